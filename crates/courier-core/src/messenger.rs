//! The single delivery worker.
//!
//! Every message and reply the bus hands to an application handler goes
//! through one [`Messenger`]. It runs tasks strictly one after another on a
//! dedicated Tokio task, so handlers reached through the bus never run
//! concurrently with each other and never run while a caller holds one of
//! the bus's locks.
//!
//! A task's cleanup is its `Drop`: a task that is never run (because the
//! messenger was destroyed first) still releases what it holds.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::handler::{MessageHandler, ReplyHandler};
use crate::routable::{Message, Reply, Routable};

/// How long the worker waits for work before servicing recurrent tasks.
const RECURRENT_INTERVAL: Duration = Duration::from_millis(100);

/// A unit of work for the messenger.
pub trait Task: Send {
    fn run(&mut self);
}

impl<F> Task for F
where
    F: FnMut() + Send,
{
    fn run(&mut self) {
        self()
    }
}

enum Command {
    Run(Box<dyn Task>),
    AddRecurrent(Box<dyn Task>),
    Sync(oneshot::Sender<()>),
    Terminate,
}

pub struct Messenger {
    tx: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Messenger {
    /// Spawn the worker. Must be called inside a Tokio runtime.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(rx));
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Queue `task`. After `destroy` the task is dropped instead of run.
    pub fn enqueue(&self, task: Box<dyn Task>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        // A closed channel hands the task back inside the error; dropping it
        // runs its cleanup.
        let _ = self.tx.send(Command::Run(task));
    }

    /// Run `task` once per worker iteration until the messenger is destroyed.
    pub fn add_recurrent_task(&self, task: Box<dyn Task>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.tx.send(Command::AddRecurrent(task));
    }

    pub fn deliver_message(&self, handler: Arc<dyn MessageHandler>, msg: Message) {
        self.enqueue(Box::new(MessageTask {
            handler,
            msg: Some(msg),
        }));
    }

    pub fn deliver_reply(&self, handler: Arc<dyn ReplyHandler>, reply: Reply) {
        self.enqueue(Box::new(ReplyTask {
            handler,
            reply: Some(reply),
        }));
    }

    /// Wait until every task queued before this call has run.
    ///
    /// Calling this from a task running on the messenger never returns.
    pub async fn sync(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Sync(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Run what is queued, stop the worker and drop every remaining task.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Command::Terminate);
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "messenger worker ended abnormally");
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut recurrent: Vec<Box<dyn Task>> = Vec::new();
    loop {
        let next = if recurrent.is_empty() {
            rx.recv().await.map(Some)
        } else {
            match tokio::time::timeout(RECURRENT_INTERVAL, rx.recv()).await {
                Ok(cmd) => cmd.map(Some),
                Err(_elapsed) => Some(None),
            }
        };
        let Some(cmd) = next else {
            // Every sender is gone.
            break;
        };
        match cmd {
            Some(Command::Run(mut task)) => run_guarded(task.as_mut()),
            Some(Command::AddRecurrent(task)) => recurrent.push(task),
            Some(Command::Sync(done)) => {
                let _ = done.send(());
            }
            Some(Command::Terminate) => break,
            None => {}
        }
        for task in &mut recurrent {
            run_guarded(task.as_mut());
        }
    }

    rx.close();
    let mut leftover = 0usize;
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            Command::Sync(done) => {
                let _ = done.send(());
            }
            _ => leftover += 1,
        }
    }
    if leftover > 0 {
        debug!(leftover, "messenger dropped tasks queued after termination");
    }
    debug!(recurrent = recurrent.len(), "messenger worker stopped");
}

fn run_guarded(task: &mut dyn Task) {
    if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
        error!("messenger task panicked");
    }
}

/// Hands a message to a handler; discards it if never run.
struct MessageTask {
    handler: Arc<dyn MessageHandler>,
    msg: Option<Message>,
}

impl Task for MessageTask {
    fn run(&mut self) {
        if let Some(msg) = self.msg.take() {
            self.handler.handle_message(msg);
        }
    }
}

impl Drop for MessageTask {
    fn drop(&mut self) {
        if let Some(mut msg) = self.msg.take() {
            debug!("discarding undelivered message");
            msg.discard();
        }
    }
}

/// Hands a reply to a handler; discards it if never run.
struct ReplyTask {
    handler: Arc<dyn ReplyHandler>,
    reply: Option<Reply>,
}

impl Task for ReplyTask {
    fn run(&mut self) {
        if let Some(reply) = self.reply.take() {
            self.handler.handle_reply(reply);
        }
    }
}

impl Drop for ReplyTask {
    fn drop(&mut self) {
        if let Some(mut reply) = self.reply.take() {
            debug!("discarding undelivered reply");
            reply.discard();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn runs_tasks_in_order() {
        let messenger = Messenger::start();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            messenger.enqueue(Box::new(move || log.lock().unwrap().push(i)));
        }
        messenger.sync().await;
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        messenger.destroy().await;
    }

    #[tokio::test]
    async fn panicking_task_does_not_stop_worker() {
        let messenger = Messenger::start();
        let ran = Arc::new(AtomicUsize::new(0));
        fn boom() {
            panic!("boom");
        }
        messenger.enqueue(Box::new(boom));
        let counter = ran.clone();
        messenger.enqueue(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        messenger.sync().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        messenger.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn recurrent_tasks_run_without_traffic() {
        let messenger = Messenger::start();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        messenger.add_recurrent_task(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 4);
        messenger.destroy().await;
    }

    #[tokio::test]
    async fn destroy_drops_later_tasks() {
        struct Flag(Arc<AtomicBool>);
        impl Task for Flag {
            fn run(&mut self) {
                panic!("must not run");
            }
        }
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let messenger = Messenger::start();
        messenger.destroy().await;
        assert!(messenger.is_destroyed());

        let dropped = Arc::new(AtomicBool::new(false));
        messenger.enqueue(Box::new(Flag(dropped.clone())));
        assert!(dropped.load(Ordering::SeqCst));
        // Sync after destroy returns immediately.
        messenger.sync().await;
    }

    #[tokio::test]
    async fn undelivered_reply_is_discarded() {
        let messenger = Messenger::start();
        messenger.destroy().await;
        fn never(_reply: Reply) {
            panic!("must not be called");
        }
        let mut reply = Reply::empty();
        reply.push_handler(Arc::new(never));
        messenger.deliver_reply(Arc::new(never), reply);
    }
}
