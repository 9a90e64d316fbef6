//! A string-payload protocol for tests, demos and load drivers.
//!
//! Wire form is one tag byte (`M` for messages, `R` for replies) followed by
//! the UTF-8 value.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use semver::Version;

use crate::protocol::{CodecError, Protocol, RoutingPolicy};
use crate::routable::{Body, Message};

pub const SIMPLE_PROTOCOL: &str = "Simple";

pub const KIND_MESSAGE: u32 = 1;
pub const KIND_REPLY: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleMessage {
    value: String,
}

impl SimpleMessage {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Body for SimpleMessage {
    fn protocol(&self) -> &str {
        SIMPLE_PROTOCOL
    }

    fn kind(&self) -> u32 {
        KIND_MESSAGE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleReply {
    value: String,
}

impl SimpleReply {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Body for SimpleReply {
    fn protocol(&self) -> &str {
        SIMPLE_PROTOCOL
    }

    fn kind(&self) -> u32 {
        KIND_REPLY
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct SimpleProtocol;

impl SimpleProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl Protocol for SimpleProtocol {
    fn name(&self) -> &str {
        SIMPLE_PROTOCOL
    }

    fn encode(&self, _version: &Version, body: &dyn Body) -> Result<Vec<u8>, CodecError> {
        let (tag, value) = if let Some(msg) = body.downcast_ref::<SimpleMessage>() {
            (b'M', msg.value())
        } else if let Some(reply) = body.downcast_ref::<SimpleReply>() {
            (b'R', reply.value())
        } else {
            return Err(CodecError::Encode {
                protocol: SIMPLE_PROTOCOL.to_string(),
                kind: body.kind(),
                reason: "not a simple body".to_string(),
            });
        };
        let mut out = Vec::with_capacity(1 + value.len());
        out.push(tag);
        out.extend_from_slice(value.as_bytes());
        Ok(out)
    }

    fn decode(&self, _version: &Version, bytes: &[u8]) -> Result<Box<dyn Body>, CodecError> {
        let decode_err = |reason: &str| CodecError::Decode {
            protocol: SIMPLE_PROTOCOL.to_string(),
            len: bytes.len(),
            reason: reason.to_string(),
        };
        let (&tag, rest) = bytes.split_first().ok_or_else(|| decode_err("empty payload"))?;
        let value = std::str::from_utf8(rest).map_err(|_| decode_err("value is not UTF-8"))?;
        match tag {
            b'M' => Ok(Box::new(SimpleMessage::new(value))),
            b'R' => Ok(Box::new(SimpleReply::new(value))),
            _ => Err(decode_err("unknown tag")),
        }
    }

    fn create_policy(&self, name: &str, _param: &str) -> Option<Arc<dyn RoutingPolicy>> {
        match name {
            "RoundRobin" => Some(Arc::new(RoundRobin::default())),
            _ => None,
        }
    }
}

/// Cycles through the candidate recipients.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoutingPolicy for RoundRobin {
    fn select(&self, _msg: &Message, recipients: &[String]) -> Option<String> {
        if recipients.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % recipients.len();
        Some(recipients[i].clone())
    }
}
