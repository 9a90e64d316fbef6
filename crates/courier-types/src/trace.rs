//! Diagnostic trace trees attached to every routable.
//!
//! A trace is a tree of note leaves and branch nodes. Strict branches record
//! events that happened in order; non-strict branches record events from
//! parallel work (fan-out), whose order carries no meaning and may be sorted.
//!
//! Text form: `[note]` is a leaf, `(...)` a strict branch, `{...}` a
//! non-strict branch. Inside a note, `\` escapes `\` and `]`.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

/// Named trace levels. A routable traces a note when the note's level is at
/// or below the routable's trace level; level 0 disables tracing.
pub struct TraceLevel;

impl TraceLevel {
    pub const ERROR: u8 = 1;
    pub const SEND_RECEIVE: u8 = 4;
    pub const SPLIT_MERGE: u8 = 5;
    pub const COMPONENT: u8 = 6;
    pub const MAX: u8 = 9;
}

/// Errors from [`TraceNode::decode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceDecodeError {
    #[error("unterminated note")]
    UnterminatedNote,

    #[error("unexpected '{found}' at offset {offset}")]
    MismatchedClose { found: char, offset: usize },

    #[error("{0} branch(es) left open")]
    Unclosed(usize),

    #[error("expected exactly one root node, found {0}")]
    RootCount(usize),
}

/// One node of a trace tree.
///
/// A node carrying a note is a leaf and never has children. Strictness only
/// matters for branches, so leaves compare equal regardless of it.
#[derive(Debug, Clone, Eq)]
pub struct TraceNode {
    note: Option<String>,
    strict: bool,
    children: Vec<TraceNode>,
}

impl Default for TraceNode {
    fn default() -> Self {
        Self {
            note: None,
            strict: true,
            children: Vec::new(),
        }
    }
}

impl PartialEq for TraceNode {
    fn eq(&self, other: &Self) -> bool {
        match (&self.note, &other.note) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.strict == other.strict && self.children == other.children,
            _ => false,
        }
    }
}

impl TraceNode {
    /// Empty strict branch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty branch with the given strictness.
    pub fn branch(strict: bool) -> Self {
        Self {
            strict,
            ..Self::default()
        }
    }

    /// Leaf holding `note`.
    pub fn leaf(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Self::default()
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.note.is_some()
    }

    /// A node with neither a note nor children.
    pub fn is_empty(&self) -> bool {
        self.note.is_none() && self.children.is_empty()
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn set_strict(&mut self, strict: bool) -> &mut Self {
        self.strict = strict;
        self
    }

    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    pub fn children(&self) -> &[TraceNode] {
        &self.children
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    /// Append a child. Must not be called on a leaf.
    pub fn add_child(&mut self, child: TraceNode) -> &mut Self {
        debug_assert!(!self.is_leaf(), "a trace leaf cannot have children");
        self.children.push(child);
        self
    }

    /// Append a note leaf.
    pub fn add_note(&mut self, note: impl Into<String>) -> &mut Self {
        self.add_child(TraceNode::leaf(note))
    }

    pub fn add_children(&mut self, children: impl IntoIterator<Item = TraceNode>) -> &mut Self {
        for child in children {
            self.add_child(child);
        }
        self
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn swap(&mut self, other: &mut TraceNode) {
        std::mem::swap(self, other);
    }

    /// Drop empty branches and fold branches into parents of the same
    /// strictness, so equivalent trees share one shape.
    pub fn compact(&mut self) -> &mut Self {
        if self.is_leaf() {
            return self;
        }
        let previous = std::mem::take(&mut self.children);
        for mut child in previous {
            child.compact();
            if child.is_empty() {
                continue;
            }
            if child.is_leaf() {
                self.children.push(child);
            } else if child.strict == self.strict {
                self.children.append(&mut child.children);
            } else if child.children.len() == 1 {
                if let Some(mut grandchild) = child.children.pop() {
                    if grandchild.is_empty() {
                        continue;
                    }
                    if grandchild.is_leaf() || grandchild.strict != self.strict {
                        self.children.push(grandchild);
                    } else {
                        self.children.append(&mut grandchild.children);
                    }
                }
            } else {
                self.children.push(child);
            }
        }
        self
    }

    /// Recursively sort the children of every non-strict branch.
    pub fn sort(&mut self) -> &mut Self {
        if self.is_leaf() {
            return self;
        }
        for child in &mut self.children {
            child.sort();
        }
        if !self.strict {
            self.children.sort_by(compare_nodes);
        }
        self
    }

    /// Compact, sort, and re-root into a strict branch.
    ///
    /// The result is canonical: structurally equivalent trees normalize to
    /// equal trees, and normalizing twice changes nothing.
    pub fn normalize(&mut self) -> &mut Self {
        self.compact();
        self.sort();
        if !self.is_leaf() && !self.strict && self.children.len() <= 1 {
            match self.children.pop() {
                Some(only) => *self = only,
                None => self.strict = true,
            }
        }
        if self.is_leaf() || !self.strict {
            let inner = std::mem::take(self);
            self.add_child(inner);
        }
        self
    }

    /// Render to the bracketed text form.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut String) {
        if let Some(note) = &self.note {
            out.push('[');
            for c in note.chars() {
                if c == '\\' || c == ']' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push(']');
            return;
        }
        out.push(if self.strict { '(' } else { '{' });
        for child in &self.children {
            child.encode_into(out);
        }
        out.push(if self.strict { ')' } else { '}' });
    }

    /// Parse the bracketed text form. The empty string decodes to an empty
    /// node. Characters outside notes other than brackets are ignored.
    pub fn decode(text: &str) -> Result<TraceNode, TraceDecodeError> {
        if text.is_empty() {
            return Ok(TraceNode::new());
        }
        // stack[0] is a holder for the single top-level node
        let mut stack = vec![TraceNode::new()];
        let mut note: Option<String> = None;
        let mut escaped = false;

        for (offset, c) in text.char_indices() {
            if let Some(buf) = note.as_mut() {
                if escaped {
                    buf.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == ']' {
                    let finished = note.take().unwrap_or_default();
                    push_child(&mut stack, TraceNode::leaf(finished));
                } else {
                    buf.push(c);
                }
                continue;
            }
            match c {
                '[' => note = Some(String::new()),
                '(' | '{' => stack.push(TraceNode::branch(c == '(')),
                ')' | '}' => {
                    let closes_strict = c == ')';
                    if stack.len() < 2 || stack[stack.len() - 1].strict != closes_strict {
                        return Err(TraceDecodeError::MismatchedClose { found: c, offset });
                    }
                    if let Some(done) = stack.pop() {
                        push_child(&mut stack, done);
                    }
                }
                _ => {}
            }
        }

        if note.is_some() {
            return Err(TraceDecodeError::UnterminatedNote);
        }
        if stack.len() != 1 {
            return Err(TraceDecodeError::Unclosed(stack.len() - 1));
        }
        let mut holder = stack.pop().unwrap_or_default();
        if holder.children.len() != 1 {
            return Err(TraceDecodeError::RootCount(holder.children.len()));
        }
        Ok(holder.children.remove(0))
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "    ".repeat(depth);
        if let Some(note) = &self.note {
            return writeln!(f, "{pad}{note}");
        }
        let tag = if self.strict { "trace" } else { "fork" };
        writeln!(f, "{pad}<{tag}>")?;
        for child in &self.children {
            child.write_indented(f, depth + 1)?;
        }
        writeln!(f, "{pad}</{tag}>")
    }
}

fn push_child(stack: &mut [TraceNode], child: TraceNode) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(child);
    }
}

/// Total order used to sort non-strict children: leaves first (by note),
/// then branches by child count, children, and strictness.
fn compare_nodes(a: &TraceNode, b: &TraceNode) -> Ordering {
    match (&a.note, &b.note) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a
            .children
            .len()
            .cmp(&b.children.len())
            .then_with(|| {
                a.children
                    .iter()
                    .zip(&b.children)
                    .map(|(x, y)| compare_nodes(x, y))
                    .find(|ord| ord.is_ne())
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| b.strict.cmp(&a.strict)),
    }
}

impl fmt::Display for TraceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

/// Trace state of one routable: a level and a tree of notes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    level: u8,
    root: TraceNode,
}

impl Trace {
    pub fn new(level: u8) -> Self {
        Self {
            level: level.min(TraceLevel::MAX),
            root: TraceNode::new(),
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// Set the level, clamped to `[0, 9]`.
    pub fn set_level(&mut self, level: u8) {
        self.level = level.min(TraceLevel::MAX);
    }

    pub fn should_trace(&self, level: u8) -> bool {
        level <= self.level
    }

    /// Record `note` if `level` is enabled. Returns whether it was recorded.
    pub fn trace(&mut self, level: u8, note: impl Into<String>) -> bool {
        if !self.should_trace(level) {
            return false;
        }
        self.root.add_note(note);
        true
    }

    pub fn root(&self) -> &TraceNode {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut TraceNode {
        &mut self.root
    }

    /// Replace the tree, returning the previous one.
    pub fn take_root(&mut self) -> TraceNode {
        std::mem::take(&mut self.root)
    }

    pub fn add_child(&mut self, child: TraceNode) {
        self.root.add_child(child);
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn normalize(&mut self) {
        self.root.normalize();
    }

    /// Clear the notes; the level is kept.
    pub fn clear(&mut self) {
        self.root.clear();
    }

    pub fn swap(&mut self, other: &mut Trace) {
        std::mem::swap(self, other);
    }

    pub fn encode(&self) -> String {
        self.root.encode()
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.root, f)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_node() -> impl Strategy<Value = TraceNode> {
        let leaf = "[a-c\\]\\\\ ]{0,4}".prop_map(TraceNode::leaf);
        leaf.prop_recursive(4, 32, 4, |inner| {
            (any::<bool>(), prop::collection::vec(inner, 0..4)).prop_map(|(strict, children)| {
                let mut node = TraceNode::branch(strict);
                node.add_children(children);
                node
            })
        })
    }

    #[test]
    fn encode_leaf_escapes_backslash_and_bracket() {
        let node = TraceNode::leaf(r"a]b\c");
        assert_eq!(node.encode(), r"[a\]b\\c]");
        assert_eq!(TraceNode::decode(&node.encode()).unwrap(), node);
    }

    #[test]
    fn encode_nested_branches() {
        let mut inner = TraceNode::branch(false);
        inner.add_note("x").add_note("y");
        let mut root = TraceNode::new();
        root.add_note("first").add_child(inner);
        assert_eq!(root.encode(), "([first]{[x][y]})");
    }

    #[test]
    fn decode_empty_string_is_empty_node() {
        let node = TraceNode::decode("").unwrap();
        assert!(node.is_empty());
        assert!(node.is_strict());
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert_eq!(
            TraceNode::decode("([a]"),
            Err(TraceDecodeError::Unclosed(1))
        );
        assert_eq!(
            TraceNode::decode("([a]}"),
            Err(TraceDecodeError::MismatchedClose {
                found: '}',
                offset: 4
            })
        );
        assert_eq!(
            TraceNode::decode("[abc"),
            Err(TraceDecodeError::UnterminatedNote)
        );
        assert_eq!(TraceNode::decode("[a][b]"), Err(TraceDecodeError::RootCount(2)));
    }

    #[test]
    fn compact_folds_same_strictness_and_drops_empty() {
        let mut nested = TraceNode::new();
        nested.add_note("b").add_child(TraceNode::branch(false));
        let mut root = TraceNode::new();
        root.add_note("a").add_child(nested).add_child(TraceNode::new());
        root.compact();
        assert_eq!(root.encode(), "([a][b])");
    }

    #[test]
    fn compact_lifts_single_child_of_other_strictness() {
        let mut fork = TraceNode::branch(false);
        fork.add_note("only");
        let mut root = TraceNode::new();
        root.add_child(fork);
        root.compact();
        assert_eq!(root.encode(), "([only])");
    }

    #[test]
    fn normalize_sorts_non_strict_and_reroots() {
        let mut a = TraceNode::branch(false);
        a.add_note("b").add_note("a");
        let mut b = TraceNode::branch(false);
        b.add_note("a").add_note("b");
        a.normalize();
        b.normalize();
        assert_eq!(a, b);
        assert_eq!(a.encode(), "({[a][b]})");
    }

    #[test]
    fn normalize_wraps_leaf_root() {
        let mut leaf = TraceNode::leaf("solo");
        leaf.normalize();
        assert_eq!(leaf.encode(), "([solo])");
    }

    #[test]
    fn trace_level_gates_notes() {
        let mut trace = Trace::new(4);
        assert!(trace.trace(TraceLevel::SEND_RECEIVE, "sent"));
        assert!(!trace.trace(TraceLevel::COMPONENT, "detail"));
        assert_eq!(trace.encode(), "([sent])");

        let mut disabled = Trace::default();
        assert!(!disabled.trace(TraceLevel::ERROR, "nope"));
        assert!(disabled.is_empty());
    }

    #[test]
    fn set_level_clamps() {
        let mut trace = Trace::new(42);
        assert_eq!(trace.level(), 9);
        trace.set_level(0);
        assert!(!trace.should_trace(1));
        assert!(trace.should_trace(0));
    }

    #[test]
    fn display_indents_tree() {
        let mut root = TraceNode::new();
        root.add_note("hello");
        let text = root.to_string();
        assert_eq!(text, "<trace>\n    hello\n</trace>\n");
    }

    proptest! {
        #[test]
        fn encode_decode_roundtrip(node in arb_node()) {
            let mut decoded = TraceNode::decode(&node.encode()).unwrap();
            let mut original = node.clone();
            decoded.normalize();
            original.normalize();
            prop_assert_eq!(decoded, original);
        }

        #[test]
        fn normalize_is_idempotent(node in arb_node()) {
            let mut once = node.clone();
            once.normalize();
            let mut twice = once.clone();
            twice.normalize();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn non_strict_order_does_not_matter(children in prop::collection::vec(arb_node(), 0..5)) {
            let mut forward = TraceNode::branch(false);
            forward.add_children(children.iter().cloned());
            let mut backward = TraceNode::branch(false);
            backward.add_children(children.iter().rev().cloned());
            forward.normalize();
            backward.normalize();
            prop_assert_eq!(forward, backward);
        }
    }
}
