//! Trace decoding command.

use anyhow::{Context, Result};
use console::style;

use courier_types::TraceNode;

/// Decode `encoded`, optionally normalizing it.
pub fn decode_trace(encoded: &str, normalize: bool) -> Result<TraceNode> {
    let mut node = TraceNode::decode(encoded).context("failed to decode trace")?;
    if normalize {
        node.normalize();
    }
    Ok(node)
}

/// Print a trace tree, or its re-encoded form and tree as JSON.
pub fn trace(encoded: &str, normalize: bool, json: bool) -> Result<()> {
    let node = decode_trace(encoded, normalize)?;

    if json {
        let out = serde_json::json!({
            "encoded": node.encode(),
            "tree": node.to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if node.is_empty() {
        println!("  {}", style("(empty trace)").dim());
        return Ok(());
    }
    print!("{node}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_nested_tree() {
        let node = decode_trace("([sent]{[b][a]})", false).unwrap();
        assert_eq!(node.num_children(), 2);
        assert_eq!(node.children()[0].note(), Some("sent"));
        assert!(!node.children()[1].is_strict());
    }

    #[test]
    fn normalize_sorts_unordered_branches() {
        let node = decode_trace("({[b][a]})", true).unwrap();
        assert_eq!(node.encode(), "({[a][b]})");
    }

    #[test]
    fn rejects_unbalanced_text() {
        assert!(decode_trace("([a]", false).is_err());
    }
}
