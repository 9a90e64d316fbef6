//! Routes and hops: the path a message travels.
//!
//! A route is a whitespace-separated list of hops; a hop is a `/`-separated
//! list of directives. A directive is either verbatim text or a routing
//! policy invocation written `[Name]` or `[Name:param]`. Separators inside
//! brackets do not split.
//!
//! ```text
//! search/dispatch [Hash:docid]/feed storage/*/default
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors from parsing a hop or route string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteParseError {
    #[error("unbalanced brackets in '{0}'")]
    UnbalancedBrackets(String),

    #[error("empty directive in hop '{0}'")]
    EmptyDirective(String),

    #[error("empty policy name in '{0}'")]
    EmptyPolicyName(String),
}

/// One element of a hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HopDirective {
    /// Literal text, matched or used as part of a service address.
    Verbatim(String),
    /// A routing policy chosen by name from the message's protocol.
    Policy { name: String, param: String },
}

impl HopDirective {
    fn parse(text: &str, hop: &str) -> Result<Self, RouteParseError> {
        if text.is_empty() {
            return Err(RouteParseError::EmptyDirective(hop.to_string()));
        }
        let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) else {
            return Ok(HopDirective::Verbatim(text.to_string()));
        };
        let (name, param) = inner.split_once(':').unwrap_or((inner, ""));
        if name.is_empty() {
            return Err(RouteParseError::EmptyPolicyName(hop.to_string()));
        }
        Ok(HopDirective::Policy {
            name: name.to_string(),
            param: param.to_string(),
        })
    }
}

impl fmt::Display for HopDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopDirective::Verbatim(text) => f.write_str(text),
            HopDirective::Policy { name, param } if param.is_empty() => write!(f, "[{name}]"),
            HopDirective::Policy { name, param } => write!(f, "[{name}:{param}]"),
        }
    }
}

/// A single hop of a route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Hop {
    directives: Vec<HopDirective>,
}

impl Hop {
    pub fn new(directives: Vec<HopDirective>) -> Self {
        Self { directives }
    }

    pub fn parse(text: &str) -> Result<Self, RouteParseError> {
        let directives = split_top_level(text, |c| c == '/')?
            .into_iter()
            .map(|part| HopDirective::parse(part, text))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { directives })
    }

    pub fn directives(&self) -> &[HopDirective] {
        &self.directives
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// The first policy directive, with its index.
    pub fn policy(&self) -> Option<(usize, &str, &str)> {
        self.directives.iter().enumerate().find_map(|(i, d)| match d {
            HopDirective::Policy { name, param } => Some((i, name.as_str(), param.as_str())),
            HopDirective::Verbatim(_) => None,
        })
    }

    /// Whether this hop is a single verbatim word, i.e. may name a table
    /// hop or route.
    pub fn as_name(&self) -> Option<&str> {
        match self.directives.as_slice() {
            [HopDirective::Verbatim(name)] => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, directive) in self.directives.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{directive}")?;
        }
        Ok(())
    }
}

impl FromStr for Hop {
    type Err = RouteParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hop::parse(s)
    }
}

/// An ordered list of hops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Route {
    hops: Vec<Hop>,
}

impl Route {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hops(hops: Vec<Hop>) -> Self {
        Self { hops }
    }

    pub fn parse(text: &str) -> Result<Self, RouteParseError> {
        let hops = split_top_level(text, char::is_whitespace)?
            .into_iter()
            .filter(|part| !part.is_empty())
            .map(Hop::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { hops })
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn hop(&self, index: usize) -> Option<&Hop> {
        self.hops.get(index)
    }

    pub fn num_hops(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn add_hop(&mut self, hop: Hop) -> &mut Self {
        self.hops.push(hop);
        self
    }

    /// Remove and return the hop at `index`, if any.
    pub fn remove_hop(&mut self, index: usize) -> Option<Hop> {
        (index < self.hops.len()).then(|| self.hops.remove(index))
    }

    /// Replace the hop at `index` with all hops of `route`.
    pub fn splice(&mut self, index: usize, route: &Route) {
        if index < self.hops.len() {
            self.hops.splice(index..=index, route.hops.iter().cloned());
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, hop) in self.hops.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{hop}")?;
        }
        Ok(())
    }
}

impl FromStr for Route {
    type Err = RouteParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Route::parse(s)
    }
}

/// Split `text` on `is_sep` outside of brackets.
fn split_top_level(text: &str, is_sep: impl Fn(char) -> bool) -> Result<Vec<&str>, RouteParseError> {
    let mut parts = Vec::new();
    let mut depth: i32 = 0;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err(RouteParseError::UnbalancedBrackets(text.to_string()));
                }
            }
            c if depth == 0 && is_sep(c) => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(RouteParseError::UnbalancedBrackets(text.to_string()));
    }
    parts.push(&text[start..]);
    Ok(parts)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hop_with_policy() {
        let hop = Hop::parse("search/[Hash:a/b]/feed").unwrap();
        assert_eq!(hop.directives().len(), 3);
        assert_eq!(hop.policy(), Some((1, "Hash", "a/b")));
        assert_eq!(hop.to_string(), "search/[Hash:a/b]/feed");
    }

    #[test]
    fn policy_without_param() {
        let hop = Hop::parse("[RoundRobin]").unwrap();
        assert_eq!(hop.policy(), Some((0, "RoundRobin", "")));
        assert_eq!(hop.to_string(), "[RoundRobin]");
    }

    #[test]
    fn single_word_hop_is_a_name() {
        assert_eq!(Hop::parse("indexing").unwrap().as_name(), Some("indexing"));
        assert_eq!(Hop::parse("a/b").unwrap().as_name(), None);
    }

    #[test]
    fn parse_route_splits_on_whitespace_outside_brackets() {
        let route = Route::parse("  dst/session  [Policy:x y]/z ").unwrap();
        assert_eq!(route.num_hops(), 2);
        assert_eq!(route.hop(1).unwrap().policy(), Some((0, "Policy", "x y")));
        assert_eq!(route.to_string(), "dst/session [Policy:x y]/z");
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Hop::parse("a/[b"),
            Err(RouteParseError::UnbalancedBrackets(_))
        ));
        assert!(matches!(
            Hop::parse("a//b"),
            Err(RouteParseError::EmptyDirective(_))
        ));
        assert!(matches!(
            Hop::parse("[:x]"),
            Err(RouteParseError::EmptyPolicyName(_))
        ));
    }

    #[test]
    fn empty_route() {
        let route = Route::parse("   ").unwrap();
        assert!(route.is_empty());
    }

    #[test]
    fn splice_expands_hop() {
        let mut route = Route::parse("alias last").unwrap();
        let expansion = Route::parse("one two").unwrap();
        route.splice(0, &expansion);
        assert_eq!(route.to_string(), "one two last");
        assert_eq!(route.remove_hop(0).unwrap().to_string(), "one");
        assert!(route.remove_hop(5).is_none());
    }
}
