//! Routing configuration: named hops and routes per protocol.
//!
//! A `RoutingSpec` is what a configuration source delivers to
//! `MessageBus::setup_routing`. Each table belongs to one protocol.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::route::{Hop, Route};

/// All routing tables known to a bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSpec {
    #[serde(default)]
    pub tables: Vec<RoutingTableSpec>,
}

/// The hops and routes of a single protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTableSpec {
    /// Name of the protocol this table applies to.
    pub protocol: String,
    #[serde(default)]
    pub hops: Vec<HopSpec>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

/// A named hop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopSpec {
    pub name: String,
    /// Hop text the name expands to, e.g. `dst/session` or `[RoundRobin]`.
    pub selector: String,
    /// Candidate service addresses offered to a policy directive.
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Whether a failure on this hop is ignored.
    #[serde(default)]
    pub ignore_result: bool,
}

/// A named route: a list of hop names or hop texts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub name: String,
    pub hops: Vec<String>,
}

impl HopSpec {
    pub fn new(name: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selector: selector.into(),
            ..Self::default()
        }
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipients.push(recipient.into());
        self
    }
}

impl RouteSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hops: Vec::new(),
        }
    }

    pub fn with_hop(mut self, hop: impl Into<String>) -> Self {
        self.hops.push(hop.into());
        self
    }
}

impl RoutingTableSpec {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    pub fn with_hop(mut self, hop: HopSpec) -> Self {
        self.hops.push(hop);
        self
    }

    pub fn with_route(mut self, route: RouteSpec) -> Self {
        self.routes.push(route);
        self
    }
}

impl RoutingSpec {
    pub fn with_table(mut self, table: RoutingTableSpec) -> Self {
        self.tables.push(table);
        self
    }

    /// Check the spec for problems. Returns one message per problem; an
    /// empty list means the spec is usable.
    pub fn verify(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut protocols = HashSet::new();
        for table in &self.tables {
            if table.protocol.is_empty() {
                errors.push("routing table has an empty protocol name".to_string());
            } else if !protocols.insert(table.protocol.as_str()) {
                errors.push(format!("routing table for protocol '{}' is defined more than once", table.protocol));
            }
            table.verify_into(&mut errors);
        }
        errors
    }
}

impl RoutingTableSpec {
    fn verify_into(&self, errors: &mut Vec<String>) {
        let protocol = &self.protocol;
        let mut hop_names = HashSet::new();
        for hop in &self.hops {
            if !hop_names.insert(hop.name.as_str()) {
                errors.push(format!("hop '{}' in protocol '{protocol}' is defined more than once", hop.name));
            }
            match Hop::parse(&hop.selector) {
                Ok(parsed) if parsed.is_empty() => {
                    errors.push(format!("hop '{}' in protocol '{protocol}' has an empty selector", hop.name));
                }
                Ok(_) => {}
                Err(e) => errors.push(format!("hop '{}' in protocol '{protocol}': {e}", hop.name)),
            }
        }

        let route_names: HashSet<&str> = self.routes.iter().map(|r| r.name.as_str()).collect();
        let mut seen_routes = HashSet::new();
        for route in &self.routes {
            if !seen_routes.insert(route.name.as_str()) {
                errors.push(format!("route '{}' in protocol '{protocol}' is defined more than once", route.name));
            }
            if route.hops.is_empty() {
                errors.push(format!("route '{}' in protocol '{protocol}' has no hops", route.name));
            }
            for hop_text in &route.hops {
                let hop = match Hop::parse(hop_text) {
                    Ok(hop) => hop,
                    Err(e) => {
                        errors.push(format!("route '{}' in protocol '{protocol}': {e}", route.name));
                        continue;
                    }
                };
                // Single words must name something; anything else is an address or policy.
                if let Some(name) = hop.as_name() {
                    if !hop_names.contains(name) && !route_names.contains(name) {
                        errors.push(format!(
                            "route '{}' in protocol '{protocol}' references unknown hop or route '{name}'",
                            route.name
                        ));
                    }
                }
            }
        }
    }

    /// Parse every route of this table.
    pub fn parsed_routes(&self) -> impl Iterator<Item = (&str, Route)> + '_ {
        self.routes.iter().filter_map(|spec| {
            let hops = spec
                .hops
                .iter()
                .map(|h| Hop::parse(h))
                .collect::<Result<Vec<_>, _>>()
                .ok()?;
            Some((spec.name.as_str(), Route::from_hops(hops)))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
