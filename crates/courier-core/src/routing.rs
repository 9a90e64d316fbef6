//! Route resolution against the per-protocol routing tables.
//!
//! Resolution looks only at the first hop of a route. A hop that names a
//! table route is expanded in place, a hop that names a table hop is replaced
//! by its selector, and a policy directive picks one of the hop's recipients.
//! Whatever is left is the service address to send to.

use std::collections::HashMap;
use std::sync::Arc;

use courier_types::{Error, ErrorCode, Hop, HopSpec, Route, RoutingTableSpec};

use crate::protocol::RoutingPolicy;
use crate::routable::Message;

/// Upper bound on route-name expansions while resolving one hop.
const MAX_EXPANSIONS: usize = 32;

/// The named hops and routes of one protocol.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    protocol: String,
    hops: HashMap<String, HopSpec>,
    routes: HashMap<String, Route>,
}

impl RoutingTable {
    pub fn from_spec(spec: &RoutingTableSpec) -> Self {
        Self {
            protocol: spec.protocol.clone(),
            hops: spec.hops.iter().map(|h| (h.name.clone(), h.clone())).collect(),
            routes: spec
                .parsed_routes()
                .map(|(name, route)| (name.to_string(), route))
                .collect(),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn hop(&self, name: &str) -> Option<&HopSpec> {
        self.hops.get(name)
    }

    pub fn route(&self, name: &str) -> Option<&Route> {
        self.routes.get(name)
    }

    pub fn has_route(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    pub fn num_hops(&self) -> usize {
        self.hops.len()
    }

    pub fn num_routes(&self) -> usize {
        self.routes.len()
    }
}

/// Where to send a message next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Service address of the next recipient.
    pub recipient: String,
    /// Hops the recipient still has to travel.
    pub route: Route,
}

/// Resolve the first hop of `msg`'s route.
///
/// `policy` looks up a routing policy of the message's protocol by name and
/// parameter.
pub fn resolve<F>(table: Option<&RoutingTable>, msg: &Message, policy: F) -> Result<Resolution, Error>
where
    F: Fn(&str, &str) -> Option<Arc<dyn RoutingPolicy>>,
{
    let mut route = msg.route().clone();
    let mut recipients: Vec<String> = Vec::new();
    let mut expansions = 0;

    loop {
        let Some(first) = route.hop(0) else {
            return Err(Error::new(ErrorCode::ILLEGAL_ROUTE, "Route is empty."));
        };
        let Some(name) = first.as_name().map(str::to_string) else {
            break;
        };
        let Some(table) = table else {
            break;
        };
        if let Some(expansion) = table.route(&name) {
            expansions += 1;
            if expansions > MAX_EXPANSIONS {
                return Err(Error::new(
                    ErrorCode::ILLEGAL_ROUTE,
                    format!("Route '{name}' expands into itself."),
                ));
            }
            let expansion = expansion.clone();
            route.splice(0, &expansion);
            continue;
        }
        if let Some(hop_spec) = table.hop(&name) {
            let hop = Hop::parse(&hop_spec.selector).map_err(|e| {
                Error::new(ErrorCode::ILLEGAL_ROUTE, format!("Hop '{name}' has a bad selector: {e}"))
            })?;
            recipients = hop_spec.recipients.clone();
            route.splice(0, &Route::from_hops(vec![hop]));
        }
        break;
    }

    let Some(first) = route.remove_hop(0) else {
        return Err(Error::new(ErrorCode::ILLEGAL_ROUTE, "Route is empty."));
    };
    if first.is_empty() {
        return Err(Error::new(ErrorCode::ILLEGAL_ROUTE, "Hop is empty."));
    }

    let recipient = match first.policy() {
        Some((_, name, param)) => {
            let Some(policy) = policy(name, param) else {
                return Err(Error::new(
                    ErrorCode::UNKNOWN_POLICY,
                    format!("Protocol '{}' has no routing policy '{name}'.", msg.protocol()),
                ));
            };
            policy.select(msg, &recipients).ok_or_else(|| {
                Error::new(
                    ErrorCode::NO_SERVICES_FOR_ROUTE,
                    format!("Policy '{name}' selected no recipient for hop '{first}'."),
                )
            })?
        }
        None => first.to_string(),
    };

    Ok(Resolution { recipient, route })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Protocol;
    use crate::simple::{SimpleMessage, SimpleProtocol};
    use courier_types::RouteSpec;

    fn table() -> RoutingTable {
        RoutingTable::from_spec(
            &RoutingTableSpec::new("Simple")
                .with_hop(
                    HopSpec::new("dispatch", "[RoundRobin]")
                        .with_recipient("a/session")
                        .with_recipient("b/session"),
                )
                .with_hop(HopSpec::new("fixed", "c/session"))
                .with_hop(HopSpec::new("nobody", "[RoundRobin]"))
                .with_route(RouteSpec::new("default").with_hop("dispatch").with_hop("next/hop"))
                .with_route(RouteSpec::new("alias").with_hop("default"))
                .with_route(RouteSpec::new("loop").with_hop("loop")),
        )
    }

    fn simple_policy(name: &str, param: &str) -> Option<Arc<dyn RoutingPolicy>> {
        SimpleProtocol::new().create_policy(name, param)
    }

    fn msg(route: &str) -> Message {
        Message::new(SimpleMessage::new("x")).with_route(Route::parse(route).unwrap())
    }

    #[test]
    fn plain_address_passes_through() {
        let r = resolve(Some(&table()), &msg("dst/session more/hops"), simple_policy).unwrap();
        assert_eq!(r.recipient, "dst/session");
        assert_eq!(r.route.to_string(), "more/hops");
    }

    #[test]
    fn named_route_and_hop_expand() {
        let t = table();
        let policy = SimpleProtocol::new().create_policy("RoundRobin", "").unwrap();
        let shared = move |_: &str, _: &str| Some(policy.clone());

        let first = resolve(Some(&t), &msg("alias"), &shared).unwrap();
        let second = resolve(Some(&t), &msg("default"), &shared).unwrap();
        assert_eq!(first.recipient, "a/session");
        assert_eq!(second.recipient, "b/session");
        assert_eq!(first.route.to_string(), "next/hop");

        let fixed = resolve(Some(&t), &msg("fixed"), &shared).unwrap();
        assert_eq!(fixed.recipient, "c/session");
        assert!(fixed.route.is_empty());
    }

    #[test]
    fn failures_map_to_error_codes() {
        let t = table();
        let code = |route: Message| resolve(Some(&t), &route, simple_policy).unwrap_err().code;

        assert_eq!(code(Message::new(SimpleMessage::new("x"))), ErrorCode::ILLEGAL_ROUTE);
        assert_eq!(code(msg("loop")), ErrorCode::ILLEGAL_ROUTE);
        assert_eq!(code(msg("nobody")), ErrorCode::NO_SERVICES_FOR_ROUTE);
        assert_eq!(code(msg("[Unheard]")), ErrorCode::UNKNOWN_POLICY);
    }

    #[test]
    fn works_without_table() {
        let r = resolve(None, &msg("dispatch"), simple_policy).unwrap();
        assert_eq!(r.recipient, "dispatch");
    }
}
