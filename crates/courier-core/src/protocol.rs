//! Pluggable payload protocols and the routing policies they provide.

use std::sync::Arc;

use dashmap::DashMap;
use semver::Version;
use thiserror::Error;

use crate::routable::{Body, Message};

/// Failure to move a body across the wire.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("protocol '{protocol}' cannot encode body of kind {kind}: {reason}")]
    Encode {
        protocol: String,
        kind: u32,
        reason: String,
    },

    #[error("protocol '{protocol}' cannot decode {len} bytes: {reason}")]
    Decode {
        protocol: String,
        len: usize,
        reason: String,
    },

    #[error("protocol '{protocol}' does not speak version {version}")]
    IncompatibleVersion { protocol: String, version: Version },
}

/// Encodes and decodes the bodies of one application protocol, and supplies
/// the routing policies its routes may name.
pub trait Protocol: Send + Sync {
    fn name(&self) -> &str;

    fn encode(&self, version: &Version, body: &dyn Body) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, version: &Version, bytes: &[u8]) -> Result<Box<dyn Body>, CodecError>;

    /// Instantiate the policy a `[name:param]` hop directive refers to.
    fn create_policy(&self, name: &str, param: &str) -> Option<Arc<dyn RoutingPolicy>>;
}

/// Picks one recipient for a message out of a hop's candidates.
pub trait RoutingPolicy: Send + Sync {
    fn select(&self, msg: &Message, recipients: &[String]) -> Option<String>;
}

type PolicyKey = (String, String, String);

/// Registered protocols plus a cache of the policies they created.
#[derive(Default)]
pub struct ProtocolRepository {
    protocols: DashMap<String, Arc<dyn Protocol>>,
    policies: DashMap<PolicyKey, Arc<dyn RoutingPolicy>>,
}

impl ProtocolRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `protocol`, returning the one it replaces. Cached policies of
    /// a replaced protocol are dropped.
    pub fn put_protocol(&self, protocol: Arc<dyn Protocol>) -> Option<Arc<dyn Protocol>> {
        let name = protocol.name().to_string();
        let previous = self.protocols.insert(name.clone(), protocol);
        if previous.is_some() {
            self.policies.retain(|(p, _, _), _| *p != name);
        }
        previous
    }

    pub fn get_protocol(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.protocols.get(name).map(|p| p.value().clone())
    }

    pub fn has_protocol(&self, name: &str) -> bool {
        self.protocols.contains_key(name)
    }

    /// The policy `name:param` of `protocol`, created on first use.
    pub fn get_routing_policy(&self, protocol: &str, name: &str, param: &str) -> Option<Arc<dyn RoutingPolicy>> {
        let key = (protocol.to_string(), name.to_string(), param.to_string());
        if let Some(policy) = self.policies.get(&key) {
            return Some(policy.value().clone());
        }
        let policy = self.get_protocol(protocol)?.create_policy(name, param)?;
        Some(self.policies.entry(key).or_insert(policy).value().clone())
    }

    pub fn clear_policy_cache(&self) {
        self.policies.clear();
    }

    pub fn num_cached_policies(&self) -> usize {
        self.policies.len()
    }
}
