//! Bus configuration file model.
//!
//! `BusConfig` mirrors a `courier.toml` file. Every field has a default, so
//! an empty file yields a working configuration.

use serde::{Deserialize, Serialize};

use crate::routing_spec::RoutingSpec;

/// Top-level configuration for a message bus and its source sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub bus: BusLimits,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub routing: RoutingSpec,
}

/// System-wide admission limits for messages delivered to local sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusLimits {
    /// Maximum number of unreplied inbound messages (0 = unlimited).
    #[serde(default = "default_max_pending_count")]
    pub max_pending_count: u32,

    /// Maximum total approximate size of unreplied inbound messages (0 = unlimited).
    #[serde(default = "default_max_pending_size")]
    pub max_pending_size: u64,
}

fn default_max_pending_count() -> u32 {
    2048
}

fn default_max_pending_size() -> u64 {
    100 * 1024 * 1024
}

impl Default for BusLimits {
    fn default() -> Self {
        Self {
            max_pending_count: default_max_pending_count(),
            max_pending_size: default_max_pending_size(),
        }
    }
}

/// Defaults applied to source sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Message timeout applied when a message has none, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub throttle: ThrottleConfig,
}

fn default_timeout_ms() -> u64 {
    180_000
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            throttle: ThrottleConfig::default(),
        }
    }
}

/// Which throttle policy a source session uses, with its knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ThrottleConfig {
    /// Admit everything.
    AllPass,

    /// Fixed limits on pending count and size (0 = unlimited).
    Static {
        #[serde(default)]
        max_pending_count: u32,
        #[serde(default)]
        max_pending_size: u64,
    },

    /// Adaptive window driven by measured throughput.
    Dynamic(DynamicThrottleConfig),

    /// Token budget replenished every second.
    Rate {
        desired_rate: f64,
        #[serde(default)]
        max_pending_count: u32,
    },
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig::Dynamic(DynamicThrottleConfig::default())
    }
}

/// Knobs of the adaptive window policy. See `DynamicThrottlePolicy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicThrottleConfig {
    pub window_size_increment: f64,
    pub min_window_size: f64,
    pub max_window_size: f64,
    pub window_size_backoff: f64,
    pub decrement_factor: f64,
    pub resize_rate: f64,
    pub efficiency_threshold: f64,
    pub weight: f64,
    /// Throughput cap in messages per millisecond (0 = none).
    pub max_throughput: f64,
    /// Hard cap on pending messages (0 = none).
    pub max_pending_count: u32,
}

impl Default for DynamicThrottleConfig {
    fn default() -> Self {
        Self {
            window_size_increment: 20.0,
            min_window_size: 20.0,
            max_window_size: f64::from(i32::MAX),
            window_size_backoff: 0.9,
            decrement_factor: 2.0,
            resize_rate: 3.0,
            efficiency_threshold: 1.0,
            weight: 1.0,
            max_throughput: 0.0,
            max_pending_count: 0,
        }
    }
}

/// Client-side retry of messages whose replies carry transient errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_enabled")]
    pub enabled: bool,

    /// Delay before the first retry, in milliseconds; later retries back off.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_retry_enabled() -> bool {
    true
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_retry_enabled(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}
