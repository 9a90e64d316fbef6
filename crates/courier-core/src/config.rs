//! Bus configuration loader.
//!
//! Reads a `courier.toml` file and deserializes it into [`BusConfig`]. The
//! lenient loader falls back to defaults when the file is missing or
//! malformed; the strict forms report why.

use std::path::Path;

use courier_types::config::BusConfig;
use thiserror::Error;

/// Conventional file name of a bus configuration.
pub const CONFIG_FILE_NAME: &str = "courier.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse bus config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid routing in bus config: {}", .0.join("; "))]
    InvalidRouting(Vec<String>),
}

/// Parse and check a configuration document.
pub fn parse_bus_config(text: &str) -> Result<BusConfig, ConfigError> {
    let config: BusConfig = toml::from_str(text)?;
    let problems = config.routing.verify();
    if !problems.is_empty() {
        return Err(ConfigError::InvalidRouting(problems));
    }
    Ok(config)
}

/// Read and parse `path`, failing on any problem.
pub async fn read_bus_config(path: &Path) -> Result<BusConfig, ConfigError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_bus_config(&text)
}

/// Load the configuration at `path`.
///
/// - If the file does not exist, returns [`BusConfig::default()`].
/// - If the file cannot be read or parsed, logs a warning and returns the default.
pub async fn load_bus_config(path: &Path) -> BusConfig {
    match read_bus_config(path).await {
        Ok(config) => config,
        Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            BusConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            BusConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::config::ThrottleConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_bus_config(&tmp.path().join(CONFIG_FILE_NAME)).await;
        assert_eq!(config, BusConfig::default());
        assert_eq!(config.bus.max_pending_count, 2048);
    }

    #[tokio::test]
    async fn valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(
            &path,
            r#"
[bus]
max_pending_count = 10

[source]
timeout_ms = 5000

[source.throttle]
policy = "static"
max_pending_count = 4

[retry]
enabled = false

[[routing.tables]]
protocol = "Simple"

[[routing.tables.hops]]
name = "inbox"
selector = "server/inbox"
"#,
        )
        .await
        .unwrap();

        let config = load_bus_config(&path).await;
        assert_eq!(config.bus.max_pending_count, 10);
        assert_eq!(config.source.timeout_ms, 5000);
        assert_eq!(
            config.source.throttle,
            ThrottleConfig::Static {
                max_pending_count: 4,
                max_pending_size: 0
            }
        );
        assert!(!config.retry.enabled);
        assert_eq!(config.routing.tables[0].hops[0].selector, "server/inbox");
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, "this is not { valid toml !!!").await.unwrap();

        assert_eq!(load_bus_config(&path).await, BusConfig::default());
        assert!(matches!(read_bus_config(&path).await, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn dangling_route_reference_is_rejected() {
        let text = r#"
[[routing.tables]]
protocol = "Simple"

[[routing.tables.routes]]
name = "default"
hops = ["nowhere"]
"#;
        assert!(matches!(parse_bus_config(text), Err(ConfigError::InvalidRouting(_))));
    }
}
