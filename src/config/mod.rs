//! Configuration management for the threat mitigation service.
//!
//! Settings come from an optional TOML file followed by `TMS__`-prefixed
//! environment variables, e.g. `TMS__SERVER__PORT=9090` or
//! `TMS__CDN__ZONE_ID=...`. Every section has defaults, so an empty
//! environment yields a runnable configuration.

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::Config;

/// Load configuration from the config file and environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file =
        env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());
    load_from(&config_file)
}

/// Load configuration from `path` (if it exists) and the environment
pub fn load_from(path: &str) -> Result<Config, ConfigError> {
    let config = ConfigBuilder::builder()
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("TMS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = load_from("/nonexistent/tms-config").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.collector.table, "tms_mon");
        assert_eq!(config.enrichment.zones.len(), 5);
        assert!(config.alerts.policy.count_failures);
    }

    #[test]
    fn test_file_overrides_sections() {
        let path = env::temp_dir().join(format!("tms-config-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[shaping]
enabled = true
interface = "eth1"
limit_mb_per_s = 2.5

[cycle]
ranges = ["192.168.0.0/24", "10.0.0.0/16"]
interval_seconds = 60

[[alerts.channels]]
channel = "webhook"
url = "http://hooks.local/tms"

[[policy.rules]]
name = "asn"
action = "cdn_block"
condition = {{ type = "asn", numbers = [4134] }}
"#
        )
        .unwrap();

        let config = load_from(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(config.shaping.enabled);
        assert_eq!(config.shaping.interface.as_deref(), Some("eth1"));
        assert_eq!(config.shaping.limit_mb_per_s, 2.5);
        assert_eq!(config.cycle.ranges.len(), 2);
        assert_eq!(config.alerts.channels.len(), 1);
        assert_eq!(config.policy.rules.unwrap()[0].name, "asn");
        assert_eq!(config.edge.block_set, "bad_ips");
    }
}
