//! Configuration schema (spec §6), loaded from YAML with `serde_yaml`,
//! following the teacher's `#[serde(default = "...")]`-per-field style for
//! timeouts and sizes.

use crate::error::LoadConfigError;
use duration_string::DurationString;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_validation_period() -> DurationString {
    DurationString::new(Duration::new(300, 0))
}

fn default_load_period() -> DurationString {
    DurationString::new(Duration::new(2, 0))
}

fn default_max_workers() -> usize {
    500
}

fn default_validation_timeout() -> DurationString {
    DurationString::new(Duration::new(10, 0))
}

fn default_request_timeout() -> DurationString {
    DurationString::new(Duration::new(10, 0))
}

fn default_block_ttl() -> DurationString {
    DurationString::new(Duration::new(60, 0))
}

fn default_queue_capacity() -> usize {
    2000
}

fn default_validation_url() -> String {
    "http://127.0.0.1:9001/ping".to_string()
}

/// The wire shape a vendor's feed comes back in; determines which adapter
/// `vendor::registry::build` instantiates.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VendorShape {
    /// `{code, data: {proxy_list: [...]}}`, e.g. kuaidaili.
    FlatList,
    /// `{success, data: [{ip, port}, ...]}`, e.g. data5u.
    RecordList,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VendorConfig {
    pub name: String,
    pub api_url: String,
    pub shape: VendorShape,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub store_address: String,
    #[serde(default)]
    pub store_password: String,

    #[serde(default = "default_validation_period")]
    pub validation_period: DurationString,
    #[serde(default = "default_load_period")]
    pub load_period: DurationString,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout: DurationString,
    #[serde(default = "default_request_timeout")]
    pub default_request_timeout: DurationString,
    #[serde(default = "default_block_ttl")]
    pub block_ttl: DurationString,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_validation_url")]
    pub validation_url: String,

    /// Vendors the center pulls from. Spec §6 names this `enabled_vendors:
    /// set<string>`; API endpoints per vendor are config here rather than
    /// hardcoded, since real feed URLs carry vendor-specific order IDs.
    #[serde(default)]
    pub enabled_vendors: Vec<VendorConfig>,

    /// Channel names to start a `ProxyPool` for. Not named explicitly in
    /// spec.md (which treats Proxy Pool construction as parametrized by
    /// whatever the caller passes); supplied here because `main.rs` needs
    /// to know which pools to start.
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Runtime-typed durations and sizes derived from `Config`, so the rest of
/// the crate never has to call `.into()` on a `DurationString` at every use
/// site.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store_address: String,
    pub store_password: String,
    pub validation_period: Duration,
    pub load_period: Duration,
    pub max_workers: usize,
    pub validation_timeout: Duration,
    pub default_request_timeout: Duration,
    pub block_ttl: Duration,
    pub queue_capacity: usize,
    pub validation_url: String,
    pub channels: Vec<String>,
}

impl From<&Config> for EngineConfig {
    fn from(c: &Config) -> Self {
        EngineConfig {
            store_address: c.store_address.clone(),
            store_password: c.store_password.clone(),
            validation_period: c.validation_period.into(),
            load_period: c.load_period.into(),
            max_workers: c.max_workers,
            validation_timeout: c.validation_timeout.into(),
            default_request_timeout: c.default_request_timeout.into(),
            block_ttl: c.block_ttl.into(),
            queue_capacity: c.queue_capacity,
            validation_url: c.validation_url.clone(),
            channels: c.channels.clone(),
        }
    }
}

pub fn load_config(path: PathBuf) -> Result<Config, LoadConfigError> {
    let f = std::fs::File::open(path)?;
    let cfg: Config = serde_yaml::from_reader(f)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_when_absent() {
        let yaml = r#"
store_address: "127.0.0.1:6379"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.max_workers, 500);
        assert_eq!(cfg.queue_capacity, 2000);
        let engine: EngineConfig = (&cfg).into();
        assert_eq!(engine.validation_period, Duration::from_secs(300));
        assert_eq!(engine.block_ttl, Duration::from_secs(60));
    }

    #[test]
    fn parses_vendors_and_channels() {
        let yaml = r#"
store_address: "127.0.0.1:6379"
enabled_vendors:
  - name: kuai
    api_url: "http://example.invalid/kuai"
    shape: flat_list
  - name: data5u
    api_url: "http://example.invalid/data5u"
    shape: record_list
channels:
  - amazon
  - ebay
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.enabled_vendors.len(), 2);
        assert_eq!(cfg.enabled_vendors[0].shape, VendorShape::FlatList);
        assert_eq!(cfg.channels, vec!["amazon".to_string(), "ebay".to_string()]);
    }
}
