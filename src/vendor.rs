//! Vendor adapters: pure pull, stateless, one per third-party proxy feed.
//! `FetchProxy` is the entire contract (spec §4.C); every element returned
//! MUST parse as `host:port`. Two response shapes are represented here —
//! the rest of the shapes documented in spec §6 reduce to one of these two.

use crate::error::VendorError;
use async_trait::async_trait;
use serde::Deserialize;

#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_proxies(&self) -> Result<Vec<String>, VendorError>;
}

/// Response shaped as `{code, data: {proxy_list: ["host:port", ...]}}`,
/// ported from `provider/kuai.go`.
#[derive(Deserialize)]
struct FlatListResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<FlatListData>,
}

#[derive(Deserialize)]
struct FlatListData {
    proxy_list: Vec<String>,
}

pub struct KuaiAdapter {
    client: reqwest::Client,
    api_url: String,
}

impl KuaiAdapter {
    pub fn new(api_url: impl Into<String>) -> Self {
        KuaiAdapter {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl VendorAdapter for KuaiAdapter {
    fn name(&self) -> &str {
        "kuai"
    }

    async fn fetch_proxies(&self) -> Result<Vec<String>, VendorError> {
        let response: FlatListResponse = self.client.get(&self.api_url).send().await?.json().await?;
        if response.code != 0 {
            return Err(VendorError::Malformed(format!(
                "error returned [{}]: [{}]",
                response.code, response.msg
            )));
        }
        let data = response
            .data
            .ok_or_else(|| VendorError::Malformed("missing data field".to_string()))?;
        if data.proxy_list.is_empty() {
            return Err(VendorError::Malformed("empty proxy_list".to_string()));
        }
        Ok(data.proxy_list)
    }
}

/// Response shaped as `{success, data: [{ip, port}, ...]}`, ported from
/// `provider/data5u.go`. `port` arrives as a JSON number in the original
/// feed, not a string, so it's normalized here on assembly.
#[derive(Deserialize)]
struct RecordListResponse {
    success: bool,
    #[serde(default)]
    msg: String,
    data: Vec<IpPortRecord>,
}

#[derive(Deserialize)]
struct IpPortRecord {
    ip: String,
    port: u16,
}

pub struct GeneralAdapter {
    client: reqwest::Client,
    api_url: String,
    name: String,
}

impl GeneralAdapter {
    pub fn new(name: impl Into<String>, api_url: impl Into<String>) -> Self {
        GeneralAdapter {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl VendorAdapter for GeneralAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_proxies(&self) -> Result<Vec<String>, VendorError> {
        let response: RecordListResponse =
            self.client.get(&self.api_url).send().await?.json().await?;
        if !response.success {
            return Err(VendorError::Malformed(format!(
                "error returned [{}]: [{}]",
                response.success, response.msg
            )));
        }
        if response.data.is_empty() {
            return Err(VendorError::Malformed("empty proxy_list".to_string()));
        }
        Ok(response
            .data
            .into_iter()
            .map(|r| format!("{}:{}", r.ip, r.port))
            .collect())
    }
}

/// Resolves configured vendor names to adapter instances, mirroring
/// `provider.New(name string)` in `original_source/provider/provider.go`.
/// Vendor API URLs are supplied by the caller via `config::VendorConfig`
/// rather than hardcoded, since real vendor credentials do not belong in
/// source.
pub mod registry {
    use super::{GeneralAdapter, KuaiAdapter, VendorAdapter};
    use crate::config::VendorConfig;

    pub fn build(configs: &[VendorConfig]) -> Vec<Box<dyn VendorAdapter>> {
        configs
            .iter()
            .map(|c| -> Box<dyn VendorAdapter> {
                match c.shape {
                    crate::config::VendorShape::FlatList => Box::new(KuaiAdapter::new(&c.api_url)),
                    crate::config::VendorShape::RecordList => {
                        Box::new(GeneralAdapter::new(&c.name, &c.api_url))
                    }
                }
            })
            .collect()
    }
}

/// A deterministic, non-networked vendor for tests.
pub struct FakeVendor {
    name: String,
    proxies: Vec<String>,
}

impl FakeVendor {
    pub fn new(name: impl Into<String>, proxies: Vec<String>) -> Self {
        FakeVendor {
            name: name.into(),
            proxies,
        }
    }
}

#[async_trait]
impl VendorAdapter for FakeVendor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_proxies(&self) -> Result<Vec<String>, VendorError> {
        Ok(self.proxies.clone())
    }
}
