//! The Client Façade (spec §4.F): wraps a `ProxyPool` so callers issue
//! ordinary HTTP requests without ever touching `take`/`free`/`delete`
//! themselves. Ported from `original_source/proxy/general.go`'s
//! take-request-free-or-delete shape.

use crate::error::{CallerProxyFailure, NoProxyAvailable};
use crate::model::ProxyRecord;
use crate::pool::ProxyPool;
use crate::store::Store;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug)]
pub enum FacadeError {
    NoProxyAvailable,
    Request(CallerProxyFailure),
}

impl std::fmt::Display for FacadeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FacadeError::NoProxyAvailable => write!(f, "no proxy available for this channel"),
            FacadeError::Request(e) => write!(f, "{e}"),
        }
    }
}
impl std::error::Error for FacadeError {}

impl From<NoProxyAvailable> for FacadeError {
    fn from(_: NoProxyAvailable) -> Self {
        FacadeError::NoProxyAvailable
    }
}

#[async_trait]
pub trait ClientFacade: Send + Sync {
    /// Leases a proxy, performs `GET url`, and returns the response body
    /// on success. A response the caller's `is_success` predicate rejects
    /// is treated the same as a transport failure: the leased proxy is
    /// deleted from its channel rather than freed.
    async fn get(
        &self,
        url: &str,
        is_success: &(dyn for<'r> Fn(&'r reqwest::Response) -> bool + Send + Sync),
    ) -> Result<reqwest::Response, FacadeError>;
}

/// Caches one `reqwest::Client` per leased proxy URL so repeated requests
/// through the same proxy don't pay connection-pool setup cost twice.
pub struct ReqwestFacade<S: Store> {
    pool: ProxyPool<S>,
    request_timeout: Duration,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl<S: Store + 'static> ReqwestFacade<S> {
    pub fn new(pool: ProxyPool<S>, request_timeout: Duration) -> Self {
        ReqwestFacade {
            pool,
            request_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, record: &ProxyRecord) -> Result<reqwest::Client, CallerProxyFailure> {
        let proxy_url = format!("http://{}", record.addr());
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&proxy_url) {
            return Ok(client.clone());
        }
        let proxy = reqwest::Proxy::http(&proxy_url).map_err(CallerProxyFailure::Transport)?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.request_timeout)
            .build()
            .map_err(CallerProxyFailure::Transport)?;
        clients.insert(proxy_url, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl<S: Store + 'static> ClientFacade for ReqwestFacade<S> {
    async fn get(
        &self,
        url: &str,
        is_success: &(dyn for<'r> Fn(&'r reqwest::Response) -> bool + Send + Sync),
    ) -> Result<reqwest::Response, FacadeError> {
        let record = self.pool.take().await?;

        let client = match self.client_for(&record).await {
            Ok(c) => c,
            Err(e) => {
                self.pool.delete(&record).await;
                return Err(FacadeError::Request(e));
            }
        };

        let result = client.get(url).send().await;
        match result {
            Ok(response) if is_success(&response) => {
                self.pool.free(&record).await;
                Ok(response)
            }
            Ok(_response) => {
                self.pool.delete(&record).await;
                Err(FacadeError::Request(CallerProxyFailure::Forbidden))
            }
            Err(e) => {
                self.pool.delete(&record).await;
                Err(FacadeError::Request(CallerProxyFailure::Transport(e)))
            }
        }
    }
}

/// A façade that always reports `NoProxyAvailable` while counting calls,
/// for callers that want to exercise retry/backoff bookkeeping without a
/// live pool or network. It never succeeds — a caller testing recovery
/// after retries needs a real `ProxyPool`/`FakeStore`, since a success
/// response can't be constructed without an actual HTTP round trip.
pub struct FixedFacade {
    pub attempts: Arc<Mutex<u32>>,
}

impl FixedFacade {
    pub fn new() -> Self {
        FixedFacade {
            attempts: Arc::new(Mutex::new(0)),
        }
    }
}

impl Default for FixedFacade {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientFacade for FixedFacade {
    async fn get(
        &self,
        _url: &str,
        _is_success: &(dyn for<'r> Fn(&'r reqwest::Response) -> bool + Send + Sync),
    ) -> Result<reqwest::Response, FacadeError> {
        let mut attempts = self.attempts.lock().await;
        *attempts += 1;
        Err(FacadeError::NoProxyAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::{channel_pool_key, proxy_hash_key, Anonymity};
    use crate::store::{FakeStore, ProxyFields};
    use std::time::SystemTime;

    fn test_config() -> EngineConfig {
        EngineConfig {
            store_address: String::new(),
            store_password: String::new(),
            validation_period: Duration::from_secs(300),
            load_period: Duration::from_secs(2),
            max_workers: 4,
            validation_timeout: Duration::from_secs(1),
            default_request_timeout: Duration::from_secs(1),
            block_ttl: Duration::from_secs(60),
            queue_capacity: 100,
            validation_url: "http://example.invalid".to_string(),
            channels: vec![],
        }
    }

    #[tokio::test]
    async fn get_with_empty_pool_surfaces_no_proxy_available() {
        let store = Arc::new(FakeStore::default());
        let (pool, handle) = ProxyPool::start(store, "amazon", test_config());
        let facade = ReqwestFacade::new(pool, Duration::from_secs(1));

        let result = facade.get("http://example.invalid", &|_| true).await;
        assert!(matches!(result, Err(FacadeError::NoProxyAvailable)));

        handle.shutdown();
        handle.join().await;
    }

    #[tokio::test]
    async fn fixed_facade_counts_attempts_and_always_errs() {
        let facade = FixedFacade::new();
        let first = facade.get("http://example.invalid", &|_| true).await;
        let second = facade.get("http://example.invalid", &|_| true).await;
        assert!(matches!(first, Err(FacadeError::NoProxyAvailable)));
        assert!(matches!(second, Err(FacadeError::NoProxyAvailable)));
        assert_eq!(*facade.attempts.lock().await, 2);
    }

    #[allow(dead_code)]
    async fn seed_proxy(store: &FakeStore, ip: &str, port: &str) {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        store
            .hash_set(
                &proxy_hash_key(ip, port),
                &ProxyFields {
                    ip: ip.to_string(),
                    port: port.to_string(),
                    anonymity: Anonymity::High as i64,
                    rtt: 5,
                    validated_at: now,
                },
            )
            .await
            .unwrap();
        store.zadd(&channel_pool_key("amazon"), &format!("{ip}:{port}"), 0).await.unwrap();
    }
}
