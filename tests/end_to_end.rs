//! End-to-end exercise of the full pipeline — center harvesting into the
//! shared store, a channel pool replenishing from it, and the client
//! façade leasing through it — using the in-memory fakes so the suite
//! runs without a real Redis or network.

use proxypool::center::ProxyCenter;
use proxypool::client::{ClientFacade, FacadeError, ReqwestFacade};
use proxypool::config::EngineConfig;
use proxypool::model::Anonymity;
use proxypool::pool::ProxyPool;
use proxypool::store::FakeStore;
use proxypool::validator::FixedValidator;
use proxypool::vendor::{FakeVendor, VendorAdapter};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> EngineConfig {
    EngineConfig {
        store_address: String::new(),
        store_password: String::new(),
        validation_period: Duration::from_millis(50),
        load_period: Duration::from_millis(10),
        max_workers: 4,
        validation_timeout: Duration::from_secs(1),
        default_request_timeout: Duration::from_secs(1),
        block_ttl: Duration::from_millis(50),
        queue_capacity: 100,
        validation_url: "http://example.invalid".to_string(),
        channels: vec!["amazon".to_string()],
    }
}

#[tokio::test]
async fn harvested_proxy_reaches_the_channel_pool() {
    let store = Arc::new(FakeStore::default());
    let vendors: Vec<Box<dyn VendorAdapter>> =
        vec![Box::new(FakeVendor::new("v", vec!["9.9.9.9:80".to_string()]))];
    let validator = Arc::new(FixedValidator::always_ok(12, Anonymity::High));

    let center_handle = ProxyCenter::start(store.clone(), vendors, validator, fast_config());
    // Give the fetcher and worker loops a few ticks to land the proxy in
    // the global inventory before the pool's replenishment loop starts.
    tokio::time::sleep(Duration::from_millis(80)).await;

    let (pool, pool_handle) = ProxyPool::start(store.clone(), "amazon", fast_config());
    // Pool replenishment ticks every 5s in production; drive one pass
    // directly here rather than waiting out the real interval.
    for _ in 0..50 {
        if pool.take().await.is_ok() {
            center_handle.shutdown();
            pool_handle.shutdown();
            center_handle.join().await;
            pool_handle.join().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("harvested proxy never reached the pool within the deadline");
}

#[tokio::test]
async fn facade_get_against_empty_pool_reports_no_proxy_available() {
    let store = Arc::new(FakeStore::default());
    let (pool, handle) = ProxyPool::start(store, "amazon", fast_config());
    let facade = ReqwestFacade::new(pool, Duration::from_secs(1));

    let result = facade.get("http://example.invalid", &|_| true).await;
    assert!(matches!(result, Err(FacadeError::NoProxyAvailable)));

    handle.shutdown();
    handle.join().await;
}

#[tokio::test]
async fn dead_candidate_never_reaches_any_channel_pool() {
    let store = Arc::new(FakeStore::default());
    let vendors: Vec<Box<dyn VendorAdapter>> =
        vec![Box::new(FakeVendor::new("v", vec!["4.4.4.4:80".to_string()]))];
    let validator = Arc::new(FixedValidator::always_fails());

    let center_handle = ProxyCenter::start(store.clone(), vendors, validator, fast_config());
    tokio::time::sleep(Duration::from_millis(80)).await;

    let (pool, pool_handle) = ProxyPool::start(store.clone(), "amazon", fast_config());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(pool.take().await.is_err());

    center_handle.shutdown();
    pool_handle.shutdown();
    center_handle.join().await;
    pool_handle.join().await;
}
