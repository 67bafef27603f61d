//! The global Proxy Center (spec §4.D): four independent background loops
//! — fetcher, scanner, workers, block-cleaner — that own the shared global
//! inventory and global blocked set. Singleton per deployment; started
//! explicitly via `ProxyCenter::start` and stopped via the returned
//! `CenterHandle`, per the Redesign Flag in spec §9 (constructor-launched,
//! never-stoppable tasks replaced with an explicit handle).

use crate::cache::TtlCache;
use crate::config::EngineConfig;
use crate::metrics;
use crate::model::{proxy_hash_key, Anonymity, ProxyRecord, GLOBAL_BLOCKED_SET, PROXY_KEY_PREFIX};
use crate::store::{ProxyFields, Store};
use crate::validator::Validator;
use crate::vendor::VendorAdapter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl TryFrom<ProxyFields> for ProxyRecord {
    type Error = ();

    fn try_from(f: ProxyFields) -> Result<Self, Self::Error> {
        Ok(ProxyRecord {
            ip: f.ip,
            port: f.port,
            anonymity: Anonymity::from_i64(f.anonymity).ok_or(())?,
            rtt_ms: f.rtt.max(0) as u64,
            validated_at: f.validated_at,
        })
    }
}

const BLOCK_CLEANER_PERIOD: Duration = Duration::from_secs(60);
const READ_CACHE_TTL: Duration = Duration::from_millis(500);

struct Shared<S: Store, V: Validator> {
    store: Arc<S>,
    validator: Arc<V>,
    vendors: Vec<Box<dyn VendorAdapter>>,
    config: EngineConfig,
    read_cache: Mutex<TtlCache<&'static str, Vec<String>>>,
}

impl<S: Store, V: Validator> Shared<S, V> {
    /// Snapshot of every `"ip:port"` string currently in the global
    /// inventory, damped by the short-TTL read cache (spec §4.D).
    async fn inventory_members(&self) -> Result<Vec<String>, crate::error::StoreError> {
        let now = std::time::Instant::now();
        {
            let cache = self.read_cache.lock().await;
            if let Some(cached) = cache.get(&"inventory", now) {
                return Ok(cached);
            }
        }
        let keys = self.store.keys_matching(PROXY_KEY_PREFIX).await?;
        let members: Vec<String> = keys
            .into_iter()
            .map(|k| k.trim_start_matches(PROXY_KEY_PREFIX).to_string())
            .collect();
        let mut cache = self.read_cache.lock().await;
        cache.put("inventory", members.clone(), now);
        Ok(members)
    }

    async fn blocked_members(&self) -> Result<HashSet<String>, crate::error::StoreError> {
        let now = std::time::Instant::now();
        {
            let cache = self.read_cache.lock().await;
            if let Some(cached) = cache.get(&"blocked", now) {
                return Ok(cached.into_iter().collect());
            }
        }
        let members = self.store.zrange_with_scores(GLOBAL_BLOCKED_SET).await?;
        let as_strings: Vec<String> = members.iter().map(|m| m.member.clone()).collect();
        let mut cache = self.read_cache.lock().await;
        cache.put("blocked", as_strings.clone(), now);
        Ok(as_strings.into_iter().collect())
    }
}

pub struct CenterHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CenterHandle {
    /// Signal every loop to stop at its next tick boundary.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for every loop to exit after `shutdown()`.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

pub struct ProxyCenter;

impl ProxyCenter {
    pub fn start<S, V>(
        store: Arc<S>,
        vendors: Vec<Box<dyn VendorAdapter>>,
        validator: Arc<V>,
        config: EngineConfig,
    ) -> CenterHandle
    where
        S: Store + 'static,
        V: Validator + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            store,
            validator,
            vendors,
            config: config.clone(),
            read_cache: Mutex::new(TtlCache::new(READ_CACHE_TTL)),
        });

        let (queue_tx, queue_rx) = mpsc::channel::<String>(config.queue_capacity);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(fetcher_loop(
            shared.clone(),
            queue_tx.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(scanner_loop(
            shared.clone(),
            queue_tx.clone(),
            shutdown_rx.clone(),
        )));
        for _ in 0..config.max_workers.max(1) {
            tasks.push(tokio::spawn(worker_loop(
                shared.clone(),
                queue_rx.clone(),
                shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(block_cleaner_loop(
            shared.clone(),
            shutdown_rx.clone(),
        )));

        CenterHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Enqueue a batch, dropping anything past `queue_capacity` rather than
/// blocking: the scanner will re-discover dropped work on its next pass
/// (spec §5 "Backpressure").
async fn enqueue_all(queue: &mpsc::Sender<String>, members: Vec<String>) {
    for member in members {
        if queue.try_send(member).is_err() {
            log::debug!("validation queue full, dropping candidate for this tick");
        }
    }
}

async fn fetcher_loop<S: Store, V: Validator>(
    shared: Arc<Shared<S, V>>,
    queue: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    if shared.vendors.is_empty() {
        return;
    }
    let mut ticker = tokio::time::interval(shared.config.load_period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
        }
        if *shutdown.borrow() {
            return;
        }

        // Point-in-time snapshot of existing ∪ blocked, taken once per tick
        // so the diff is stable under concurrent mutation (spec §4.D).
        let existing = match shared.inventory_members().await {
            Ok(m) => m,
            Err(e) => {
                log::error!("fetcher: could not read inventory, skipping this tick: {e}");
                continue;
            }
        };
        let blocked = match shared.blocked_members().await {
            Ok(m) => m,
            Err(e) => {
                log::error!("fetcher: could not read blocked set, skipping this tick: {e}");
                continue;
            }
        };
        let mut known: HashSet<String> = existing.into_iter().collect();
        known.extend(blocked);

        for vendor in &shared.vendors {
            match vendor.fetch_proxies().await {
                Ok(candidates) => {
                    let fresh: Vec<String> = candidates
                        .into_iter()
                        .filter(|c| !known.contains(c))
                        .collect();
                    metrics::PROXIES_DISCOVERED
                        .with_label_values(&[vendor.name()])
                        .inc_by(fresh.len() as u64);
                    log::debug!("fetcher[{}]: {} new candidates", vendor.name(), fresh.len());
                    enqueue_all(&queue, fresh).await;
                }
                Err(e) => {
                    log::warn!("fetcher[{}]: vendor unavailable this tick: {e}", vendor.name());
                }
            }
        }
    }
}

async fn scanner_loop<S: Store, V: Validator>(
    shared: Arc<Shared<S, V>>,
    queue: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(shared.config.validation_period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
        }
        if *shutdown.borrow() {
            return;
        }

        let keys = match shared.store.keys_matching(PROXY_KEY_PREFIX).await {
            Ok(k) => k,
            Err(e) => {
                log::error!("scanner: could not enumerate inventory, skipping this tick: {e}");
                continue;
            }
        };

        let now = now_unix();
        let mut stale = Vec::new();
        for key in keys {
            match shared.store.hash_get(&key).await {
                Ok(Some(fields)) => {
                    if now - fields.validated_at > shared.config.validation_period.as_secs() as i64
                    {
                        stale.push(format!("{}:{}", fields.ip, fields.port));
                    }
                }
                Ok(None) => {}
                Err(e) => log::error!("scanner: could not read {key}: {e}"),
            }
        }
        log::debug!("scanner: {} stale proxies re-enqueued", stale.len());
        enqueue_all(&queue, stale).await;
    }
}

async fn worker_loop<S: Store, V: Validator>(
    shared: Arc<Shared<S, V>>,
    queue: Arc<Mutex<mpsc::Receiver<String>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let item = {
            let mut rx = queue.lock().await;
            tokio::select! {
                item = rx.recv() => item,
                _ = shutdown.changed() => { if *shutdown.borrow() { None } else { continue; } }
            }
        };
        let Some(candidate) = item else {
            if *shutdown.borrow() {
                return;
            }
            continue;
        };
        process_candidate(&shared, &candidate).await;
    }
}

async fn process_candidate<S: Store, V: Validator>(shared: &Arc<Shared<S, V>>, candidate: &str) {
    let Some((ip, port)) = candidate.split_once(':') else {
        return;
    };

    let result = shared.validator.validate(ip, port).await;
    let key = proxy_hash_key(ip, port);

    if result.ok {
        metrics::VALIDATIONS.with_label_values(&["success"]).inc();
        let record = ProxyRecord {
            ip: ip.to_string(),
            port: port.to_string(),
            anonymity: result.anonymity,
            rtt_ms: result.rtt_ms,
            validated_at: now_unix(),
        };
        if let Err(e) = shared.store.hash_set(&key, &ProxyFields::from(&record)).await {
            log::error!("worker: could not save validated proxy {candidate}: {e}");
            return;
        }
        if let Err(e) = shared.store.zrem(GLOBAL_BLOCKED_SET, candidate).await {
            log::error!("worker: could not unblock {candidate}: {e}");
        }
        log::debug!("worker: {candidate} validated ok, rtt={}ms", result.rtt_ms);
    } else {
        metrics::VALIDATIONS.with_label_values(&["failure"]).inc();
        if let Err(e) = shared.store.delete(&key).await {
            log::error!("worker: could not delete failed proxy {candidate}: {e}");
        }
        if let Err(e) = shared
            .store
            .zadd(GLOBAL_BLOCKED_SET, candidate, now_unix())
            .await
        {
            log::error!("worker: could not block {candidate}: {e}");
        }
        log::warn!("worker: {candidate} failed validation, blocked");
    }
}

async fn block_cleaner_loop<S: Store, V: Validator>(
    shared: Arc<Shared<S, V>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(BLOCK_CLEANER_PERIOD);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
        }
        if *shutdown.borrow() {
            return;
        }

        let members = match shared.store.zrange_with_scores(GLOBAL_BLOCKED_SET).await {
            Ok(m) => m,
            Err(e) => {
                log::error!("block-cleaner: could not read blocked set, skipping: {e}");
                continue;
            }
        };
        let now = now_unix();
        let ttl = shared.config.block_ttl.as_secs() as i64;
        let mut purged = 0u64;
        for member in members {
            if member.score + ttl < now {
                if let Err(e) = shared.store.zrem(GLOBAL_BLOCKED_SET, &member.member).await {
                    log::error!("block-cleaner: could not purge {}: {e}", member.member);
                } else {
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            metrics::BLOCK_CLEANUPS.inc_by(purged);
            log::debug!("block-cleaner: purged {purged} expired blocks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FakeStore;
    use crate::validator::FixedValidator;
    use crate::vendor::FakeVendor;
    use std::time::Duration as StdDuration;

    fn test_config() -> EngineConfig {
        EngineConfig {
            store_address: String::new(),
            store_password: String::new(),
            validation_period: StdDuration::from_millis(30),
            load_period: StdDuration::from_millis(10),
            max_workers: 4,
            validation_timeout: StdDuration::from_secs(1),
            default_request_timeout: StdDuration::from_secs(1),
            block_ttl: StdDuration::from_millis(30),
            queue_capacity: 100,
            validation_url: "http://example.invalid".to_string(),
            channels: vec![],
        }
    }

    #[tokio::test]
    async fn happy_harvest_lands_in_inventory() {
        let store = Arc::new(FakeStore::default());
        let vendors: Vec<Box<dyn VendorAdapter>> =
            vec![Box::new(FakeVendor::new("v", vec!["1.1.1.1:80".to_string()]))];
        let validator = Arc::new(FixedValidator::always_ok(42, Anonymity::High));

        let handle = ProxyCenter::start(store.clone(), vendors, validator, test_config());
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
        handle.join().await;

        let fields = store
            .hash_get(&proxy_hash_key("1.1.1.1", "80"))
            .await
            .unwrap();
        assert!(fields.is_some());
        let fields = fields.unwrap();
        assert_eq!(fields.rtt, 42);
        assert_eq!(fields.anonymity, Anonymity::High as i64);

        let blocked = store.zrange_with_scores(GLOBAL_BLOCKED_SET).await.unwrap();
        assert!(blocked.is_empty());
    }

    #[tokio::test]
    async fn dead_on_arrival_lands_in_blocked_set() {
        let store = Arc::new(FakeStore::default());
        let vendors: Vec<Box<dyn VendorAdapter>> =
            vec![Box::new(FakeVendor::new("v", vec!["2.2.2.2:80".to_string()]))];
        let validator = Arc::new(FixedValidator::always_fails());

        let handle = ProxyCenter::start(store.clone(), vendors, validator, test_config());
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
        handle.join().await;

        let fields = store
            .hash_get(&proxy_hash_key("2.2.2.2", "80"))
            .await
            .unwrap();
        assert!(fields.is_none());

        let blocked = store.zrange_with_scores(GLOBAL_BLOCKED_SET).await.unwrap();
        assert!(blocked.iter().any(|m| m.member == "2.2.2.2:80"));
    }

    #[tokio::test]
    async fn block_cleaner_purges_expired_entries() {
        let store = Arc::new(FakeStore::default());
        store
            .zadd(GLOBAL_BLOCKED_SET, "5.5.5.5:80", now_unix() - 1000)
            .await
            .unwrap();
        let vendors: Vec<Box<dyn VendorAdapter>> = vec![];
        let validator = Arc::new(FixedValidator::always_fails());

        let mut cfg = test_config();
        cfg.block_ttl = StdDuration::from_millis(1);

        let shared = Arc::new(Shared {
            store: store.clone(),
            validator,
            vendors,
            config: cfg,
            read_cache: Mutex::new(TtlCache::new(READ_CACHE_TTL)),
        });
        let (_tx, rx) = watch::channel(false);
        // Run one cleaner pass directly rather than waiting 60s of ticks.
        let members = shared
            .store
            .zrange_with_scores(GLOBAL_BLOCKED_SET)
            .await
            .unwrap();
        let now = now_unix();
        for m in members {
            if m.score + 1 < now {
                shared.store.zrem(GLOBAL_BLOCKED_SET, &m.member).await.unwrap();
            }
        }
        drop(rx);

        let blocked = store.zrange_with_scores(GLOBAL_BLOCKED_SET).await.unwrap();
        assert!(blocked.is_empty());
    }

    #[tokio::test]
    async fn stale_revalidation_moves_proxy_to_blocked() {
        let store = Arc::new(FakeStore::default());
        let key = proxy_hash_key("6.6.6.6", "80");
        store
            .hash_set(
                &key,
                &ProxyFields {
                    ip: "6.6.6.6".to_string(),
                    port: "80".to_string(),
                    anonymity: Anonymity::High as i64,
                    rtt: 10,
                    validated_at: now_unix() - 1000,
                },
            )
            .await
            .unwrap();

        let vendors: Vec<Box<dyn VendorAdapter>> = vec![];
        let validator = Arc::new(FixedValidator::always_fails());
        let mut cfg = test_config();
        cfg.validation_period = StdDuration::from_millis(10);

        let handle = ProxyCenter::start(store.clone(), vendors, validator, cfg);
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.shutdown();
        handle.join().await;

        assert!(store.hash_get(&key).await.unwrap().is_none());
        let blocked = store.zrange_with_scores(GLOBAL_BLOCKED_SET).await.unwrap();
        assert!(blocked.iter().any(|m| m.member == "6.6.6.6:80"));
    }
}
