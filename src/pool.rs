//! Per-channel Proxy Pool (spec §4.E): leases proxies drawn from the global
//! inventory to one caller at a time, and isolates a caller's channel from
//! failures observed by other channels via its own blocked set.

use crate::config::EngineConfig;
use crate::error::NoProxyAvailable;
use crate::metrics;
use crate::model::{
    channel_blocked_key, channel_leased_key, channel_pool_key, proxy_hash_key, ProxyRecord,
    GLOBAL_BLOCKED_SET, PROXY_KEY_PREFIX,
};
use crate::store::Store;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Target number of leaseable proxies a pool keeps warm. Not named in the
/// configuration schema (spec §6 scopes capacity at the engine level via
/// `queue_capacity`); a pool-local constant avoids one channel's
/// replenishment starving another's.
const POOL_CAPACITY: usize = 200;
const CROSS_CHECK_PERIOD: Duration = Duration::from_secs(30);
const BLOCK_CLEANER_PERIOD: Duration = Duration::from_secs(60);

pub struct PoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

struct Shared<S: Store> {
    store: Arc<S>,
    channel: String,
    config: EngineConfig,
    /// Serializes replenishment so a `take()` that finds `pool(c)` empty
    /// doesn't race the background `replenish_loop` (or another blocked
    /// `take()`) into scanning the global inventory twice at once.
    replenish_lock: Mutex<()>,
}

/// A leased, per-channel proxy pool. Cheap to clone: `take`/`free`/`delete`
/// only need the channel name and a handle to the shared store.
pub struct ProxyPool<S: Store> {
    shared: Arc<Shared<S>>,
}

impl<S: Store> Clone for ProxyPool<S> {
    fn clone(&self) -> Self {
        ProxyPool {
            shared: self.shared.clone(),
        }
    }
}

impl<S: Store + 'static> ProxyPool<S> {
    /// Starts the pool's background loops (replenishment, cross-check,
    /// block-cleaner) and returns both a handle usable for `take`/`free`/
    /// `delete` and a `PoolHandle` to stop them.
    pub fn start(store: Arc<S>, channel: impl Into<String>, config: EngineConfig) -> (Self, PoolHandle) {
        let shared = Arc::new(Shared {
            store,
            channel: channel.into(),
            config,
            replenish_lock: Mutex::new(()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(replenish_loop(shared.clone(), shutdown_rx.clone())),
            tokio::spawn(cross_check_loop(shared.clone(), shutdown_rx.clone())),
            tokio::spawn(block_cleaner_loop(shared.clone(), shutdown_rx.clone())),
        ];

        (
            ProxyPool { shared },
            PoolHandle {
                shutdown: shutdown_tx,
                tasks,
            },
        )
    }

    /// Leases the least-used leaseable proxy for this channel, atomically
    /// removing it from the pool so no other caller can take it at the
    /// same time (spec §8 "Lease exclusivity"). Per spec §4.E: if the pop
    /// comes back nil, replenish once from the global inventory and retry
    /// the pop exactly once more before giving up.
    pub async fn take(&self) -> Result<ProxyRecord, NoProxyAvailable> {
        let key = channel_pool_key(&self.shared.channel);
        let mut replenished_already = false;
        loop {
            let popped = self
                .shared
                .store
                .zpop_max(&key)
                .await
                .map_err(|_| NoProxyAvailable)?;
            let Some(member) = popped else {
                if replenished_already {
                    metrics::POOL_TAKES
                        .with_label_values(&[&self.shared.channel, "empty"])
                        .inc();
                    return Err(NoProxyAvailable);
                }
                replenished_already = true;
                replenish_once(&self.shared).await;
                continue;
            };
            let Some((ip, port)) = member.member.split_once(':') else {
                continue;
            };
            match self.shared.store.hash_get(&proxy_hash_key(ip, port)).await {
                Ok(Some(fields)) => match ProxyRecord::try_from(fields) {
                    Ok(record) => {
                        let _ = self
                            .shared
                            .store
                            .zadd(&channel_leased_key(&self.shared.channel), &member.member, now_unix())
                            .await;
                        metrics::POOL_TAKES
                            .with_label_values(&[&self.shared.channel, "ok"])
                            .inc();
                        return Ok(record);
                    }
                    Err(()) => continue,
                },
                // The global inventory has already evicted this member
                // (it expired or failed revalidation); it's gone from the
                // pool now too, so just try the next-highest one.
                Ok(None) => continue,
                Err(_) => return Err(NoProxyAvailable),
            }
        }
    }

    /// Returns a proxy to the pool after a successful use, bumping its
    /// usage score so `take` prefers less-recently-used proxies next.
    /// Growth is capped rather than allowed to wrap (spec §9 allows this
    /// as a defect fix over the original's unchecked increment).
    pub async fn free(&self, record: &ProxyRecord) {
        let key = channel_pool_key(&self.shared.channel);
        let member = record.addr().to_string();
        match self.shared.store.zadd_incr(&key, &member, 1).await {
            Ok(score) if score < 0 => {
                let _ = self.shared.store.zadd(&key, &member, i64::MAX).await;
            }
            _ => {}
        }
        let _ = self
            .shared
            .store
            .zrem(&channel_leased_key(&self.shared.channel), &member)
            .await;
        metrics::POOL_FREES.with_label_values(&[&self.shared.channel]).inc();
    }

    /// Drops a proxy that failed while leased to this channel and blocks
    /// it so replenishment won't offer it again until the block expires
    /// (spec §8 "Per-channel block isolation": other channels are
    /// unaffected).
    pub async fn delete(&self, record: &ProxyRecord) {
        let blocked_key = channel_blocked_key(&self.shared.channel);
        let member = record.addr().to_string();
        let _ = self.shared.store.zadd(&blocked_key, &member, now_unix()).await;
        let _ = self
            .shared
            .store
            .zrem(&channel_leased_key(&self.shared.channel), &member)
            .await;
        metrics::POOL_DELETES.with_label_values(&[&self.shared.channel]).inc();
    }
}

async fn is_channel_blocked<S: Store>(shared: &Shared<S>, member: &str) -> bool {
    match shared.store.zrange_with_scores(&channel_blocked_key(&shared.channel)).await {
        Ok(blocked) => blocked.iter().any(|m| m.member == member),
        Err(_) => false,
    }
}

async fn is_globally_blocked<S: Store>(shared: &Shared<S>, member: &str) -> bool {
    match shared.store.zrange_with_scores(GLOBAL_BLOCKED_SET).await {
        Ok(blocked) => blocked.iter().any(|m| m.member == member),
        Err(_) => false,
    }
}

async fn is_leased<S: Store>(shared: &Shared<S>, member: &str) -> bool {
    match shared.store.zrange_with_scores(&channel_leased_key(&shared.channel)).await {
        Ok(leased) => leased.iter().any(|m| m.member == member),
        Err(_) => false,
    }
}

/// Pulls fresh members from the global inventory into `pool(c)`, excluding
/// anything already present, globally blocked, or blocked for this
/// channel. Serialized by `shared.replenish_lock` (spec §4.E): `take()`
/// calls this synchronously on a nil pop, and the background
/// `replenish_loop` calls it on its own cadence — the lock keeps the two
/// from scanning the global inventory concurrently for the same channel.
async fn replenish_once<S: Store>(shared: &Arc<Shared<S>>) {
    let _guard = shared.replenish_lock.lock().await;

    let pool_key = channel_pool_key(&shared.channel);
    let current = match shared.store.zrange_with_scores(&pool_key).await {
        Ok(m) => m,
        Err(e) => {
            log::error!("pool[{}]: could not read pool, skipping replenishment: {e}", shared.channel);
            return;
        }
    };
    if current.len() >= POOL_CAPACITY {
        return;
    }
    let have: HashSet<String> = current.into_iter().map(|m| m.member).collect();

    let inventory_keys = match shared.store.keys_matching(PROXY_KEY_PREFIX).await {
        Ok(k) => k,
        Err(e) => {
            log::error!("pool[{}]: could not read global inventory: {e}", shared.channel);
            return;
        }
    };

    let mut added = 0usize;
    for key in inventory_keys {
        if have.len() + added >= POOL_CAPACITY {
            break;
        }
        let member = key.trim_start_matches(PROXY_KEY_PREFIX).to_string();
        if have.contains(&member) {
            continue;
        }
        if is_globally_blocked(shared, &member).await
            || is_channel_blocked(shared, &member).await
            || is_leased(shared, &member).await
        {
            continue;
        }
        if shared.store.zadd(&pool_key, &member, 0).await.is_ok() {
            added += 1;
        }
    }
    if added > 0 {
        metrics::POOL_REPLENISHMENTS.with_label_values(&[&shared.channel]).inc();
        log::debug!("pool[{}]: replenished {added} proxies", shared.channel);
    }
}

async fn replenish_loop<S: Store>(shared: Arc<Shared<S>>, mut shutdown: watch::Receiver<bool>) {
    // Replenishment rides the same cadence as the center's fetcher
    // (`load_period`): both govern how quickly newly-harvested proxies
    // become leaseable.
    let mut ticker = tokio::time::interval(shared.config.load_period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
        }
        if *shutdown.borrow() {
            return;
        }
        replenish_once(&shared).await;
    }
}

/// Removes pool members whose global inventory record has since been
/// evicted. Deliberately does NOT re-check the channel blocked set here —
/// a member already removed for this channel stays out until its block
/// entry expires via `block_cleaner_loop`, even if it becomes valid again
/// in the global inventory in the meantime.
async fn cross_check_loop<S: Store>(shared: Arc<Shared<S>>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(CROSS_CHECK_PERIOD);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
        }
        if *shutdown.borrow() {
            return;
        }

        let pool_key = channel_pool_key(&shared.channel);
        let members = match shared.store.zrange_with_scores(&pool_key).await {
            Ok(m) => m,
            Err(e) => {
                log::error!("pool[{}]: could not read pool for cross-check: {e}", shared.channel);
                continue;
            }
        };
        for member in members {
            let Some((ip, port)) = member.member.split_once(':') else {
                continue;
            };
            match shared.store.hash_get(&proxy_hash_key(ip, port)).await {
                Ok(None) => {
                    let _ = shared.store.zrem(&pool_key, &member.member).await;
                }
                Ok(Some(_)) => {}
                Err(e) => log::error!("pool[{}]: cross-check read failed for {}: {e}", shared.channel, member.member),
            }
        }
    }
}

async fn block_cleaner_loop<S: Store>(shared: Arc<Shared<S>>, mut shutdown: watch::Receiver<bool>) {
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

        let blocked_key = channel_blocked_key(&shared.channel);
        let members = match shared.store.zrange_with_scores(&blocked_key).await {
            Ok(m) => m,
            Err(e) => {
                log::error!("pool[{}]: could not read blocked set: {e}", shared.channel);
                continue;
            }
        };
        let now = now_unix();
        let ttl = shared.config.block_ttl.as_secs() as i64;
        for member in members {
            if member.score + ttl < now {
                let _ = shared.store.zrem(&blocked_key, &member.member).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Anonymity;
    use crate::store::{FakeStore, ProxyFields};
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn test_config() -> EngineConfig {
        EngineConfig {
            store_address: String::new(),
            store_password: String::new(),
            validation_period: Duration::from_secs(300),
            load_period: Duration::from_secs(2),
            max_workers: 4,
            validation_timeout: Duration::from_secs(1),
            default_request_timeout: Duration::from_secs(1),
            block_ttl: Duration::from_millis(30),
            queue_capacity: 100,
            validation_url: "http://example.invalid".to_string(),
            channels: vec![],
        }
    }

    async fn seed_proxy(store: &FakeStore, ip: &str, port: &str) {
        store
            .hash_set(
                &proxy_hash_key(ip, port),
                &ProxyFields {
                    ip: ip.to_string(),
                    port: port.to_string(),
                    anonymity: Anonymity::High as i64,
                    rtt: 10,
                    validated_at: now_unix(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lease_is_exclusive_across_concurrent_takers() {
        let store = Arc::new(FakeStore::default());
        seed_proxy(&store, "1.1.1.1", "80").await;
        store.zadd(&channel_pool_key("amazon"), "1.1.1.1:80", 0).await.unwrap();

        let (pool, handle) = ProxyPool::start(store.clone(), "amazon", test_config());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.take().await }));
        }
        let mut successes = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        handle.shutdown();
        handle.join().await;
    }

    #[tokio::test]
    async fn take_returns_err_when_pool_empty() {
        let store = Arc::new(FakeStore::default());
        let (pool, handle) = ProxyPool::start(store, "amazon", test_config());
        assert!(pool.take().await.is_err());
        handle.shutdown();
        handle.join().await;
    }

    #[tokio::test]
    async fn free_then_take_round_trips() {
        let store = Arc::new(FakeStore::default());
        seed_proxy(&store, "2.2.2.2", "80").await;
        store.zadd(&channel_pool_key("amazon"), "2.2.2.2:80", 0).await.unwrap();
        let (pool, handle) = ProxyPool::start(store, "amazon", test_config());

        let record = pool.take().await.unwrap();
        assert!(pool.take().await.is_err());
        pool.free(&record).await;
        let leased_again = pool.take().await.unwrap();
        pretty_assert_eq!(leased_again, record);

        handle.shutdown();
        handle.join().await;
    }

    #[tokio::test]
    async fn delete_blocks_only_the_calling_channel() {
        let store = Arc::new(FakeStore::default());
        seed_proxy(&store, "3.3.3.3", "80").await;
        store.zadd(&channel_pool_key("amazon"), "3.3.3.3:80", 0).await.unwrap();
        store.zadd(&channel_pool_key("ebay"), "3.3.3.3:80", 0).await.unwrap();

        let (amazon_pool, amazon_handle) = ProxyPool::start(store.clone(), "amazon", test_config());
        let (ebay_pool, ebay_handle) = ProxyPool::start(store.clone(), "ebay", test_config());

        let record = amazon_pool.take().await.unwrap();
        amazon_pool.delete(&record).await;

        let amazon_blocked = store.zrange_with_scores(&channel_blocked_key("amazon")).await.unwrap();
        assert!(amazon_blocked.iter().any(|m| m.member == "3.3.3.3:80"));

        let ebay_blocked = store.zrange_with_scores(&channel_blocked_key("ebay")).await.unwrap();
        assert!(ebay_blocked.is_empty());
        assert!(ebay_pool.take().await.is_ok());

        amazon_handle.shutdown();
        amazon_handle.join().await;
        ebay_handle.shutdown();
        ebay_handle.join().await;
    }
}
