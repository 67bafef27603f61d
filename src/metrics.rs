//! Process-level counters for the lifecycle engine, using the teacher's
//! `prometheus` + `lazy_static` stack. A `/metrics` HTTP endpoint is out of
//! scope for this crate (spec Non-goals; no outer surface); a caller's own
//! binary may register `REGISTRY` with its own exporter.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref PROXIES_DISCOVERED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "proxypool_proxies_discovered_total",
            "New candidate proxies enqueued for validation, by vendor"
        ),
        &["vendor"]
    )
    .unwrap();
    pub static ref VALIDATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "proxypool_validations_total",
            "Validation outcomes processed by the center's worker pool"
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref BLOCK_CLEANUPS: IntCounter = IntCounter::new(
        "proxypool_global_block_cleanups_total",
        "Entries removed from the global blocked set by the block-cleaner"
    )
    .unwrap();
    pub static ref POOL_TAKES: IntCounterVec = IntCounterVec::new(
        Opts::new("proxypool_pool_takes_total", "Take() outcomes, by channel"),
        &["channel", "outcome"]
    )
    .unwrap();
    pub static ref POOL_FREES: IntCounterVec = IntCounterVec::new(
        Opts::new("proxypool_pool_frees_total", "Free() calls, by channel"),
        &["channel"]
    )
    .unwrap();
    pub static ref POOL_DELETES: IntCounterVec = IntCounterVec::new(
        Opts::new("proxypool_pool_deletes_total", "Delete() calls, by channel"),
        &["channel"]
    )
    .unwrap();
    pub static ref POOL_REPLENISHMENTS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "proxypool_pool_replenishments_total",
            "Replenishment runs, by channel"
        ),
        &["channel"]
    )
    .unwrap();
}

/// Registers every counter declared above with `REGISTRY`. Idempotent only
/// in the sense that it must be called exactly once per process; a second
/// call fails with an `AlreadyReg` error from the `prometheus` crate.
pub fn register_all() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(PROXIES_DISCOVERED.clone()))?;
    REGISTRY.register(Box::new(VALIDATIONS.clone()))?;
    REGISTRY.register(Box::new(BLOCK_CLEANUPS.clone()))?;
    REGISTRY.register(Box::new(POOL_TAKES.clone()))?;
    REGISTRY.register(Box::new(POOL_FREES.clone()))?;
    REGISTRY.register(Box::new(POOL_DELETES.clone()))?;
    REGISTRY.register(Box::new(POOL_REPLENISHMENTS.clone()))?;
    Ok(())
}
