use clap::Parser;
use proxypool::client::{ClientFacade, ReqwestFacade};
use proxypool::config::{self, EngineConfig};
use proxypool::pool::ProxyPool;
use proxypool::store::RedisStore;
use proxypool::validator::HttpValidator;
use proxypool::vendor;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct ProxyPoolArgs {
    config: std::path::PathBuf,
}

pub async fn run() {
    let args = ProxyPoolArgs::parse();
    let cfg = match config::load_config(args.config.clone()) {
        Ok(cfg) => cfg,
        Err(error) => {
            eprintln!("Error parsing {}: {error}", args.config.display());
            std::process::exit(exitcode::CONFIG);
        }
    };
    let engine_config: EngineConfig = (&cfg).into();

    if let Err(error) = proxypool::metrics::register_all() {
        log::warn!("could not register metrics, continuing without them: {error}");
    }

    let validation_url = match url::Url::parse(&engine_config.validation_url) {
        Ok(u) => u,
        Err(error) => {
            eprintln!("invalid validation_url {}: {error}", engine_config.validation_url);
            std::process::exit(exitcode::CONFIG);
        }
    };

    let store = match RedisStore::connect(&engine_config.store_address, &engine_config.store_password).await {
        Ok(store) => Arc::new(store),
        Err(error) => {
            eprintln!("could not connect to store: {error}");
            std::process::exit(exitcode::UNAVAILABLE);
        }
    };

    let vendors = vendor::registry::build(&cfg.enabled_vendors);
    let validator = Arc::new(HttpValidator::new(validation_url, engine_config.validation_timeout));

    let center_handle = proxypool::center::ProxyCenter::start(
        store.clone(),
        vendors,
        validator,
        engine_config.clone(),
    );

    let mut pool_handles = Vec::new();
    let mut facades: Vec<Arc<dyn ClientFacade>> = Vec::new();
    for channel in &engine_config.channels {
        let (pool, handle) = ProxyPool::start(store.clone(), channel.clone(), engine_config.clone());
        pool_handles.push(handle);
        facades.push(Arc::new(ReqwestFacade::new(pool, engine_config.default_request_timeout)));
    }
    log::info!("started proxy center and {} channel pools", facades.len());

    if let Err(error) = tokio::signal::ctrl_c().await {
        log::error!("could not listen for shutdown signal: {error}");
    }

    log::info!("shutting down");
    center_handle.shutdown();
    for handle in &pool_handles {
        handle.shutdown();
    }
    center_handle.join().await;
    for handle in pool_handles {
        handle.join().await;
    }
}

#[tokio::main]
async fn main() {
    simple_logger::SimpleLogger::new().env().init().unwrap();
    run().await
}
