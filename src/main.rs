//! Coalescing Cache CLI
//!
//! Single operations against a backend, plus a `burst` mode that shows how
//! same-tick requests collapse into one round trip.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coalescing_cache::{
    config::{Args, BackendKind, Command},
    CoalescingCache, MemoryBackend,
};

// Coalescing relies on the flush task not running while a caller records
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("coalescing_cache={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = args.cache_config();
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let cache = match args.backend {
        BackendKind::Redis => CoalescingCache::connect(config)
            .await
            .context("Failed to connect to Redis")?,
        BackendKind::Memory => {
            info!("Using in-memory backend (nothing persists)");
            CoalescingCache::with_backend(config, Arc::new(MemoryBackend::new()))?
        }
    };

    cache.when_ready().await.context("Backend not ready")?;

    let outcome = run(&cache, args.command).await;
    cache.close().await.context("Failed to close backend")?;
    outcome
}

async fn run(cache: &CoalescingCache, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Get { key } => {
            let record = cache.get(&key).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Set {
            key,
            version,
            value,
        } => {
            let value: serde_json::Value =
                serde_json::from_str(&value).context("VALUE must be valid JSON")?;
            cache.set(&key, version, &value).await?;
            println!("OK");
        }
        Command::Delete { key } => {
            cache.delete(&key).await?;
            println!("OK");
        }
        Command::DeleteBulk { keys } => {
            let count = keys.len();
            cache.delete_bulk(keys).await?;
            println!("Deleted {count} key(s)");
        }
        Command::Burst { count } => burst(cache, count).await?,
    }

    Ok(())
}

/// Record `count` mixed operations before yielding, then await them all
async fn burst(cache: &CoalescingCache, count: usize) -> anyhow::Result<()> {
    let keys = (count / 4).max(1);
    let mut writes = Vec::new();
    let mut reads = Vec::new();

    for i in 0..count {
        let key = format!("burst:{}", i % keys);
        match i % 3 {
            0 | 1 => writes.push(cache.set(key, i as i64, &serde_json::json!({ "i": i }))),
            _ => reads.push(cache.get(key)),
        }
    }

    let write_results = futures::future::join_all(writes).await;
    let read_results = futures::future::join_all(reads).await;

    let failed = write_results.iter().filter(|r| r.is_err()).count()
        + read_results.iter().filter(|r| r.is_err()).count();

    let stats = cache.stats();
    println!("operations issued:   {count}");
    println!("failed:              {failed}");
    println!("flushes:             {}", stats.flushes);
    println!("backend ops:         {}", stats.operations);
    println!("writes superseded:   {}", stats.writes_superseded);
    println!("reads coalesced:     {}", stats.reads_coalesced);
    println!("average batch size:  {:.1}", stats.average_batch_size());

    Ok(())
}
