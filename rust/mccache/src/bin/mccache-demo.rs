//! Random traffic generator for a McCache node.
//!
//! Run the same binary on several hosts in one multicast domain and watch
//! their caches converge.  The ops log (RUST_LOG=mccache=debug) carries the
//! per-operation detail; a metrics snapshot is requested from the whole
//! cluster on the way out.

use std::time::{Duration, SystemTime};

use clap::Parser;
use rand::Rng;
use tracing_subscriber::EnvFilter;

use mccache::{McCache, McCacheConfig};

#[derive(Parser, Debug)]
#[command(
    name = "mccache-demo",
    about = "Random get/set/del traffic against a McCache node"
)]
struct Args {
    /// How long to run, in seconds.
    #[arg(long, default_value_t = 60)]
    duration: u64,
    /// Namespace to exercise.
    #[arg(long, default_value = "demo")]
    namespace: String,
    /// Size of the random key space.
    #[arg(long, default_value_t = 200)]
    keys: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let node = McCache::new(McCacheConfig::load()?)?;
    node.start().await?;
    let cache = node.get_cache::<String, String>(&args.namespace);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration);
    while tokio::time::Instant::now() < deadline {
        let key = format!("k{}", rand::thread_rng().gen_range(0..args.keys));
        match rand::thread_rng().gen_range(0..10u8) {
            0 => {
                // Misses are expected; some other node may have won the race.
                let _ = cache.delete(&key);
            }
            1..=4 => {
                let stamp = humantime::format_rfc3339_nanos(SystemTime::now()).to_string();
                cache.set(&key, &stamp)?;
            }
            _ => {
                let _ = cache.get(&key);
            }
        }
        let pause = rand::thread_rng().gen_range(10..200);
        tokio::time::sleep(Duration::from_millis(pause)).await;
    }

    tracing::info!(
        "done; {} entries locally, asking the cluster for metrics",
        cache.len()
    );
    node.get_cluster_metrics(None);
    node.shutdown().await;
    Ok(())
}
