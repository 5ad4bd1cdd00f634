//! Manual smoke-test harness, not part of the public API contract (see
//! SPEC_FULL.md §2 "Crate shape"). Joins one cluster, prints every rebalance
//! the callback observes, and leaves on Ctrl-C.
//!
//! Reads `CLUSTERMESH_KEY`, `CLUSTERMESH_WORKERS` and `CLUSTERMESH_REGISTRY`
//! from the environment (optionally via a `.env` file through `dotenvy`,
//! matching the teacher's own `dotenvy` use in its binary). With no
//! `CLUSTERMESH_REGISTRY` set, falls back to static mode so this runs with
//! no external services at all.
//!
//! ```text
//! cargo run --bin smoke
//! CLUSTERMESH_REGISTRY=https://kv.example.com cargo run --bin smoke
//! ```

use std::env;

use clustermesh::Cluster;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let key = env::var("CLUSTERMESH_KEY").unwrap_or_else(|_| "smoke-demo".to_string());
    let workers: u32 = env::var("CLUSTERMESH_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let registry = env::var("CLUSTERMESH_REGISTRY").ok();

    let cluster = Cluster::new(&key)?;
    cluster.set_workers(workers)?;
    cluster.set_verbose(true);
    cluster.set_rebalance_callback(|state| {
        println!(
            "rebalanced: index={} workers={} total={} passive={}",
            state.index, state.workers, state.total, state.passive
        );
    })?;

    if let Some(endpoint) = registry {
        cluster.set_registry(Some(&endpoint))?;
        cluster.join().await?;
    } else {
        cluster.set_static_index(0)?;
        cluster.set_static_total(workers as u64)?;
        cluster.join().await?;
    }

    println!("joined as {}; press Ctrl-C to leave", cluster.instance_id());
    tokio::signal::ctrl_c().await?;

    cluster.leave().await?;
    println!("left cleanly");
    Ok(())
}
