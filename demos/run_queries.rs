//! Example running a handful of queries concurrently.
//!
//! This example shows how to:
//! - Configure a client and the default query runner
//! - Run queries concurrently within the service's slot limit
//! - Inspect results and classified errors recorded on each query
//!
//! Run with: `cargo run --example run_queries`

use overpass_engine::{Client, DefaultQueryRunner, Error, Query};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("overpass_engine=info")
        .init();

    let runner = DefaultQueryRunner::builder()
        .max_tries(3)?
        .cache_ttl(Duration::from_secs(600))
        .build();

    let client = Client::builder()
        .user_agent("overpass-engine-demo/0.1")
        .runner(Arc::new(runner))
        .build()?;

    println!("=== Status ===");
    match client.status().await {
        Ok(status) => println!("{} ({} running)", status, status.nb_running_queries),
        Err(e) => println!("Status unavailable: {}", e),
    }
    println!();

    println!("=== Queries ===");
    let amenities = ["cafe", "library", "pharmacy"];

    let handles: Vec<_> = amenities
        .into_iter()
        .map(|amenity| {
            let client = client.clone();
            let code = format!(
                "[timeout:30]; node[amenity={}](52.50,13.35,52.53,13.42); out;",
                amenity
            );
            tokio::spawn(async move {
                let mut query = Query::new(code)
                    .with_label("amenity", amenity)
                    .with_run_timeout(Some(Duration::from_secs(120)))
                    .with_raise_on_failure(false);
                let _ = client.run_query(&mut query).await;
                query
            })
        })
        .collect();

    for handle in handles {
        let query = handle.await?;
        match query.error() {
            None => println!(
                "{}: {} elements, data as of {}",
                query,
                query.result_set().map_or(0, |e| e.len()),
                query.timestamp_osm().unwrap_or("unknown")
            ),
            Some(Error::Giveup { cause, .. }) => println!("{}: gave up, {}", query, cause),
            Some(e) => println!("{}: {}", query, e),
        }
    }

    Ok(())
}
