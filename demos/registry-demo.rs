//! Registry demo: registers this process and balances picks across all instances.
//!
//! Run several copies with different `SERVICE_PORT`/`SERVICE_WEIGHT` values
//! against the same etcd cluster to watch weighted balancing between them.
//!
//! # Environment Variables
//!
//! - `ETCD_ENDPOINTS`: comma-separated etcd endpoints (default: http://127.0.0.1:2379)
//! - `ENV`, `REGION`, `APPTYPE`: key namespace (`ENV` defaults to dev)
//! - `SERVICE_NAME`: service to register and pick from (default: greeter)
//! - `SERVICE_PORT`: port to register (default: 50051)
//! - `SERVICE_WEIGHT`: weight of this instance (default: 1)
//! - `PICK_COUNT`: number of picks to make (default: 20)
//! - `PICK_INTERVAL_MS`: milliseconds between picks (default: 500)

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::sleep;
use tonic::transport::{Channel, Endpoint};
use tonic_lb_etcd::{Registry, RegistryConfig};
use tracing::{Level, error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let mut config = RegistryConfig::from_env();
    if config.endpoints.is_empty() {
        config.endpoints = vec!["http://127.0.0.1:2379".to_string()];
    }

    let service_name = env::var("SERVICE_NAME").unwrap_or_else(|_| "greeter".to_string());
    let port: u16 = env::var("SERVICE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(50051);
    let weight: i64 = env::var("SERVICE_WEIGHT")
        .ok()
        .and_then(|w| w.parse().ok())
        .unwrap_or(1);
    let pick_count: u32 = env::var("PICK_COUNT")
        .ok()
        .and_then(|c| c.parse().ok())
        .unwrap_or(20);
    let pick_interval_ms: u64 = env::var("PICK_INTERVAL_MS")
        .ok()
        .and_then(|i| i.parse().ok())
        .unwrap_or(500);

    info!("Endpoints: {:?}", config.endpoints);
    info!("Service: {service_name} on port {port} with weight {weight}");

    let registry = Registry::init(config).await?;
    info!("Namespace: {}", registry.namespace().env_prefix());

    registry.register(&service_name, port, weight).await?;

    // Feed a balance channel as well; a generated client would use `channel`.
    let (_channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
    registry.discover(&service_name, tx, |addr| {
        Endpoint::from_shared(format!("http://{addr}"))
            .expect("valid endpoint URI")
            .connect_timeout(Duration::from_secs(5))
    });

    let mut counts: HashMap<String, u32> = HashMap::new();

    for i in 1..=pick_count {
        match registry.get_address(&service_name) {
            Ok(address) => {
                info!("Pick {i}: {address}");
                *counts.entry(address).or_insert(0) += 1;
            }

            Err(e) => error!("Pick {i} failed: {e}"),
        }

        if i < pick_count {
            sleep(Duration::from_millis(pick_interval_ms)).await;
        }
    }

    info!("\n=== Load Balancing Summary ===");
    for (address, count) in &counts {
        let percentage = (f64::from(*count) / f64::from(pick_count)) * 100.0;
        info!("{address}: {count} picks ({percentage:.1}%)");
    }

    info!("Total instances used: {}", counts.len());

    registry.unregister(&service_name, port).await?;
    registry.shutdown();

    Ok(())
}
