//! floating-dns daemon entry point.
//!
//! Listens for Neutron floating IP notifications and turns attach/detach
//! updates into DNS record operations.

use std::sync::Arc;

use anyhow::Context;
use log::{error, info, warn};
use tokio::signal;

mod broker;
mod cloud;
mod config;
mod controller;
mod error;
mod resolver;
mod sink;
mod tls;
mod types;

use broker::BrokerSession;
use cloud::OpenStackCompute;
use config::Config;
use controller::Controller;
use resolver::InstanceResolver;
use sink::LogRecordSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    run().await
}

async fn run() -> anyhow::Result<()> {
    let cfg = Config::load()?;
    info!("Starting floating-dns with config: {:?}", cfg);

    let tls = tls::configure(&cfg.amqp).context("Error loading broker TLS material")?;

    let (session, deliveries) = BrokerSession::open(&cfg.amqp, tls)
        .await
        .context("Error setting up amqp consumer")?;

    // Authenticated once, shared read-only by every dispatched task.
    let compute = OpenStackCompute::authenticate(&cfg.openstack)
        .await
        .context("Error creating controller")?;
    let controller = Arc::new(Controller::new(
        InstanceResolver::new(Arc::new(compute)),
        Arc::new(LogRecordSink),
    ));

    info!("Successfully finished startup!");

    tokio::select! {
        _ = Arc::clone(&controller).run(deliveries) => {
            warn!("Broker delivery stream ended");
        }
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
    }

    // In-flight record tasks are not drained.
    session.close().await;

    info!("Shutdown complete.");
    Ok(())
}
