//! wg-steward daemon entry point
//!
//! Construction order matters: metrics, inventory client, engines, and the
//! subscriber must all come up before the supervisor starts, and any
//! construction failure aborts startup (operators provision before launch).
//! SIGINT or SIGTERM flips the shutdown watch; outstanding kernel calls
//! finish, then the process exits cleanly.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use wg_steward::{
    ApiClient, ApiConfig, Config, Metrics, PortforwardEngine, Subscriber, Supervisor,
    WireguardEngine, EVENT_CHANNEL_CAPACITY,
};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    if config.version {
        println!("{}", wg_steward::VERSION);
        return Ok(());
    }

    init_logging();
    info!("starting wg-steward {}", wg_steward::VERSION);

    let metrics = Metrics::new(&config.statsd_address).context("error initializing metrics")?;

    let api = ApiClient::new(ApiConfig {
        base_url: config.url.clone(),
        username: config.username.clone(),
        password: config.password.clone(),
        hostname: config.hostname.clone(),
        timeout: config.api_timeout,
    })
    .context("error initializing the api client")?;

    let interfaces = config.interface_list()?;
    let wireguard = WireguardEngine::new(interfaces).context("error initializing wireguard")?;

    let portforward = PortforwardEngine::new(
        &config.portforwarding_chain_prefix,
        &config.portforwarding_ipset_ipv4,
        &config.portforwarding_ipset_ipv6,
        &config.hostname,
    )
    .context("error initializing portforwarding")?;
    info!(location = portforward.location(), "portforwarding chains verified");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let subscriber = Subscriber {
        url: config.mq_url.clone(),
        username: config.mq_username.clone(),
        password: config.mq_password.clone(),
        channel: config.mq_channel.clone(),
        metrics: metrics.clone(),
    };
    let subscriber_handle = subscriber
        .subscribe(shutdown_rx.clone(), events_tx)
        .context("error connecting to message-queue")?;

    let supervisor = Supervisor::new(
        api,
        wireguard,
        portforward,
        metrics,
        events_rx,
        &config.intervals(),
        shutdown_rx,
    );
    let supervisor_handle = tokio::spawn(supervisor.run());

    tokio::select! {
        _ = signal::ctrl_c() => info!("received SIGINT, shutting down"),
        () = wait_for_sigterm() => info!("received SIGTERM, shutting down"),
    }
    let _ = shutdown_tx.send(true);

    // Outstanding kernel calls are non-cancellable; give them a moment
    let _ = tokio::time::timeout(Duration::from_secs(5), supervisor_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), subscriber_handle).await;

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}
