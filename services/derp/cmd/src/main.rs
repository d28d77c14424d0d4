//! DERP mesh watcher binary.
//!
//! Connects to every configured relay as a mesh watcher and keeps a
//! directory of which peers are reachable through which relay.

use clap::Parser;
use derp_client::{Client, ClientConfig, TcpDialer, WatchLoop};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod directory;
mod logging;

use config::WatchConfig;
use directory::{PeerDirectory, RelayPresence};
use logging::DerpLogFormatter;

/// Watch peer presence on a set of DERP relays
#[derive(Parser, Debug)]
#[command(name = "derp-watch", version, about = "Watch peer presence on DERP relays")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "derp-watch.yaml")]
    config: PathBuf,

    /// Relay URL to watch, e.g. http://derp1.example:3340 (repeatable)
    #[arg(long)]
    relay: Vec<String>,

    /// Mesh key shared by the relays
    #[arg(long)]
    mesh_key: Option<String>,

    /// Node private key, privkey:<hex>
    #[arg(long)]
    private_key: Option<String>,

    /// Key of the local relay to skip, nodekey:<hex>
    #[arg(long)]
    ignore_server_key: Option<String>,

    /// Dial plus handshake timeout, e.g. 10s
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Peer count status interval, e.g. 10s
    #[arg(long)]
    status_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command line flags win over file and environment
    fn apply_to(&self, config: &mut WatchConfig) {
        if !self.relay.is_empty() {
            config.relays = self.relay.clone();
        }
        if let Some(mesh_key) = &self.mesh_key {
            config.mesh_key = mesh_key.clone();
        }
        if let Some(private_key) = &self.private_key {
            config.private_key = Some(private_key.clone());
        }
        if let Some(key) = &self.ignore_server_key {
            config.ignore_server_key = Some(key.clone());
        }
        if let Some(timeout) = &self.connect_timeout {
            config.connect_timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(interval) = &self.status_interval {
            config.watch.status_interval_ms = interval.as_millis() as u64;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("derp_watch={}", args.log_level).parse()?)
        .add_directive(format!("derp_client={}", args.log_level).parse()?)
        .add_directive(format!("derp_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(DerpLogFormatter::new("derp-watch"))
        .init();

    info!("Starting derp-watch v{}", env!("CARGO_PKG_VERSION"));

    let mut config = WatchConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    config.validate()?;

    let private_key = config.private_key()?;
    let ignore_server_key = config.ignore_server_key()?.unwrap_or_default();
    let relays = config.relay_urls()?;
    info!(
        "Watching {} relays as {} (connect timeout {:?})",
        relays.len(),
        private_key.public().short_string(),
        config.connect_timeout()
    );

    let directory = Arc::new(PeerDirectory::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut clients = Vec::with_capacity(relays.len());
    let mut loops = Vec::with_capacity(relays.len());

    for url in relays {
        let client_config = ClientConfig::new(private_key.clone(), url.clone())
            .with_watcher(config.mesh_key.clone())
            .with_connect_timeout(config.connect_timeout());
        let client = Arc::new(Client::new(client_config, Arc::new(TcpDialer)));

        let handler = RelayPresence::new(url.to_string(), directory.clone());
        let watch_loop = WatchLoop::new(client.clone(), ignore_server_key, handler)
            .with_config(config.watch.clone());

        let mut shutdown = shutdown_rx.clone();
        loops.push(tokio::spawn(async move {
            let exit = watch_loop
                .run(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            (url, exit)
        }));
        clients.push(client);
    }

    tokio::signal::ctrl_c().await?;
    component_info!("watch", "Shutdown requested");
    shutdown_tx.send_replace(true);

    for result in join_all(loops).await {
        match result {
            Ok((url, exit)) => info!("Watch of {} ended: {:?}", url, exit),
            Err(e) => warn!("Watch task failed: {}", e),
        }
    }

    for client in &clients {
        if let Err(e) = client.close().await {
            component_warn!("watch", "Closing {} failed: {}", client.url(), e);
        }
    }

    info!("{} peers known at shutdown", directory.len());
    Ok(())
}
