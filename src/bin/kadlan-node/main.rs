use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use kadlan::{NodeId, Server, ServerConfig};
use tokio::sync::oneshot;
use tracing::info;

/// A LAN-discoverable Kademlia node.
#[derive(Parser, Debug)]
#[command(name = "kadlan-node", version = env!("CARGO_PKG_VERSION"))]
struct Opt {
    /// Port to listen on for the RPC socket. `0` lets the OS assign one.
    #[clap(long, default_value_t = 0)]
    port: u16,

    /// Deterministic node id, derived by hashing this seed string.
    ///
    /// If omitted, a random id is generated.
    #[clap(long)]
    node_id_seed: Option<String>,

    /// Bootstrap contact to ping on startup, as `ip:port`. Repeatable.
    #[clap(long = "bootstrap")]
    bootstrap: Vec<SocketAddr>,

    /// Bucket size (k).
    #[clap(long)]
    ksize: Option<usize>,

    /// Lookup concurrency (alpha).
    #[clap(long)]
    alpha: Option<usize>,

    /// Log output format: "default" or "json".
    #[clap(long, default_value = "default")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let opt = Opt::parse();
    init_tracing(&opt.log_format)?;

    let mut config = ServerConfig::default().with_bind_addr(SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        opt.port,
    ));
    if let Some(seed) = &opt.node_id_seed {
        config = config.with_node_id(NodeId::digest(seed.as_bytes()));
    }
    if let Some(ksize) = opt.ksize {
        config = config.with_ksize(ksize);
    }
    if let Some(alpha) = opt.alpha {
        config = config.with_alpha(alpha);
    }

    let (bootstrapped_tx, bootstrapped_rx) = oneshot::channel();
    let server = Server::start(config, move || {
        let _ = bootstrapped_tx.send(());
    })
    .await
    .wrap_err("failed to start server")?;

    info!(
        local_id = %server.local_id(),
        addr = %server.local_addr().wrap_err("server has no local addr")?,
        "kadlan node listening",
    );

    if !opt.bootstrap.is_empty() {
        let found = server.bootstrap(opt.bootstrap.clone()).await;
        info!(contacts = opt.bootstrap.len(), reached = found.len(), "bootstrap complete");
    }

    tokio::select! {
        _ = bootstrapped_rx => {
            info!("bootstrapped (explicit contact or LAN discovery)");
        }
        _ = tokio::time::sleep(Duration::from_secs(30)) => {
            info!("no bootstrap yet after 30s, continuing to idle and listen for LAN peers");
        }
    }

    // Idle forever, serving inbound requests and refreshing the table on
    // its own schedule until the process is killed.
    std::future::pending::<()>().await;
    Ok(())
}

fn init_tracing(log_format: &str) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match log_format {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    }
    .map_err(|e| color_eyre::eyre::eyre!("failed to install tracing subscriber: {e}"))
}
