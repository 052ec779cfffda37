use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use fedproxy::config::{ProxyConfig, TlsConfig};
use fedproxy::context::PartyContext;
use fedproxy::envelope::Payload;
use fedproxy::link::tcp_link::TcpLinkFactory;
use fedproxy::link::Party;
use fedproxy::proxy::sender_receiver_proxy::SenderReceiverProxy;
use tracing::{info, warn, Level};

/// Run one instance per party, e.g.
///
/// ```text
/// two_party_node alice --party alice=127.0.0.1:9001 --party bob=127.0.0.1:9002
/// two_party_node bob --party alice=127.0.0.1:9001 --party bob=127.0.0.1:9002
/// ```
#[derive(Parser)]
struct Args {
    self_party: String,

    /// `id=host:port`, in rank order
    #[clap(long)]
    party: Vec<String>,

    /// proxy config as a JSON object, e.g. `{"recvTimeoutMs": 60000}`
    #[clap(long)]
    config: Option<String>,

    #[clap(long)]
    job_name: Option<String>,

    #[clap(long, default_value_t = 3)]
    rounds: u32,

    #[clap(long)]
    ca_cert: Option<PathBuf>,
    #[clap(long)]
    cert: Option<PathBuf>,
    #[clap(long)]
    key: Option<PathBuf>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut parties = Vec::new();
    for s in &args.party {
        let (id, address) = s.split_once('=')
            .ok_or_else(|| anyhow!("expected id=host:port, was {:?}", s))?;
        parties.push(Party::new(id, address));
    }

    let config = match &args.config {
        Some(json) => ProxyConfig::from_json_str(json)?,
        None => ProxyConfig::default(),
    };

    let tls = match (args.ca_cert, args.cert, args.key) {
        (Some(ca_cert), Some(cert), Some(key)) => Some(TlsConfig { ca_cert, cert, key }),
        (None, None, None) => None,
        _ => return Err(anyhow!("--ca-cert, --cert and --key must be given together")),
    };

    let proxy = Arc::new(SenderReceiverProxy::new(parties, &args.self_party, tls, &config, Arc::new(TcpLinkFactory))?);
    let peers = proxy.parties().iter()
        .map(|p| p.id.clone())
        .filter(|id| id != proxy.self_party())
        .collect::<Vec<_>>();
    let ctx = PartyContext::new(args.job_name.as_deref(), proxy.clone());

    proxy.spawn_start();
    let (ok, msg) = proxy.is_ready().await;
    if !ok {
        return Err(anyhow!("failed to start: {}", msg));
    }
    info!("{} in job {}", msg, ctx.job_name());

    for round in 0..args.rounds {
        for peer in &peers {
            let data = format!("round {} from {}", round, ctx.current_party());
            proxy.send(peer, Payload::data(data), round, peer).await?;
        }
        for peer in &peers {
            let data = proxy.get_data(peer, round, ctx.current_party()).await?;
            info!("received from {}: {}", peer, String::from_utf8_lossy(&data));
        }
    }

    for peer in &peers {
        let undecodable = proxy.num_undecodable(peer)?;
        if undecodable > 0 {
            warn!("dropped {} undecodable messages from {}", undecodable, peer);
        }
    }

    // sending is asynchronous, so give the last round time to go out before closing connections
    tokio::time::sleep(Duration::from_secs(1)).await;
    ctx.shutdown().await;
    Ok(())
}
