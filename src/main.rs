mod config;
mod engine;
mod error;
mod query;
mod resolver;
mod response;
mod rule;
mod syntax;
mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use arc_swap::ArcSwap;
use bytes::Bytes;
use clap::Parser;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_settings;
use crate::engine::{Engine, Outcome, RuleSet};
use crate::query::{Context, Query};
use crate::resolver::{ResolverPool, Transport, UdpTransport, default_pool};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "DNS proxy with a rules engine to monitor, block and rewrite queries in flight",
    long_about = None
)]
struct Args {
    /// Settings file (JSON)
    #[arg(short = 'c', long = "config", default_value = "config/sentry.json")]
    config: PathBuf,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker count (defaults to the number of CPUs)
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
    /// Emit logs as JSON lines
    #[arg(long = "json-logs", default_value_t = false)]
    json_logs: bool,
}

/// Everything a worker needs to answer one datagram.
struct Server {
    engine: Engine,
    fallback: ResolverPool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.json_logs);

    let settings = load_settings(&args.config).context("load settings")?;
    let bind_addr: SocketAddr = settings.bind_udp.parse().context("parse bind addr")?;
    let transport: Arc<dyn Transport> = Arc::new(UdpTransport);

    let rules = RuleSet::load(&settings.rules, &settings, &transport).context("load rules")?;
    if rules.is_empty() {
        warn!(
            path = %settings.rules.display(),
            "rules file has no rules, every query is forwarded"
        );
    }
    for rule in rules.iter() {
        debug!(kind = %rule.kind(), domain = %rule.domain().as_str(), "rule active");
    }
    info!(rules = rules.len(), path = %settings.rules.display(), "rules loaded");

    let fallback = default_pool(
        &settings.default_resolvers,
        settings.resolution_timeout(),
        Arc::clone(&transport),
    )?;
    info!(
        resolvers = ?fallback.resolvers(),
        timeout_ms = fallback.timeout().as_millis() as u64,
        "default resolvers configured"
    );

    let engine = Engine::new(
        Arc::new(ArcSwap::from_pointee(rules)),
        settings.max_rewrite_depth,
    );
    watcher::spawn(
        settings.rules.clone(),
        settings.clone(),
        transport,
        Arc::clone(engine.rules()),
    );
    let server = Arc::new(Server { engine, fallback });

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    let socket = Arc::new(bind_udp_socket(bind_addr)?);
    info!(bind_udp = %bind_addr, udp_workers, "dns server started");

    let mut handles = Vec::with_capacity(udp_workers);
    for worker_id in 0..udp_workers {
        let server = Arc::clone(&server);
        let socket = Arc::clone(&socket);
        handles.push(tokio::spawn(async move {
            if let Err(err) = run_udp_worker(worker_id, socket, server).await {
                error!(worker_id, error = %err, "udp worker exited");
            }
        }));
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    for h in handles {
        h.abort();
    }
    Ok(())
}

fn init_tracing(debug: bool, json: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_ansi(false))
            .init();
    }
}

fn bind_udp_socket(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    if let Err(e) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp send buffer size: {}", e);
    }
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket.bind(&addr.into()).context("bind socket")?;
    UdpSocket::from_std(socket.into()).context("from_std")
}

async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    server: Arc<Server>,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(err) => {
                debug!(worker_id, error = %err, "udp recv failed");
                continue;
            }
        };
        let packet = Bytes::copy_from_slice(&buf[..len]);
        let server = Arc::clone(&server);
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            if let Some(resp) = server.handle_packet(&packet, peer).await {
                let _ = socket.send_to(&resp, peer).await;
            }
        });
    }
}

impl Server {
    /// Answers one datagram. `None` means the packet is dropped unanswered.
    async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> Option<Bytes> {
        let msg = match Message::from_bytes(packet) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(client_ip = %peer.ip(), error = %err, "dropping undecodable packet");
                return None;
            }
        };
        let query = Query::from_message(msg)?;
        let ctx = Context::new().with("client", peer).with("id", query.id());

        let failed = match self.engine.evaluate(query.clone(), &ctx).await {
            Outcome::Responded(bytes) => return Some(bytes),
            Outcome::NoAction(next) => match self.fallback.forward(&next).await {
                Ok(bytes) => return Some(bytes),
                Err(err) => err.to_string(),
            },
            Outcome::Failed(err) => err.to_string(),
        };
        warn!(
            event = "dns_response",
            qname = %query.name(),
            client_ip = %peer.ip(),
            error = %failed,
            "answering SERVFAIL"
        );
        response::server_failure(&query).ok()
    }
}
