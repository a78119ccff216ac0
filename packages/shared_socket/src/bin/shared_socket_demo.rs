use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

use shared_socket::{
    ClientProxy, ContextKind, MemoryServer, ProxyConfig, SharedContext, SocketIoClient,
    load_config,
};

const MEMORY_SCHEME: &str = "mem://";

#[derive(Parser)]
#[command(name = "shared-socket-demo")]
#[command(about = "Drive several client proxies over one shared event connection")]
struct Args {
    /// Number of client proxies to start
    #[arg(short = 'n', long, default_value = "3")]
    proxies: usize,

    /// How proxies reach the hub (overrides the config file)
    #[arg(short, long, value_enum)]
    context: Option<ContextKind>,

    /// Event every proxy subscribes to
    #[arg(long, default_value = "news")]
    event: String,

    /// Events to publish once everyone is subscribed (mem:// only)
    #[arg(short, long, default_value = "2")]
    events: usize,

    /// Event emitted by each proxy, waiting for the server's ack
    #[arg(long, default_value = "save")]
    ack_event: String,

    /// Seconds to keep listening on a socket.io server
    #[arg(long, default_value = "10")]
    listen_secs: u64,

    /// Directory holding shared_socket.toml
    #[arg(long, default_value = ".")]
    config_dir: std::path::PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        "shared_socket=debug,shared_socket_demo=debug"
    } else {
        "shared_socket=info,shared_socket_demo=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config: ProxyConfig = load_config(&args.config_dir)
        .extract()
        .context("Failed to load config")?;
    if config.url.is_empty() {
        config.url = format!("{MEMORY_SCHEME}demo");
    }
    if let Some(kind) = args.context {
        config.context = kind;
    }

    info!(url = %config.url, context = ?config.context, proxies = args.proxies, "starting demo");
    if config.url.starts_with(MEMORY_SCHEME) {
        run_in_memory(&args, &config).await
    } else {
        run_socketio(&args, &config).await
    }
}

/// Everything in-process: the demo publishes and answers acks itself.
async fn run_in_memory(args: &Args, config: &ProxyConfig) -> Result<()> {
    let server = MemoryServer::new();
    server.set_responder(|event, data| json!({ "event": event, "stored": data }));
    let remote = Arc::new(server.clone());
    let context = config.context.build(remote.clone());
    let proxies = start_proxies(args, config, remote, context)?;

    let expected = match config.context {
        ContextKind::Shared => args.proxies.min(1),
        _ => args.proxies,
    };
    wait_for_listeners(&server, &args.event, expected).await;
    for n in 0..args.events {
        let delivered = server.publish(&args.event, json!({ "seq": n }));
        info!(seq = n, delivered, "published");
    }

    for (index, proxy) in proxies.iter().enumerate() {
        let reply = proxy
            .request(&args.ack_event, &json!({ "proxy": index }))
            .await
            .context("Acknowledgement never arrived")?;
        info!(proxy = index, mode = ?proxy.mode(), %reply, "ack round trip");
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    info!(
        connections = server.connection_count(),
        connects = server.connect_count(),
        listeners = server.active_listeners(&args.event),
        "demo finished"
    );
    Ok(())
}

/// A real socket.io server: listen for a while, try one ack round trip
/// per proxy. Servers that never answer the ack only produce a warning.
async fn run_socketio(args: &Args, config: &ProxyConfig) -> Result<()> {
    let remote = Arc::new(SocketIoClient::new());
    let context = config.context.build(remote.clone());
    let proxies = start_proxies(args, config, remote, context)?;

    for (index, proxy) in proxies.iter().enumerate() {
        let payload = json!({ "proxy": index });
        let request = proxy.request(&args.ack_event, &payload);
        match tokio::time::timeout(Duration::from_secs(5), request).await {
            Ok(Ok(reply)) => info!(proxy = index, mode = ?proxy.mode(), %reply, "ack round trip"),
            Ok(Err(e)) => warn!(proxy = index, error = %e, "ack failed"),
            Err(_) => warn!(proxy = index, event = %args.ack_event, "no ack within 5s"),
        }
    }

    tokio::time::sleep(Duration::from_secs(args.listen_secs)).await;
    info!("demo finished");
    Ok(())
}

fn start_proxies(
    args: &Args,
    config: &ProxyConfig,
    remote: Arc<dyn shared_socket::remote::RemoteFactory>,
    context: Arc<dyn SharedContext>,
) -> Result<Vec<ClientProxy>> {
    let mut proxies = Vec::with_capacity(args.proxies);
    for index in 0..args.proxies {
        let proxy = ClientProxy::from_config(config, remote.clone(), context.clone())
            .context("Failed to build proxy")?;
        proxy.on("connect", move |_| info!(proxy = index, "connected"));
        proxy.on("disconnect", move |reason| info!(proxy = index, %reason, "disconnected"));
        proxy.on("connect_error", move |err| warn!(proxy = index, %err, "connect error"));
        let event = args.event.clone();
        proxy.on(&args.event, move |payload| info!(proxy = index, %event, %payload, "event"));
        proxies.push(proxy);
    }
    Ok(proxies)
}

async fn wait_for_listeners(server: &MemoryServer, event: &str, expected: usize) {
    for _ in 0..100 {
        if server.active_listeners(event) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
