//! Skein CLI
//!
//! Serve, call and ping Skein nodes over TCP.

mod config;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use skein_core::Node;
use skein_core::rpc::{Dispatcher, HandlerError, HandlerTable, RequestOptions};
use skein_transport::{TcpConnector, TcpServer, WorkerPool};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, parse_host_port};

/// Skein - multiplexed request/response over pooled channels
#[derive(Parser)]
#[command(name = "skein")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept channels and serve `echo`, `log` and ping
    Serve {
        /// Listen address (defaults to node.listen_addr)
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Send one request and print the response payload
    Call {
        /// Remote node as host:port
        #[arg(required = true)]
        addr: String,

        /// Action name
        #[arg(required = true)]
        action: String,

        /// Request payload
        #[arg(default_value = "")]
        payload: String,

        /// Response deadline in milliseconds (defaults to the configured one)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Application header as key=value (repeatable)
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Send as one-way and do not wait for a response
        #[arg(long)]
        oneway: bool,
    },

    /// Measure PING round-trip time
    Ping {
        /// Remote node as host:port
        #[arg(required = true)]
        addr: String,

        /// Number of pings
        #[arg(short = 'n', long, default_value_t = 4)]
        count: u32,
    },
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("header '{}' is not key=value", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    // -v wins over the configured level; RUST_LOG wins over both
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Serve { bind } => serve(bind, &config).await?,
        Commands::Call {
            addr,
            action,
            payload,
            timeout_ms,
            headers,
            oneway,
        } => {
            let mut options = RequestOptions::new();
            if let Some(ms) = timeout_ms {
                options = options.timeout(Duration::from_millis(ms));
            }
            for (key, value) in headers {
                options = options.header(key, value);
            }
            call(&addr, &action, payload, options, oneway, &config).await?;
        }
        Commands::Ping { addr, count } => ping(&addr, count, &config).await?,
    }

    Ok(())
}

fn client(config: &Config) -> anyhow::Result<Dispatcher> {
    let dispatcher = Dispatcher::builder()
        .config(config.dispatcher.clone())
        .connector(Arc::new(TcpConnector::new(config.transport_config())))
        .build()?;
    Ok(dispatcher)
}

fn remote(addr: &str) -> anyhow::Result<Node> {
    let (host, port) = parse_host_port(addr)?;
    Ok(Node::new(addr, host, port))
}

fn demo_handlers() -> Arc<HandlerTable> {
    let handlers = HandlerTable::new();
    handlers.register_fn("echo", |_, payload| Ok(payload));
    handlers.register_fn("log", |ctx, payload| {
        let text = std::str::from_utf8(&payload)
            .map_err(|_| HandlerError::new("log payload must be UTF-8"))?;
        tracing::info!(
            peer = ?ctx.peer_addr,
            headers = ?ctx.headers,
            "log: {}",
            text
        );
        Ok(Bytes::new())
    });
    Arc::new(handlers)
}

/// Serve until Ctrl+C
async fn serve(bind: Option<SocketAddr>, config: &Config) -> anyhow::Result<()> {
    let addr = match bind {
        Some(addr) => addr,
        None => config.parse_listen_addr()?,
    };

    let workers = Arc::new(WorkerPool::new(config.worker_config())?);
    let dispatcher = Dispatcher::builder()
        .config(config.dispatcher.clone())
        .connector(Arc::new(TcpConnector::new(config.transport_config())))
        .executor(workers.clone())
        .handlers(demo_handlers())
        .build()?;

    let server = TcpServer::bind(addr, config.transport_config(), dispatcher.channel_handler()).await?;

    println!("Skein node '{}'", config.node.name);
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listening on: {}", server.local_addr());
    println!("Actions: {}", dispatcher.handlers().actions().join(", "));
    println!("Workers: {}", workers.num_workers());
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    server.shutdown().await;
    dispatcher.shutdown();
    workers.shutdown();

    let stats = dispatcher.stats();
    tracing::info!(
        served = stats.requests_served,
        handler_failures = stats.handler_failures,
        decode_errors = stats.decode_errors,
        handled = workers.stats().total_tasks(),
        "Server stopped"
    );
    Ok(())
}

/// Send one request (or one-way frame)
async fn call(
    addr: &str,
    action: &str,
    payload: String,
    options: RequestOptions,
    oneway: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let node = remote(addr)?;
    let dispatcher = client(config)?;
    let payload = Bytes::from(payload);

    if oneway {
        dispatcher.send_oneway(&node, action, payload, options).await?;
        flush(&dispatcher, &node, config.dispatcher.pool.connect_timeout()).await;
        println!("sent");
    } else {
        let result = dispatcher.send_request(&node, action, payload, options).await?;
        let response = result.result().await.map_err(skein_core::rpc::RpcError::from)?;
        println!("{}", String::from_utf8_lossy(&response));
    }

    dispatcher.shutdown();
    Ok(())
}

/// Wait for queued writes to `node` to reach the socket
async fn flush(dispatcher: &Dispatcher, node: &Node, limit: Duration) {
    let Some(connection) = dispatcher.pool().get(node) else {
        return;
    };
    let deadline = tokio::time::Instant::now() + limit;
    while connection.outstanding_sends() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Ping `count` times and print round-trip times
async fn ping(addr: &str, count: u32, config: &Config) -> anyhow::Result<()> {
    let node = remote(addr)?;
    let dispatcher = client(config)?;

    let mut total = Duration::ZERO;
    let mut received = 0u32;
    for seq in 0..count {
        match dispatcher.ping(&node, None).await {
            Ok(rtt) => {
                received += 1;
                total += rtt;
                println!("pong from {}: seq={} time={:.3} ms", addr, seq, rtt.as_secs_f64() * 1e3);
            }
            Err(e) => println!("ping {} seq={} failed: {}", addr, seq, e),
        }
        if seq + 1 < count {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    println!();
    println!("{} sent, {} received", count, received);
    if received > 0 {
        println!(
            "average {:.3} ms",
            total.as_secs_f64() * 1e3 / f64::from(received)
        );
    }

    dispatcher.shutdown();
    Ok(())
}
