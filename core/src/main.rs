use clap::Parser;
use relaymq::config::{read_endpoint_file, DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT};
use relaymq::protocol::ConnectionInfo;
use relaymq::storage::TopicFileStore;
use relaymq::{Broker, BrokerConfig, RelaymqError, Result};
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(about = "RelayMQ broker - a node of the post delivery fabric")]
struct Args {
    /// Directory where this broker's topics are stored (must exist)
    broker_dir: PathBuf,

    /// IP of the leader's peer listener; starts this broker as a follower
    ip: Option<String>,

    /// Port of the leader's peer listener
    port: Option<u16>,

    /// Read the leader endpoint from a key=value file (ip=, port=) instead
    #[arg(short = 'f', long = "leader-file", conflicts_with_all = ["ip", "port"])]
    leader_file: Option<PathBuf>,

    /// Address the listeners bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Host advertised to clients and peer brokers
    #[arg(long, default_value = "127.0.0.1")]
    advertised_host: String,

    /// Port for publisher/consumer connections
    #[arg(long, default_value_t = DEFAULT_CLIENT_PORT)]
    client_port: u16,

    /// Port other brokers dial when joining
    #[arg(long, default_value_t = DEFAULT_PEER_PORT)]
    peer_port: u16,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let leader = match (&args.leader_file, &args.ip, &args.port) {
        (Some(path), _, _) => Some(read_endpoint_file(path)?),
        (None, Some(ip), Some(port)) => Some(ConnectionInfo::new(ip.clone(), *port)),
        (None, None, None) => None,
        _ => {
            return Err(RelaymqError::Config(
                "a follower needs both <ip> and <port>".to_string(),
            ))
        }
    };

    match &leader {
        Some(ci) => info!("starting follower broker, leader at {ci}"),
        None => info!("starting leader broker"),
    }
    info!("topic store: {}", args.broker_dir.display());

    let store = TopicFileStore::new(&args.broker_dir)?;
    let config = BrokerConfig {
        host: args.host,
        advertised_host: args.advertised_host,
        client_port: args.client_port,
        peer_port: args.peer_port,
        data_dir: args.broker_dir,
        leader,
    };

    let broker = Broker::new(config, Box::new(store)).await?;
    let shutdown = broker.shutdown_handle();
    let mut server = tokio::spawn(broker.run());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down gracefully");
            shutdown.shutdown();
            let _ = server.await;
        }
        result = &mut server => {
            if let Ok(Err(e)) = result {
                return Err(e);
            }
        }
    }

    info!("broker shut down");
    Ok(())
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
