//! Broker configuration.

use std::fs;
use std::path::{Path, PathBuf};

use crate::protocol::ConnectionInfo;
use crate::{RelaymqError, Result};

/// Default port for publisher/consumer connections.
pub const DEFAULT_CLIENT_PORT: u16 = 29621;
/// Default port for broker-to-broker connections.
pub const DEFAULT_PEER_PORT: u16 = 29622;

/// Configuration of one broker node.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address the listeners bind to.
    pub host: String,
    /// Host name advertised to clients and peers; must be reachable from
    /// both, so binding to `0.0.0.0` still advertises something routable.
    pub advertised_host: String,
    /// Port for publisher and consumer connections.
    pub client_port: u16,
    /// Port other brokers dial when joining the cluster.
    pub peer_port: u16,
    /// Root directory of the topic store.
    pub data_dir: PathBuf,
    /// Peer endpoint of the leader broker. `None` makes this broker the
    /// leader.
    pub leader: Option<ConnectionInfo>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            advertised_host: "127.0.0.1".to_string(),
            client_port: DEFAULT_CLIENT_PORT,
            peer_port: DEFAULT_PEER_PORT,
            data_dir: PathBuf::from("./data"),
            leader: None,
        }
    }
}

impl BrokerConfig {
    pub fn is_leader(&self) -> bool {
        self.leader.is_none()
    }
}

/// Reads a `key=value` endpoint file with `ip` and `port` entries, as passed
/// to the server and client binaries with `-f`.
///
/// Blank lines and `#` comments are ignored. The port must parse as a
/// decimal number in `0..=65535`.
pub fn read_endpoint_file(path: &Path) -> Result<ConnectionInfo> {
    let contents = fs::read_to_string(path)?;

    let mut ip = None;
    let mut port = None;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(RelaymqError::Config(format!(
                "malformed line '{line}' in {}",
                path.display()
            )));
        };
        match key.trim() {
            "ip" => ip = Some(value.trim().to_string()),
            "port" => port = Some(value.trim().to_string()),
            _ => {}
        }
    }

    let ip = ip.ok_or_else(|| {
        RelaymqError::Config(format!("missing 'ip' entry in {}", path.display()))
    })?;
    let port = port.ok_or_else(|| {
        RelaymqError::Config(format!("missing 'port' entry in {}", path.display()))
    })?;
    let port = port
        .parse::<u16>()
        .map_err(|_| RelaymqError::Config(format!("invalid port number: {port}")))?;

    Ok(ConnectionInfo::new(ip, port))
}
