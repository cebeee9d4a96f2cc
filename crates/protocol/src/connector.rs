//! Establishing connections to a remote endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, error, trace};

use crate::connection::{Connection, ResponseListener};
use crate::ProtocolError;

/// Seam for opening a transport to the remote endpoint.
///
/// Production code uses [`TcpConnector`]; tests substitute in-memory
/// transports behind the same trait.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection and start its reader against `listener`.
    ///
    /// A `timeout` of `None` waits indefinitely.
    async fn connect(
        &self,
        timeout: Option<Duration>,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<Arc<Connection>, ProtocolError>;
}

/// Connects over TCP to a fixed host and port.
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        timeout: Option<Duration>,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<Arc<Connection>, ProtocolError> {
        let peer = format!("{}:{}", self.host, self.port);
        trace!(peer = %peer, timeout = ?timeout, "connecting");

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                error!(peer = %peer, timeout_ms = limit.as_millis() as u64, "connect timed out");
                ProtocolError::ConnectTimeout(limit)
            })?,
            None => connect.await,
        }
        .map_err(|e| {
            error!(peer = %peer, error = %e, "connect failed");
            ProtocolError::ConnectionFailed(e.to_string())
        })?;

        let _ = stream.set_nodelay(true);
        debug!(peer = %peer, "connected");
        Ok(Connection::spawn(stream, peer, listener))
    }
}
