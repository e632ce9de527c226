//! TCP connector and acceptor.
//!
//! Both sides wrap each `TcpStream` in a [`StreamChannel`] after applying the
//! socket options from [`TransportConfig`].

use crate::TransportConfig;
use crate::channel::{
    Channel, ChannelHandler, ChannelRef, Connector, TransportError, TransportResult,
};
use crate::stream::StreamChannel;
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn configure(stream: &TcpStream, config: &TransportConfig) -> TransportResult<()> {
    stream.set_nodelay(config.nodelay)?;

    let sock = SockRef::from(stream);
    if let Some(idle) = config.keepalive {
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }
    if let Some(size) = config.recv_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    Ok(())
}

fn wrap(
    stream: TcpStream,
    config: &TransportConfig,
    handler: Arc<dyn ChannelHandler>,
) -> TransportResult<ChannelRef> {
    configure(&stream, config)?;
    let local = stream.local_addr().ok();
    let peer = stream.peer_addr().ok();
    Ok(StreamChannel::spawn(
        stream,
        local,
        peer,
        handler,
        config.read_buffer_size,
    ))
}

/// Opens TCP channels
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TransportConfig,
}

impl TcpConnector {
    /// Create a connector with the given socket options
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        handler: Arc<dyn ChannelHandler>,
    ) -> TransportResult<ChannelRef> {
        let timeout = self.config.connect_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "{}:{}: {}",
                    host, port, e
                )));
            }
            Err(_) => return Err(TransportError::ConnectTimeout(timeout.as_millis() as u64)),
        };

        tracing::debug!("Connected to {}:{}", host, port);
        wrap(stream, &self.config, handler)
    }
}

/// Accepts inbound TCP channels and hands them to a [`ChannelHandler`]
pub struct TcpServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TcpServer {
    /// Bind `addr` and start accepting.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        config: TransportConfig,
        handler: Arc<dyn ChannelHandler>,
    ) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        let (shutdown, mut stop) = watch::channel(false);

        tracing::info!("Listening on {}", local_addr);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, from)) => {
                            match wrap(stream, &config, Arc::clone(&handler)) {
                                Ok(channel) => {
                                    tracing::debug!(channel = channel.id(), "Accepted channel from {}", from);
                                }
                                Err(e) => tracing::warn!("Failed to set up channel from {}: {}", from, e),
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                        }
                    },
                }
            }
            tracing::info!("Listener on {} stopped", local_addr);
        });

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new channels. Established channels stay open.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
