//! Two-node test fixture for integration testing
//!
//! Provides a client dispatcher and a serving dispatcher wired together
//! either over the in-memory network or over loopback TCP.
//!
//! # Example
//!
//! ```no_run
//! use skein_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_echo() {
//!     let fixture = TwoNodeFixture::memory();
//!     let reply = fixture.echo(b"hi").await.unwrap();
//!     assert_eq!(&reply[..], b"hi");
//!     fixture.cleanup().await;
//! }
//! ```

use bytes::Bytes;
use skein_core::Node;
use skein_core::rpc::{
    CollectingReporter, Dispatcher, DispatcherConfig, RequestOptions, RpcError, RpcResult,
};
use skein_transport::{
    Connector, DirectExecutor, Executor, MemoryNetwork, TcpConnector, TcpServer,
    TransportConfig, TransportResult,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

/// Port allocator for in-memory listeners so fixtures never collide
static NEXT_PORT: AtomicU16 = AtomicU16::new(20000);

/// Host name the serving peer listens on in the in-memory network
pub const SERVER_HOST: &str = "server";

/// One dispatcher plus the diagnostics it reported
pub struct Peer {
    pub dispatcher: Dispatcher,
    pub reporter: Arc<CollectingReporter>,
}

impl Peer {
    /// Dispatcher that opens channels with `connector` and runs handlers on
    /// `executor`
    pub fn new(
        config: DispatcherConfig,
        connector: Arc<dyn Connector>,
        executor: Arc<dyn Executor>,
    ) -> RpcResult<Self> {
        let reporter = Arc::new(CollectingReporter::new());
        let dispatcher = Dispatcher::builder()
            .config(config)
            .connector(connector)
            .executor(executor)
            .reporter(reporter.clone())
            .build()?;
        Ok(Self {
            dispatcher,
            reporter,
        })
    }
}

/// Client/server pair
///
/// The server registers `echo` on creation. Handlers run inline on the
/// server's reader task unless another executor is supplied.
pub struct TwoNodeFixture {
    pub client: Peer,
    pub server: Peer,
    /// Address of the serving peer
    pub server_node: Node,
    pub network: Arc<MemoryNetwork>,
    tcp_server: Option<TcpServer>,
}

impl TwoNodeFixture {
    /// Pair over the in-memory network with default configuration
    pub fn memory() -> Self {
        Self::memory_with(
            DispatcherConfig::default(),
            DispatcherConfig::default(),
            Arc::new(DirectExecutor),
        )
    }

    /// Pair over the in-memory network with custom configuration and server
    /// executor
    ///
    /// # Panics
    ///
    /// Panics if either configuration is invalid.
    pub fn memory_with(
        client_config: DispatcherConfig,
        server_config: DispatcherConfig,
        server_executor: Arc<dyn Executor>,
    ) -> Self {
        let network = Arc::new(MemoryNetwork::new());
        let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);

        let server = Peer::new(server_config, network.clone(), server_executor)
            .expect("server configuration");
        let client = Peer::new(client_config, network.clone(), Arc::new(DirectExecutor))
            .expect("client configuration");

        network
            .listen(SERVER_HOST, port, server.dispatcher.channel_handler())
            .expect("in-memory port is unique");

        let fixture = Self {
            client,
            server,
            server_node: Node::new("server", SERVER_HOST, port),
            network,
            tcp_server: None,
        };
        fixture.register_echo();
        fixture
    }

    /// Pair over loopback TCP on an ephemeral port
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn tcp(config: DispatcherConfig) -> TransportResult<Self> {
        let transport = TransportConfig::default();
        let server = Peer::new(
            config.clone(),
            Arc::new(TcpConnector::new(transport.clone())),
            Arc::new(DirectExecutor),
        )
        .expect("server configuration");
        let client = Peer::new(
            config,
            Arc::new(TcpConnector::new(transport.clone())),
            Arc::new(DirectExecutor),
        )
        .expect("client configuration");

        let bind: SocketAddr = "127.0.0.1:0".parse().expect("valid literal");
        let tcp_server = TcpServer::bind(bind, transport, server.dispatcher.channel_handler()).await?;
        let addr = tcp_server.local_addr();

        let fixture = Self {
            client,
            server,
            server_node: Node::new("server", addr.ip().to_string(), addr.port()),
            network: Arc::new(MemoryNetwork::new()),
            tcp_server: Some(tcp_server),
        };
        fixture.register_echo();
        Ok(fixture)
    }

    fn register_echo(&self) {
        self.server
            .dispatcher
            .handlers()
            .register_fn("echo", |_, payload| Ok(payload));
    }

    /// Round trip `payload` through the server's `echo` action
    ///
    /// # Errors
    ///
    /// Any failure the request completes with.
    pub async fn echo(&self, payload: &[u8]) -> RpcResult<Bytes> {
        let result = self
            .client
            .dispatcher
            .send_request(
                &self.server_node,
                "echo",
                Bytes::copy_from_slice(payload),
                RequestOptions::new(),
            )
            .await?;
        result.result().await.map_err(RpcError::from)
    }

    /// Shut both dispatchers down and stop the TCP listener
    pub async fn cleanup(self) {
        self.client.dispatcher.shutdown();
        self.server.dispatcher.shutdown();
        if let Some(server) = self.tcp_server {
            server.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixture_memory_echo() {
        let fixture = TwoNodeFixture::memory();
        let reply = fixture.echo(b"ping").await.unwrap();
        assert_eq!(&reply[..], b"ping");
        fixture.cleanup().await;
    }

    #[tokio::test]
    async fn test_fixture_ports_unique() {
        let a = TwoNodeFixture::memory();
        let b = TwoNodeFixture::memory();
        assert_ne!(a.server_node.port(), b.server_node.port());
    }

    #[tokio::test]
    async fn test_fixture_tcp_echo() {
        let fixture = TwoNodeFixture::tcp(DispatcherConfig::default()).await.unwrap();
        let reply = fixture.echo(b"over tcp").await.unwrap();
        assert_eq!(&reply[..], b"over tcp");
        fixture.cleanup().await;
    }
}
