//! Pooled multi-channel connections.
//!
//! ```text
//!  ConnectionPool
//!   ├── by_node: Node ─────────▶ Arc<Connection>
//!   ├── by_id:   ConnectionId ─▶ Arc<Connection>
//!   └── owners:  ChannelId ────▶ ConnectionId
//!
//!  Connection (one per Node)
//!   └── slots: [ch0, ch1, None, ch3]   read-mostly, swapped under a lock
//! ```
//!
//! Channels open lazily on first use of their slot (or all at once with
//! `eager_connect`). A channel that closes is evicted from its slot by a close
//! listener; the next send through that slot reconnects. Concurrent senders
//! to an empty slot serialize on a per-slot async mutex so only one connect
//! is in flight per slot.

use crate::node::Node;
use crate::rpc::config::PoolConfig;
use crate::rpc::error::{RpcError, RpcResult};
use crate::rpc::selection::ChannelSelector;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use skein_transport::{ChannelHandler, ChannelId, ChannelRef, Connector, WriteCallback};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Process-unique connection identifier
pub type ConnectionId = u64;

/// A logical multi-channel path to one node
pub struct Connection {
    id: ConnectionId,
    node: Node,
    slots: RwLock<Vec<Option<ChannelRef>>>,
    open_locks: Vec<AsyncMutex<()>>,
    selector: Box<dyn ChannelSelector>,
    connector: Arc<dyn Connector>,
    owners: Arc<DashMap<ChannelId, ConnectionId>>,
    outstanding: Arc<AtomicUsize>,
    closed: AtomicBool,
    connect_timeout: Duration,
}

impl Connection {
    fn new(
        id: ConnectionId,
        node: Node,
        config: &PoolConfig,
        connector: Arc<dyn Connector>,
        owners: Arc<DashMap<ChannelId, ConnectionId>>,
    ) -> Arc<Self> {
        let channels = config.channels_per_node.max(1);
        Arc::new(Self {
            id,
            node,
            slots: RwLock::new(vec![None; channels]),
            open_locks: (0..channels).map(|_| AsyncMutex::new(())).collect(),
            selector: config.selection.selector(),
            connector,
            owners,
            outstanding: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            connect_timeout: config.connect_timeout(),
        })
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote node
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Number of channel slots
    pub fn channel_count(&self) -> usize {
        self.open_locks.len()
    }

    /// Number of slots holding an open channel
    pub fn open_channels(&self) -> usize {
        self.slots
            .read()
            .iter()
            .flatten()
            .filter(|c| c.is_open())
            .count()
    }

    /// Writes queued but not yet completed
    pub fn outstanding_sends(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Channel for the next send.
    ///
    /// `hint` pins the choice to slot `hint % channel_count()`; otherwise the
    /// selection strategy decides. Opens the slot's channel if it is empty.
    ///
    /// # Errors
    /// Returns `RpcError::ConnectionClosed` once the connection is closed and
    /// `RpcError::LocalSend` if the channel cannot be opened.
    pub async fn channel(
        self: &Arc<Self>,
        hint: Option<usize>,
        handler: &Arc<dyn ChannelHandler>,
    ) -> RpcResult<ChannelRef> {
        if self.is_closed() {
            return Err(RpcError::connection_closed("connection is closed"));
        }

        let count = self.channel_count();
        let slot = match hint {
            Some(h) => h % count,
            None => self.selector.select(count),
        };

        if let Some(channel) = self.live(slot) {
            return Ok(channel);
        }

        let _guard = self.open_locks[slot].lock().await;
        if let Some(channel) = self.live(slot) {
            return Ok(channel);
        }
        if self.is_closed() {
            return Err(RpcError::connection_closed("connection is closed"));
        }

        let connect = self
            .connector
            .connect(self.node.host(), self.node.port(), Arc::clone(handler));
        let channel = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(result) => result.map_err(|e| {
                RpcError::LocalSend(Cow::Owned(format!("connect to {}: {}", self.node, e)))
            })?,
            Err(_) => {
                return Err(RpcError::LocalSend(Cow::Owned(format!(
                    "connect to {} timed out after {:?}",
                    self.node, self.connect_timeout
                ))));
            }
        };

        tracing::debug!(
            connection = self.id,
            channel = channel.id(),
            slot,
            "Opened channel to {}",
            self.node
        );

        self.install(slot, Arc::clone(&channel));
        Ok(channel)
    }

    /// Open every empty slot.
    ///
    /// # Errors
    /// Returns the first connect failure.
    pub async fn connect_all(self: &Arc<Self>, handler: &Arc<dyn ChannelHandler>) -> RpcResult<()> {
        for slot in 0..self.channel_count() {
            self.channel(Some(slot), handler).await?;
        }
        Ok(())
    }

    /// Write `bytes` on `channel`, counting the write as outstanding until
    /// `on_complete` runs
    pub fn write(&self, channel: &ChannelRef, bytes: Bytes, on_complete: WriteCallback) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let outstanding = Arc::clone(&self.outstanding);
        channel.write(
            bytes,
            Box::new(move |result| {
                outstanding.fetch_sub(1, Ordering::AcqRel);
                on_complete(result);
            }),
        );
    }

    /// Close every channel. Idempotent.
    ///
    /// Callers that track requests on this connection must fail them first;
    /// see `Dispatcher::close_connection`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let channels: Vec<ChannelRef> = self.slots.write().iter_mut().filter_map(Option::take).collect();
        tracing::info!(
            connection = self.id,
            channels = channels.len(),
            outstanding = self.outstanding_sends(),
            "Closing connection to {}",
            self.node
        );
        for channel in channels {
            channel.close();
        }
    }

    fn live(&self, slot: usize) -> Option<ChannelRef> {
        self.slots.read()[slot]
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
    }

    fn install(self: &Arc<Self>, slot: usize, channel: ChannelRef) {
        let channel_id = channel.id();
        self.owners.insert(channel_id, self.id);
        self.slots.write()[slot] = Some(Arc::clone(&channel));

        let weak = Arc::downgrade(self);
        channel.add_close_listener(Box::new(move |_| {
            if let Some(connection) = weak.upgrade() {
                connection.evict(channel_id);
            }
        }));

        // close() may have drained the slots while we were connecting
        if self.is_closed() {
            self.evict(channel_id);
            channel.close();
        }
    }

    /// Drop `channel_id` from its slot if it is still installed
    fn evict(&self, channel_id: ChannelId) -> bool {
        let mut slots = self.slots.write();
        for slot in slots.iter_mut() {
            if slot.as_ref().is_some_and(|c| c.id() == channel_id) {
                *slot = None;
                tracing::debug!(connection = self.id, channel = channel_id, "Evicted closed channel");
                return true;
            }
        }
        false
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("node", &self.node.to_string())
            .field("open_channels", &self.open_channels())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Connections keyed by node
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    by_node: DashMap<Node, Arc<Connection>>,
    by_id: DashMap<ConnectionId, Arc<Connection>>,
    owners: Arc<DashMap<ChannelId, ConnectionId>>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Create an empty pool opening channels through `connector`
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            by_node: DashMap::new(),
            by_id: DashMap::new(),
            owners: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Connection to `node`, creating it if absent or closed.
    ///
    /// With `eager_connect` a new connection opens all of its channels
    /// before it is returned.
    ///
    /// # Errors
    /// Returns `RpcError::LocalSend` if an eager connect fails; the failed
    /// connection is not kept.
    pub async fn acquire(
        &self,
        node: &Node,
        handler: &Arc<dyn ChannelHandler>,
    ) -> RpcResult<Arc<Connection>> {
        if let Some(existing) = self.by_node.get(node) {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing.value()));
            }
        }

        let (connection, created) = match self.by_node.entry(node.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    let connection = self.create(node);
                    let stale = entry.insert(Arc::clone(&connection));
                    self.by_id.remove(&stale.id());
                    (connection, true)
                } else {
                    (Arc::clone(entry.get()), false)
                }
            }
            Entry::Vacant(entry) => {
                let connection = self.create(node);
                entry.insert(Arc::clone(&connection));
                (connection, true)
            }
        };

        if created && self.config.eager_connect {
            if let Err(e) = connection.connect_all(handler).await {
                self.forget(&connection);
                connection.close();
                return Err(e);
            }
        }

        Ok(connection)
    }

    fn create(&self, node: &Node) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(
            id,
            node.clone(),
            &self.config,
            Arc::clone(&self.connector),
            Arc::clone(&self.owners),
        );
        self.by_id.insert(id, Arc::clone(&connection));
        tracing::debug!(connection = id, "Created connection to {}", node);
        connection
    }

    fn forget(&self, connection: &Arc<Connection>) {
        self.by_node
            .remove_if(connection.node(), |_, c| Arc::ptr_eq(c, connection));
        self.by_id.remove(&connection.id());
    }

    /// Existing connection to `node`
    pub fn get(&self, node: &Node) -> Option<Arc<Connection>> {
        self.by_node.get(node).map(|c| Arc::clone(c.value()))
    }

    /// Connection by id, if still pooled
    pub fn get_by_id(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.by_id.get(&id).map(|c| Arc::clone(c.value()))
    }

    /// Pooled connection that owns `channel_id`
    pub fn owner_of(&self, channel_id: ChannelId) -> Option<Arc<Connection>> {
        let id = *self.owners.get(&channel_id)?;
        self.get_by_id(id)
    }

    /// Forget `channel_id` and return the id of the connection that owned it
    pub fn channel_closed(&self, channel_id: ChannelId) -> Option<ConnectionId> {
        self.owners.remove(&channel_id).map(|(_, id)| id)
    }

    /// Remove the connection to `node` from the pool without closing it
    pub fn remove(&self, node: &Node) -> Option<Arc<Connection>> {
        let (_, connection) = self.by_node.remove(node)?;
        self.by_id.remove(&connection.id());
        Some(connection)
    }

    /// Remove and close the connection to `node`
    pub fn close(&self, node: &Node) -> bool {
        match self.remove(node) {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Remove every connection without closing them
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let nodes: Vec<Node> = self.by_node.iter().map(|e| e.key().clone()).collect();
        nodes.iter().filter_map(|node| self.remove(node)).collect()
    }

    /// Remove and close every connection
    pub fn close_all(&self) {
        for connection in self.drain() {
            connection.close();
        }
    }

    /// Pooled connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.by_node.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Number of pooled connections
    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::config::SelectionStrategy;
    use skein_transport::{MemoryNetwork, TransportError};

    struct Nop;

    impl ChannelHandler for Nop {
        fn on_read(&self, _channel: &ChannelRef, _bytes: Bytes) {}
        fn on_closed(&self, _channel: &ChannelRef, _cause: Option<TransportError>) {}
    }

    fn handler() -> Arc<dyn ChannelHandler> {
        Arc::new(Nop)
    }

    fn pool(network: &MemoryNetwork, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(config, Arc::new(network.clone()))
    }

    fn listening(port: u16) -> (MemoryNetwork, Node) {
        let network = MemoryNetwork::new();
        network.listen("peer", port, handler()).unwrap();
        (network, Node::new("peer", "peer", port))
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn test_lazy_open_and_reuse() {
        let (network, node) = listening(1);
        let pool = pool(&network, PoolConfig::default());
        let h = handler();

        let connection = pool.acquire(&node, &h).await.unwrap();
        assert_eq!(connection.open_channels(), 0);

        let a = connection.channel(Some(1), &h).await.unwrap();
        let b = connection.channel(Some(5), &h).await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(connection.open_channels(), 1);

        let again = pool.acquire(&node, &h).await.unwrap();
        assert_eq!(again.id(), connection.id());
        assert_eq!(pool.owner_of(a.id()).unwrap().id(), connection.id());
    }

    #[tokio::test]
    async fn test_eager_connect_opens_all() {
        let (network, node) = listening(2);
        let config = PoolConfig {
            channels_per_node: 3,
            eager_connect: true,
            ..Default::default()
        };
        let pool = pool(&network, config);

        let connection = pool.acquire(&node, &handler()).await.unwrap();
        assert_eq!(connection.open_channels(), 3);
    }

    #[tokio::test]
    async fn test_eager_connect_failure_not_pooled() {
        let network = MemoryNetwork::new();
        let config = PoolConfig {
            eager_connect: true,
            ..Default::default()
        };
        let pool = pool(&network, config);

        let err = pool
            .acquire(&Node::new("ghost", "ghost", 9), &handler())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::LocalSend(_)));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_closed_channel_evicted_and_reopened() {
        let (network, node) = listening(3);
        let config = PoolConfig {
            channels_per_node: 1,
            ..Default::default()
        };
        let pool = pool(&network, config);
        let h = handler();

        let connection = pool.acquire(&node, &h).await.unwrap();
        let first = connection.channel(None, &h).await.unwrap();
        first.close();
        wait_until(|| connection.open_channels() == 0).await;

        let second = connection.channel(None, &h).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert!(second.is_open());
    }

    #[tokio::test]
    async fn test_round_robin_spreads() {
        let (network, node) = listening(4);
        let config = PoolConfig {
            channels_per_node: 2,
            selection: SelectionStrategy::RoundRobin,
            ..Default::default()
        };
        let pool = pool(&network, config);
        let h = handler();

        let connection = pool.acquire(&node, &h).await.unwrap();
        let a = connection.channel(None, &h).await.unwrap();
        let b = connection.channel(None, &h).await.unwrap();
        let c = connection.channel(None, &h).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), c.id());
    }

    #[tokio::test]
    async fn test_close_node() {
        let (network, node) = listening(5);
        let pool = pool(&network, PoolConfig::default());
        let h = handler();

        let connection = pool.acquire(&node, &h).await.unwrap();
        let channel = connection.channel(None, &h).await.unwrap();

        assert!(pool.close(&node));
        assert!(!pool.close(&node));
        assert!(connection.is_closed());
        assert!(!channel.is_open());
        assert!(matches!(
            connection.channel(None, &h).await,
            Err(RpcError::ConnectionClosed(_))
        ));

        // A closed connection is replaced on the next acquire
        let fresh = pool.acquire(&node, &h).await.unwrap();
        assert_ne!(fresh.id(), connection.id());
    }

    #[tokio::test]
    async fn test_outstanding_sends_tracked() {
        let (network, node) = listening(6);
        let pool = pool(&network, PoolConfig::default());
        let h = handler();

        let connection = pool.acquire(&node, &h).await.unwrap();
        let channel = connection.channel(None, &h).await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        connection.write(
            &channel,
            Bytes::from_static(b"x"),
            Box::new(move |res| {
                let _ = tx.send(res.is_ok());
            }),
        );
        assert!(rx.await.unwrap());
        assert_eq!(connection.outstanding_sends(), 0);
    }

    #[tokio::test]
    async fn test_channel_closed_forgets_owner() {
        let (network, node) = listening(7);
        let pool = pool(&network, PoolConfig::default());
        let h = handler();

        let connection = pool.acquire(&node, &h).await.unwrap();
        let channel = connection.channel(None, &h).await.unwrap();

        assert_eq!(pool.channel_closed(channel.id()), Some(connection.id()));
        assert_eq!(pool.channel_closed(channel.id()), None);
        assert!(pool.owner_of(channel.id()).is_none());
    }
}
