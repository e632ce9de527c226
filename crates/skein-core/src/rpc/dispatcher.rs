//! Request dispatcher.
//!
//! The dispatcher is the protocol state machine. Outbound it resolves a
//! [`Node`] to a pooled [`Connection`](crate::rpc::Connection), registers the
//! request, encodes the frame and writes it to one of the connection's
//! channels. Inbound it decodes the byte stream of every channel and
//! reacts per frame:
//!
//! | Handle / message   | Reaction                                          |
//! |--------------------|---------------------------------------------------|
//! | REQUEST / PING     | answer RESPONSE / PING immediately                |
//! | REQUEST / PAYLOAD  | run the action's handler, answer with its result  |
//! | ONEWAY / PAYLOAD   | run the action's handler, never answer            |
//! | RESPONSE / *       | resolve the pending request, or discard if late   |
//!
//! A channel that closes fails every request pending on its connection. A
//! channel that delivers a malformed frame is closed after its
//! connection's requests are failed with a decode error.

use crate::codec::{FrameCodec, FrameDecoder};
use crate::frame::{CodecId, Frame, FrameBuilder, HandleType, MessageType, ResponseStatus};
use crate::node::Node;
use crate::promise::Outcome;
use crate::rpc::config::DispatcherConfig;
use crate::rpc::connection::{Connection, ConnectionPool};
use crate::rpc::diagnostics::{Diagnostic, ErrorReporter, TracingReporter};
use crate::rpc::error::{RpcError, RpcResult};
use crate::rpc::handler::{HandlerTable, RequestContext, RequestHandler};
use crate::rpc::registry::{RequestRegistry, ResponseResult};
use crate::rpc::serialization::Serializer;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skein_transport::{
    ChannelHandler, ChannelId, ChannelRef, Connector, DirectExecutor, Executor, Scheduler,
    TokioExecutor, TokioScheduler, TransportError,
};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Action label used for ping requests in diagnostics
const PING_ACTION: &str = "ping";

/// Error payload carried by a RESPONSE with status error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorBody {
    /// Action that failed
    pub action: String,
    /// Failure message
    pub message: String,
}

impl RemoteErrorBody {
    fn to_bytes(&self) -> Bytes {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .unwrap_or_else(|_| Bytes::from(self.message.clone()))
    }

    /// Parse an error payload. Payloads that are not a JSON body are taken
    /// as the message itself.
    pub fn from_payload(action: &str, payload: &[u8]) -> Self {
        serde_json::from_slice(payload).unwrap_or_else(|_| Self {
            action: action.to_string(),
            message: String::from_utf8_lossy(payload).into_owned(),
        })
    }
}

/// Per-request send options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    timeout: Option<Duration>,
    headers: BTreeMap<String, String>,
    codec: CodecId,
    channel_hint: Option<usize>,
}

impl RequestOptions {
    /// Defaults: configured timeout, raw codec, strategy-selected channel
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline for the response. `Duration::ZERO` disables the deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add an application header
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Payload codec id written into the frame
    pub fn codec(mut self, codec: CodecId) -> Self {
        self.codec = codec;
        self
    }

    /// Pin the send to channel slot `hint % channels_per_node`. Requests
    /// sharing a hint are delivered in send order.
    pub fn channel_hint(mut self, hint: usize) -> Self {
        self.channel_hint = Some(hint);
        self
    }
}

/// Dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// REQUEST frames written (pings included)
    pub requests_sent: u64,
    /// ONEWAY frames written
    pub oneways_sent: u64,
    /// Responses matched to a pending request
    pub responses_matched: u64,
    /// Responses discarded because nothing was pending
    pub late_responses: u64,
    /// Requests failed by their deadline
    pub timeouts: u64,
    /// Inbound REQUEST and ONEWAY frames served
    pub requests_served: u64,
    /// Handler errors, panics and rejections
    pub handler_failures: u64,
    /// Channels closed for malformed input
    pub decode_errors: u64,
    /// Requests currently pending
    pub pending: usize,
}

#[derive(Debug, Default)]
struct Counters {
    requests_sent: AtomicU64,
    oneways_sent: AtomicU64,
    responses_matched: AtomicU64,
    late_responses: AtomicU64,
    requests_served: AtomicU64,
    handler_failures: AtomicU64,
    decode_errors: AtomicU64,
}

/// Everything a handler task needs to answer, detached from the dispatcher
struct Responder {
    codec: FrameCodec,
    reporter: Arc<dyn ErrorReporter>,
    counters: Counters,
}

impl Responder {
    fn write(&self, channel: &ChannelRef, frame: &Frame) {
        let bytes = match self.codec.encode(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.reporter.report(Diagnostic::ResponseWriteFailed {
                    channel_id: channel.id(),
                    message: e.to_string(),
                });
                return;
            }
        };
        let channel_id = channel.id();
        let request_id = frame.request_id();
        channel.write(
            bytes,
            Box::new(move |result| {
                if let Err(e) = result {
                    tracing::debug!(channel = channel_id, request_id, "Response write failed: {}", e);
                }
            }),
        );
    }

    fn reply_error(&self, channel: &ChannelRef, request: &Frame, action: &str, message: String) {
        let body = RemoteErrorBody {
            action: action.to_string(),
            message,
        };
        let mut response = Frame::response_to(request, ResponseStatus::Error, body.to_bytes());
        response.codec = CodecId::JSON;
        self.write(channel, &response);
    }

    fn handler_failed(&self, diagnostic: Diagnostic) {
        self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
        self.reporter.report(diagnostic);
    }
}

struct ChannelDecoder {
    decoder: FrameDecoder,
    buffer: BytesMut,
}

struct DispatcherInner {
    config: DispatcherConfig,
    pool: ConnectionPool,
    registry: Arc<RequestRegistry>,
    handlers: Arc<HandlerTable>,
    executor: Arc<dyn Executor>,
    responder: Arc<Responder>,
    decoders: DashMap<ChannelId, ChannelDecoder>,
    shut_down: AtomicBool,
}

/// Sends requests to remote nodes and serves inbound ones.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Start building a dispatcher
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    fn handler(&self) -> Arc<dyn ChannelHandler> {
        Arc::clone(&self.inner) as Arc<dyn ChannelHandler>
    }

    /// This dispatcher as a channel handler, for accepted server channels
    pub fn channel_handler(&self) -> Arc<dyn ChannelHandler> {
        self.handler()
    }

    /// Configuration in use
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Handler table served by this dispatcher
    pub fn handlers(&self) -> &Arc<HandlerTable> {
        &self.inner.handlers
    }

    /// Connection pool
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Pending request table
    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.inner.registry
    }

    /// Number of requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.registry.len()
    }

    fn check_running(&self) -> RpcResult<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(RpcError::connection_closed("dispatcher is shut down"));
        }
        Ok(())
    }

    async fn route(&self, node: &Node, hint: Option<usize>) -> RpcResult<(Arc<Connection>, ChannelRef)> {
        self.check_running()?;
        let handler = self.handler();
        let connection = self.inner.pool.acquire(node, &handler).await?;
        let channel = connection.channel(hint, &handler).await?;
        Ok((connection, channel))
    }

    fn effective_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        match requested {
            Some(t) if t.is_zero() => None,
            Some(t) => Some(t),
            None => self.inner.config.default_timeout(),
        }
    }

    /// Send a REQUEST and return the result its response will complete.
    ///
    /// # Errors
    /// Fails without registering anything if no channel to `node` can be
    /// obtained (`LocalSend`, `ConnectionClosed`) or the frame cannot be
    /// encoded (`Encode`). Failures after the write is queued (write error,
    /// timeout, closed connection, remote error) complete the returned
    /// result instead.
    pub async fn send_request(
        &self,
        node: &Node,
        action: &str,
        payload: Bytes,
        options: RequestOptions,
    ) -> RpcResult<ResponseResult> {
        let (connection, channel) = self.route(node, options.channel_hint).await?;
        let timeout = self.effective_timeout(options.timeout);
        let (request_id, result) =
            self.inner
                .registry
                .register(connection.id(), Some(channel.id()), action, timeout)?;

        let frame = FrameBuilder::new(HandleType::Request, MessageType::Payload)
            .request_id(request_id)
            .action(action)
            .headers(options.headers)
            .codec(options.codec)
            .encryption(self.inner.config.wire.encryption)
            .timeout_ms(timeout.map_or(0, duration_to_ms))
            .payload(payload)
            .build();

        self.write_request(&connection, &channel, request_id, &frame)?;
        tracing::trace!(request_id, action, node = %node, "Sent request");
        Ok(result)
    }

    fn write_request(
        &self,
        connection: &Connection,
        channel: &ChannelRef,
        request_id: u64,
        frame: &Frame,
    ) -> RpcResult<()> {
        let bytes = match self.inner.responder.codec.encode(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.inner.registry.resolve(request_id);
                return Err(RpcError::Encode(Cow::Owned(e.to_string())));
            }
        };

        let registry = Arc::downgrade(&self.inner.registry);
        connection.write(
            channel,
            bytes,
            Box::new(move |written| {
                let Err(e) = written else { return };
                let Some(registry) = registry.upgrade() else { return };
                if let Some(pending) = registry.resolve(request_id) {
                    tracing::debug!(request_id, "Request write failed: {}", e);
                    pending
                        .result()
                        .try_fail(RpcError::LocalSend(Cow::Owned(e.to_string())));
                }
            }),
        );
        self.inner
            .responder
            .counters
            .requests_sent
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send a REQUEST and deliver its outcome to `callback`.
    ///
    /// A local send failure invokes `callback` before this returns. A
    /// cancelled result is delivered as `RpcError::Cancelled`.
    pub async fn send_request_with_callback<F>(
        &self,
        node: &Node,
        action: &str,
        payload: Bytes,
        options: RequestOptions,
        callback: F,
    ) where
        F: FnOnce(RpcResult<Bytes>) + Send + 'static,
    {
        match self.send_request(node, action, payload, options).await {
            Err(e) => callback(Err(e)),
            Ok(result) => result.add_listener(move |outcome| {
                callback(match outcome {
                    Outcome::Success(value) => Ok(value.clone()),
                    Outcome::Failure(cause) => Err(cause.clone()),
                    Outcome::Cancelled => Err(RpcError::Cancelled),
                })
            }),
        }
    }

    /// Send a ONEWAY frame. Nothing is registered and no response is
    /// expected.
    ///
    /// # Errors
    /// Only local failures are reported: no channel, or an unencodable
    /// frame. Write failures after queuing are logged.
    pub async fn send_oneway(
        &self,
        node: &Node,
        action: &str,
        payload: Bytes,
        options: RequestOptions,
    ) -> RpcResult<()> {
        let (connection, channel) = self.route(node, options.channel_hint).await?;
        let frame = FrameBuilder::new(HandleType::OneWay, MessageType::Payload)
            .action(action)
            .headers(options.headers)
            .codec(options.codec)
            .encryption(self.inner.config.wire.encryption)
            .payload(payload)
            .build();
        let bytes = self
            .inner
            .responder
            .codec
            .encode(&frame)
            .map_err(|e| RpcError::Encode(Cow::Owned(e.to_string())))?;

        let channel_id = channel.id();
        connection.write(
            &channel,
            bytes,
            Box::new(move |written| {
                if let Err(e) = written {
                    tracing::debug!(channel = channel_id, "One-way write failed: {}", e);
                }
            }),
        );
        self.inner
            .responder
            .counters
            .oneways_sent
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Round trip a PING through `node` and return the elapsed time.
    ///
    /// # Errors
    /// Any local send failure, timeout or closed connection.
    pub async fn ping(&self, node: &Node, timeout: Option<Duration>) -> RpcResult<Duration> {
        let (connection, channel) = self.route(node, None).await?;
        let timeout = self.effective_timeout(timeout);
        let (request_id, result) =
            self.inner
                .registry
                .register(connection.id(), Some(channel.id()), PING_ACTION, timeout)?;

        let frame = FrameBuilder::new(HandleType::Request, MessageType::Ping)
            .request_id(request_id)
            .encryption(self.inner.config.wire.encryption)
            .timeout_ms(timeout.map_or(0, duration_to_ms))
            .build();

        let start = Instant::now();
        self.write_request(&connection, &channel, request_id, &frame)?;
        result.result().await?;
        Ok(start.elapsed())
    }

    /// Typed request: serialize `request` with `serializer`, await the
    /// response and deserialize it.
    ///
    /// # Errors
    /// Serialization failures, local send failures and every failure the
    /// pending request can complete with.
    pub async fn call<S, Req, Resp>(
        &self,
        node: &Node,
        action: &str,
        serializer: &S,
        request: &Req,
        options: RequestOptions,
    ) -> RpcResult<Resp>
    where
        S: Serializer,
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serializer.serialize(request)?;
        let options = options.codec(serializer.codec_id());
        let result = self.send_request(node, action, payload, options).await?;
        let bytes = result.result().await?;
        serializer.deserialize(&bytes)
    }

    /// Process one decoded frame received on `channel`
    pub fn on_frame_received(&self, channel: &ChannelRef, frame: Frame) {
        self.inner.on_frame(channel, frame);
    }

    /// Fail requests pending on `channel`'s connection and forget its
    /// decode state
    pub fn on_channel_closed(&self, channel: &ChannelRef, cause: Option<TransportError>) {
        self.inner.channel_closed(channel, cause);
    }

    /// Fail every request pending on the connection to `node` with
    /// connection-closed, then close its channels. Returns whether a
    /// connection existed.
    pub fn close_connection(&self, node: &Node) -> bool {
        let Some(connection) = self.inner.pool.remove(node) else {
            return false;
        };
        self.inner.close(&connection, "connection closed locally");
        true
    }

    /// Fail every pending request, close every pooled connection and
    /// refuse further sends. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections = self.inner.pool.drain();
        tracing::info!(connections = connections.len(), "Shutting down dispatcher");
        for connection in &connections {
            self.inner.close(connection, "dispatcher shut down");
        }
        self.inner
            .registry
            .fail_all(&RpcError::connection_closed("dispatcher shut down"));
    }

    /// Whether `shutdown` was called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Snapshot of dispatcher counters
    pub fn stats(&self) -> DispatcherStats {
        let c = &self.inner.responder.counters;
        DispatcherStats {
            requests_sent: c.requests_sent.load(Ordering::Relaxed),
            oneways_sent: c.oneways_sent.load(Ordering::Relaxed),
            responses_matched: c.responses_matched.load(Ordering::Relaxed),
            late_responses: c.late_responses.load(Ordering::Relaxed),
            timeouts: self.inner.registry.stats().timed_out,
            requests_served: c.requests_served.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            pending: self.inner.registry.len(),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("connections", &self.inner.pool.len())
            .field("pending", &self.inner.registry.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn duration_to_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl DispatcherInner {
    fn close(&self, connection: &Connection, reason: &'static str) {
        let failed = self
            .registry
            .fail_all_for(connection.id(), &RpcError::connection_closed(reason));
        tracing::debug!(
            connection = connection.id(),
            failed,
            "Closing connection to {}",
            connection.node()
        );
        connection.close();
    }

    fn on_frame(&self, channel: &ChannelRef, frame: Frame) {
        match (frame.handle_type(), frame.message_type()) {
            (HandleType::Request, MessageType::Ping) => {
                self.responder.write(channel, &Frame::pong(&frame));
            }
            (HandleType::Request, MessageType::Payload)
            | (HandleType::OneWay, MessageType::Payload) => self.serve(channel, frame),
            (HandleType::OneWay, MessageType::Ping) => {
                tracing::trace!(channel = channel.id(), "Ignoring one-way ping");
            }
            (HandleType::Response, _) => self.complete(frame),
        }
    }

    fn complete(&self, frame: Frame) {
        let request_id = frame.request_id();
        let Some(pending) = self.registry.resolve(request_id) else {
            self.responder
                .counters
                .late_responses
                .fetch_add(1, Ordering::Relaxed);
            self.responder
                .reporter
                .report(Diagnostic::LateResponse { request_id });
            return;
        };
        self.responder
            .counters
            .responses_matched
            .fetch_add(1, Ordering::Relaxed);

        match frame.status() {
            ResponseStatus::Ok => {
                pending.result().try_succeed(frame.into_payload());
            }
            ResponseStatus::Error => {
                let body = RemoteErrorBody::from_payload(pending.action(), frame.payload());
                pending.result().try_fail(RpcError::Remote {
                    action: body.action,
                    message: body.message,
                });
            }
        }
    }

    fn serve(&self, channel: &ChannelRef, mut request: Frame) {
        self.responder
            .counters
            .requests_served
            .fetch_add(1, Ordering::Relaxed);
        let expects_response = request.expects_response();

        let Some(action) = request.action().map(str::to_string) else {
            self.responder.handler_failed(Diagnostic::NoHandler {
                action: String::new(),
            });
            if expects_response {
                self.responder
                    .reply_error(channel, &request, "", "missing action".to_string());
            }
            return;
        };

        let Some(handler) = self.handlers.lookup(&action) else {
            self.responder.handler_failed(Diagnostic::NoHandler {
                action: action.clone(),
            });
            if expects_response {
                let message = format!("no handler for action [{}]", action);
                self.responder.reply_error(channel, &request, &action, message);
            }
            return;
        };

        let payload = std::mem::take(&mut request.payload);
        let ctx = RequestContext {
            channel_id: channel.id(),
            peer_addr: channel.peer_addr(),
            request_id: request.request_id(),
            action,
            headers: request.headers().clone(),
            codec: request.codec(),
            handle_type: request.handle_type(),
        };
        let request = Arc::new(request);

        let task = {
            let responder = Arc::clone(&self.responder);
            let channel = Arc::clone(channel);
            let request = Arc::clone(&request);
            Box::new(move || run_handler(&responder, &channel, &request, handler.as_ref(), ctx, payload))
        };

        if let Err(rejected) = self.executor.execute(task) {
            let action = request.action().unwrap_or_default().to_string();
            self.responder.handler_failed(Diagnostic::Rejected {
                action: action.clone(),
                reason: rejected.reason.to_string(),
            });
            if expects_response {
                let message = format!("rejected: {}", rejected.reason);
                self.responder.reply_error(channel, &request, &action, message);
            }
        }
    }

    fn on_decode_error(&self, channel: &ChannelRef, message: String) {
        self.responder
            .counters
            .decode_errors
            .fetch_add(1, Ordering::Relaxed);
        self.responder.reporter.report(Diagnostic::DecodeFailed {
            channel_id: channel.id(),
            message: message.clone(),
        });
        self.decoders.remove(&channel.id());
        if let Some(connection) = self.pool.channel_closed(channel.id()) {
            self.registry
                .fail_all_for(connection, &RpcError::Decode(Cow::Owned(message)));
        }
        channel.close();
    }

    fn channel_closed(&self, channel: &ChannelRef, cause: Option<TransportError>) {
        self.decoders.remove(&channel.id());
        let Some(connection) = self.pool.channel_closed(channel.id()) else {
            return;
        };
        let error = match &cause {
            Some(e) => RpcError::ConnectionClosed(Cow::Owned(format!(
                "channel {} closed: {}",
                channel.id(),
                e
            ))),
            None => RpcError::connection_closed("channel closed"),
        };
        let failed = self.registry.fail_all_for(connection, &error);
        if failed > 0 {
            tracing::debug!(connection, channel = channel.id(), failed, "Channel closed with pending requests");
        }
    }
}

fn run_handler(
    responder: &Responder,
    channel: &ChannelRef,
    request: &Frame,
    handler: &dyn RequestHandler,
    ctx: RequestContext,
    payload: Bytes,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&ctx, payload)));
    let expects_response = ctx.expects_response();
    match outcome {
        Ok(Ok(body)) => {
            if expects_response {
                let response = Frame::response_to(request, ResponseStatus::Ok, body);
                responder.write(channel, &response);
            }
        }
        Ok(Err(e)) => {
            responder.handler_failed(Diagnostic::HandlerFailed {
                action: ctx.action.clone(),
                request_id: ctx.request_id,
                message: e.message().to_string(),
            });
            if expects_response {
                responder.reply_error(channel, request, &ctx.action, e.message().to_string());
            }
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            responder.handler_failed(Diagnostic::HandlerPanicked {
                action: ctx.action.clone(),
                request_id: ctx.request_id,
                message: message.clone(),
            });
            if expects_response {
                responder.reply_error(channel, request, &ctx.action, message);
            }
        }
    }
}

impl ChannelHandler for DispatcherInner {
    fn on_open(&self, channel: &ChannelRef) {
        tracing::debug!(
            channel = channel.id(),
            peer = ?channel.peer_addr(),
            "Channel opened"
        );
    }

    fn on_read(&self, channel: &ChannelRef, bytes: Bytes) {
        let (frames, error) = {
            let mut entry = self
                .decoders
                .entry(channel.id())
                .or_insert_with(|| ChannelDecoder {
                    decoder: self.responder.codec.decoder(),
                    buffer: BytesMut::new(),
                });
            let state = &mut *entry;
            state.buffer.extend_from_slice(&bytes);

            let mut frames = Vec::new();
            let error = loop {
                match state.decoder.decode(&mut state.buffer) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break None,
                    Err(e) => break Some(e),
                }
            };
            (frames, error)
        };

        for frame in frames {
            self.on_frame(channel, frame);
        }
        if let Some(e) = error {
            self.on_decode_error(channel, e.to_string());
        }
    }

    fn on_closed(&self, channel: &ChannelRef, cause: Option<TransportError>) {
        tracing::debug!(channel = channel.id(), cause = ?cause, "Channel closed");
        self.channel_closed(channel, cause);
    }
}

/// Builder for [`Dispatcher`]
#[derive(Default)]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    connector: Option<Arc<dyn Connector>>,
    executor: Option<Arc<dyn Executor>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    handlers: Option<Arc<HandlerTable>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl DispatcherBuilder {
    /// Configuration
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Opens outbound channels (required)
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Runs handler bodies. Defaults to the current tokio runtime's blocking
    /// pool, or inline execution outside a runtime.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Arms request deadlines. Defaults to the current tokio runtime.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Handler table to serve (a fresh empty table otherwise)
    pub fn handlers(mut self, handlers: Arc<HandlerTable>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Diagnostic channel. Defaults to [`TracingReporter`].
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Build the dispatcher.
    ///
    /// # Errors
    /// Returns `RpcError::InvalidConfig` if the configuration is invalid, no
    /// connector was given, or no scheduler was given outside a tokio
    /// runtime.
    pub fn build(self) -> RpcResult<Dispatcher> {
        self.config.validate()?;
        let connector = self
            .connector
            .ok_or(RpcError::invalid_config("a connector is required"))?;
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(
                TokioScheduler::current()
                    .ok_or(RpcError::invalid_config("no scheduler and no tokio runtime"))?,
            ),
        };
        let executor = self.executor.unwrap_or_else(|| match TokioExecutor::current() {
            Some(executor) => Arc::new(executor),
            None => Arc::new(DirectExecutor),
        });

        let inner = DispatcherInner {
            pool: ConnectionPool::new(self.config.pool.clone(), connector),
            registry: RequestRegistry::new(scheduler),
            handlers: self.handlers.unwrap_or_default(),
            executor,
            responder: Arc::new(Responder {
                codec: FrameCodec::new(self.config.wire.max_frame_length),
                reporter: self
                    .reporter
                    .unwrap_or_else(|| Arc::new(TracingReporter)),
                counters: Counters::default(),
            }),
            decoders: DashMap::new(),
            shut_down: AtomicBool::new(false),
            config: self.config,
        };
        Ok(Dispatcher {
            inner: Arc::new(inner),
        })
    }
}
