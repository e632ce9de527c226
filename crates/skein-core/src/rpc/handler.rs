//! Application request handlers and the action table.

use crate::frame::{CodecId, HandleType};
use crate::rpc::error::RpcError;
use crate::rpc::serialization::Serializer;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use skein_transport::ChannelId;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// What a handler knows about the inbound frame besides its payload
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Channel the frame arrived on
    pub channel_id: ChannelId,
    /// Remote address of that channel
    pub peer_addr: Option<SocketAddr>,
    /// Request id (zero for one-way frames)
    pub request_id: u64,
    /// Action the frame addresses
    pub action: String,
    /// Application headers
    pub headers: BTreeMap<String, String>,
    /// Payload codec id
    pub codec: CodecId,
    /// REQUEST or ONEWAY
    pub handle_type: HandleType,
}

impl RequestContext {
    /// Whether the sender is waiting for a response
    pub fn expects_response(&self) -> bool {
        self.handle_type == HandleType::Request
    }
}

/// Application-level handler failure, sent back to the caller as a remote
/// error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Create a handler error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Message delivered to the caller
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        Self::new(err.to_string())
    }
}

/// Result of a handler invocation
pub type HandlerResult = Result<Bytes, HandlerError>;

/// Serves one action.
///
/// Handlers run on the dispatcher's executor. A panic is caught and treated
/// like an error return.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one inbound REQUEST or ONEWAY payload. The return value is
    /// discarded for ONEWAY frames.
    fn handle(&self, ctx: &RequestContext, payload: Bytes) -> HandlerResult;
}

/// Adapts a closure into a [`RequestHandler`]
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&RequestContext, Bytes) -> HandlerResult + Send + Sync + 'static,
{
    /// Wrap `f`
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(&RequestContext, Bytes) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, ctx: &RequestContext, payload: Bytes) -> HandlerResult {
        (self.0)(ctx, payload)
    }
}

struct TypedHandler<S, Req, Resp, F> {
    serializer: S,
    f: F,
    _marker: std::marker::PhantomData<fn(Req) -> Resp>,
}

impl<S, Req, Resp, F> RequestHandler for TypedHandler<S, Req, Resp, F>
where
    S: Serializer,
    Req: DeserializeOwned + 'static,
    Resp: Serialize + 'static,
    F: Fn(&RequestContext, Req) -> Result<Resp, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, ctx: &RequestContext, payload: Bytes) -> HandlerResult {
        let request: Req = self.serializer.deserialize(&payload)?;
        let response = (self.f)(ctx, request)?;
        Ok(self.serializer.serialize(&response)?)
    }
}

/// Action name to handler map shared by the dispatcher and the application
#[derive(Default)]
pub struct HandlerTable {
    handlers: DashMap<String, Arc<dyn RequestHandler>>,
}

impl HandlerTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `action`, returning the handler it replaced
    pub fn register<H: RequestHandler>(
        &self,
        action: impl Into<String>,
        handler: H,
    ) -> Option<Arc<dyn RequestHandler>> {
        let action = action.into();
        tracing::debug!(action = %action, "Registered handler");
        self.handlers.insert(action, Arc::new(handler))
    }

    /// Register a closure for `action`
    pub fn register_fn<F>(&self, action: impl Into<String>, f: F) -> Option<Arc<dyn RequestHandler>>
    where
        F: Fn(&RequestContext, Bytes) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(action, FnHandler::new(f))
    }

    /// Register a typed closure for `action`; payloads are decoded and
    /// encoded with `serializer`
    pub fn register_typed<S, Req, Resp, F>(
        &self,
        action: impl Into<String>,
        serializer: S,
        f: F,
    ) -> Option<Arc<dyn RequestHandler>>
    where
        S: Serializer,
        Req: DeserializeOwned + 'static,
        Resp: Serialize + 'static,
        F: Fn(&RequestContext, Req) -> Result<Resp, HandlerError> + Send + Sync + 'static,
    {
        self.register(
            action,
            TypedHandler {
                serializer,
                f,
                _marker: std::marker::PhantomData,
            },
        )
    }

    /// Handler for `action`
    pub fn lookup(&self, action: &str) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(action).map(|h| Arc::clone(h.value()))
    }

    /// Remove the handler for `action`
    pub fn remove(&self, action: &str) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.remove(action).map(|(_, h)| h)
    }

    /// Registered action names, sorted
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        actions.sort();
        actions
    }

    /// Number of registered actions
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no action is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("actions", &self.actions())
            .finish()
    }
}
