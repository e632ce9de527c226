//! Request/response layer: connection pooling, pending request
//! correlation and the dispatcher state machine.

pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod registry;
pub mod selection;
pub mod serialization;

pub use config::{DispatcherConfig, PoolConfig, SelectionStrategy, WireConfig};
pub use connection::{Connection, ConnectionId, ConnectionPool};
pub use diagnostics::{CollectingReporter, Diagnostic, ErrorReporter, TracingReporter};
pub use dispatcher::{
    Dispatcher, DispatcherBuilder, DispatcherStats, RemoteErrorBody, RequestOptions,
};
pub use error::{FailureKind, RpcError, RpcResult};
pub use handler::{
    FnHandler, HandlerError, HandlerResult, HandlerTable, RequestContext, RequestHandler,
};
pub use registry::{PendingRequest, RegistryStats, RequestRegistry, ResponseResult};
pub use selection::{ChannelSelector, RandomSelector, RoundRobinSelector};
pub use serialization::{BincodeSerializer, JsonSerializer, Serializer};
