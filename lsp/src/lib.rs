//! LSP client core for the classbench harness.
//!
//! ```text
//! caller ──► Bridge ──► Connection ──► Transport ──► language server
//!              ▲             │ (registry, lifecycle)       │
//!              └─────────────┴──── Dispatcher ◄── codec ◄──┘
//! ```
//!
//! [`Bridge`] is the entry point for synchronous callers: it owns a
//! background runtime, drives the handshake, and exposes blocking requests
//! plus probe-style queries such as [`Bridge::completions`].

pub mod codec;
pub mod protocol;
pub mod retry;
pub mod transport;
pub mod types;

mod bridge;
mod connection;
mod dispatcher;
mod documents;
mod error;
mod lifecycle;
mod queries;
mod registry;

pub use bridge::{Bridge, call_blocking};
pub use connection::Connection;
pub use dispatcher::{HandlerRegistry, NotificationHandler, RequestHandler};
pub use documents::{DocumentStore, DocumentSync, OpenDocument};
pub use error::{RpcError, RpcResult};
pub use lifecycle::{InvalidTransition, LifecycleState};
pub use protocol::{Message, Position, Range, RequestId, ResponseError};
pub use retry::{Classification, RetryPolicy, RetryableResult, with_retry};
pub use types::{
    ClientConfig, HandshakeConfig, RequiredNotification, RetryConfig, ServerConfig, TimeoutConfig,
};
