//! Inbound call handling.
//!
//! Connections hand fully reassembled inbound calls to a [`CallSink`]. The
//! channel's sink is a [`HandlerRegistry`] that dispatches on service and
//! method name to registered [`Handler`]s.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use muxwire_core::{InboundCall, OutboundResponse};
use muxwire_proto::ErrorCode;
use parking_lot::RwLock;
use tracing::debug;

/// Failure answered with an error frame instead of a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct HandlerError {
    /// Error class sent to the caller.
    pub code: ErrorCode,
    /// Description sent to the caller.
    pub message: String,
}

impl HandlerError {
    /// Error with `code` and `message`.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// The request itself was unacceptable.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// The handler failed.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnexpectedError, message)
    }
}

/// Receives inbound calls from connections.
#[async_trait]
pub trait CallSink: Send + Sync + 'static {
    /// Produce the answer for `call`.
    ///
    /// The future is dropped if the caller cancels or the call's deadline
    /// passes first.
    async fn handle(&self, call: InboundCall) -> Result<OutboundResponse, HandlerError>;
}

/// Application code serving one method.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Serve `call`.
    async fn handle(&self, call: InboundCall) -> Result<OutboundResponse, HandlerError>;
}

/// [`Handler`] wrapping an async closure. Built with [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`Handler`].
///
/// ```ignore
/// channel.register_handler("kv", "get", handler_fn(|call| async move {
///     Ok(OutboundResponse::ok("", call.arg3().clone()))
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutboundResponse, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutboundResponse, HandlerError>> + Send + 'static,
{
    async fn handle(&self, call: InboundCall) -> Result<OutboundResponse, HandlerError> {
        (self.f)(call).await
    }
}

/// Handlers keyed by service and method.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<(String, String), Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `method` of `service` with `handler`, replacing any earlier one.
    pub fn register(&self, service: impl Into<String>, method: impl Into<String>, handler: impl Handler) {
        self.handlers.write().insert((service.into(), method.into()), Arc::new(handler));
    }

    /// Whether a handler is registered.
    pub fn contains(&self, service: &str, method: &str) -> bool {
        self.handlers.read().contains_key(&(service.to_string(), method.to_string()))
    }

    fn lookup(&self, service: &str, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().get(&(service.to_string(), method.to_string())).cloned()
    }
}

#[async_trait]
impl CallSink for HandlerRegistry {
    async fn handle(&self, call: InboundCall) -> Result<OutboundResponse, HandlerError> {
        let method = String::from_utf8_lossy(call.method()).into_owned();
        let Some(handler) = self.lookup(&call.service, &method) else {
            debug!(service = %call.service, %method, "no handler registered");
            return Err(HandlerError::bad_request(format!("Endpoint '{method}' is not defined")));
        };
        handler.handle(call).await
    }
}
