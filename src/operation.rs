//! Remotely invokable operations ("settings").
//!
//! An operation is registered explicitly with its id, a human-readable name,
//! a lockable flag that never changes afterwards, and a handler. Handlers are
//! async because device I/O may suspend; they receive the calling session and
//! the JSON arguments of the request.

use crate::session::SessionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Numeric id of an operation, unique within its broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u32);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for OperationId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Executes one operation.
///
/// Failures are opaque hardware or driver errors; the broker wraps them with
/// the operation id (and the registry with the device id) without altering them.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Run the operation for `session` with `args`.
    async fn call(&self, session: SessionId, args: Value) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into an [`OperationHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
///
/// ```
/// use daq_broker::operation::handler_fn;
/// use serde_json::{json, Value};
///
/// let increment = handler_fn(|_session, args: Value| async move {
///     let n = args.as_i64().unwrap_or_default();
///     Ok(json!(n + 1))
/// });
/// # let _ = increment;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(SessionId, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(SessionId, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, session: SessionId, args: Value) -> anyhow::Result<Value> {
        (self.0)(session, args).await
    }
}

/// A registered operation.
#[derive(Clone)]
pub struct Operation {
    id: OperationId,
    name: String,
    lockable: bool,
    handler: Arc<dyn OperationHandler>,
}

impl Operation {
    /// Create an operation. `lockable` is fixed for the lifetime of the operation.
    pub fn new(
        id: impl Into<OperationId>,
        name: impl Into<String>,
        lockable: bool,
        handler: impl OperationHandler + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            lockable,
            handler: Arc::new(handler),
        }
    }

    /// Id clients address this operation by.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Human-readable name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether sessions may lock this operation.
    pub fn is_lockable(&self) -> bool {
        self.lockable
    }

    /// Run the handler. Authorization is the caller's job.
    pub(crate) async fn call(&self, session: SessionId, args: Value) -> anyhow::Result<Value> {
        self.handler.call(session, args).await
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("lockable", &self.lockable)
            .field("handler", &"Arc<dyn OperationHandler>")
            .finish()
    }
}
