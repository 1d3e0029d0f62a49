//! Per-operation advisory locks.
//!
//! A [`ResourceBroker`] owns a table of operations and the lock state for the
//! lockable ones. A session that locks an operation becomes its only permitted
//! caller until it unlocks it or disconnects. The lock is advisory: concurrent
//! calls that are authorized are not serialized against each other.
//!
//! Lock transitions are committed under a mutex and their notifications are
//! emitted before the mutex is released, so the order of `on setting locked` /
//! `on setting unlocked` notifications always matches the order of the
//! transitions, and both precede the return of the triggering call.

use crate::error::{BrokerError, BrokerResult, LockTarget};
use crate::operation::{Operation, OperationHandler, OperationId};
use crate::router::NotificationRouter;
use crate::session::{SessionId, SessionScoped};
use crate::signal::{SignalId, ON_SETTING_LOCKED, ON_SETTING_UNLOCKED};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Destination for signals emitted by a broker.
pub trait SignalSink: Send + Sync {
    /// Emit `signal` with `payload`.
    fn emit(&self, signal: SignalId, payload: Value);
}

/// Sends every signal to all subscribed sessions.
pub struct BrokerScope {
    router: Arc<NotificationRouter>,
}

impl BrokerScope {
    /// Sink delivering through `router`.
    pub fn new(router: Arc<NotificationRouter>) -> Self {
        Self { router }
    }
}

impl SignalSink for BrokerScope {
    fn emit(&self, signal: SignalId, payload: Value) {
        self.router.emit_broker_scoped(signal, payload);
    }
}

/// Operation table plus lock state for one server (or one device).
pub struct ResourceBroker {
    operations: RwLock<HashMap<OperationId, Arc<Operation>>>,
    locks: Mutex<HashMap<OperationId, SessionId>>,
    reserved: RwLock<HashSet<OperationId>>,
    sink: Arc<dyn SignalSink>,
}

impl ResourceBroker {
    /// Broker whose lock notifications go to every subscribed session.
    pub fn new(router: Arc<NotificationRouter>) -> Self {
        Self::with_sink(Arc::new(BrokerScope::new(router)))
    }

    /// Broker emitting into a custom sink.
    pub fn with_sink(sink: Arc<dyn SignalSink>) -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            reserved: RwLock::new(HashSet::new()),
            sink,
        }
    }

    /// Keep `ids` free of user operations on a broker with nothing registered yet.
    pub(crate) fn reserving(mut self, ids: &[OperationId]) -> Self {
        self.reserved.get_mut().extend(ids.iter().copied());
        self
    }

    /// Refuse future registrations on `ids`. Fails if one is already registered.
    pub(crate) fn reserve(&self, ids: &[OperationId]) -> BrokerResult<()> {
        let operations = self.operations.write();
        if let Some(id) = ids.iter().find(|id| operations.contains_key(id)) {
            return Err(BrokerError::DuplicateOperation(*id));
        }
        self.reserved.write().extend(ids.iter().copied());
        Ok(())
    }

    /// Register an operation under `id`.
    pub fn register_operation(
        &self,
        id: impl Into<OperationId>,
        name: impl Into<String>,
        lockable: bool,
        handler: impl OperationHandler + 'static,
    ) -> BrokerResult<()> {
        self.register(Operation::new(id, name, lockable, handler))
    }

    /// Register a prebuilt operation. Ids taken by built-in settings are refused.
    pub fn register(&self, operation: Operation) -> BrokerResult<()> {
        let mut operations = self.operations.write();
        let id = operation.id();
        if operations.contains_key(&id) || self.reserved.read().contains(&id) {
            return Err(BrokerError::DuplicateOperation(id));
        }
        debug!(operation = %id, name = operation.name(), lockable = operation.is_lockable(), "Registered operation");
        operations.insert(id, Arc::new(operation));
        Ok(())
    }

    /// Look up a registered operation.
    pub fn operation(&self, id: OperationId) -> BrokerResult<Arc<Operation>> {
        self.operations
            .read()
            .get(&id)
            .cloned()
            .ok_or(BrokerError::UnknownOperation(id))
    }

    /// Ids of all registered operations, ascending.
    pub fn operation_ids(&self) -> Vec<OperationId> {
        let mut ids: Vec<_> = self.operations.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Whether operation `id` accepts locks.
    pub fn is_lockable(&self, id: OperationId) -> BrokerResult<bool> {
        Ok(self.operation(id)?.is_lockable())
    }

    /// Take the lock on `id` for `session`.
    ///
    /// Locking is not re-entrant: the current owner locking again gets
    /// `AlreadyLocked` just like anyone else.
    pub fn lock(&self, session: SessionId, id: OperationId) -> BrokerResult<()> {
        if !self.is_lockable(id)? {
            return Err(BrokerError::NotLockable(id));
        }

        let mut locks = self.locks.lock();
        if let Some(owner) = locks.get(&id) {
            return Err(BrokerError::AlreadyLocked {
                target: LockTarget::Operation(id),
                requester: session,
                owner: *owner,
            });
        }
        locks.insert(id, session);
        debug!(session = %session, operation = %id, "Operation locked");
        self.sink
            .emit(ON_SETTING_LOCKED, json!([id.0, session.as_u64()]));
        Ok(())
    }

    /// Release `session`'s lock on `id`.
    pub fn unlock(&self, session: SessionId, id: OperationId) -> BrokerResult<()> {
        self.operation(id)?;

        let mut locks = self.locks.lock();
        match locks.get(&id) {
            None => Err(BrokerError::NotLocked(LockTarget::Operation(id))),
            Some(owner) if *owner != session => Err(BrokerError::NotOwner {
                target: LockTarget::Operation(id),
                requester: session,
                owner: *owner,
            }),
            Some(_) => {
                locks.remove(&id);
                debug!(session = %session, operation = %id, "Operation unlocked");
                self.sink.emit(ON_SETTING_UNLOCKED, json!(id.0));
                Ok(())
            }
        }
    }

    /// Whether any session holds the lock on `id`.
    pub fn is_locked(&self, id: OperationId) -> bool {
        self.locks.lock().contains_key(&id)
    }

    /// Whether `session` owns the lock on `id`. Fails if `id` is unlocked.
    pub fn has_lock(&self, session: SessionId, id: OperationId) -> BrokerResult<bool> {
        Ok(self.owner(id)? == session)
    }

    /// The session holding the lock on `id`. Fails if `id` is unlocked.
    pub fn owner(&self, id: OperationId) -> BrokerResult<SessionId> {
        self.operation(id)?;
        self.locks
            .lock()
            .get(&id)
            .copied()
            .ok_or(BrokerError::NotLocked(LockTarget::Operation(id)))
    }

    /// Operations currently locked by `session`, ascending.
    pub fn locked_by(&self, session: SessionId) -> Vec<OperationId> {
        let mut ids: Vec<_> = self
            .locks
            .lock()
            .iter()
            .filter(|(_, owner)| **owner == session)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Check that `session` may call `operation` right now.
    pub fn authorize(&self, session: SessionId, operation: &Operation) -> BrokerResult<()> {
        if !operation.is_lockable() {
            return Ok(());
        }
        match self.locks.lock().get(&operation.id()) {
            Some(owner) if *owner != session => {
                warn!(
                    session = %session,
                    operation = %operation.id(),
                    owner = %owner,
                    "Access denied to locked operation"
                );
                Err(BrokerError::AccessDenied {
                    operation: operation.id(),
                    device: None,
                    requester: session,
                    owner: *owner,
                })
            }
            _ => Ok(()),
        }
    }

    /// Authorize and run operation `id`.
    ///
    /// The lock check happens before the handler is awaited; no broker lock is
    /// held while the handler runs.
    pub async fn invoke(
        &self,
        session: SessionId,
        id: OperationId,
        args: Value,
    ) -> BrokerResult<Value> {
        let operation = self.operation(id)?;
        self.authorize(session, &operation)?;
        operation
            .call(session, args)
            .await
            .map_err(|source| BrokerError::Handler {
                operation: id,
                device: None,
                source,
            })
    }

    /// Release every lock held by `session`. Returns how many were released.
    pub fn release_all(&self, session: SessionId) -> usize {
        let mut locks = self.locks.lock();
        let owned: Vec<_> = locks
            .iter()
            .filter(|(_, owner)| **owner == session)
            .map(|(id, _)| *id)
            .collect();
        for id in &owned {
            locks.remove(id);
            debug!(session = %session, operation = %id, "Operation lock released on session close");
            self.sink.emit(ON_SETTING_UNLOCKED, json!(id.0));
        }
        owned.len()
    }

    /// Release every lock regardless of owner. Returns how many were released.
    pub(crate) fn release_every_lock(&self) -> usize {
        let mut locks = self.locks.lock();
        let mut released: Vec<_> = locks.drain().map(|(id, _)| id).collect();
        released.sort();
        for id in &released {
            debug!(operation = %id, "Operation lock released on removal");
            self.sink.emit(ON_SETTING_UNLOCKED, json!(id.0));
        }
        released.len()
    }
}

impl SessionScoped for ResourceBroker {
    fn on_session_closed(&self, session: SessionId) {
        self.release_all(session);
    }
}
