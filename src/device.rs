//! Devices: named sub-resources with a whole-device lock.
//!
//! A [`Device`] groups the settings of one logical instrument (one stepper
//! motor, one delay generator). It carries two independent kinds of lock:
//!
//! - the **whole-device lock**, a single optional owner. While a device is
//!   locked, only the owner may call its lockable settings. Non-lockable
//!   settings (position read-back, status queries) stay open to everyone.
//! - **per-setting locks** held in the device's embedded [`ResourceBroker`].
//!
//! Signals a device emits (its own lock notifications, the embedded broker's,
//! and anything the device's handlers emit through a [`DeviceEmitter`]) are
//! device-scoped: once the device is added to a
//! [`DeviceRegistry`](crate::registry::DeviceRegistry) they reach only the
//! sessions selected onto it. A device that is not attached to a registry
//! emits into the void.

use crate::broker::{ResourceBroker, SignalSink};
use crate::error::{BrokerError, BrokerResult, LockTarget};
use crate::operation::{OperationHandler, OperationId};
use crate::registry::SelectionMap;
use crate::router::NotificationRouter;
use crate::session::{SessionId, SessionScoped};
use crate::signal::{SignalId, ON_DEVICE_LOCKED, ON_DEVICE_UNLOCKED};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Placeholder id used in errors raised by a device that is not in a registry.
const UNATTACHED: &str = "<unattached>";

/// Where a device's signals go once it is registered.
pub(crate) struct DeviceBinding {
    pub(crate) device_id: String,
    pub(crate) router: Arc<NotificationRouter>,
    pub(crate) selections: Arc<SelectionMap>,
}

#[derive(Default)]
struct DeviceSignals {
    binding: RwLock<Option<DeviceBinding>>,
}

impl DeviceSignals {
    fn device_id(&self) -> Option<String> {
        self.binding.read().as_ref().map(|b| b.device_id.clone())
    }
}

impl SignalSink for DeviceSignals {
    fn emit(&self, signal: SignalId, payload: Value) {
        let binding = self.binding.read();
        let Some(binding) = binding.as_ref() else {
            trace!(signal = %signal, "Device not attached to a registry, signal dropped");
            return;
        };
        // Snapshot of who is selected onto this device right now.
        let audience = binding.selections.sessions_on(&binding.device_id);
        binding
            .router
            .emit_device_scoped(&binding.device_id, signal, payload, |session| {
                audience.contains(&session)
            });
    }
}

/// Handle for emitting device-scoped signals from inside setting handlers.
#[derive(Clone)]
pub struct DeviceEmitter {
    signals: Arc<DeviceSignals>,
}

impl DeviceEmitter {
    /// Emit `signal` to the sessions currently selected onto the device.
    pub fn emit(&self, signal: SignalId, payload: Value) {
        self.signals.emit(signal, payload);
    }
}

/// One logical instrument with its own settings and whole-device lock.
pub struct Device {
    owner: Mutex<Option<SessionId>>,
    broker: ResourceBroker,
    signals: Arc<DeviceSignals>,
}

impl Device {
    /// Device with no settings, not yet in a registry.
    pub fn new() -> Self {
        let signals = Arc::new(DeviceSignals::default());
        Self {
            owner: Mutex::new(None),
            broker: ResourceBroker::with_sink(signals.clone()),
            signals,
        }
    }

    /// The id this device is registered under, if it is in a registry.
    pub fn id(&self) -> Option<String> {
        self.signals.device_id()
    }

    fn label(&self) -> String {
        self.id().unwrap_or_else(|| UNATTACHED.to_string())
    }

    /// Emitter for device-defined signals.
    pub fn emitter(&self) -> DeviceEmitter {
        DeviceEmitter {
            signals: Arc::clone(&self.signals),
        }
    }

    /// The embedded broker holding this device's settings and per-setting locks.
    pub fn broker(&self) -> &ResourceBroker {
        &self.broker
    }

    /// Register a device setting.
    pub fn register_operation(
        &self,
        id: impl Into<OperationId>,
        name: impl Into<String>,
        lockable: bool,
        handler: impl OperationHandler + 'static,
    ) -> BrokerResult<()> {
        self.broker.register_operation(id, name, lockable, handler)
    }

    /// Take the whole-device lock for `session`. Not re-entrant.
    pub fn lock(&self, session: SessionId) -> BrokerResult<()> {
        let mut owner = self.owner.lock();
        if let Some(current) = *owner {
            return Err(BrokerError::AlreadyLocked {
                target: LockTarget::Device(self.label()),
                requester: session,
                owner: current,
            });
        }
        *owner = Some(session);
        debug!(session = %session, device = %self.label(), "Device locked");
        self.signals.emit(ON_DEVICE_LOCKED, json!(session.as_u64()));
        Ok(())
    }

    /// Release `session`'s whole-device lock.
    pub fn unlock(&self, session: SessionId) -> BrokerResult<()> {
        let mut owner = self.owner.lock();
        match *owner {
            None => Err(BrokerError::NotLocked(LockTarget::Device(self.label()))),
            Some(current) if current != session => Err(BrokerError::NotOwner {
                target: LockTarget::Device(self.label()),
                requester: session,
                owner: current,
            }),
            Some(_) => {
                *owner = None;
                debug!(session = %session, device = %self.label(), "Device unlocked");
                self.signals.emit(ON_DEVICE_UNLOCKED, Value::Null);
                Ok(())
            }
        }
    }

    /// Whether any session holds the whole-device lock.
    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }

    /// Whether `session` holds the whole-device lock. Fails if the device is unlocked.
    pub fn has_lock(&self, session: SessionId) -> BrokerResult<bool> {
        Ok(self.owner()? == session)
    }

    /// The session holding the whole-device lock. Fails if the device is unlocked.
    pub fn owner(&self) -> BrokerResult<SessionId> {
        let owner = *self.owner.lock();
        owner.ok_or_else(|| BrokerError::NotLocked(LockTarget::Device(self.label())))
    }

    /// Authorize against the whole-device lock, then run the setting through
    /// the embedded broker (which applies any per-setting lock).
    pub async fn handle_request(
        &self,
        operation_id: OperationId,
        session: SessionId,
        args: Value,
    ) -> BrokerResult<Value> {
        let operation = self.broker.operation(operation_id)?;
        let owner = *self.owner.lock();
        if operation.is_lockable() {
            if let Some(owner) = owner {
                if owner != session {
                    warn!(
                        session = %session,
                        device = %self.label(),
                        operation = %operation_id,
                        owner = %owner,
                        "Access denied to locked device"
                    );
                    return Err(BrokerError::AccessDenied {
                        operation: operation_id,
                        device: self.id(),
                        requester: session,
                        owner,
                    });
                }
            }
        }
        self.broker.invoke(session, operation_id, args).await
    }

    /// Drop the whole-device lock and every setting lock regardless of owner.
    ///
    /// Returns the former whole-device owner.
    pub(crate) fn force_release(&self) -> Option<SessionId> {
        let former = {
            let mut owner = self.owner.lock();
            let former = owner.take();
            if let Some(session) = former {
                debug!(session = %session, device = %self.label(), "Device lock released on removal");
                self.signals.emit(ON_DEVICE_UNLOCKED, Value::Null);
            }
            former
        };
        self.broker.release_every_lock();
        former
    }

    pub(crate) fn attach(&self, binding: DeviceBinding) {
        *self.signals.binding.write() = Some(binding);
    }

    pub(crate) fn detach(&self) {
        self.signals.binding.write().take();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = *self.owner.lock();
        f.debug_struct("Device")
            .field("id", &self.id())
            .field("owner", &owner)
            .field("operations", &self.broker.operation_ids())
            .finish()
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionScoped for Device {
    fn on_session_closed(&self, session: SessionId) {
        {
            let mut owner = self.owner.lock();
            if *owner == Some(session) {
                *owner = None;
                debug!(session = %session, device = %self.label(), "Device lock released on session close");
                self.signals.emit(ON_DEVICE_UNLOCKED, Value::Null);
            }
        }
        self.broker.release_all(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::operation::handler_fn;

    const A: SessionId = SessionId::new(1);
    const B: SessionId = SessionId::new(2);
    const SET_NUMBER: OperationId = OperationId(13);
    const GET_NUMBER: OperationId = OperationId(12);

    fn device() -> Device {
        let device = Device::new();
        device
            .register_operation(SET_NUMBER, "set_number", true, handler_fn(|_, args: Value| async move { Ok(args) }))
            .expect("register set_number");
        device
            .register_operation(GET_NUMBER, "get_number", false, handler_fn(|_, _| async { Ok(json!(0)) }))
            .expect("register get_number");
        device
    }

    #[test]
    fn test_whole_device_lock_lifecycle() {
        let device = device();
        assert!(!device.is_locked());
        assert_eq!(device.has_lock(A).unwrap_err().kind(), ErrorKind::NotLocked);

        device.lock(A).expect("lock");
        assert!(device.has_lock(A).expect("locked"));
        assert!(!device.has_lock(B).expect("locked"));
        assert_eq!(device.lock(B).unwrap_err().kind(), ErrorKind::AlreadyLocked);
        assert_eq!(device.lock(A).unwrap_err().kind(), ErrorKind::AlreadyLocked);
        assert_eq!(device.unlock(B).unwrap_err().kind(), ErrorKind::NotOwner);

        device.unlock(A).expect("unlock");
        assert!(!device.is_locked());
        assert_eq!(device.unlock(A).unwrap_err().kind(), ErrorKind::NotLocked);
    }

    #[tokio::test]
    async fn test_device_lock_guards_lockable_settings_only() {
        let device = device();
        device.lock(A).expect("lock");

        device
            .handle_request(SET_NUMBER, A, json!(3))
            .await
            .expect("owner may set");
        let err = device.handle_request(SET_NUMBER, B, json!(4)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert_eq!(err.owner(), Some(A));

        device
            .handle_request(GET_NUMBER, B, Value::Null)
            .await
            .expect("non-lockable setting stays open");
    }

    #[test]
    fn test_denial_completes_without_suspending() {
        let device = device();
        device.lock(A).expect("lock");

        let mut call = tokio_test::task::spawn(device.handle_request(SET_NUMBER, B, json!(1)));
        let result = tokio_test::assert_ready!(call.poll());
        assert_eq!(result.unwrap_err().kind(), ErrorKind::AccessDenied);
    }

    #[tokio::test]
    async fn test_setting_lock_applies_inside_device() {
        let device = device();
        device.broker().lock(A, SET_NUMBER).expect("setting lock");

        let err = device.handle_request(SET_NUMBER, B, json!(1)).await.unwrap_err();
        assert!(matches!(err, BrokerError::AccessDenied { owner: A, .. }));
    }

    #[tokio::test]
    async fn test_unknown_setting() {
        let device = device();
        let err = device
            .handle_request(OperationId(99), A, Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownOperation);
    }

    #[test]
    fn test_session_close_releases_both_lock_kinds() {
        let device = device();
        device.lock(A).expect("device lock");
        device.broker().lock(A, SET_NUMBER).expect("setting lock");

        device.on_session_closed(B);
        assert!(device.is_locked());

        device.on_session_closed(A);
        assert!(!device.is_locked());
        assert!(!device.broker().is_locked(SET_NUMBER));
    }

    #[test]
    fn test_unattached_device_errors_name_placeholder() {
        let device = device();
        device.lock(A).expect("lock");
        let err = device.lock(B).unwrap_err();
        assert!(err.to_string().contains(UNATTACHED));
        assert!(device.id().is_none());
    }

    #[test]
    fn test_debug_shows_owner_and_settings() {
        let device = device();
        device.lock(A).expect("lock");
        let shown = format!("{device:?}");
        assert!(shown.starts_with("Device"));
        assert!(shown.contains("owner: Some"));
        assert!(shown.contains(&format!("{:?}", SET_NUMBER)));
    }
}
