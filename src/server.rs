//! Built-in lock and selection settings under their well-known ids.
//!
//! Clients talk to a server purely in terms of `(operation id, arguments)`.
//! [`LockServer`] answers the per-setting lock settings (410 to 416) itself
//! and forwards every other id to its broker. [`DeviceServer`] adds the device
//! settings (502 to 508), applies the lock settings to the selected device's
//! own settings, and dispatches every other id to the selected device.

use crate::broker::ResourceBroker;
use crate::device::Device;
use crate::error::{BrokerError, BrokerResult};
use crate::operation::{OperationHandler, OperationId};
use crate::registry::DeviceRegistry;
use crate::router::NotificationRouter;
use crate::session::{SessionId, SessionScoped};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Lock the setting given as argument. Returns `null`.
pub const LOCK_SETTING: OperationId = OperationId(410);
/// Unlock the setting given as argument. Returns `null`.
pub const UNLOCK_SETTING: OperationId = OperationId(411);
/// Whether the setting given as argument is locked.
pub const IS_SETTING_LOCKED: OperationId = OperationId(412);
/// Whether the caller holds the lock on the setting given as argument.
pub const HAS_SETTING_LOCK: OperationId = OperationId(413);
/// Whether the setting given as argument accepts locks.
pub const IS_SETTING_LOCKABLE: OperationId = OperationId(414);
/// Session holding the lock on the setting given as argument.
pub const SETTING_OWNER: OperationId = OperationId(415);
/// The caller's own session id.
pub const GET_SESSION: OperationId = OperationId(416);

/// Ids of all devices.
pub const GET_DEVICES: OperationId = OperationId(502);
/// Select the device id given as argument.
pub const SELECT_DEVICE: OperationId = OperationId(503);
/// Lock the selected device.
pub const LOCK_DEVICE: OperationId = OperationId(504);
/// Unlock the selected device.
pub const UNLOCK_DEVICE: OperationId = OperationId(505);
/// Id of the selected device.
pub const GET_SELECTED_DEVICE: OperationId = OperationId(506);
/// Whether the selected device is locked.
pub const IS_DEVICE_LOCKED: OperationId = OperationId(507);
/// Whether the caller holds the selected device's lock.
pub const HAS_DEVICE_LOCK: OperationId = OperationId(508);

const LOCK_SETTINGS: [OperationId; 7] = [
    LOCK_SETTING,
    UNLOCK_SETTING,
    IS_SETTING_LOCKED,
    HAS_SETTING_LOCK,
    IS_SETTING_LOCKABLE,
    SETTING_OWNER,
    GET_SESSION,
];

const DEVICE_SETTINGS: [OperationId; 7] = [
    GET_DEVICES,
    SELECT_DEVICE,
    LOCK_DEVICE,
    UNLOCK_DEVICE,
    GET_SELECTED_DEVICE,
    IS_DEVICE_LOCKED,
    HAS_DEVICE_LOCK,
];

const RESERVED: [OperationId; 14] = [
    LOCK_SETTING,
    UNLOCK_SETTING,
    IS_SETTING_LOCKED,
    HAS_SETTING_LOCK,
    IS_SETTING_LOCKABLE,
    SETTING_OWNER,
    GET_SESSION,
    GET_DEVICES,
    SELECT_DEVICE,
    LOCK_DEVICE,
    UNLOCK_DEVICE,
    GET_SELECTED_DEVICE,
    IS_DEVICE_LOCKED,
    HAS_DEVICE_LOCK,
];

/// Whether `id` is taken by a built-in setting.
pub fn is_reserved(id: OperationId) -> bool {
    RESERVED.contains(&id)
}

/// A server reachable by `(session, operation id, arguments)` requests.
#[async_trait]
pub trait SettingsServer: SessionScoped {
    /// Handle one request from `session`.
    async fn handle(
        &self,
        session: SessionId,
        operation_id: OperationId,
        args: Value,
    ) -> BrokerResult<Value>;
}

fn operation_arg(setting: OperationId, args: &Value) -> BrokerResult<OperationId> {
    args.as_u64()
        .and_then(|raw| u32::try_from(raw).ok())
        .map(OperationId)
        .ok_or_else(|| BrokerError::InvalidArguments {
            operation: setting,
            reason: format!("expected an operation id, got {args}"),
        })
}

fn device_arg(setting: OperationId, args: &Value) -> BrokerResult<&str> {
    args.as_str().ok_or_else(|| BrokerError::InvalidArguments {
        operation: setting,
        reason: format!("expected a device id, got {args}"),
    })
}

/// Answer a lock setting (410 to 416) against `broker`.
fn handle_lock_setting(
    broker: &ResourceBroker,
    session: SessionId,
    setting: OperationId,
    args: &Value,
) -> BrokerResult<Value> {
    if setting == GET_SESSION {
        return Ok(json!(session.as_u64()));
    }

    let id = operation_arg(setting, args)?;
    match setting {
        LOCK_SETTING => broker.lock(session, id).map(|()| Value::Null),
        UNLOCK_SETTING => broker.unlock(session, id).map(|()| Value::Null),
        IS_SETTING_LOCKED => {
            broker.operation(id)?;
            Ok(json!(broker.is_locked(id)))
        }
        HAS_SETTING_LOCK => broker.has_lock(session, id).map(|owned| json!(owned)),
        IS_SETTING_LOCKABLE => broker.is_lockable(id).map(|lockable| json!(lockable)),
        SETTING_OWNER => broker.owner(id).map(|owner| json!(owner.as_u64())),
        other => Err(BrokerError::UnknownOperation(other)),
    }
}

/// A settings server with per-setting locks.
pub struct LockServer {
    broker: ResourceBroker,
}

impl LockServer {
    /// Server with no settings, broadcasting lock changes through `router`.
    pub fn new(router: Arc<NotificationRouter>) -> Self {
        Self {
            broker: ResourceBroker::new(router).reserving(&RESERVED),
        }
    }

    /// Register a setting. Ids of built-in settings are refused.
    pub fn register_operation(
        &self,
        id: impl Into<OperationId>,
        name: impl Into<String>,
        lockable: bool,
        handler: impl OperationHandler + 'static,
    ) -> BrokerResult<()> {
        self.broker.register_operation(id, name, lockable, handler)
    }

    /// The broker behind this server. It refuses built-in setting ids too.
    pub fn broker(&self) -> &ResourceBroker {
        &self.broker
    }
}

#[async_trait]
impl SettingsServer for LockServer {
    async fn handle(
        &self,
        session: SessionId,
        operation_id: OperationId,
        args: Value,
    ) -> BrokerResult<Value> {
        if LOCK_SETTINGS.contains(&operation_id) {
            return handle_lock_setting(&self.broker, session, operation_id, &args);
        }
        self.broker.invoke(session, operation_id, args).await
    }
}

impl SessionScoped for LockServer {
    fn on_session_closed(&self, session: SessionId) {
        self.broker.release_all(session);
    }
}

/// A settings server fronting a set of devices.
pub struct DeviceServer {
    registry: Arc<DeviceRegistry>,
}

impl DeviceServer {
    /// Server routing requests to the devices in `registry`.
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// The registry behind this server.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Add a device whose settings stay clear of the built-in ids.
    ///
    /// The device keeps refusing built-in ids for settings registered later.
    pub fn add_device(
        &self,
        device_id: impl Into<String>,
        device: Device,
    ) -> BrokerResult<Arc<Device>> {
        device.broker().reserve(&RESERVED)?;
        self.registry.add_device(device_id, device)
    }

    fn handle_device_setting(
        &self,
        session: SessionId,
        setting: OperationId,
        args: &Value,
    ) -> BrokerResult<Value> {
        match setting {
            GET_DEVICES => Ok(json!(self.registry.list_devices())),
            SELECT_DEVICE => {
                let device_id = device_arg(setting, args)?;
                self.registry
                    .select_device(session, device_id)
                    .map(|()| Value::Null)
            }
            GET_SELECTED_DEVICE => self.registry.get_selected_device(session).map(Value::from),
            LOCK_DEVICE => self
                .registry
                .selected_device(session)?
                .lock(session)
                .map(|()| Value::Null),
            UNLOCK_DEVICE => self
                .registry
                .selected_device(session)?
                .unlock(session)
                .map(|()| Value::Null),
            IS_DEVICE_LOCKED => Ok(json!(self.registry.selected_device(session)?.is_locked())),
            HAS_DEVICE_LOCK => self
                .registry
                .selected_device(session)?
                .has_lock(session)
                .map(|owned| json!(owned)),
            other => Err(BrokerError::UnknownOperation(other)),
        }
    }
}

#[async_trait]
impl SettingsServer for DeviceServer {
    async fn handle(
        &self,
        session: SessionId,
        operation_id: OperationId,
        args: Value,
    ) -> BrokerResult<Value> {
        if DEVICE_SETTINGS.contains(&operation_id) {
            return self.handle_device_setting(session, operation_id, &args);
        }
        if operation_id == GET_SESSION {
            return Ok(json!(session.as_u64()));
        }
        if LOCK_SETTINGS.contains(&operation_id) {
            let device = self.registry.selected_device(session)?;
            let device_id = device.id().unwrap_or_default();
            return handle_lock_setting(device.broker(), session, operation_id, &args)
                .map_err(|err| err.with_device(&device_id));
        }
        self.registry.dispatch(session, operation_id, args).await
    }
}

impl SessionScoped for DeviceServer {
    fn on_session_closed(&self, session: SessionId) {
        self.registry.on_session_closed(session);
    }
}
