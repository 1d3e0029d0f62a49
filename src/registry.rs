//! Device registry: device lookup, per-session selection and dispatch.
//!
//! Clients of a device server first select a device on their session; every
//! device setting they call afterwards is executed by that device. The
//! registry owns the selection map and keeps it consistent with the device
//! map: a selection always names a live device, and removing a device clears
//! every selection that pointed at it.
//!
//! Lock order: the device map is always taken before the selection map, and
//! neither is held across an `.await`.

use crate::device::{Device, DeviceBinding};
use crate::error::{BrokerError, BrokerResult};
use crate::operation::OperationId;
use crate::router::NotificationRouter;
use crate::session::{SessionId, SessionScoped};
use crate::signal::SignalId;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Session -> selected device id.
#[derive(Default)]
pub(crate) struct SelectionMap {
    inner: RwLock<HashMap<SessionId, String>>,
}

impl SelectionMap {
    pub(crate) fn get(&self, session: SessionId) -> Option<String> {
        self.inner.read().get(&session).cloned()
    }

    fn set(&self, session: SessionId, device_id: String) {
        self.inner.write().insert(session, device_id);
    }

    fn remove(&self, session: SessionId) -> Option<String> {
        self.inner.write().remove(&session)
    }

    /// Sessions currently selected onto `device_id`.
    pub(crate) fn sessions_on(&self, device_id: &str) -> Vec<SessionId> {
        self.inner
            .read()
            .iter()
            .filter(|(_, selected)| selected.as_str() == device_id)
            .map(|(session, _)| *session)
            .collect()
    }

    /// Drop every selection of `device_id`. Returns the affected sessions.
    fn clear_device(&self, device_id: &str) -> Vec<SessionId> {
        let mut inner = self.inner.write();
        let affected: Vec<_> = inner
            .iter()
            .filter(|(_, selected)| selected.as_str() == device_id)
            .map(|(session, _)| *session)
            .collect();
        for session in &affected {
            inner.remove(session);
        }
        affected
    }
}

/// Maps device ids to devices and routes calls to each session's selected device.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    selections: Arc<SelectionMap>,
    router: Arc<NotificationRouter>,
}

impl DeviceRegistry {
    /// Empty registry delivering device-scoped signals through `router`.
    pub fn new(router: Arc<NotificationRouter>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            selections: Arc::new(SelectionMap::default()),
            router,
        }
    }

    /// Registry populated from `(device_id, device)` pairs.
    pub fn from_devices<I>(router: Arc<NotificationRouter>, devices: I) -> BrokerResult<Self>
    where
        I: IntoIterator<Item = (String, Device)>,
    {
        let registry = Self::new(router);
        for (id, device) in devices {
            registry.add_device(id, device)?;
        }
        Ok(registry)
    }

    /// The router device-scoped signals are delivered through.
    pub fn router(&self) -> &Arc<NotificationRouter> {
        &self.router
    }

    /// Add `device` under `device_id`.
    pub fn add_device(
        &self,
        device_id: impl Into<String>,
        device: Device,
    ) -> BrokerResult<Arc<Device>> {
        let device_id = device_id.into();
        let mut devices = self.devices.write();
        if devices.contains_key(&device_id) {
            return Err(BrokerError::DuplicateDevice(device_id));
        }

        device.attach(DeviceBinding {
            device_id: device_id.clone(),
            router: Arc::clone(&self.router),
            selections: Arc::clone(&self.selections),
        });
        let device = Arc::new(device);
        devices.insert(device_id.clone(), Arc::clone(&device));
        info!(device = %device_id, settings = device.broker().operation_ids().len(), "Device added");
        Ok(device)
    }

    /// Remove a device, releasing its lock and clearing selections of it.
    pub fn remove_device(&self, device_id: &str) -> BrokerResult<Arc<Device>> {
        let mut devices = self.devices.write();
        let device = devices
            .remove(device_id)
            .ok_or_else(|| BrokerError::UnknownDevice(device_id.to_string()))?;

        // Selected sessions still hear the unlock before the device goes away.
        device.force_release();
        device.detach();
        let deselected = self.selections.clear_device(device_id);
        drop(devices);

        info!(device = %device_id, deselected = deselected.len(), "Device removed");
        Ok(device)
    }

    /// Ids of all devices, sorted.
    pub fn list_devices(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.devices.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Look up a device by id.
    pub fn device(&self, device_id: &str) -> BrokerResult<Arc<Device>> {
        self.devices
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownDevice(device_id.to_string()))
    }

    /// Select `device_id` for `session`, replacing any earlier selection.
    pub fn select_device(&self, session: SessionId, device_id: &str) -> BrokerResult<()> {
        let devices = self.devices.read();
        if !devices.contains_key(device_id) {
            return Err(BrokerError::UnknownDevice(device_id.to_string()));
        }
        self.selections.set(session, device_id.to_string());
        debug!(session = %session, device = %device_id, "Device selected");
        Ok(())
    }

    /// Id of the device `session` has selected.
    pub fn get_selected_device(&self, session: SessionId) -> BrokerResult<String> {
        self.selections
            .get(session)
            .ok_or(BrokerError::NoDeviceSelected(session))
    }

    /// Whether `session` has any device selected.
    pub fn has_device_selected(&self, session: SessionId) -> bool {
        self.selections.get(session).is_some()
    }

    /// The device `session` has selected.
    pub fn selected_device(&self, session: SessionId) -> BrokerResult<Arc<Device>> {
        let devices = self.devices.read();
        let device_id = self.get_selected_device(session)?;
        let device = devices.get(&device_id).cloned();
        debug_assert!(
            device.is_some(),
            "selection of session {session} names missing device {device_id}"
        );
        device.ok_or(BrokerError::UnknownDevice(device_id))
    }

    /// Run `operation_id` on the device `session` has selected.
    ///
    /// The device applies its whole-device lock and then its per-setting
    /// lock. Handler failures come back tagged with the device id.
    pub async fn dispatch(
        &self,
        session: SessionId,
        operation_id: OperationId,
        args: Value,
    ) -> BrokerResult<Value> {
        let device = self.selected_device(session)?;
        let device_id = device.id().unwrap_or_default();
        device
            .handle_request(operation_id, session, args)
            .await
            .map_err(|err| err.with_device(&device_id))
    }

    /// Emit a device-scoped signal on behalf of `device_id`.
    ///
    /// Returns the number of sessions the notification was delivered to.
    pub fn emit_device_scoped(
        &self,
        device_id: &str,
        signal: SignalId,
        payload: Value,
    ) -> BrokerResult<usize> {
        self.device(device_id)?;
        let audience = self.selections.sessions_on(device_id);
        Ok(self
            .router
            .emit_device_scoped(device_id, signal, payload, |session| {
                audience.contains(&session)
            }))
    }
}

impl SessionScoped for DeviceRegistry {
    fn on_session_closed(&self, session: SessionId) {
        let devices: Vec<_> = self.devices.read().values().cloned().collect();
        for device in devices {
            device.on_session_closed(session);
        }
        if let Some(device_id) = self.selections.remove(session) {
            debug!(session = %session, device = %device_id, "Selection cleared on session close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::operation::handler_fn;
    use crate::signal::{ON_DEVICE_LOCKED, ON_DEVICE_UNLOCKED, ON_SETTING_UNLOCKED};
    use serde_json::json;

    const A: SessionId = SessionId::new(1);
    const B: SessionId = SessionId::new(2);
    const SET_POSITION: OperationId = OperationId(11);

    fn motor() -> Device {
        let device = Device::new();
        device
            .register_operation(
                SET_POSITION,
                "set_position",
                true,
                handler_fn(|_, args: Value| async move { Ok(args) }),
            )
            .expect("register");
        device
    }

    fn registry() -> DeviceRegistry {
        DeviceRegistry::from_devices(
            Arc::new(NotificationRouter::new()),
            vec![("sm1".to_string(), motor()), ("sm2".to_string(), motor())],
        )
        .expect("registry")
    }

    #[test]
    fn test_add_and_list() {
        let registry = registry();
        assert_eq!(registry.list_devices(), vec!["sm1", "sm2"]);
        assert_eq!(registry.device("sm1").expect("sm1").id().as_deref(), Some("sm1"));

        let err = registry.add_device("sm1", motor()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateDevice);
    }

    #[test]
    fn test_selection() {
        let registry = registry();
        assert_eq!(
            registry.get_selected_device(A).unwrap_err().kind(),
            ErrorKind::NoDeviceSelected
        );
        assert_eq!(
            registry.select_device(A, "sm9").unwrap_err().kind(),
            ErrorKind::UnknownDevice
        );

        registry.select_device(A, "sm1").expect("select");
        assert_eq!(registry.get_selected_device(A).expect("selected"), "sm1");
        registry.select_device(A, "sm2").expect("reselect");
        assert_eq!(registry.get_selected_device(A).expect("selected"), "sm2");
    }

    #[tokio::test]
    async fn test_dispatch_requires_selection() {
        let registry = registry();
        let err = registry.dispatch(A, SET_POSITION, json!(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoDeviceSelected);
    }

    #[tokio::test]
    async fn test_dispatch_tags_device_on_denial() {
        let registry = registry();
        registry.select_device(A, "sm1").expect("select");
        registry.select_device(B, "sm1").expect("select");
        registry.device("sm1").expect("sm1").lock(A).expect("lock");

        let err = registry.dispatch(B, SET_POSITION, json!(500)).await.unwrap_err();
        match err {
            BrokerError::AccessDenied { device, owner, .. } => {
                assert_eq!(device.as_deref(), Some("sm1"));
                assert_eq!(owner, A);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The other motor is unaffected.
        registry.select_device(B, "sm2").expect("select");
        assert_eq!(
            registry.dispatch(B, SET_POSITION, json!(500)).await.expect("sm2 is free"),
            json!(500)
        );
    }

    #[test]
    fn test_remove_device_clears_selection_and_lock() {
        let router = Arc::new(NotificationRouter::new());
        let registry = DeviceRegistry::from_devices(
            Arc::clone(&router),
            vec![("sm1".to_string(), motor())],
        )
        .expect("registry");
        let mut rx = router.connect(B);
        router.subscribe(B, ON_DEVICE_UNLOCKED);

        registry.select_device(A, "sm1").expect("select");
        registry.select_device(B, "sm1").expect("select");
        registry.device("sm1").expect("sm1").lock(A).expect("lock");

        let removed = registry.remove_device("sm1").expect("remove");

        assert!(!removed.is_locked());
        assert!(removed.id().is_none());
        assert!(!registry.has_device_selected(A));
        assert!(!registry.has_device_selected(B));
        assert_eq!(rx.try_recv().expect("unlock notification").signal, ON_DEVICE_UNLOCKED);
        assert_eq!(
            registry.remove_device("sm1").unwrap_err().kind(),
            ErrorKind::UnknownDevice
        );
    }

    #[test]
    fn test_remove_device_releases_setting_locks() {
        let router = Arc::new(NotificationRouter::new());
        let registry = DeviceRegistry::from_devices(
            Arc::clone(&router),
            vec![("sm1".to_string(), motor())],
        )
        .expect("registry");
        let mut rx = router.connect(B);
        router.subscribe(B, ON_SETTING_UNLOCKED);

        registry.select_device(A, "sm1").expect("select");
        registry.select_device(B, "sm1").expect("select");
        registry
            .device("sm1")
            .expect("sm1")
            .broker()
            .lock(A, SET_POSITION)
            .expect("setting lock");

        let removed = registry.remove_device("sm1").expect("remove");

        assert!(!removed.broker().is_locked(SET_POSITION));
        assert!(removed.broker().locked_by(A).is_empty());
        let notification = rx.try_recv().expect("unlock notification");
        assert_eq!(notification.signal, ON_SETTING_UNLOCKED);
        assert_eq!(notification.payload, json!(SET_POSITION.0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_session_close_releases_device_locks_everywhere() {
        let router = Arc::new(NotificationRouter::new());
        let registry = DeviceRegistry::from_devices(
            Arc::clone(&router),
            vec![("sm1".to_string(), motor()), ("sm2".to_string(), motor())],
        )
        .expect("registry");
        let mut rx = router.connect(B);
        router.subscribe(B, ON_DEVICE_LOCKED);
        router.subscribe(B, ON_DEVICE_UNLOCKED);
        registry.select_device(B, "sm1").expect("select");

        registry.device("sm1").expect("sm1").lock(A).expect("lock sm1");
        registry.device("sm2").expect("sm2").lock(A).expect("lock sm2");
        registry.select_device(A, "sm2").expect("select");
        assert_eq!(rx.try_recv().expect("lock notification").signal, ON_DEVICE_LOCKED);

        registry.on_session_closed(A);

        assert!(!registry.device("sm1").expect("sm1").is_locked());
        assert!(!registry.device("sm2").expect("sm2").is_locked());
        assert!(!registry.has_device_selected(A));
        // B is selected onto sm1 only, so it hears exactly sm1's unlock.
        let unlocked = rx.try_recv().expect("unlock notification");
        assert_eq!(unlocked.signal, ON_DEVICE_UNLOCKED);
        assert_eq!(unlocked.device(), Some("sm1"));
        assert!(rx.try_recv().is_err());
    }
}
