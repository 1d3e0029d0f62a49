//! Notification types and well-known signal ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Numeric id of a signal, as seen by subscribing clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalId(pub u32);

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An operation was locked. Payload: `[operation_id, session_id]`.
pub const ON_SETTING_LOCKED: SignalId = SignalId(417);
/// An operation was unlocked. Payload: `operation_id`.
pub const ON_SETTING_UNLOCKED: SignalId = SignalId(418);
/// A device was locked as a whole. Payload: `session_id`.
pub const ON_DEVICE_LOCKED: SignalId = SignalId(500);
/// A whole-device lock was released. Payload: `null`.
pub const ON_DEVICE_UNLOCKED: SignalId = SignalId(501);

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationScope {
    /// Every session subscribed to the signal.
    Broker,
    /// Only subscribed sessions selected onto this device at emission time.
    Device(String),
}

/// A signal emission as delivered to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// The emitted signal.
    pub signal: SignalId,
    /// Broker-wide or tied to one device.
    pub scope: NotificationScope,
    /// Signal-specific data.
    pub payload: Value,
    /// When the signal was emitted.
    pub emitted_at: DateTime<Utc>,
}

impl Notification {
    pub(crate) fn new(signal: SignalId, scope: NotificationScope, payload: Value) -> Self {
        Self {
            signal,
            scope,
            payload,
            emitted_at: Utc::now(),
        }
    }

    /// The emitting device, for device-scoped notifications.
    pub fn device(&self) -> Option<&str> {
        match &self.scope {
            NotificationScope::Device(id) => Some(id),
            NotificationScope::Broker => None,
        }
    }
}
