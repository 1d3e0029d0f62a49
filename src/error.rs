//! Custom error types for the broker.
//!
//! This module defines the primary error type, `BrokerError`, shared by the
//! resource broker, devices, the device registry and the built-in settings
//! servers. Using the `thiserror` crate, every failure a caller can see is a
//! distinct variant, so clients can match on the kind of failure instead of
//! inspecting message strings.
//!
//! ## Error Hierarchy
//!
//! - **Registration**: `DuplicateOperation`, `DuplicateDevice`.
//! - **Unknown ids**: `UnknownDevice`, `UnknownOperation`.
//! - **Selection**: `NoDeviceSelected`, raised when a session calls a device
//!   setting before selecting a device.
//! - **Lock bookkeeping**: `NotLockable`, `AlreadyLocked`, `NotLocked`, `NotOwner`.
//! - **Authorization**: `AccessDenied`, carrying the owning session so the
//!   caller can tell the user who holds the lock.
//! - **Requests**: `InvalidArguments` for built-in settings called with
//!   malformed arguments.
//! - **Handler**: `Handler` wraps whatever the device handler returned. The
//!   underlying `anyhow::Error` is kept intact; the registry attaches the
//!   device id so the failure can be attributed.

use crate::operation::OperationId;
use crate::session::SessionId;
use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the broker error type.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// The resource a lock error refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockTarget {
    /// A per-operation lock held in a [`ResourceBroker`](crate::broker::ResourceBroker).
    Operation(OperationId),
    /// A whole-device lock.
    Device(String),
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::Operation(id) => write!(f, "operation {}", id),
            LockTarget::Device(id) => write!(f, "device \"{}\"", id),
        }
    }
}

/// Fieldless view of a [`BrokerError`] for callers that only care about the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    DuplicateOperation,
    DuplicateDevice,
    UnknownDevice,
    UnknownOperation,
    NoDeviceSelected,
    NotLockable,
    AlreadyLocked,
    NotLocked,
    NotOwner,
    AccessDenied,
    InvalidArguments,
    Handler,
}

/// Every failure the broker, devices and settings servers report.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The id is already taken, by a registered or a built-in setting.
    #[error("operation {0} is already registered")]
    DuplicateOperation(OperationId),

    /// A device with this id is already in the registry.
    #[error("device \"{0}\" is already registered")]
    DuplicateDevice(String),

    /// No device with this id.
    #[error("device id \"{0}\" is not a valid device id")]
    UnknownDevice(String),

    /// No setting with this id.
    #[error("operation {0} is not registered")]
    UnknownOperation(OperationId),

    /// The session called a device setting before selecting a device.
    #[error("session {0} has no device selected")]
    NoDeviceSelected(SessionId),

    /// The setting was registered without locking.
    #[error("operation {0} does not have locking enabled")]
    NotLockable(OperationId),

    #[error("{target} can not be locked by session {requester} because it is already locked by session {owner}")]
    /// Lock requested on something already locked, also by its owner.
    AlreadyLocked {
        /// What was to be locked.
        target: LockTarget,
        /// The session asking for the lock.
        requester: SessionId,
        /// The session holding it.
        owner: SessionId,
    },

    /// Unlock or owner query on something unlocked.
    #[error("{0} is not locked")]
    NotLocked(LockTarget),

    #[error("{target} can not be unlocked by session {requester} because it is locked by session {owner}")]
    /// Unlock requested by a session other than the owner.
    NotOwner {
        /// What was to be unlocked.
        target: LockTarget,
        /// The session asking to unlock.
        requester: SessionId,
        /// The session holding the lock.
        owner: SessionId,
    },

    #[error(
        "session {requester} can not access operation {operation}{} because it is locked by session {owner}",
        on_device(.device)
    )]
    /// Call refused because another session holds a lock on it.
    AccessDenied {
        /// The setting called.
        operation: OperationId,
        /// The device owning the setting, once known.
        device: Option<String>,
        /// The calling session.
        requester: SessionId,
        /// The session holding the lock.
        owner: SessionId,
    },

    /// A built-in setting got arguments it can not use.
    #[error("invalid arguments for operation {operation}: {reason}")]
    InvalidArguments {
        /// The built-in setting called.
        operation: OperationId,
        /// What was wrong with the arguments.
        reason: String,
    },

    #[error("operation {operation}{} failed: {source}", on_device(.device))]
    /// The setting's handler failed.
    Handler {
        /// The setting called.
        operation: OperationId,
        /// The device owning the setting, once known.
        device: Option<String>,
        /// What the handler returned.
        #[source]
        source: anyhow::Error,
    },
}

fn on_device(device: &Option<String>) -> String {
    match device {
        Some(id) => format!(" on device \"{}\"", id),
        None => String::new(),
    }
}

impl BrokerError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::DuplicateOperation(_) => ErrorKind::DuplicateOperation,
            BrokerError::DuplicateDevice(_) => ErrorKind::DuplicateDevice,
            BrokerError::UnknownDevice(_) => ErrorKind::UnknownDevice,
            BrokerError::UnknownOperation(_) => ErrorKind::UnknownOperation,
            BrokerError::NoDeviceSelected(_) => ErrorKind::NoDeviceSelected,
            BrokerError::NotLockable(_) => ErrorKind::NotLockable,
            BrokerError::AlreadyLocked { .. } => ErrorKind::AlreadyLocked,
            BrokerError::NotLocked(_) => ErrorKind::NotLocked,
            BrokerError::NotOwner { .. } => ErrorKind::NotOwner,
            BrokerError::AccessDenied { .. } => ErrorKind::AccessDenied,
            BrokerError::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            BrokerError::Handler { .. } => ErrorKind::Handler,
        }
    }

    /// Attach a device id to handler and access errors that do not carry one yet.
    pub fn with_device(self, device_id: &str) -> Self {
        match self {
            BrokerError::Handler {
                operation,
                device: None,
                source,
            } => BrokerError::Handler {
                operation,
                device: Some(device_id.to_string()),
                source,
            },
            BrokerError::AccessDenied {
                operation,
                device: None,
                requester,
                owner,
            } => BrokerError::AccessDenied {
                operation,
                device: Some(device_id.to_string()),
                requester,
                owner,
            },
            other => other,
        }
    }

    /// The session holding the lock, for errors caused by someone else's lock.
    pub fn owner(&self) -> Option<SessionId> {
        match self {
            BrokerError::AlreadyLocked { owner, .. }
            | BrokerError::NotOwner { owner, .. }
            | BrokerError::AccessDenied { owner, .. } => Some(*owner),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_error_display() {
        let err = BrokerError::UnknownDevice("sm9".to_string());
        assert_eq!(err.to_string(), "device id \"sm9\" is not a valid device id");
    }

    #[test]
    fn test_access_denied_names_owner_and_device() {
        let err = BrokerError::AccessDenied {
            operation: OperationId(11),
            device: Some("sm1".into()),
            requester: SessionId::new(2),
            owner: SessionId::new(1),
        };
        assert_eq!(
            err.to_string(),
            "session 2 can not access operation 11 on device \"sm1\" because it is locked by session 1"
        );
        assert_eq!(err.owner(), Some(SessionId::new(1)));
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[test]
    fn test_with_device_fills_handler_context() {
        let err = BrokerError::Handler {
            operation: OperationId(11),
            device: None,
            source: anyhow!("stepper motor is busy"),
        }
        .with_device("sm1");

        assert!(matches!(
            &err,
            BrokerError::Handler { device: Some(id), .. } if id == "sm1"
        ));
        assert_eq!(
            err.to_string(),
            "operation 11 on device \"sm1\" failed: stepper motor is busy"
        );
    }

    #[test]
    fn test_with_device_keeps_existing_device() {
        let err = BrokerError::AccessDenied {
            operation: OperationId(3),
            device: Some("dev 1".into()),
            requester: SessionId::new(5),
            owner: SessionId::new(4),
        }
        .with_device("dev 2");
        assert!(err.to_string().contains("\"dev 1\""));
    }

    #[test]
    fn test_lock_target_display() {
        assert_eq!(LockTarget::Operation(OperationId(410)).to_string(), "operation 410");
        assert_eq!(LockTarget::Device("sm1".into()).to_string(), "device \"sm1\"");
    }
}
