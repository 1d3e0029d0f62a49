//! Session-scoped exclusive access to remotely controlled instruments.
//!
//! Many client sessions share a set of devices. A session can take an
//! advisory lock on a single setting ([`broker::ResourceBroker`]) or on a whole
//! device ([`device::Device`]); while it holds the lock, other sessions are
//! refused the guarded settings. Every lock a session holds is released when
//! the session closes ([`session::SessionManager`]). Lock changes and device
//! events reach subscribers through the [`router::NotificationRouter`], with
//! device events going only to sessions selected onto that device
//! ([`registry::DeviceRegistry`]).
//!
//! [`server::LockServer`] and [`server::DeviceServer`] expose all of this under
//! numeric setting ids, and [`devices`] holds the reference devices the
//! `daq-broker` binary builds from its configuration.

pub mod broker;
pub mod config;
pub mod device;
pub mod devices;
pub mod error;
pub mod operation;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod signal;

pub use broker::ResourceBroker;
pub use device::{Device, DeviceEmitter};
pub use error::{BrokerError, BrokerResult, ErrorKind};
pub use operation::{handler_fn, OperationHandler, OperationId};
pub use registry::DeviceRegistry;
pub use router::NotificationRouter;
pub use server::{DeviceServer, LockServer, SettingsServer};
pub use session::{SessionHandle, SessionId, SessionManager, SessionScoped};
pub use signal::{Notification, SignalId};
