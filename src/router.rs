//! Notification fan-out to subscribed sessions.
//!
//! Each session connects once and receives its notifications on an unbounded
//! channel; which signals it gets is decided by its subscriptions. Broker-scoped
//! emissions go to every subscriber of the signal. Device-scoped emissions take
//! an explicit predicate, evaluated once per subscriber at emission time, that
//! says whether the session is currently selected onto the emitting device.
//! A session that changes its selection afterwards is not notified
//! retroactively.

use crate::session::{SessionId, SessionScoped};
use crate::signal::{Notification, NotificationScope, SignalId};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Default)]
struct Subscriber {
    tx: Option<mpsc::UnboundedSender<Notification>>,
    signals: HashSet<SignalId>,
}

/// Routes signal emissions to the sessions that asked for them.
#[derive(Default)]
pub struct NotificationRouter {
    subscribers: RwLock<HashMap<SessionId, Subscriber>>,
}

impl NotificationRouter {
    /// Router with no connected sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the delivery channel for `session`.
    ///
    /// Connecting again replaces the previous channel; subscriptions are kept.
    pub fn connect(&self, session: SessionId) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().entry(session).or_default().tx = Some(tx);
        rx
    }

    /// Start delivering `signal` to `session`.
    pub fn subscribe(&self, session: SessionId, signal: SignalId) {
        self.subscribers
            .write()
            .entry(session)
            .or_default()
            .signals
            .insert(signal);
    }

    /// Stop delivering `signal` to `session`.
    pub fn unsubscribe(&self, session: SessionId, signal: SignalId) {
        if let Some(subscriber) = self.subscribers.write().get_mut(&session) {
            subscriber.signals.remove(&signal);
        }
    }

    /// Whether `session` is subscribed to `signal`.
    pub fn is_subscribed(&self, session: SessionId, signal: SignalId) -> bool {
        self.subscribers
            .read()
            .get(&session)
            .is_some_and(|s| s.signals.contains(&signal))
    }

    /// Deliver to every session subscribed to `signal`. Returns the number of deliveries.
    pub fn emit_broker_scoped(&self, signal: SignalId, payload: Value) -> usize {
        let notification = Notification::new(signal, NotificationScope::Broker, payload);
        self.deliver(&notification, |_| true)
    }

    /// Deliver to sessions subscribed to `signal` for which `is_selected` holds.
    ///
    /// `is_selected` answers "is this session currently selected onto
    /// `device_id`?". Returns the number of deliveries.
    pub fn emit_device_scoped<P>(
        &self,
        device_id: &str,
        signal: SignalId,
        payload: Value,
        is_selected: P,
    ) -> usize
    where
        P: Fn(SessionId) -> bool,
    {
        let notification = Notification::new(
            signal,
            NotificationScope::Device(device_id.to_string()),
            payload,
        );
        self.deliver(&notification, is_selected)
    }

    fn deliver<P>(&self, notification: &Notification, filter: P) -> usize
    where
        P: Fn(SessionId) -> bool,
    {
        let subscribers = self.subscribers.read();
        let mut delivered = 0;
        for (session, subscriber) in subscribers.iter() {
            if !subscriber.signals.contains(&notification.signal) || !filter(*session) {
                continue;
            }
            let Some(tx) = &subscriber.tx else {
                continue;
            };
            if tx.send(notification.clone()).is_ok() {
                delivered += 1;
            } else {
                trace!(session = %session, signal = %notification.signal, "Receiver dropped, notification discarded");
            }
        }
        delivered
    }
}

impl SessionScoped for NotificationRouter {
    fn on_session_closed(&self, session: SessionId) {
        self.subscribers.write().remove(&session);
    }
}
