//! Who hears which notification.

use daq_broker::devices::stepper_motor::{
    ON_BUSY_STATUS_CHANGED, ON_NEW_POSITION, SET_POSITION,
};
use daq_broker::devices::test_device::{ON_SALIVATION, RING_BELL};
use daq_broker::devices::{stepper_motor_device, test_device, SimulatedStepperMotor};
use daq_broker::server::{LOCK_DEVICE, LOCK_SETTING, SELECT_DEVICE, UNLOCK_SETTING};
use daq_broker::signal::{
    NotificationScope, ON_DEVICE_LOCKED, ON_DEVICE_UNLOCKED, ON_SETTING_LOCKED,
    ON_SETTING_UNLOCKED,
};
use daq_broker::{
    handler_fn, DeviceRegistry, DeviceServer, LockServer, Notification, NotificationRouter,
    OperationId, SessionId, SessionManager, SettingsServer,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const A: SessionId = SessionId::new(1);
const B: SessionId = SessionId::new(2);
const C: SessionId = SessionId::new(3);

fn drain(rx: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}

fn device_server(router: &Arc<NotificationRouter>) -> DeviceServer {
    let server = DeviceServer::new(Arc::new(DeviceRegistry::new(router.clone())));
    for id in ["sm1", "sm2"] {
        let driver = Arc::new(SimulatedStepperMotor::new(0, true, Duration::ZERO));
        server
            .add_device(id, stepper_motor_device(driver).expect("build"))
            .expect("add");
    }
    server
        .add_device("dev 1", test_device().expect("build"))
        .expect("add");
    server
}

#[tokio::test]
async fn test_broker_scoped_lock_signals_reach_all_subscribers() {
    let router = Arc::new(NotificationRouter::new());
    let server = LockServer::new(router.clone());
    server
        .register_operation(OperationId(1), "set_delay", true, handler_fn(|_, _| async { Ok(Value::Null) }))
        .expect("register");

    let mut rx_b = router.connect(B);
    let mut rx_c = router.connect(C);
    for signal in [ON_SETTING_LOCKED, ON_SETTING_UNLOCKED] {
        router.subscribe(B, signal);
    }
    router.subscribe(C, ON_SETTING_UNLOCKED);

    server.handle(A, LOCK_SETTING, json!(1)).await.expect("lock");
    server.handle(A, UNLOCK_SETTING, json!(1)).await.expect("unlock");

    let seen_b = drain(&mut rx_b);
    assert_eq!(seen_b.len(), 2);
    assert_eq!(seen_b[0].signal, ON_SETTING_LOCKED);
    assert_eq!(seen_b[0].payload, json!([1, 1]));
    assert_eq!(seen_b[0].scope, NotificationScope::Broker);
    assert_eq!(seen_b[1].signal, ON_SETTING_UNLOCKED);
    assert_eq!(seen_b[1].payload, json!(1));

    let seen_c = drain(&mut rx_c);
    assert_eq!(seen_c.len(), 1);
    assert_eq!(seen_c[0].signal, ON_SETTING_UNLOCKED);
}

#[tokio::test]
async fn test_device_signals_reach_only_selected_sessions() {
    let router = Arc::new(NotificationRouter::new());
    let server = device_server(&router);
    let mut rx_b = router.connect(B);
    let mut rx_c = router.connect(C);
    for session in [B, C] {
        router.subscribe(session, ON_DEVICE_LOCKED);
    }

    server.handle(A, SELECT_DEVICE, json!("sm1")).await.expect("select");
    server.handle(B, SELECT_DEVICE, json!("sm1")).await.expect("select");
    server.handle(C, SELECT_DEVICE, json!("sm2")).await.expect("select");

    server.handle(A, LOCK_DEVICE, Value::Null).await.expect("lock");

    let seen_b = drain(&mut rx_b);
    assert_eq!(seen_b.len(), 1);
    assert_eq!(seen_b[0].signal, ON_DEVICE_LOCKED);
    assert_eq!(seen_b[0].payload, json!(1));
    assert_eq!(seen_b[0].device(), Some("sm1"));
    assert!(drain(&mut rx_c).is_empty());
}

#[tokio::test]
async fn test_selection_change_moves_audience() {
    let router = Arc::new(NotificationRouter::new());
    let server = device_server(&router);
    let mut rx_b = router.connect(B);
    router.subscribe(B, ON_SALIVATION);

    server.handle(A, SELECT_DEVICE, json!("dev 1")).await.expect("select");
    server.handle(B, SELECT_DEVICE, json!("sm1")).await.expect("select");

    server.handle(A, RING_BELL, Value::Null).await.expect("ring");
    assert!(drain(&mut rx_b).is_empty(), "b is not on dev 1 yet");

    server.handle(B, SELECT_DEVICE, json!("dev 1")).await.expect("reselect");
    server.handle(A, RING_BELL, Value::Null).await.expect("ring");
    let seen = drain(&mut rx_b);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].signal, ON_SALIVATION);
    assert_eq!(seen[0].device(), Some("dev 1"));

    server.handle(B, SELECT_DEVICE, json!("sm2")).await.expect("leave");
    server.handle(A, RING_BELL, Value::Null).await.expect("ring");
    assert!(drain(&mut rx_b).is_empty(), "b left dev 1");
}

#[tokio::test]
async fn test_move_emits_busy_and_final_position() {
    let router = Arc::new(NotificationRouter::new());
    let server = device_server(&router);
    let mut rx = router.connect(B);
    router.subscribe(B, ON_BUSY_STATUS_CHANGED);
    router.subscribe(B, ON_NEW_POSITION);

    server.handle(A, SELECT_DEVICE, json!("sm1")).await.expect("select");
    server.handle(B, SELECT_DEVICE, json!("sm1")).await.expect("select");
    server.handle(A, SET_POSITION, json!(40)).await.expect("move");

    let seen = drain(&mut rx);
    let busy: Vec<_> = seen
        .iter()
        .filter(|n| n.signal == ON_BUSY_STATUS_CHANGED)
        .map(|n| n.payload.clone())
        .collect();
    assert_eq!(busy, vec![json!(true), json!(false)]);
    let last_position = seen
        .iter()
        .filter(|n| n.signal == ON_NEW_POSITION)
        .last()
        .expect("final position");
    assert_eq!(last_position.payload, json!(40));
}

#[tokio::test]
async fn test_session_close_notifies_remaining_sessions() {
    let router = Arc::new(NotificationRouter::new());
    let server = Arc::new(device_server(&router));
    let sessions = SessionManager::new();
    sessions.register(server.clone());
    sessions.register(router.clone());

    let a = sessions.open("a");
    let b = sessions.open("b");
    let mut rx_b = router.connect(b.id());
    router.subscribe(b.id(), ON_DEVICE_UNLOCKED);
    router.subscribe(b.id(), ON_SETTING_UNLOCKED);

    for session in [a.id(), b.id()] {
        server.handle(session, SELECT_DEVICE, json!("sm1")).await.expect("select");
    }
    server.handle(a.id(), LOCK_DEVICE, Value::Null).await.expect("lock device");
    server.handle(a.id(), LOCK_SETTING, json!(11)).await.expect("lock setting");

    drop(a);

    let signals: Vec<_> = drain(&mut rx_b).into_iter().map(|n| n.signal).collect();
    assert_eq!(signals, vec![ON_DEVICE_UNLOCKED, ON_SETTING_UNLOCKED]);
}
