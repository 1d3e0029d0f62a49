//! Counter device used for exercising clients.
//!
//! Holds one integer. `set_number` is the only lockable setting, so a session
//! holding the device lock can pin the number while everyone else can still
//! read it, do arithmetic, or ring the bell.

use crate::device::{Device, DeviceEmitter};
use crate::error::BrokerResult;
use crate::operation::{handler_fn, OperationId};
use crate::signal::SignalId;
use anyhow::Context;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Add one to the number. Lockable.
pub const INCREMENT: OperationId = OperationId(10);
/// Subtract one from the number. Lockable.
pub const DECREMENT: OperationId = OperationId(11);
/// Current number.
pub const GET_NUMBER: OperationId = OperationId(12);
/// Overwrite the number. Lockable.
pub const SET_NUMBER: OperationId = OperationId(13);
/// Emit the salivation signal.
pub const RING_BELL: OperationId = OperationId(14);

/// Emitted by `ring_bell`.
pub const ON_SALIVATION: SignalId = SignalId(15);

fn number_arg(args: Value) -> anyhow::Result<i64> {
    serde_json::from_value(args).context("expected an integer")
}

async fn increment(args: Value) -> anyhow::Result<Value> {
    Ok(json!(number_arg(args)? + 1))
}

async fn decrement(args: Value) -> anyhow::Result<Value> {
    Ok(json!(number_arg(args)? - 1))
}

async fn set_number(number: Arc<AtomicI64>, args: Value) -> anyhow::Result<Value> {
    number.store(number_arg(args)?, Ordering::SeqCst);
    Ok(Value::Null)
}

async fn ring_bell(emitter: DeviceEmitter) -> anyhow::Result<Value> {
    emitter.emit(ON_SALIVATION, Value::Null);
    Ok(Value::Null)
}

/// Build a counter device starting at zero.
pub fn test_device() -> BrokerResult<Device> {
    let device = Device::new();
    let number = Arc::new(AtomicI64::new(0));
    let emitter = device.emitter();

    device.register_operation(INCREMENT, "increment", false, handler_fn(|_, args| increment(args)))?;
    device.register_operation(DECREMENT, "decrement", false, handler_fn(|_, args| decrement(args)))?;

    let current = Arc::clone(&number);
    device.register_operation(
        GET_NUMBER,
        "get_number",
        false,
        handler_fn(move |_, _| {
            let value = current.load(Ordering::SeqCst);
            async move { Ok(json!(value)) }
        }),
    )?;

    device.register_operation(
        SET_NUMBER,
        "set_number",
        true,
        handler_fn(move |_, args| set_number(Arc::clone(&number), args)),
    )?;

    device.register_operation(
        RING_BELL,
        "ring_bell",
        false,
        handler_fn(move |_, _| ring_bell(emitter.clone())),
    )?;

    Ok(device)
}
