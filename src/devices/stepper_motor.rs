//! Stepper motor device.
//!
//! The device speaks to the motor only through [`StepperMotorDriver`], so
//! real pulse generators and the [`SimulatedStepperMotor`] are
//! interchangeable. Only `set_position` is lockable: a session holding the
//! device lock owns motion, while position, busy and enable queries (and the
//! emergency `stop`) stay open to everyone.
//!
//! While a move is in progress the device emits `on new position` every
//! 100 ms with the live position, and once more with the final position when
//! the move ends. `on busy status changed` brackets every move.

use crate::device::{Device, DeviceEmitter};
use crate::error::BrokerResult;
use crate::operation::{handler_fn, OperationId};
use crate::signal::SignalId;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Move to the position given in steps. Lockable.
pub const SET_POSITION: OperationId = OperationId(11);
/// Current position in steps.
pub const GET_POSITION: OperationId = OperationId(12);
/// Whether a move is in progress.
pub const IS_BUSY: OperationId = OperationId(13);
/// Stop the running move.
pub const STOP: OperationId = OperationId(14);
/// Whether the motor accepts moves.
pub const IS_ENABLED: OperationId = OperationId(15);
/// Enable or disable the motor.
pub const SET_ENABLED: OperationId = OperationId(16);
/// Whether the motor has an enable line.
pub const IS_ENABLEABLE: OperationId = OperationId(17);

/// Live position while moving, final position once stopped.
pub const ON_NEW_POSITION: SignalId = SignalId(110);
/// `true` when a move starts, `false` when it ends.
pub const ON_BUSY_STATUS_CHANGED: SignalId = SignalId(111);
/// New enable state after `set_enabled`.
pub const ON_ENABLED_STATUS_CHANGED: SignalId = SignalId(112);

const UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Failures reported by a stepper motor.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StepperMotorError {
    /// The motor has no enable line.
    #[error("stepper motor is not enableable")]
    NotEnableable,
    /// `stop` interrupted the move.
    #[error("set position operation stopped")]
    Stopped,
    /// The motor is disabled.
    #[error("can not set position when stepper motor is disabled")]
    Disabled,
    /// Another move is in progress.
    #[error("stepper motor is busy")]
    Busy,
    /// The distance to the target does not fit in a step count.
    #[error("target position is out of range")]
    OutOfRange,
}

/// Hardware interface of a stepper motor.
#[async_trait]
pub trait StepperMotorDriver: Send + Sync {
    /// Step to `position`. Returns once the motor stops, early if [`stop`](Self::stop) was called.
    async fn set_position(&self, position: i64) -> Result<(), StepperMotorError>;

    /// Current position in steps, live during a move.
    fn position(&self) -> i64;

    /// Ask a running move to stop after the current step.
    fn stop(&self);

    /// Whether the motor accepts moves.
    fn is_enabled(&self) -> bool;

    /// Switch the enable line. Fails on a motor without one.
    fn set_enabled(&self, enabled: bool) -> Result<(), StepperMotorError>;

    /// Whether the motor has an enable line at all.
    fn is_enableable(&self) -> bool;
}

/// A stepper motor that only exists in memory.
///
/// Starts enabled. A motor without an enable line is always enabled.
pub struct SimulatedStepperMotor {
    position: AtomicI64,
    enabled: AtomicBool,
    enableable: bool,
    stop_requested: AtomicBool,
    step_delay: Duration,
}

impl SimulatedStepperMotor {
    /// Motor at `initial_position`, taking `step_delay` per step.
    pub fn new(initial_position: i64, enableable: bool, step_delay: Duration) -> Self {
        Self {
            position: AtomicI64::new(initial_position),
            enabled: AtomicBool::new(true),
            enableable,
            stop_requested: AtomicBool::new(false),
            step_delay,
        }
    }
}

#[async_trait]
impl StepperMotorDriver for SimulatedStepperMotor {
    async fn set_position(&self, position: i64) -> Result<(), StepperMotorError> {
        if !self.is_enabled() {
            return Err(StepperMotorError::Disabled);
        }
        let start = self.position();
        let distance = position
            .checked_sub(start)
            .ok_or(StepperMotorError::OutOfRange)?
            .unsigned_abs();
        let step = if position > start { 1 } else { -1 };
        self.stop_requested.store(false, Ordering::SeqCst);

        for _ in 0..distance {
            if self.stop_requested.swap(false, Ordering::SeqCst) {
                return Err(StepperMotorError::Stopped);
            }
            if self.step_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.step_delay).await;
            }
            self.position.fetch_add(step, Ordering::SeqCst);
        }
        Ok(())
    }

    fn position(&self) -> i64 {
        self.position.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        !self.enableable || self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) -> Result<(), StepperMotorError> {
        if !self.enableable {
            return Err(StepperMotorError::NotEnableable);
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn is_enableable(&self) -> bool {
        self.enableable
    }
}

struct MotorState {
    driver: Arc<dyn StepperMotorDriver>,
    busy: AtomicBool,
    emitter: DeviceEmitter,
}

/// Marks the motor busy for the lifetime of one move.
///
/// Dropping it (move finished, failed or cancelled) stops the position
/// ticker, clears the busy flag and reports the final position.
struct Motion {
    state: Arc<MotorState>,
    ticker: JoinHandle<()>,
}

impl Motion {
    fn begin(state: &Arc<MotorState>) -> Result<Self, StepperMotorError> {
        if state
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StepperMotorError::Busy);
        }
        state.emitter.emit(ON_BUSY_STATUS_CHANGED, json!(true));

        let ticking = Arc::clone(state);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(UPDATE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                ticking
                    .emitter
                    .emit(ON_NEW_POSITION, json!(ticking.driver.position()));
            }
        });

        Ok(Self {
            state: Arc::clone(state),
            ticker,
        })
    }
}

impl Drop for Motion {
    fn drop(&mut self) {
        self.ticker.abort();
        self.state.busy.store(false, Ordering::SeqCst);
        self.state.emitter.emit(ON_BUSY_STATUS_CHANGED, json!(false));
        self.state
            .emitter
            .emit(ON_NEW_POSITION, json!(self.state.driver.position()));
    }
}

async fn set_position(state: Arc<MotorState>, args: Value) -> anyhow::Result<Value> {
    let target: i64 = serde_json::from_value(args).context("expected a position in steps")?;
    let motion = Motion::begin(&state)?;
    debug!(from = state.driver.position(), to = target, "Stepper motor moving");

    let result = state.driver.set_position(target).await;
    drop(motion);

    if let Err(err) = result {
        warn!(position = state.driver.position(), error = %err, "Stepper motor move ended early");
        return Err(err.into());
    }
    Ok(Value::Null)
}

async fn set_enabled(state: Arc<MotorState>, args: Value) -> anyhow::Result<Value> {
    let enabled: bool = serde_json::from_value(args).context("expected a boolean")?;
    state.driver.set_enabled(enabled)?;
    state.emitter.emit(ON_ENABLED_STATUS_CHANGED, json!(enabled));
    Ok(Value::Null)
}

/// Build a stepper motor device around `driver`.
pub fn stepper_motor_device(driver: Arc<dyn StepperMotorDriver>) -> BrokerResult<Device> {
    let device = Device::new();
    let state = Arc::new(MotorState {
        driver,
        busy: AtomicBool::new(false),
        emitter: device.emitter(),
    });

    let s = Arc::clone(&state);
    device.register_operation(
        SET_POSITION,
        "set_position",
        true,
        handler_fn(move |_, args| set_position(Arc::clone(&s), args)),
    )?;

    let s = Arc::clone(&state);
    device.register_operation(
        GET_POSITION,
        "get_position",
        false,
        handler_fn(move |_, _| {
            let position = s.driver.position();
            async move { Ok(json!(position)) }
        }),
    )?;

    let s = Arc::clone(&state);
    device.register_operation(
        IS_BUSY,
        "is_busy",
        false,
        handler_fn(move |_, _| {
            let busy = s.busy.load(Ordering::SeqCst);
            async move { Ok(json!(busy)) }
        }),
    )?;

    let s = Arc::clone(&state);
    device.register_operation(
        STOP,
        "stop",
        false,
        handler_fn(move |_, _| {
            s.driver.stop();
            async { Ok(Value::Null) }
        }),
    )?;

    let s = Arc::clone(&state);
    device.register_operation(
        IS_ENABLED,
        "is_enabled",
        false,
        handler_fn(move |_, _| {
            let enabled = s.driver.is_enabled();
            async move { Ok(json!(enabled)) }
        }),
    )?;

    let s = Arc::clone(&state);
    device.register_operation(
        SET_ENABLED,
        "set_enabled",
        false,
        handler_fn(move |_, args| set_enabled(Arc::clone(&s), args)),
    )?;

    let s = Arc::clone(&state);
    device.register_operation(
        IS_ENABLEABLE,
        "is_enableable",
        false,
        handler_fn(move |_, _| {
            let enableable = s.driver.is_enableable();
            async move { Ok(json!(enableable)) }
        }),
    )?;

    Ok(device)
}
