//! Reference devices and config-driven construction.

pub mod stepper_motor;
pub mod test_device;

use crate::config::{BrokerConfig, DeviceDefinition, DeviceKind};
use crate::device::Device;
use crate::error::BrokerResult;
use crate::registry::DeviceRegistry;
use crate::router::NotificationRouter;
use crate::server::DeviceServer;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use stepper_motor::{stepper_motor_device, SimulatedStepperMotor, StepperMotorDriver, StepperMotorError};
pub use test_device::test_device;

/// Build the device described by `definition`.
pub fn build_device(definition: &DeviceDefinition) -> BrokerResult<Device> {
    match definition.kind {
        DeviceKind::Test => test_device(),
        DeviceKind::StepperMotor => {
            let settings = definition.stepper_motor.clone().unwrap_or_default();
            let driver = SimulatedStepperMotor::new(
                settings.initial_position,
                settings.enableable,
                Duration::from_millis(settings.step_delay_ms),
            );
            stepper_motor_device(Arc::new(driver))
        }
    }
}

/// Build a device server holding every enabled device in `config`.
pub fn build_device_server(
    config: &BrokerConfig,
    router: Arc<NotificationRouter>,
) -> BrokerResult<DeviceServer> {
    let server = DeviceServer::new(Arc::new(DeviceRegistry::new(router)));
    for definition in config.enabled_devices() {
        server.add_device(definition.id.clone(), build_device(definition)?)?;
    }
    info!(devices = server.registry().list_devices().len(), "Device server ready");
    Ok(server)
}
