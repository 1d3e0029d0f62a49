//! daq-broker command line
//!
//! `check` loads and validates the configuration and lists the devices it
//! would serve. `demo` boots the configured device server in-process and walks
//! two sessions through a lock, a refused call and a release on disconnect.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_broker::config::{BrokerConfig, DeviceDefinition, DeviceKind, DEFAULT_CONFIG_PATH};
use daq_broker::devices::{build_device, build_device_server};
use daq_broker::devices::stepper_motor::{
    ON_BUSY_STATUS_CHANGED, ON_NEW_POSITION, SET_POSITION,
};
use daq_broker::server::{GET_SELECTED_DEVICE, LOCK_DEVICE, SELECT_DEVICE};
use daq_broker::signal::{ON_DEVICE_LOCKED, ON_DEVICE_UNLOCKED};
use daq_broker::{DeviceServer, NotificationRouter, SessionManager, SettingsServer};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "daq-broker", version, about = "Session-scoped device lock broker")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and list the devices it defines
    Check,
    /// Run a two-session lock walkthrough against the configured devices
    Demo {
        /// Device to contend for (defaults to the first stepper motor)
        #[arg(short, long)]
        device: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BrokerConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.application.log_level))?,
        )
        .init();

    info!(name = %config.application.name, config = %cli.config.display(), "Starting daq-broker");

    match cli.command {
        Command::Check => check(&config),
        Command::Demo { device } => demo(&config, device).await,
    }
}

fn check(config: &BrokerConfig) -> Result<()> {
    for definition in &config.devices {
        let device = build_device(definition)?;
        println!(
            "{:<16} {:<14} {:<9} settings {:?}",
            definition.id,
            format!("{:?}", definition.kind),
            if definition.enabled { "enabled" } else { "disabled" },
            device.broker().operation_ids().iter().map(|id| id.0).collect::<Vec<_>>()
        );
    }
    println!("{} device(s), configuration OK", config.devices.len());
    Ok(())
}

async fn demo(config: &BrokerConfig, device: Option<String>) -> Result<()> {
    let mut config = config.clone();
    if !config.devices.iter().any(|d| d.kind == DeviceKind::StepperMotor) {
        config.devices.push(DeviceDefinition {
            id: "sm1".to_string(),
            kind: DeviceKind::StepperMotor,
            enabled: true,
            stepper_motor: None,
        });
    }
    let device_id = match device {
        Some(id) => id,
        None => config
            .enabled_devices()
            .find(|d| d.kind == DeviceKind::StepperMotor)
            .map(|d| d.id.clone())
            .context("no enabled stepper motor to demonstrate")?,
    };

    let router = Arc::new(NotificationRouter::new());
    let server = Arc::new(build_device_server(&config, Arc::clone(&router))?);
    let sessions = SessionManager::new();
    sessions.register(server.clone());
    sessions.register(router.clone());

    let alice = sessions.open("alice");
    let bob = sessions.open("bob");
    let mut bob_rx = router.connect(bob.id());
    for signal in [ON_DEVICE_LOCKED, ON_DEVICE_UNLOCKED, ON_NEW_POSITION, ON_BUSY_STATUS_CHANGED] {
        router.subscribe(bob.id(), signal);
    }

    for session in [alice.id(), bob.id()] {
        server.handle(session, SELECT_DEVICE, json!(device_id)).await?;
    }
    let selected = server.handle(bob.id(), GET_SELECTED_DEVICE, Value::Null).await?;
    info!(session = %bob.id(), device = %selected, "Both sessions selected");

    server.handle(alice.id(), LOCK_DEVICE, Value::Null).await?;
    move_to(&server, alice.id(), 20).await;
    move_to(&server, bob.id(), 500).await;

    info!(session = %alice.id(), "Closing session");
    alice.close();
    move_to(&server, bob.id(), 500).await;

    while let Ok(notification) = bob_rx.try_recv() {
        println!(
            "bob <- signal {} from {} payload {}",
            notification.signal,
            notification.device().unwrap_or("broker"),
            notification.payload
        );
    }
    bob.close();
    Ok(())
}

async fn move_to(server: &DeviceServer, session: daq_broker::SessionId, position: i64) {
    match server.handle(session, SET_POSITION, json!(position)).await {
        Ok(_) => info!(session = %session, position, "Move finished"),
        Err(err) => warn!(session = %session, error = %err, "Move refused"),
    }
}
