use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use thinglink::mqtt::message_manager::stringify;
use thinglink::{CodecRegistry, Device, DeviceConfig, DeviceHandle, Publisher};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(DeviceConfig::default_path);
    info!("Loading device configuration from {}", path.display());
    let config = DeviceConfig::load(&path)
        .await
        .map_err(|e| eyre!("Failed to load device configuration: {}", e))?;
    let properties = config.properties.clone();

    let mut device = Device::init(config, &CodecRegistry::with_builtins())
        .map_err(|e| eyre!("Failed to initialise device: {}", e))?;

    // Wire configured properties: get topics are logged, set topics accept commands
    let mut publishers: HashMap<String, Publisher> = HashMap::new();
    for (property, topics) in &properties {
        if let Some(get) = &topics.get {
            let name = property.clone();
            device
                .subscribe(get, property, move |topic: &str, value: Value| {
                    info!("{} <- {} = {}", name, topic, stringify(&value));
                })
                .map_err(|e| eyre!("Failed to subscribe {}: {}", property, e))?;
        }
        if topics.set.is_some() {
            let publisher = device
                .publisher(topics.set.clone(), topics.get.clone(), property, topics.confirm)
                .map_err(|e| eyre!("Failed to create publisher for {}: {}", property, e))?;
            publishers.insert(property.clone(), publisher);
        }
    }

    let handle = device.handle();
    let mut liveness = handle.liveness();
    tokio::spawn(async move {
        while liveness.changed().await.is_ok() {
            let online = *liveness.borrow_and_update();
            info!("Device is {}", if online { "online" } else { "offline" });
        }
    });

    let running = tokio::spawn(device.start().run());
    command_loop(&handle, &publishers).await;

    handle
        .shutdown()
        .map_err(|e| eyre!("Failed to stop device: {}", e))?;
    let status = running
        .await
        .map_err(|e| eyre!("Device task failed: {}", e))?
        .into_status();
    info!(
        "Device stopped ({} messages received, {} sent)",
        status.messages_received, status.messages_sent
    );

    Ok(())
}

/// Reads `set <property> <value>` commands from stdin until `quit` or Ctrl-C.
async fn command_loop(handle: &DeviceHandle, publishers: &HashMap<String, Publisher>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !run_command(line.trim(), handle, publishers) {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    error!("Failed to read command: {}", e);
                    stdin_open = false;
                }
            }
        }
    }
}

fn run_command(line: &str, handle: &DeviceHandle, publishers: &HashMap<String, Publisher>) -> bool {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("set"), Some(property), Some(raw)) => match publishers.get(property) {
            Some(publisher) => {
                let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
                if let Err(e) = handle.publish(publisher, value) {
                    error!("{}", e);
                }
            }
            None => warn!("No set topic configured for property {}", property),
        },
        (Some("status"), None, None) => {
            info!("Device is {}", if handle.is_online() { "online" } else { "offline" })
        }
        (Some("quit"), None, None) => return false,
        (Some(""), None, None) | (None, _, _) => {}
        _ => warn!("Unknown command: {} (expected: set <property> <value> | status | quit)", line),
    }
    true
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
