use anyhow::Result;
use ble_fitness_bridge::domain::settings::SettingsService;
use ble_fitness_bridge::infrastructure::bluetooth::btleplug_host::BtleplugHost;
use ble_fitness_bridge::infrastructure::bluetooth::fake::FakeHost;
use ble_fitness_bridge::infrastructure::bluetooth::host::HostEventSender;
use ble_fitness_bridge::infrastructure::bluetooth::protocol::uuids;
use ble_fitness_bridge::infrastructure::bluetooth::{
    host_event_channel, BluetoothService, HostController, SessionConfig,
};
use ble_fitness_bridge::infrastructure::logging;
use ble_fitness_bridge::rpc::{server, tools::Dispatcher};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Drive BLE fitness peripherals over line-delimited JSON-RPC on stdio
#[derive(Parser, Debug)]
#[command(name = "ble_fitness_bridge", version, about)]
struct Args {
    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also serve on this local socket name
    #[arg(long)]
    socket: Option<String>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Use a simulated trainer instead of the Bluetooth adapter
    #[arg(long)]
    fake: bool,
}

/// Trainer plus strap with canned readings
fn demo_host(events: HostEventSender) -> FakeHost {
    FakeHost::fitness_bike(events)
        .with_read_value(
            uuids::FITNESS_MACHINE_FEATURE,
            vec![0x86, 0x50, 0x00, 0x00, 0x0C, 0xE0, 0x00, 0x00],
        )
        .with_notification_payload(
            uuids::INDOOR_BIKE_DATA,
            vec![0x44, 0x00, 0x90, 0x03, 0x98, 0x00, 0x64, 0x00],
        )
        .with_notification_payload(uuids::HEART_RATE_MEASUREMENT, vec![0x00, 0x48])
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings_service = match &args.config {
        Some(path) => SettingsService::from_path(path.clone()),
        None => SettingsService::new()?,
    };
    // First run: leave an editable file with every default spelled out
    let wrote_defaults = (!settings_service.path().exists()).then(|| settings_service.save());
    if let Some(level) = &args.log_level {
        settings_service.get_mut().log_settings.level = level.clone();
    }
    let settings = settings_service.get().clone();

    // Initialize logging
    let _guard = logging::init_logger(&settings.log_settings)?;
    info!("Starting BLE fitness bridge");
    info!("Settings: {}", settings_service.path().display());
    match wrote_defaults {
        Some(Ok(())) => info!("Wrote default settings"),
        Some(Err(e)) => warn!("Could not write default settings: {}", e),
        None => {}
    }

    let (events_tx, events_rx) = host_event_channel();
    let host: Arc<dyn HostController> = if args.fake {
        info!("Using simulated Bluetooth host");
        Arc::new(demo_host(events_tx))
    } else {
        Arc::new(BtleplugHost::new(events_tx).await?)
    };

    let service = BluetoothService::spawn(
        host,
        events_rx,
        SessionConfig::from(&settings.session),
    );
    let dispatcher = Dispatcher::new(service.clone(), settings.session.default_scan_duration());

    let socket = args.socket.or(settings.transport.local_socket_name);
    if let Some(name) = &socket {
        server::spawn_local_socket(name, dispatcher.clone(), tokio::runtime::Handle::current())?;
    }

    server::serve_stdio(dispatcher).await?;

    if socket.is_some() {
        info!("Still serving local socket, Ctrl+C to exit");
        tokio::signal::ctrl_c().await?;
    }

    if let Err(e) = service.disconnect().await {
        warn!("Disconnect on shutdown failed: {}", e);
    }
    info!("Shutting down");
    Ok(())
}
