use anyhow::Context;
use clap::Parser;
use floaty_telemetry::domain::models::{AppEvent, ConnectionStatus, DeviceAddress};
use floaty_telemetry::domain::settings::{Settings, SettingsService};
use floaty_telemetry::domain::telemetry::{BalanceRecord, TelemetryRecord, ValuesRecord};
use floaty_telemetry::infrastructure::bluetooth::gatt::GattTransport;
use floaty_telemetry::infrastructure::bluetooth::simulator::{SimulatedPeripheral, SimulatorConfig};
use floaty_telemetry::infrastructure::bluetooth::{TelemetryConfig, TelemetryService};
use floaty_telemetry::infrastructure::logging;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Address the simulated board answers on.
const SIMULATED_ADDRESS: u64 = 0x00_F1_0A_7E_00_01;

#[derive(Parser, Debug)]
#[command(name = "floaty", version, about = "VESC board telemetry over BLE")]
struct Cli {
    /// Board address (AA:BB:CC:DD:EE:FF). Defaults to the last connected board.
    #[arg(long, value_name = "ADDR", env = "FLOATY_ADDRESS", conflicts_with = "simulate")]
    address: Option<DeviceAddress>,

    /// Talk to a simulated board instead of the radio.
    #[arg(long)]
    simulate: bool,

    /// Settings file (defaults to the per-user config directory).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// ATT MTU to request once connected.
    #[arg(long, value_name = "N")]
    mtu: Option<u16>,

    /// Also poll balance controller state.
    #[arg(long)]
    balance: bool,

    /// Poll period for every command.
    #[arg(long, value_name = "MS")]
    interval_ms: Option<u64>,

    /// Print records as JSON lines.
    #[arg(long)]
    json: bool,

    /// Minimum log level (stderr). `RUST_LOG` takes precedence.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Settings for this run. Overrides are not written back to disk.
    fn effective_settings(&self, stored: &Settings) -> Settings {
        let mut settings = stored.clone();
        if let Some(mtu) = self.mtu {
            settings.requested_mtu = Some(mtu);
        }
        if self.balance {
            settings.enable_balance_poll();
        }
        if let Some(interval_ms) = self.interval_ms {
            settings.set_poll_interval(interval_ms);
        }
        settings
    }
}

#[cfg(windows)]
fn radio_transport(runtime: Handle) -> anyhow::Result<Arc<dyn GattTransport>> {
    use floaty_telemetry::infrastructure::bluetooth::winrt::WinRtTransport;
    Ok(Arc::new(WinRtTransport::new(runtime)))
}

#[cfg(not(windows))]
fn radio_transport(_runtime: Handle) -> anyhow::Result<Arc<dyn GattTransport>> {
    anyhow::bail!("no Bluetooth transport on this platform; use --simulate")
}

fn print_values(record: &ValuesRecord, json: bool) -> anyhow::Result<()> {
    if json {
        let line = serde_json::to_string(&TelemetryRecord::Values(record.clone()))?;
        println!("{line}");
    } else {
        println!(
            "values  {:5.1} V  {:6.2} A in  {:6.2} A motor  duty {:5.1}%  {:6.0} erpm  FET {:4.1}°C  motor {:4.1}°C",
            record.input_voltage,
            record.avg_input_current,
            record.avg_motor_current,
            record.duty_cycle_now * 100.0,
            record.rpm,
            record.temp_mosfet,
            record.temp_motor,
        );
    }
    Ok(())
}

fn print_balance(record: &BalanceRecord, json: bool) -> anyhow::Result<()> {
    if json {
        let line = serde_json::to_string(&TelemetryRecord::Balance(record.clone()))?;
        println!("{line}");
    } else {
        println!(
            "balance pitch {:6.2}°  roll {:6.2}°  pid {:7.2}  current {:6.2} A",
            record.pitch_angle, record.roll_angle, record.pid_output, record.balance_current,
        );
    }
    Ok(())
}

/// `Some(record)` for a received record, `None` once the channel closed.
fn received<T>(result: Result<T, broadcast::error::RecvError>) -> Option<Option<T>> {
    match result {
        Ok(record) => Some(Some(record)),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!("Printer fell behind, skipped {} records", skipped);
            Some(None)
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match &cli.config {
        Some(path) => SettingsService::open(path.clone()),
        None => SettingsService::new()?,
    };
    let settings = cli.effective_settings(settings_service.get());
    let _log_guard = logging::init_logger(&settings.log_settings, cli.log_level.as_deref())?;
    info!("Using settings at {}", settings_service.path().display());

    let runtime = Handle::current();
    let (address, transport): (DeviceAddress, Arc<dyn GattTransport>) = if cli.simulate {
        let address = DeviceAddress::new(SIMULATED_ADDRESS);
        let simulator = SimulatedPeripheral::new(
            address,
            SimulatorConfig::from_settings(&settings),
            runtime.clone(),
        );
        (address, Arc::new(simulator))
    } else {
        let address = cli
            .address
            .or(settings.last_connected_address)
            .context("no board address known; pass --address or --simulate")?;
        (address, radio_transport(runtime.clone())?)
    };

    let (event_sender, mut events) = mpsc::unbounded_channel();
    let service = TelemetryService::new(
        transport,
        TelemetryConfig::from_settings(&settings)?,
        runtime,
        event_sender,
    );
    let mut values = service.subscribe_values();
    let mut balance = service.subscribe_balance();

    service.connect(address);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, disconnecting");
                break Ok(());
            }
            Some(event) = events.recv() => match event {
                AppEvent::ConnectionStatus { address, status: ConnectionStatus::Connected } => {
                    if !cli.simulate {
                        if let Err(e) = settings_service.remember_address(address) {
                            warn!("Could not save settings: {}", e);
                        }
                    }
                }
                AppEvent::ConnectionStatus { address, status: ConnectionStatus::Error } => {
                    break Err(anyhow::anyhow!("connection to {} failed", address));
                }
                AppEvent::ConnectionStatus { address, status: ConnectionStatus::Disconnected } => {
                    info!("{} disconnected", address);
                    break Ok(());
                }
                AppEvent::ConnectionStatus { .. } | AppEvent::MtuChanged { .. } => {}
            },
            record = values.recv() => match received(record) {
                Some(Some(record)) => print_values(&record, cli.json)?,
                Some(None) => {}
                None => break Ok(()),
            },
            record = balance.recv() => match received(record) {
                Some(Some(record)) => print_balance(&record, cli.json)?,
                Some(None) => {}
                None => break Ok(()),
            },
        }
    };

    service.shutdown();
    outcome
}
