//! Telemetry Service
//!
//! Coordinates the connection manager, the telemetry decoder and the poll
//! scheduler for the VESC board: once a connection is set up it enables
//! telemetry notifications, negotiates the MTU and starts polling; when
//! the connection ends it stops polling.

use crate::domain::models::{AppEvent, ConnectionStatus, DeviceAddress};
use crate::domain::settings::Settings;
use crate::domain::telemetry::{BalanceRecord, ValuesRecord};
use crate::infrastructure::bluetooth::connection::{ConnectionManager, ManagerConfig};
use crate::infrastructure::bluetooth::gatt::{find_characteristic, GattService, GattTransport};
use crate::infrastructure::bluetooth::listener::{ConnectionEventListener, EventListenerRegistry};
use crate::infrastructure::bluetooth::poller::{PollDefinition, PollError, PollScheduler};
use crate::infrastructure::bluetooth::telemetry::TelemetryDecoder;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub command_characteristic: Uuid,
    pub telemetry_characteristic: Uuid,
    pub requested_mtu: Option<u16>,
    pub polls: Vec<PollDefinition>,
    pub operation_timeout: Option<Duration>,
    pub raw_data_logging: bool,
}

impl TelemetryConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, PollError> {
        let polls = settings
            .polls
            .iter()
            .map(PollDefinition::from_settings)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            command_characteristic: settings.ble_command_char_uuid,
            telemetry_characteristic: settings.ble_telemetry_char_uuid,
            requested_mtu: settings.requested_mtu,
            polls,
            operation_timeout: settings.operation_timeout_ms.map(Duration::from_millis),
            raw_data_logging: settings.debug_raw_data_logging,
        })
    }
}

/// Reacts to connection lifecycle events.
struct Coordinator {
    manager: ConnectionManager,
    poller: PollScheduler,
    telemetry_characteristic: Uuid,
    requested_mtu: Option<u16>,
    polls: Vec<PollDefinition>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl Coordinator {
    fn publish(&self, event: AppEvent) {
        // The receiver going away just means nobody is watching any more.
        let _ = self.event_sender.send(event);
    }

    fn status(&self, address: DeviceAddress, status: ConnectionStatus) {
        self.publish(AppEvent::ConnectionStatus { address, status });
    }

    fn on_setup_complete(&self, address: DeviceAddress, services: &[GattService]) -> anyhow::Result<()> {
        if find_characteristic(services, self.telemetry_characteristic).is_none() {
            self.status(address, ConnectionStatus::Error);
            anyhow::bail!(
                "{} has no telemetry characteristic {}",
                address,
                self.telemetry_characteristic
            );
        }

        info!("Connected to {}, starting telemetry", address);
        self.manager
            .enable_notifications(address, self.telemetry_characteristic);
        if let Some(mtu) = self.requested_mtu {
            self.manager.request_mtu(address, mtu);
        }
        self.poller.start(address, &self.polls);
        self.status(address, ConnectionStatus::Connected);
        Ok(())
    }

    fn on_connection_ended(&self, address: DeviceAddress, status: ConnectionStatus) {
        self.poller.stop(address);
        self.status(address, status);
    }
}

/// Telemetry pipeline for one or more boards.
pub struct TelemetryService {
    registry: Arc<EventListenerRegistry>,
    coordinator: Arc<Coordinator>,
    decoder: Arc<TelemetryDecoder>,
    listeners: Vec<Arc<ConnectionEventListener>>,
}

impl TelemetryService {
    /// Create the service over `transport`. Poll tasks run on `runtime`.
    pub fn new(
        transport: Arc<dyn GattTransport>,
        config: TelemetryConfig,
        runtime: Handle,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let registry = Arc::new(EventListenerRegistry::new());
        let manager = ConnectionManager::with_config(
            transport,
            registry.clone(),
            ManagerConfig {
                operation_timeout: config.operation_timeout,
            },
        );
        let poller = PollScheduler::new(manager.clone(), config.command_characteristic, runtime);
        let decoder = Arc::new(
            TelemetryDecoder::new(config.telemetry_characteristic)
                .with_raw_logging(config.raw_data_logging),
        );

        let coordinator = Arc::new(Coordinator {
            manager,
            poller,
            telemetry_characteristic: config.telemetry_characteristic,
            requested_mtu: config.requested_mtu,
            polls: config.polls,
            event_sender,
        });

        // Decoder first so a record is published before anything reacts to it.
        let listeners = vec![
            Arc::new(decoder.listener()),
            Arc::new(Self::coordinator_listener(&coordinator)),
        ];
        for listener in &listeners {
            registry.register(listener.clone());
        }

        Self {
            registry,
            coordinator,
            decoder,
            listeners,
        }
    }

    fn coordinator_listener(coordinator: &Arc<Coordinator>) -> ConnectionEventListener {
        let setup = Arc::clone(coordinator);
        let failed = Arc::clone(coordinator);
        let disconnected = Arc::clone(coordinator);
        let mtu = Arc::clone(coordinator);

        ConnectionEventListener::new()
            .on_connection_setup_complete(move |address, services| {
                setup.on_setup_complete(address, services)
            })
            .on_connection_failed(move |address, e| {
                error!("Connection to {} failed: {}", address, e);
                failed.on_connection_ended(address, ConnectionStatus::Error);
                Ok(())
            })
            .on_disconnect(move |address| {
                info!("Disconnected from {}", address);
                disconnected.on_connection_ended(address, ConnectionStatus::Disconnected);
                Ok(())
            })
            .on_mtu_changed(move |address, value| {
                info!("MTU for {} is now {}", address, value);
                mtu.publish(AppEvent::MtuChanged {
                    address,
                    mtu: value,
                });
                Ok(())
            })
    }

    pub fn connect(&self, address: DeviceAddress) {
        self.coordinator
            .status(address, ConnectionStatus::Connecting);
        self.coordinator.manager.connect(address);
    }

    /// Disconnect after already queued operations have run.
    pub fn disconnect(&self, address: DeviceAddress) {
        self.coordinator.poller.stop(address);
        self.coordinator.manager.disconnect(address);
    }

    pub fn teardown(&self, address: DeviceAddress) {
        self.coordinator.manager.teardown_connection(address);
    }

    pub fn status(&self, address: DeviceAddress) -> ConnectionStatus {
        self.coordinator.manager.status(address)
    }

    pub fn is_polling(&self, address: DeviceAddress) -> bool {
        self.coordinator.poller.is_polling(address)
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.coordinator.manager
    }

    pub fn registry(&self) -> &Arc<EventListenerRegistry> {
        &self.registry
    }

    pub fn subscribe_values(&self) -> broadcast::Receiver<ValuesRecord> {
        self.decoder.subscribe_values()
    }

    pub fn subscribe_balance(&self) -> broadcast::Receiver<BalanceRecord> {
        self.decoder.subscribe_balance()
    }

    /// Stop polling and tear every connection down.
    pub fn shutdown(&self) {
        self.coordinator.poller.stop_all();
        self.coordinator.manager.teardown_all();
    }
}

impl Drop for TelemetryService {
    fn drop(&mut self) {
        self.shutdown();
        // The listeners hold the manager, which holds the registry.
        for listener in &self.listeners {
            if !self.registry.unregister(listener) {
                warn!("Telemetry listener was already unregistered");
            }
        }
    }
}
