//! Periodic telemetry polling.
//!
//! One Tokio task per poll definition writes a pre-encoded command frame
//! to the peripheral's command characteristic on a fixed period, for as
//! long as the connection lasts.

use crate::domain::models::DeviceAddress;
use crate::domain::settings::PollSettings;
use crate::infrastructure::bluetooth::connection::ConnectionManager;
use crate::infrastructure::bluetooth::protocol::{self, Frame, FrameError};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("poll payload too large ({size} bytes, max 255)")]
    PayloadTooLarge { size: usize },

    #[error("poll period must be non-zero")]
    ZeroPeriod,

    #[error("could not encode poll command: {0}")]
    Encode(FrameError),
}

impl From<FrameError> for PollError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::PayloadTooLarge { size } => Self::PayloadTooLarge { size },
            other => Self::Encode(other),
        }
    }
}

/// A command sent on a fixed period. The frame is encoded once, up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollDefinition {
    command_id: u8,
    period: Duration,
    frame: Frame,
}

impl PollDefinition {
    pub const DEFAULT_PERIOD: Duration = Duration::from_millis(500);

    pub fn new(command_id: u8, payload: &[u8], period: Duration) -> Result<Self, PollError> {
        if period.is_zero() {
            return Err(PollError::ZeroPeriod);
        }
        let frame = protocol::encode(command_id, payload)?;
        Ok(Self {
            command_id,
            period,
            frame,
        })
    }

    pub fn from_settings(settings: &PollSettings) -> Result<Self, PollError> {
        Self::new(
            settings.command_id,
            &settings.payload,
            Duration::from_millis(settings.interval_ms),
        )
    }

    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

/// Runs poll tasks per connected address.
///
/// Tasks are spawned on the runtime captured at construction, so
/// [`start`](Self::start) may be called from any thread, including a
/// listener hook running on the radio's thread.
pub struct PollScheduler {
    manager: ConnectionManager,
    characteristic: Uuid,
    runtime: Handle,
    tasks: Mutex<HashMap<DeviceAddress, Vec<JoinHandle<()>>>>,
}

impl PollScheduler {
    pub fn new(manager: ConnectionManager, characteristic: Uuid, runtime: Handle) -> Self {
        Self {
            manager,
            characteristic,
            runtime,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling `address`. Returns false if it is already being polled.
    pub fn start(&self, address: DeviceAddress, definitions: &[PollDefinition]) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.contains_key(&address) {
            warn!("Already polling {}, ignoring start", address);
            return false;
        }

        let handles = definitions
            .iter()
            .map(|definition| self.spawn(address, definition.clone()))
            .collect();
        tasks.insert(address, handles);
        info!("Polling {} with {} commands", address, definitions.len());
        true
    }

    fn spawn(&self, address: DeviceAddress, definition: PollDefinition) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let characteristic = self.characteristic;

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(definition.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                debug!(
                    "Polling {} with command {:#04X}",
                    address, definition.command_id
                );
                manager.write_characteristic(
                    address,
                    characteristic,
                    definition.frame.as_bytes().to_vec(),
                );
            }
        })
    }

    /// Stop polling `address`. Returns false if it was not being polled.
    pub fn stop(&self, address: DeviceAddress) -> bool {
        let handles = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address);

        match handles {
            Some(handles) => {
                for handle in handles {
                    handle.abort();
                }
                info!("Stopped polling {}", address);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (address, handles) in drained {
            for handle in handles {
                handle.abort();
            }
            debug!("Stopped polling {}", address);
        }
    }

    pub fn is_polling(&self, address: DeviceAddress) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&address)
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::telemetry::COMM_GET_VALUES;
    use crate::infrastructure::bluetooth::connection::CompletionSink;
    use crate::infrastructure::bluetooth::gatt::{
        CharacteristicProperties, GattCharacteristic, GattService, GattTransport, LinkId,
        OperationId, Request, Response,
    };
    use crate::infrastructure::bluetooth::listener::EventListenerRegistry;
    use std::sync::Arc;

    const COMMAND: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

    /// Answers everything at once and remembers what was written.
    #[derive(Default)]
    struct EchoTransport {
        writes: Mutex<Vec<Vec<u8>>>,
    }

    impl GattTransport for EchoTransport {
        fn start(&self, link: LinkId, id: OperationId, request: Request, sink: CompletionSink) {
            let response = match request {
                Request::DiscoverServices => Response::Services(vec![GattService {
                    uuid: Uuid::from_u128(1),
                    characteristics: vec![GattCharacteristic {
                        uuid: COMMAND,
                        properties: CharacteristicProperties::from_bits(
                            CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
                        ),
                    }],
                }]),
                Request::Write { payload, .. } => {
                    self.writes.lock().unwrap().push(payload);
                    Response::Done
                }
                _ => Response::Done,
            };
            sink.complete(link, id, Ok(response));
        }

        fn release(&self, _link: LinkId) {}
    }

    fn address() -> DeviceAddress {
        DeviceAddress::new(0x11_22_33_44_55_66)
    }

    fn scheduler() -> (Arc<EchoTransport>, PollScheduler) {
        let transport = Arc::new(EchoTransport::default());
        let manager =
            ConnectionManager::new(transport.clone(), Arc::new(EventListenerRegistry::new()));
        manager.connect(address());
        assert!(manager.is_connected(address()));
        let scheduler = PollScheduler::new(manager, COMMAND, Handle::current());
        (transport, scheduler)
    }

    fn values_poll() -> PollDefinition {
        PollDefinition::new(COMM_GET_VALUES, &[], PollDefinition::DEFAULT_PERIOD).unwrap()
    }

    #[test]
    fn test_definition_encodes_frame_once() {
        let definition = values_poll();
        assert_eq!(definition.frame().payload(), &[COMM_GET_VALUES]);
        assert_eq!(
            PollDefinition::new(COMM_GET_VALUES, &[0; 255], Duration::from_millis(10)),
            Err(PollError::PayloadTooLarge { size: 256 })
        );
        assert_eq!(
            PollDefinition::new(COMM_GET_VALUES, &[], Duration::ZERO),
            Err(PollError::ZeroPeriod)
        );
    }

    #[test]
    fn test_definition_from_settings() {
        let settings = PollSettings::new(COMM_GET_VALUES);
        let definition = PollDefinition::from_settings(&settings).unwrap();
        assert_eq!(definition.period(), Duration::from_millis(settings.interval_ms));
        assert_eq!(definition.command_id(), COMM_GET_VALUES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_period() {
        let (transport, scheduler) = scheduler();
        assert!(scheduler.start(address(), &[values_poll()]));

        // Ticks at 0, 500 and 1000 ms.
        tokio::time::sleep(Duration::from_millis(1250)).await;
        let writes = transport.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w == values_poll().frame().as_bytes()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_start_does_not_double_schedule() {
        let (transport, scheduler) = scheduler();
        assert!(scheduler.start(address(), &[values_poll()]));
        assert!(!scheduler.start(address(), &[values_poll()]));

        tokio::time::sleep(Duration::from_millis(1250)).await;
        assert_eq!(transport.writes.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_once() {
        let (transport, scheduler) = scheduler();
        scheduler.start(address(), &[values_poll()]);
        tokio::time::sleep(Duration::from_millis(750)).await;

        assert!(scheduler.stop(address()));
        assert!(!scheduler.stop(address()));
        assert!(!scheduler.is_polling(address()));

        let before = transport.writes.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.writes.lock().unwrap().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_from_another_thread() {
        let (transport, scheduler) = scheduler();
        let scheduler = Arc::new(scheduler);

        let remote = scheduler.clone();
        std::thread::spawn(move || remote.start(address(), &[values_poll()]))
            .join()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(transport.writes.lock().unwrap().len(), 1);
        assert!(scheduler.stop(address()));
    }
}
