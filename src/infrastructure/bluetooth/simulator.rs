//! Simulated Peripheral
//!
//! An in-process [`GattTransport`] that behaves like a VESC board behind a
//! Nordic UART bridge: it exposes the UART service, answers
//! `COMM_GET_VALUES` and `COMM_GET_DECODED_BALANCE` polls with valid frames
//! split to the negotiated MTU, and reports completions from Tokio tasks
//! after a short latency, the way a radio stack reports from its own
//! thread.

use crate::domain::models::DeviceAddress;
use crate::domain::settings::Settings;
use crate::domain::telemetry::{
    BalanceRecord, ValuesRecord, COMM_GET_DECODED_BALANCE, COMM_GET_VALUES,
};
use crate::infrastructure::bluetooth::connection::CompletionSink;
use crate::infrastructure::bluetooth::error::ConnectionError;
use crate::infrastructure::bluetooth::gatt::{
    CharacteristicProperties, GattCharacteristic, GattService, GattTransport, LinkId,
    NotificationMode, OperationId, Request, Response, GATT_MIN_MTU,
};
use crate::infrastructure::bluetooth::protocol;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Largest MTU the simulated radio agrees to.
const SIMULATED_MAX_MTU: u16 = 247;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub service: Uuid,
    pub command_characteristic: Uuid,
    pub telemetry_characteristic: Uuid,
    /// Delay before each completion is reported.
    pub latency: Duration,
}

impl SimulatorConfig {
    pub const DEFAULT_LATENCY: Duration = Duration::from_millis(15);

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            service: settings.ble_service_uuid,
            command_characteristic: settings.ble_command_char_uuid,
            telemetry_characteristic: settings.ble_telemetry_char_uuid,
            latency: Self::DEFAULT_LATENCY,
        }
    }
}

struct LinkState {
    sink: CompletionSink,
    mtu: u16,
    notifying: bool,
}

pub struct SimulatedPeripheral {
    address: DeviceAddress,
    config: SimulatorConfig,
    runtime: Handle,
    links: Arc<Mutex<HashMap<LinkId, LinkState>>>,
    tick: AtomicU32,
}

/// What a request produced: the completion, plus any notifications the
/// peripheral pushes right after it.
struct Outcome {
    result: Result<Response, ConnectionError>,
    notifications: Vec<Vec<u8>>,
}

impl Outcome {
    fn done() -> Self {
        Self::reply(Ok(Response::Done))
    }

    fn reply(result: Result<Response, ConnectionError>) -> Self {
        Self {
            result,
            notifications: Vec::new(),
        }
    }
}

impl SimulatedPeripheral {
    pub fn new(address: DeviceAddress, config: SimulatorConfig, runtime: Handle) -> Self {
        Self {
            address,
            config,
            runtime,
            links: Arc::new(Mutex::new(HashMap::new())),
            tick: AtomicU32::new(0),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    fn links(&self) -> MutexGuard<'_, HashMap<LinkId, LinkState>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every link to `address` as if the board powered off.
    pub fn drop_link(&self, address: DeviceAddress) {
        let dropped: Vec<_> = {
            let mut links = self.links();
            let ids: Vec<_> = links.keys().filter(|l| l.address == address).copied().collect();
            ids.into_iter()
                .filter_map(|id| links.remove(&id).map(|state| (id, state.sink)))
                .collect()
        };
        for (link, sink) in dropped {
            info!("Simulated link to {} dropped", link.address);
            sink.link_lost(link);
        }
    }

    fn services(&self) -> Vec<GattService> {
        vec![
            GattService {
                uuid: self.config.service,
                characteristics: vec![
                    GattCharacteristic {
                        uuid: self.config.command_characteristic,
                        properties: CharacteristicProperties::from_bits(
                            CharacteristicProperties::WRITE
                                | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
                        ),
                    },
                    GattCharacteristic {
                        uuid: self.config.telemetry_characteristic,
                        properties: CharacteristicProperties::from_bits(
                            CharacteristicProperties::NOTIFY,
                        ),
                    },
                ],
            },
            GattService {
                uuid: BATTERY_SERVICE_UUID,
                characteristics: vec![GattCharacteristic {
                    uuid: BATTERY_LEVEL_UUID,
                    properties: CharacteristicProperties::from_bits(CharacteristicProperties::READ),
                }],
            },
        ]
    }

    fn execute(&self, link: LinkId, request: Request, sink: &CompletionSink) -> Outcome {
        match request {
            Request::Connect => {
                if link.address != self.address {
                    return Outcome::reply(Err(ConnectionError::NotFound));
                }
                self.links().insert(
                    link,
                    LinkState {
                        sink: sink.clone(),
                        mtu: GATT_MIN_MTU,
                        notifying: false,
                    },
                );
                Outcome::done()
            }
            Request::Disconnect => Outcome::done(),
            Request::DiscoverServices => Outcome::reply(Ok(Response::Services(self.services()))),
            Request::RequestMtu { size } => {
                let mtu = size.min(SIMULATED_MAX_MTU);
                if let Some(state) = self.links().get_mut(&link) {
                    state.mtu = mtu;
                }
                Outcome::reply(Ok(Response::Mtu(mtu)))
            }
            Request::Read { characteristic } if characteristic == BATTERY_LEVEL_UUID => {
                Outcome::reply(Ok(Response::Value(vec![self.battery_level()])))
            }
            Request::Read { characteristic } => Outcome::reply(Err(ConnectionError::Gatt {
                status: format!("read not permitted on {}", characteristic),
            })),
            Request::SetNotifications {
                characteristic,
                mode,
            } => {
                if characteristic == self.config.telemetry_characteristic {
                    if let Some(state) = self.links().get_mut(&link) {
                        state.notifying = mode != NotificationMode::Disabled;
                    }
                }
                Outcome::done()
            }
            Request::Write {
                characteristic,
                payload,
                ..
            } => {
                let notifications = if characteristic == self.config.command_characteristic {
                    self.answer(link, &payload)
                } else {
                    Vec::new()
                };
                Outcome {
                    result: Ok(Response::Done),
                    notifications,
                }
            }
        }
    }

    /// Respond to a command frame with a response frame, chunked to the
    /// link's MTU. Nothing is sent while notifications are off.
    fn answer(&self, link: LinkId, command: &[u8]) -> Vec<Vec<u8>> {
        let payload = match protocol::decode(command) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Simulator ignoring malformed command: {}", e);
                return Vec::new();
            }
        };

        let response = match payload.first() {
            Some(&COMM_GET_VALUES) => self.values().to_payload(),
            Some(&COMM_GET_DECODED_BALANCE) => self.balance().to_payload(),
            other => {
                debug!("Simulator has no answer for command {:?}", other);
                return Vec::new();
            }
        };

        let chunk_len = {
            let links = self.links();
            match links.get(&link) {
                Some(state) if state.notifying => usize::from(state.mtu - 3),
                _ => return Vec::new(),
            }
        };

        match protocol::encode(response[0], &response[1..]) {
            Ok(frame) => frame
                .as_bytes()
                .chunks(chunk_len)
                .map(|chunk| chunk.to_vec())
                .collect(),
            Err(e) => {
                warn!("Simulator could not frame response: {}", e);
                Vec::new()
            }
        }
    }

    fn next_tick(&self) -> f32 {
        self.tick.fetch_add(1, Ordering::Relaxed) as f32
    }

    fn battery_level(&self) -> u8 {
        87
    }

    fn values(&self) -> ValuesRecord {
        let t = self.next_tick();
        let tachometer = (t * 120.0) as i32;
        ValuesRecord {
            temp_mosfet: 30.5 + (t * 0.1).sin(),
            temp_motor: 35.0 + (t * 0.05).sin() * 2.0,
            avg_motor_current: 12.4 + (t * 0.3).sin() * 4.0,
            avg_input_current: 8.1 + (t * 0.3).sin() * 2.5,
            duty_cycle_now: 0.42 + (t * 0.2).sin() * 0.1,
            rpm: 4200.0 + (t * 0.2).sin() * 300.0,
            input_voltage: 50.4 - t * 0.01,
            amp_hours: t * 0.0011,
            amp_hours_charged: t * 0.0002,
            watt_hours: t * 0.055,
            watt_hours_charged: t * 0.01,
            tachometer,
            tachometer_abs: tachometer,
            fault_code: Some(0),
            pid_pos: Some(0.0),
        }
    }

    fn balance(&self) -> BalanceRecord {
        let t = self.next_tick();
        let pitch = (t * 0.25).sin() * 1.5;
        BalanceRecord {
            pid_output: pitch * 8.0,
            pitch_angle: pitch,
            roll_angle: (t * 0.1).cos() * 2.0,
            motor_current: 12.4 + pitch,
            balance_current: 11.0 + pitch,
            setpoint: 0.0,
            torque_tilt_setpoint: 0.3,
            turn_tilt_setpoint: 0.0,
            nose_angling_setpoint: 0.0,
            true_pitch_angle: pitch + 0.1,
        }
    }
}

impl GattTransport for SimulatedPeripheral {
    fn start(&self, link: LinkId, id: OperationId, request: Request, sink: CompletionSink) {
        debug!("Simulator executing #{} on {}: {:?}", id, link.address, request);
        let Outcome {
            result,
            notifications,
        } = self.execute(link, request, &sink);

        let links = Arc::clone(&self.links);
        let latency = self.config.latency;
        let telemetry = self.config.telemetry_characteristic;
        self.runtime.spawn(async move {
            tokio::time::sleep(latency).await;
            let alive = |links: &Mutex<HashMap<LinkId, LinkState>>| {
                links
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains_key(&link)
            };

            // Failed connects never create a link; report those regardless.
            if result.is_ok() && !alive(&links) {
                return;
            }
            sink.complete(link, id, result);

            for chunk in notifications {
                if !alive(&links) {
                    break;
                }
                sink.notification(link, telemetry, &chunk);
            }
        });
    }

    fn release(&self, link: LinkId) {
        if self.links().remove(&link).is_some() {
            debug!("Simulator released {:?}", link);
        }
    }
}
