//! Telemetry decoding.
//!
//! Turns telemetry notifications into typed records: chunks are
//! reassembled per peripheral, each frame is validated, and the payload is
//! decoded and published on a broadcast channel per record kind. Anything
//! that fails along the way is logged and dropped.

use crate::domain::models::DeviceAddress;
use crate::domain::telemetry::{BalanceRecord, TelemetryRecord, ValuesRecord};
use crate::infrastructure::bluetooth::listener::ConnectionEventListener;
use crate::infrastructure::bluetooth::protocol::{self, FrameAssembler};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Records buffered per subscriber before the slowest one starts lagging.
pub const CHANNEL_CAPACITY: usize = 64;

pub struct TelemetryDecoder {
    characteristic: Uuid,
    assemblers: Mutex<HashMap<DeviceAddress, FrameAssembler>>,
    values: broadcast::Sender<ValuesRecord>,
    balance: broadcast::Sender<BalanceRecord>,
    raw_logging: bool,
}

impl TelemetryDecoder {
    /// Decode notifications arriving on `characteristic`.
    pub fn new(characteristic: Uuid) -> Self {
        let (values, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (balance, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            characteristic,
            assemblers: Mutex::new(HashMap::new()),
            values,
            balance,
            raw_logging: false,
        }
    }

    /// Log every notification chunk in hex at debug level.
    pub fn with_raw_logging(mut self, enabled: bool) -> Self {
        self.raw_logging = enabled;
        self
    }

    pub fn subscribe_values(&self) -> broadcast::Receiver<ValuesRecord> {
        self.values.subscribe()
    }

    pub fn subscribe_balance(&self) -> broadcast::Receiver<BalanceRecord> {
        self.balance.subscribe()
    }

    /// Feed one notification chunk. Returns the records it completed, after
    /// publishing them.
    pub fn handle_notification(&self, address: DeviceAddress, chunk: &[u8]) -> Vec<TelemetryRecord> {
        if self.raw_logging {
            debug!("{} raw: {}", address, hex(chunk));
        }

        let candidates = {
            let mut assemblers = self
                .assemblers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            assemblers.entry(address).or_default().push(chunk)
        };

        let mut records = Vec::new();
        for candidate in candidates {
            let payload = match protocol::decode(&candidate) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Dropping frame from {}: {}", address, e);
                    continue;
                }
            };
            match TelemetryRecord::decode(payload) {
                Ok(record) => {
                    self.publish(&record);
                    records.push(record);
                }
                Err(e) => warn!("Dropping payload from {}: {}", address, e),
            }
        }
        records
    }

    fn publish(&self, record: &TelemetryRecord) {
        // A send error only means nobody is subscribed right now.
        let delivered = match record {
            TelemetryRecord::Values(values) => self.values.send(values.clone()).is_ok(),
            TelemetryRecord::Balance(balance) => self.balance.send(balance.clone()).is_ok(),
        };
        if !delivered {
            trace!("No subscribers for {:#04X} record", record.command_id());
        }
    }

    /// Forget any partial frame buffered for `address`.
    pub fn reset(&self, address: DeviceAddress) {
        self.assemblers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address);
    }

    /// Listener that feeds this decoder from the connection manager.
    pub fn listener(self: &Arc<Self>) -> ConnectionEventListener {
        let on_changed = Arc::clone(self);
        let on_disconnect = Arc::clone(self);
        let on_failed = Arc::clone(self);

        ConnectionEventListener::new()
            .on_characteristic_changed(move |address, characteristic, value| {
                if characteristic == on_changed.characteristic {
                    on_changed.handle_notification(address, value);
                }
                Ok(())
            })
            .on_disconnect(move |address| {
                on_disconnect.reset(address);
                Ok(())
            })
            .on_connection_failed(move |address, _| {
                on_failed.reset(address);
                Ok(())
            })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::telemetry::COMM_GET_VALUES;
    use crate::infrastructure::bluetooth::listener::{ConnectionEvent, EventListenerRegistry};
    use tokio::sync::broadcast::error::TryRecvError;

    const TELEMETRY: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

    fn address() -> DeviceAddress {
        DeviceAddress::new(0xAA_BB_CC_DD_EE_FF)
    }

    fn values_frame(temp_mosfet: f32) -> Vec<u8> {
        let record = ValuesRecord {
            temp_mosfet,
            ..Default::default()
        };
        let payload = record.to_payload();
        protocol::encode(payload[0], &payload[1..]).unwrap().into_bytes()
    }

    #[test]
    fn test_split_notifications_produce_one_record() {
        let decoder = TelemetryDecoder::new(TELEMETRY);
        let mut rx = decoder.subscribe_values();
        let frame = values_frame(30.5);

        // 20-byte chunks, as on a default-MTU link.
        let mut produced = Vec::new();
        for chunk in frame.chunks(20) {
            produced.extend(decoder.handle_notification(address(), chunk));
        }

        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].command_id(), COMM_GET_VALUES);
        assert_eq!(rx.try_recv().unwrap().temp_mosfet, 30.5);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_corrupt_frame_is_dropped() {
        let decoder = TelemetryDecoder::new(TELEMETRY);
        let mut rx = decoder.subscribe_values();
        let mut frame = values_frame(30.5);
        frame[10] ^= 0xFF;

        assert!(decoder.handle_notification(address(), &frame).is_empty());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        // The next good frame still decodes.
        assert_eq!(decoder.handle_notification(address(), &values_frame(20.0)).len(), 1);
    }

    #[test]
    fn test_bad_frame_costs_only_itself() {
        let decoder = TelemetryDecoder::new(TELEMETRY);
        let mut rx = decoder.subscribe_values();

        let mut bad = values_frame(1.0);
        bad[1] = 0xFF;
        assert!(decoder.handle_notification(address(), &bad).is_empty());
        for i in 0..4 {
            let produced = decoder.handle_notification(address(), &values_frame(i as f32));
            assert_eq!(produced.len(), 1, "frame {} after the corrupt one", i);
        }

        let mut stray = vec![0x02];
        stray.extend_from_slice(&values_frame(42.0));
        assert_eq!(decoder.handle_notification(address(), &stray).len(), 1);

        let temps: Vec<f32> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|v| v.temp_mosfet)
            .collect();
        assert_eq!(temps, vec![0.0, 1.0, 2.0, 3.0, 42.0]);
    }

    #[test]
    fn test_unknown_command_is_dropped() {
        let decoder = TelemetryDecoder::new(TELEMETRY);
        let frame = protocol::encode(0x7E, &[1, 2, 3]).unwrap();
        assert!(decoder.handle_notification(address(), frame.as_bytes()).is_empty());
    }

    #[test]
    fn test_balance_records_use_their_own_channel() {
        let decoder = TelemetryDecoder::new(TELEMETRY);
        let mut values = decoder.subscribe_values();
        let mut balance = decoder.subscribe_balance();

        let record = BalanceRecord {
            pitch_angle: 1.5,
            ..Default::default()
        };
        let payload = record.to_payload();
        let frame = protocol::encode(payload[0], &payload[1..]).unwrap();
        decoder.handle_notification(address(), frame.as_bytes());

        assert_eq!(balance.try_recv().unwrap(), record);
        assert_eq!(values.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_listener_filters_characteristic_and_resets() {
        let decoder = Arc::new(TelemetryDecoder::new(TELEMETRY));
        let mut rx = decoder.subscribe_values();
        let registry = EventListenerRegistry::new();
        registry.register(Arc::new(decoder.listener()));

        let frame = values_frame(12.5);
        registry.dispatch(&ConnectionEvent::CharacteristicChanged {
            address: address(),
            characteristic: Uuid::from_u128(0x2a19),
            value: &frame,
        });
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        // Half a frame, then the link drops: the remainder must not join it.
        registry.dispatch(&ConnectionEvent::CharacteristicChanged {
            address: address(),
            characteristic: TELEMETRY,
            value: &frame[..30],
        });
        registry.dispatch(&ConnectionEvent::Disconnect { address: address() });
        registry.dispatch(&ConnectionEvent::CharacteristicChanged {
            address: address(),
            characteristic: TELEMETRY,
            value: &frame[30..],
        });
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        registry.dispatch(&ConnectionEvent::CharacteristicChanged {
            address: address(),
            characteristic: TELEMETRY,
            value: &frame,
        });
        assert_eq!(rx.try_recv().unwrap().temp_mosfet, 12.5);
    }
}
