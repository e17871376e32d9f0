//! Telemetry Records
//!
//! Typed records decoded from the payload of a validated response frame.
//! The first payload byte echoes the command that produced the response
//! and selects the record layout. All multi-byte fields are big-endian.

use serde::Serialize;

/// `COMM_GET_VALUES`: motor and battery electricals.
pub const COMM_GET_VALUES: u8 = 0x04;

/// `COMM_GET_DECODED_BALANCE`: balance controller state.
pub const COMM_GET_DECODED_BALANCE: u8 = 0x4F;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("empty payload")]
    Empty,

    #[error("unknown command id {0:#04X}")]
    UnknownCommand(u8),

    #[error("{kind} payload truncated ({actual} bytes, need {needed})")]
    Truncated {
        kind: &'static str,
        needed: usize,
        actual: usize,
    },
}

/// Motor/battery telemetry returned for [`COMM_GET_VALUES`].
///
/// # Payload layout
///
/// ```text
/// [0]     : command echo (0x04)
/// [1-2]   : MOSFET temperature   (i16, /10, °C)
/// [3-4]   : motor temperature    (i16, /10, °C)
/// [5-8]   : avg motor current    (i32, /100, A)
/// [9-12]  : avg input current    (i32, /100, A)
/// [13-20] : d/q axis currents    (not decoded)
/// [21-22] : duty cycle           (i16, /1000)
/// [23-26] : electrical RPM       (i32)
/// [27-28] : input voltage        (i16, /10, V)
/// [29-32] : amp hours            (i32, /10000, Ah)
/// [33-36] : amp hours charged    (i32, /10000, Ah)
/// [37-40] : watt hours           (i32, /10000, Wh)
/// [41-44] : watt hours charged   (i32, /10000, Wh)
/// [45-48] : tachometer           (i32)
/// [49-52] : tachometer absolute  (i32)
/// [53]    : fault code           (u8, optional)
/// [54-57] : PID position         (i32, /1000000, optional)
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValuesRecord {
    pub temp_mosfet: f32,
    pub temp_motor: f32,
    pub avg_motor_current: f32,
    pub avg_input_current: f32,
    pub duty_cycle_now: f32,
    pub rpm: f32,
    pub input_voltage: f32,
    pub amp_hours: f32,
    pub amp_hours_charged: f32,
    pub watt_hours: f32,
    pub watt_hours_charged: f32,
    pub tachometer: i32,
    pub tachometer_abs: i32,
    pub fault_code: Option<u8>,
    pub pid_pos: Option<f32>,
}

impl ValuesRecord {
    /// Bytes required for the mandatory fields.
    pub const MIN_LEN: usize = 53;
    /// Bytes required for the optional fault code and PID position.
    pub const EXTENDED_LEN: usize = 58;

    fn decode(payload: &[u8]) -> Result<Self, RecordError> {
        let p = Fields::new("values", payload, Self::MIN_LEN)?;

        let (fault_code, pid_pos) = if payload.len() >= Self::EXTENDED_LEN {
            (Some(payload[53]), Some(p.i32(54) as f32 / 1_000_000.0))
        } else {
            (None, None)
        };

        Ok(Self {
            temp_mosfet: p.i16(1) as f32 / 10.0,
            temp_motor: p.i16(3) as f32 / 10.0,
            avg_motor_current: p.i32(5) as f32 / 100.0,
            avg_input_current: p.i32(9) as f32 / 100.0,
            duty_cycle_now: p.i16(21) as f32 / 1000.0,
            rpm: p.i32(23) as f32,
            input_voltage: p.i16(27) as f32 / 10.0,
            amp_hours: p.i32(29) as f32 / 10000.0,
            amp_hours_charged: p.i32(33) as f32 / 10000.0,
            watt_hours: p.i32(37) as f32 / 10000.0,
            watt_hours_charged: p.i32(41) as f32 / 10000.0,
            tachometer: p.i32(45),
            tachometer_abs: p.i32(49),
            fault_code,
            pid_pos,
        })
    }

    /// Serialize into the response payload layout, command echo included.
    /// The extended fields are written only when both are present.
    pub fn to_payload(&self) -> Vec<u8> {
        let extended = self.fault_code.zip(self.pid_pos);
        let len = if extended.is_some() {
            Self::EXTENDED_LEN
        } else {
            Self::MIN_LEN
        };

        let mut w = FieldWriter::new(COMM_GET_VALUES, len);
        w.i16(1, self.temp_mosfet * 10.0);
        w.i16(3, self.temp_motor * 10.0);
        w.i32(5, self.avg_motor_current * 100.0);
        w.i32(9, self.avg_input_current * 100.0);
        w.i16(21, self.duty_cycle_now * 1000.0);
        w.i32(23, self.rpm);
        w.i16(27, self.input_voltage * 10.0);
        w.i32(29, self.amp_hours * 10000.0);
        w.i32(33, self.amp_hours_charged * 10000.0);
        w.i32(37, self.watt_hours * 10000.0);
        w.i32(41, self.watt_hours_charged * 10000.0);
        w.put(45, &self.tachometer.to_be_bytes());
        w.put(49, &self.tachometer_abs.to_be_bytes());
        if let Some((fault, pid_pos)) = extended {
            w.put(53, &[fault]);
            w.i32(54, pid_pos * 1_000_000.0);
        }
        w.bytes
    }
}

/// Balance controller state returned for [`COMM_GET_DECODED_BALANCE`].
///
/// Every field is an unscaled IEEE-754 `f32` at a fixed offset:
/// PID output (1), pitch (5), roll (9), motor current (13), balance
/// current (17), setpoint (21), torque tilt (25), turn tilt (29),
/// nose angling (33), true pitch (37).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BalanceRecord {
    pub pid_output: f32,
    pub pitch_angle: f32,
    pub roll_angle: f32,
    pub motor_current: f32,
    pub balance_current: f32,
    pub setpoint: f32,
    pub torque_tilt_setpoint: f32,
    pub turn_tilt_setpoint: f32,
    pub nose_angling_setpoint: f32,
    pub true_pitch_angle: f32,
}

impl BalanceRecord {
    pub const MIN_LEN: usize = 41;

    fn decode(payload: &[u8]) -> Result<Self, RecordError> {
        let p = Fields::new("balance", payload, Self::MIN_LEN)?;
        Ok(Self {
            pid_output: p.f32(1),
            pitch_angle: p.f32(5),
            roll_angle: p.f32(9),
            motor_current: p.f32(13),
            balance_current: p.f32(17),
            setpoint: p.f32(21),
            torque_tilt_setpoint: p.f32(25),
            turn_tilt_setpoint: p.f32(29),
            nose_angling_setpoint: p.f32(33),
            true_pitch_angle: p.f32(37),
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut w = FieldWriter::new(COMM_GET_DECODED_BALANCE, Self::MIN_LEN);
        let fields = [
            self.pid_output,
            self.pitch_angle,
            self.roll_angle,
            self.motor_current,
            self.balance_current,
            self.setpoint,
            self.torque_tilt_setpoint,
            self.turn_tilt_setpoint,
            self.nose_angling_setpoint,
            self.true_pitch_angle,
        ];
        for (i, value) in fields.iter().enumerate() {
            w.put(1 + i * 4, &value.to_be_bytes());
        }
        w.bytes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Values(ValuesRecord),
    Balance(BalanceRecord),
}

impl TelemetryRecord {
    /// Decode a validated frame payload.
    ///
    /// Fails closed: a payload shorter than the layout produces no record.
    pub fn decode(payload: &[u8]) -> Result<Self, RecordError> {
        match payload.first() {
            None => Err(RecordError::Empty),
            Some(&COMM_GET_VALUES) => ValuesRecord::decode(payload).map(Self::Values),
            Some(&COMM_GET_DECODED_BALANCE) => BalanceRecord::decode(payload).map(Self::Balance),
            Some(&other) => Err(RecordError::UnknownCommand(other)),
        }
    }

    pub fn command_id(&self) -> u8 {
        match self {
            Self::Values(_) => COMM_GET_VALUES,
            Self::Balance(_) => COMM_GET_DECODED_BALANCE,
        }
    }
}

/// Bounds-checked big-endian field reader. Construction verifies the
/// payload covers the layout, so the accessors index without checks.
struct Fields<'a> {
    bytes: &'a [u8],
}

impl<'a> Fields<'a> {
    fn new(kind: &'static str, bytes: &'a [u8], needed: usize) -> Result<Self, RecordError> {
        if bytes.len() < needed {
            return Err(RecordError::Truncated {
                kind,
                needed,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    fn i16(&self, at: usize) -> i16 {
        i16::from_be_bytes([self.bytes[at], self.bytes[at + 1]])
    }

    fn i32(&self, at: usize) -> i32 {
        i32::from_be_bytes(self.word(at))
    }

    fn f32(&self, at: usize) -> f32 {
        f32::from_be_bytes(self.word(at))
    }

    fn word(&self, at: usize) -> [u8; 4] {
        [
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ]
    }
}

/// Writes scaled fields into a zeroed payload. Scaled values are rounded
/// to the nearest integer and saturate at the field width.
struct FieldWriter {
    bytes: Vec<u8>,
}

impl FieldWriter {
    fn new(command_id: u8, len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        bytes[0] = command_id;
        Self { bytes }
    }

    fn put(&mut self, at: usize, field: &[u8]) {
        self.bytes[at..at + field.len()].copy_from_slice(field);
    }

    fn i16(&mut self, at: usize, scaled: f32) {
        self.put(at, &(scaled.round() as i16).to_be_bytes());
    }

    fn i32(&mut self, at: usize, scaled: f32) {
        self.put(at, &(scaled.round() as i32).to_be_bytes());
    }
}
