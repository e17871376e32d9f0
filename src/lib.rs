//! Floaty telemetry: BLE link and telemetry decoding for VESC-based
//! self-balancing boards.

pub mod domain;
pub mod infrastructure;
