//! Bluetooth Module
//!
//! BLE link to a VESC board and decoding of its telemetry.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    TelemetryService                       │
//! │  (coordinator - public API for the application)           │
//! └───────┬──────────────────┬───────────────────┬───────────┘
//!         │                  │                   │
//!         ▼                  ▼                   ▼
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────────┐
//! │ PollScheduler│──►│ Connection   │──►│ EventListener   │
//! │              │   │ Manager      │   │ Registry        │
//! │ - periodic   │   │ - state per  │   │ - hook fan-out  │
//! │   commands   │   │   peripheral │   │        │        │
//! └──────────────┘   │ - op queue   │   │        ▼        │
//!                    └──────┬───────┘   │ TelemetryDecoder│
//!                           │           └─────────────────┘
//!                           ▼
//!                  GattTransport (WinRT / simulator)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - frame codec and CRC16
//! - [`gatt`] - GATT types and the transport trait
//! - [`queue`] - per-connection operation queue
//! - [`connection`] - connection manager and completion sink
//! - [`listener`] - connection event hooks and their registry
//! - [`poller`] - periodic command polling
//! - [`telemetry`] - notification reassembly and record publishing
//! - [`simulator`] - in-process simulated board
//! - `winrt` - Windows transport (Windows only)
//! - [`service`] - main service coordinator

pub mod connection;
pub mod error;
pub mod gatt;
pub mod listener;
pub mod poller;
pub mod protocol;
pub mod queue;
pub mod service;
pub mod simulator;
pub mod telemetry;
#[cfg(windows)]
pub mod winrt;

pub use connection::{CompletionSink, ConnectionManager, ManagerConfig};
pub use error::{ConnectionError, OperationError};
pub use service::{TelemetryConfig, TelemetryService};
