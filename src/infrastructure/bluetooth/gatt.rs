//! GATT Types
//!
//! The vocabulary shared by the connection manager and the radio
//! transports: discovered services, queued operations, the requests a
//! transport executes and the responses it reports back.

use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::connection::CompletionSink;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Smallest ATT MTU every link supports.
pub const GATT_MIN_MTU: u16 = 23;
/// Largest ATT MTU a peer may negotiate.
pub const GATT_MAX_MTU: u16 = 517;

/// Characteristic property bits as advertised in the characteristic
/// declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_readable(&self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn is_writable_without_response(&self) -> bool {
        self.0 & Self::WRITE_WITHOUT_RESPONSE != 0
    }

    pub fn is_notifiable(&self) -> bool {
        self.0 & Self::NOTIFY != 0
    }

    pub fn is_indicatable(&self) -> bool {
        self.0 & Self::INDICATE != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Look a characteristic up across every discovered service.
pub fn find_characteristic(services: &[GattService], uuid: Uuid) -> Option<&GattCharacteristic> {
    services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.uuid == uuid)
}

/// One radio operation as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Disconnect,
    DiscoverServices,
    ReadCharacteristic { id: Uuid },
    WriteCharacteristic { id: Uuid, payload: Vec<u8> },
    EnableNotifications { id: Uuid },
    DisableNotifications { id: Uuid },
    RequestMtu { size: u16 },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::DiscoverServices => "discover services",
            Self::ReadCharacteristic { .. } => "read",
            Self::WriteCharacteristic { .. } => "write",
            Self::EnableNotifications { .. } => "enable notifications",
            Self::DisableNotifications { .. } => "disable notifications",
            Self::RequestMtu { .. } => "request MTU",
        }
    }

    pub fn characteristic(&self) -> Option<Uuid> {
        match self {
            Self::ReadCharacteristic { id }
            | Self::WriteCharacteristic { id, .. }
            | Self::EnableNotifications { id }
            | Self::DisableNotifications { id } => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Value written to the client characteristic configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    Notify,
    Indicate,
    Disabled,
}

/// A validated operation, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect,
    Disconnect,
    DiscoverServices,
    Read {
        characteristic: Uuid,
    },
    Write {
        characteristic: Uuid,
        payload: Vec<u8>,
        write_type: WriteType,
    },
    SetNotifications {
        characteristic: Uuid,
        mode: NotificationMode,
    },
    RequestMtu {
        size: u16,
    },
}

/// Successful outcome reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Done,
    Services(Vec<GattService>),
    Value(Vec<u8>),
    Mtu(u16),
}

/// Identity of one connection attempt. The session number distinguishes
/// successive connections to the same address, so completions that
/// outlive their connection are recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId {
    pub address: DeviceAddress,
    pub session: u64,
}

pub type OperationId = u64;

/// A radio stack the connection manager drives.
///
/// `start` must not block: the transport begins the request and reports
/// the outcome through `sink`, on whatever thread it likes (possibly
/// before `start` returns), echoing `link` and `id`. Only one request per
/// link is outstanding at a time.
pub trait GattTransport: Send + Sync {
    fn start(&self, link: LinkId, id: OperationId, request: Request, sink: CompletionSink);

    /// Drop every resource held for `link`. No further events may be
    /// reported for it.
    fn release(&self, link: LinkId);
}

/// Per-link resources of a transport whose connect completes later.
///
/// A link released while its connect is still running must not be
/// inserted afterwards: [`finish`](Self::finish) hands the fresh resources
/// back so the caller can close them.
#[derive(Debug)]
pub struct LinkTable<T> {
    open: HashMap<LinkId, T>,
    connecting: HashSet<LinkId>,
}

impl<T> Default for LinkTable<T> {
    fn default() -> Self {
        Self {
            open: HashMap::new(),
            connecting: HashSet::new(),
        }
    }
}

impl<T> LinkTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, link: LinkId) {
        self.connecting.insert(link);
    }

    /// Store the resources of a finished connect. `Err` gives them back
    /// when the link was released in the meantime.
    pub fn finish(&mut self, link: LinkId, resources: T) -> Result<(), T> {
        if self.connecting.remove(&link) {
            self.open.insert(link, resources);
            Ok(())
        } else {
            Err(resources)
        }
    }

    /// The connect failed; nothing will be stored.
    pub fn abandon(&mut self, link: LinkId) {
        self.connecting.remove(&link);
    }

    /// Forget `link`, cancelling a connect in progress. Returns the open
    /// resources for the caller to close.
    pub fn release(&mut self, link: LinkId) -> Option<T> {
        self.connecting.remove(&link);
        self.open.remove(&link)
    }

    pub fn get(&self, link: LinkId) -> Option<&T> {
        self.open.get(&link)
    }

    pub fn get_mut(&mut self, link: LinkId) -> Option<&mut T> {
        self.open.get_mut(&link)
    }
}
