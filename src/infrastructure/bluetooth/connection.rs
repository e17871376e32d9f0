//! BLE Connection Manager
//!
//! Owns one state machine per peripheral and serializes the radio
//! operations submitted against it.
//!
//! ```text
//!  connect()            Connect ok + services discovered
//! ──────────► Connecting ───────────────────────────────► Ready
//!                 │                                         │
//!                 │ connect failed / link lost              │ teardown / link lost /
//!                 ▼                                         ▼ Disconnect completed
//!            (removed, on_connection_failed)        TearingDown → (removed, on_disconnect)
//! ```
//!
//! Every public operation returns immediately. Results come back through
//! the [`EventListenerRegistry`] and, for [`ConnectionManager::submit`],
//! through the returned continuation. Per-connection state sits behind
//! its own mutex; the radio reports completions on its own thread through
//! a [`CompletionSink`]. No lock is held while the transport or a listener
//! runs. The next operation only starts once the previous one's
//! continuation and event have been delivered, so outcomes reach
//! everyone in submission order.

use crate::domain::models::{ConnectionStatus, DeviceAddress};
use crate::infrastructure::bluetooth::error::{ConnectionError, OperationError};
use crate::infrastructure::bluetooth::gatt::{
    find_characteristic, GattService, GattTransport, LinkId, NotificationMode, Operation,
    OperationId, Request, Response, WriteType, GATT_MAX_MTU, GATT_MIN_MTU,
};
use crate::infrastructure::bluetooth::listener::{ConnectionEvent, EventListenerRegistry};
use crate::infrastructure::bluetooth::queue::{OperationQueue, OperationResult, QueuedOperation};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Fail an in-flight operation that has not completed after this long.
    /// `None` waits forever.
    pub operation_timeout: Option<Duration>,
}

/// Connection lifecycle. Services and MTU only exist once the link is
/// ready; a disconnected peripheral has no entry at all.
enum LinkPhase {
    Connecting,
    Ready(ReadyLink),
    TearingDown,
}

struct ReadyLink {
    services: Vec<GattService>,
    mtu: u16,
}

struct ConnectionState {
    phase: LinkPhase,
    queue: OperationQueue,
}

struct PeripheralConnection {
    link: LinkId,
    state: Mutex<ConnectionState>,
}

impl PeripheralConnection {
    fn new(link: LinkId) -> Self {
        Self {
            link,
            state: Mutex::new(ConnectionState {
                phase: LinkPhase::Connecting,
                queue: OperationQueue::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Why a connection is being removed.
enum Termination {
    Requested,
    ConnectFailed(ConnectionError),
    LinkLost,
}

/// Event to publish once the connection lock is released.
enum Notice {
    SetupComplete(Vec<GattService>),
    MtuChanged(u16),
    Read(Uuid, Vec<u8>),
    Write(Uuid),
    NotificationsEnabled(Uuid),
    NotificationsDisabled(Uuid),
}

impl Notice {
    fn dispatch(&self, address: DeviceAddress, listeners: &EventListenerRegistry) {
        let event = match self {
            Self::SetupComplete(services) => ConnectionEvent::SetupComplete { address, services },
            Self::MtuChanged(mtu) => ConnectionEvent::MtuChanged { address, mtu: *mtu },
            Self::Read(characteristic, value) => ConnectionEvent::CharacteristicRead {
                address,
                characteristic: *characteristic,
                value,
            },
            Self::Write(characteristic) => ConnectionEvent::CharacteristicWrite {
                address,
                characteristic: *characteristic,
            },
            Self::NotificationsEnabled(characteristic) => ConnectionEvent::NotificationsEnabled {
                address,
                characteristic: *characteristic,
            },
            Self::NotificationsDisabled(characteristic) => {
                ConnectionEvent::NotificationsDisabled {
                    address,
                    characteristic: *characteristic,
                }
            }
        };
        listeners.dispatch(&event);
    }
}

struct Shared {
    transport: Arc<dyn GattTransport>,
    listeners: Arc<EventListenerRegistry>,
    connections: RwLock<HashMap<DeviceAddress, Arc<PeripheralConnection>>>,
    next_session: AtomicU64,
    next_operation: AtomicU64,
    config: ManagerConfig,
    runtime: Option<tokio::runtime::Handle>,
}

/// Handle a transport uses to report back to the manager.
///
/// Cheap to clone and safe to use from any thread. Holds only a weak
/// reference, so reports after the manager is dropped are ignored.
#[derive(Clone)]
pub struct CompletionSink {
    shared: Weak<Shared>,
}

impl CompletionSink {
    /// The request `id` on `link` finished.
    pub fn complete(&self, link: LinkId, id: OperationId, result: Result<Response, ConnectionError>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_complete(link, id, result.map_err(OperationError::from));
        }
    }

    /// The peripheral pushed a new value for `characteristic`.
    pub fn notification(&self, link: LinkId, characteristic: Uuid, value: &[u8]) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_notification(link, characteristic, value);
        }
    }

    /// The link dropped without being asked to.
    pub fn link_lost(&self, link: LinkId) {
        if let Some(shared) = self.shared.upgrade() {
            info!("Link to {} lost", link.address);
            shared.terminate(link, Termination::LinkLost);
        }
    }

    fn timed_out(&self, link: LinkId, id: OperationId) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_complete(link, id, Err(OperationError::TimedOut));
        }
    }
}

impl std::fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSink")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

/// Connection manager. Clones share the same connections.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn GattTransport>, listeners: Arc<EventListenerRegistry>) -> Self {
        Self::with_config(transport, listeners, ManagerConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn GattTransport>,
        listeners: Arc<EventListenerRegistry>,
        config: ManagerConfig,
    ) -> Self {
        let runtime = tokio::runtime::Handle::try_current().ok();
        if config.operation_timeout.is_some() && runtime.is_none() {
            warn!("Operation timeout configured outside a Tokio runtime; timeouts disabled");
        }

        Self {
            shared: Arc::new(Shared {
                transport,
                listeners,
                connections: RwLock::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                next_operation: AtomicU64::new(1),
                config,
                runtime,
            }),
        }
    }

    pub fn listeners(&self) -> &Arc<EventListenerRegistry> {
        &self.shared.listeners
    }

    /// Start connecting to `address`. Ignored (with a warning) if a
    /// connection to it already exists.
    pub fn connect(&self, address: DeviceAddress) {
        self.shared.connect(address, None);
    }

    /// Drop the connection now. Queued and in-flight operations fail with
    /// [`OperationError::LinkLost`] and `on_disconnect` fires once. Calling
    /// it again, or for an unknown address, does nothing.
    pub fn teardown_connection(&self, address: DeviceAddress) {
        match self.shared.lookup(address) {
            Some(conn) => {
                self.shared.terminate(conn.link, Termination::Requested);
            }
            None => debug!("Teardown of {}: not connected", address),
        }
    }

    pub fn teardown_all(&self) {
        for address in self.connected_devices() {
            self.teardown_connection(address);
        }
    }

    /// Disconnect once everything queued before this call has run.
    pub fn disconnect(&self, address: DeviceAddress) {
        self.enqueue(address, Operation::Disconnect, None);
    }

    /// Negotiate the ATT MTU. `size` is clamped to 23..=517.
    pub fn request_mtu(&self, address: DeviceAddress, size: u16) {
        self.enqueue(address, Operation::RequestMtu { size }, None);
    }

    pub fn read_characteristic(&self, address: DeviceAddress, characteristic: Uuid) {
        self.enqueue(address, Operation::ReadCharacteristic { id: characteristic }, None);
    }

    pub fn write_characteristic(
        &self,
        address: DeviceAddress,
        characteristic: Uuid,
        payload: impl Into<Vec<u8>>,
    ) {
        let operation = Operation::WriteCharacteristic {
            id: characteristic,
            payload: payload.into(),
        };
        self.enqueue(address, operation, None);
    }

    pub fn enable_notifications(&self, address: DeviceAddress, characteristic: Uuid) {
        self.enqueue(address, Operation::EnableNotifications { id: characteristic }, None);
    }

    pub fn disable_notifications(&self, address: DeviceAddress, characteristic: Uuid) {
        self.enqueue(address, Operation::DisableNotifications { id: characteristic }, None);
    }

    /// Queue any operation and get its outcome through a continuation.
    ///
    /// Never blocks; the receiver resolves when the operation completes,
    /// fails validation, or is discarded by a teardown.
    pub fn submit(
        &self,
        address: DeviceAddress,
        operation: Operation,
    ) -> oneshot::Receiver<OperationResult> {
        let (tx, rx) = oneshot::channel();
        if operation == Operation::Connect {
            self.shared.connect(address, Some(tx));
        } else {
            self.enqueue(address, operation, Some(tx));
        }
        rx
    }

    /// Discovered services, or empty before discovery has completed.
    pub fn services_on_device(&self, address: DeviceAddress) -> Vec<GattService> {
        let Some(conn) = self.shared.lookup(address) else {
            return Vec::new();
        };
        let state = conn.lock();
        match &state.phase {
            LinkPhase::Ready(ready) => ready.services.clone(),
            _ => Vec::new(),
        }
    }

    pub fn is_connected(&self, address: DeviceAddress) -> bool {
        self.status(address) == ConnectionStatus::Connected
    }

    pub fn status(&self, address: DeviceAddress) -> ConnectionStatus {
        let Some(conn) = self.shared.lookup(address) else {
            return ConnectionStatus::Disconnected;
        };
        let state = conn.lock();
        match state.phase {
            LinkPhase::Connecting => ConnectionStatus::Connecting,
            LinkPhase::Ready(_) => ConnectionStatus::Connected,
            LinkPhase::TearingDown => ConnectionStatus::Disconnected,
        }
    }

    /// Negotiated MTU of a ready connection.
    pub fn mtu(&self, address: DeviceAddress) -> Option<u16> {
        let conn = self.shared.lookup(address)?;
        let state = conn.lock();
        match &state.phase {
            LinkPhase::Ready(ready) => Some(ready.mtu),
            _ => None,
        }
    }

    pub fn connected_devices(&self) -> Vec<DeviceAddress> {
        self.shared
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    fn enqueue(
        &self,
        address: DeviceAddress,
        operation: Operation,
        continuation: Option<oneshot::Sender<OperationResult>>,
    ) {
        let id = self.shared.next_operation_id();
        let queued = QueuedOperation::new(id, clamp(operation), continuation);

        let Some(conn) = self.shared.lookup(address) else {
            error!(
                "Not connected to {}, cannot perform {}",
                address,
                queued.operation.name()
            );
            queued.finish(Err(OperationError::NotConnected));
            return;
        };

        debug!("Queueing {} #{} for {}", queued.operation.name(), id, address);
        conn.lock().queue.push(queued);
        self.shared.pump(&conn);
    }
}

fn clamp(operation: Operation) -> Operation {
    match operation {
        Operation::RequestMtu { size } => Operation::RequestMtu {
            size: size.clamp(GATT_MIN_MTU, GATT_MAX_MTU),
        },
        other => other,
    }
}

/// Turn a queued operation into a transport request, given the current
/// phase of its connection.
fn validate(phase: &LinkPhase, operation: &Operation) -> Result<Request, OperationError> {
    let ready = match (phase, operation) {
        (LinkPhase::TearingDown, _) => return Err(OperationError::LinkLost),
        (LinkPhase::Connecting, Operation::Connect) => return Ok(Request::Connect),
        (_, Operation::Connect) => return Err(OperationError::AlreadyConnected),
        (_, Operation::DiscoverServices) => return Ok(Request::DiscoverServices),
        (_, Operation::Disconnect) => return Ok(Request::Disconnect),
        (LinkPhase::Connecting, _) => return Err(OperationError::NotConnected),
        (LinkPhase::Ready(ready), _) => ready,
    };

    if let Operation::RequestMtu { size } = operation {
        return Ok(Request::RequestMtu { size: *size });
    }

    let Some(id) = operation.characteristic() else {
        return Err(OperationError::NotConnected);
    };
    let characteristic =
        find_characteristic(&ready.services, id).ok_or(OperationError::UnknownCharacteristic(id))?;
    let props = characteristic.properties;
    let unsupported = || OperationError::Unsupported {
        characteristic: id,
        operation: operation.name(),
    };

    match operation {
        Operation::ReadCharacteristic { .. } if props.is_readable() => Ok(Request::Read {
            characteristic: id,
        }),
        Operation::WriteCharacteristic { payload, .. } => {
            let write_type = if props.is_writable() {
                WriteType::WithResponse
            } else if props.is_writable_without_response() {
                WriteType::WithoutResponse
            } else {
                return Err(unsupported());
            };
            Ok(Request::Write {
                characteristic: id,
                payload: payload.clone(),
                write_type,
            })
        }
        Operation::EnableNotifications { .. } => {
            let mode = if props.is_notifiable() {
                NotificationMode::Notify
            } else if props.is_indicatable() {
                NotificationMode::Indicate
            } else {
                return Err(unsupported());
            };
            Ok(Request::SetNotifications {
                characteristic: id,
                mode,
            })
        }
        Operation::DisableNotifications { .. }
            if props.is_notifiable() || props.is_indicatable() =>
        {
            Ok(Request::SetNotifications {
                characteristic: id,
                mode: NotificationMode::Disabled,
            })
        }
        _ => Err(unsupported()),
    }
}

impl Shared {
    fn sink(self: &Arc<Self>) -> CompletionSink {
        CompletionSink {
            shared: Arc::downgrade(self),
        }
    }

    fn next_operation_id(&self) -> OperationId {
        self.next_operation.fetch_add(1, Ordering::Relaxed)
    }

    fn lookup(&self, address: DeviceAddress) -> Option<Arc<PeripheralConnection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .cloned()
    }

    /// The connection `link` refers to, if it is still the live one.
    fn lookup_link(&self, link: LinkId) -> Option<Arc<PeripheralConnection>> {
        self.lookup(link.address).filter(|conn| conn.link == link)
    }

    fn connect(
        self: &Arc<Self>,
        address: DeviceAddress,
        continuation: Option<oneshot::Sender<OperationResult>>,
    ) {
        let conn = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if connections.contains_key(&address) {
                warn!("Already connected or connecting to {}", address);
                drop(connections);
                if let Some(tx) = continuation {
                    let _ = tx.send(Err(OperationError::AlreadyConnected));
                }
                return;
            }

            let link = LinkId {
                address,
                session: self.next_session.fetch_add(1, Ordering::Relaxed),
            };
            let conn = Arc::new(PeripheralConnection::new(link));
            {
                let mut state = conn.lock();
                state.queue.push(QueuedOperation::new(
                    self.next_operation_id(),
                    Operation::Connect,
                    continuation,
                ));
                state.queue.push(QueuedOperation::new(
                    self.next_operation_id(),
                    Operation::DiscoverServices,
                    None,
                ));
            }
            connections.insert(address, conn.clone());
            conn
        };

        info!("Connecting to {}", address);
        self.pump(&conn);
    }

    /// Put the next valid operation in flight if the connection is idle.
    fn pump(self: &Arc<Self>, conn: &Arc<PeripheralConnection>) {
        let start = {
            let mut state = conn.lock();
            let ConnectionState { phase, queue } = &mut *state;
            let advance = queue.advance(|op| validate(phase, op));

            // Failed under the lock so nothing queued behind them can
            // report first. A oneshot send never blocks.
            for (op, e) in advance.rejected {
                warn!(
                    "Rejected {} #{} for {}: {}",
                    op.operation.name(),
                    op.id,
                    conn.link.address,
                    e
                );
                op.finish(Err(e));
            }
            advance.start
        };

        if let Some((id, request)) = start {
            debug!("Starting #{} on {}: {:?}", id, conn.link.address, request);
            self.arm_timeout(conn.link, id);
            self.transport.start(conn.link, id, request, self.sink());
        }
    }

    fn arm_timeout(self: &Arc<Self>, link: LinkId, id: OperationId) {
        let (Some(timeout), Some(runtime)) = (self.config.operation_timeout, &self.runtime) else {
            return;
        };
        let sink = self.sink();
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            sink.timed_out(link, id);
        });
    }

    fn on_complete(
        self: &Arc<Self>,
        link: LinkId,
        id: OperationId,
        result: Result<Response, OperationError>,
    ) {
        let Some(conn) = self.lookup_link(link) else {
            debug!("Dropping completion #{} for stale link {:?}", id, link);
            return;
        };

        let mut state = conn.lock();
        let Some(op) = state.queue.complete(id) else {
            debug!("Completion #{} on {} is not in flight", id, link.address);
            return;
        };
        let connecting = matches!(state.phase, LinkPhase::Connecting);
        let setup = matches!(
            op.operation,
            Operation::Connect | Operation::DiscoverServices
        );

        if op.operation == Operation::Disconnect {
            drop(state);
            info!("Disconnected from {}", link.address);
            op.finish(result);
            self.terminate(link, Termination::Requested);
            return;
        }

        let response = match result {
            Ok(response) => response,
            Err(e) if connecting && setup => {
                drop(state);
                let cause = match &e {
                    OperationError::Failed(cause) => cause.clone(),
                    other => ConnectionError::Transport(other.to_string()),
                };
                error!("Connection to {} failed: {}", link.address, cause);
                op.finish(Err(e));
                self.terminate(link, Termination::ConnectFailed(cause));
                return;
            }
            Err(e) => {
                drop(state);
                self.fail(&conn, op, e);
                return;
            }
        };

        if op.operation == Operation::Connect {
            drop(state);
            info!("Link to {} established, discovering services", link.address);
            op.finish(Ok(Response::Done));
            self.resume(&conn);
            return;
        }

        match apply(&mut state.phase, &op.operation, response) {
            Ok((response, notice)) => {
                drop(state);
                debug!("{} #{} on {} complete", op.operation.name(), id, link.address);
                op.finish(Ok(response));
                if let Some(notice) = notice {
                    notice.dispatch(link.address, &self.listeners);
                }
                self.resume(&conn);
            }
            Err(e) => {
                drop(state);
                self.fail(&conn, op, e);
            }
        }
    }

    /// Fail one operation and move on to the next.
    fn fail(self: &Arc<Self>, conn: &Arc<PeripheralConnection>, op: QueuedOperation, e: OperationError) {
        error!(
            "{} #{} on {} failed: {}",
            op.operation.name(),
            op.id,
            conn.link.address,
            e
        );
        op.finish(Err(e));
        self.resume(conn);
    }

    /// The completed operation has been reported; let the next one go.
    fn resume(self: &Arc<Self>, conn: &Arc<PeripheralConnection>) {
        conn.lock().queue.settled();
        self.pump(conn);
    }

    fn on_notification(&self, link: LinkId, characteristic: Uuid, value: &[u8]) {
        if self.lookup_link(link).is_none() {
            debug!("Dropping notification for stale link {:?}", link);
            return;
        }
        self.listeners.dispatch(&ConnectionEvent::CharacteristicChanged {
            address: link.address,
            characteristic,
            value,
        });
    }

    /// Remove the connection for `link`, fail everything queued on it and
    /// tell the listeners. Returns false if it was already gone.
    fn terminate(&self, link: LinkId, reason: Termination) -> bool {
        let conn = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let live = connections
                .get(&link.address)
                .is_some_and(|conn| conn.link == link);
            if live {
                connections.remove(&link.address)
            } else {
                None
            }
        };
        let Some(conn) = conn else {
            return false;
        };

        let (drained, was_connecting) = {
            let mut state = conn.lock();
            let was_connecting = matches!(state.phase, LinkPhase::Connecting);
            state.phase = LinkPhase::TearingDown;
            (state.queue.drain(), was_connecting)
        };

        self.transport.release(link);

        let op_error = match reason {
            Termination::ConnectFailed(_) => OperationError::ConnectionFailed,
            _ => OperationError::LinkLost,
        };
        if !drained.is_empty() {
            info!(
                "Discarding {} queued operations for {}: {}",
                drained.len(),
                link.address,
                op_error
            );
        }
        for op in drained {
            op.finish(Err(op_error.clone()));
        }

        let address = link.address;
        match reason {
            Termination::ConnectFailed(error) => {
                self.listeners
                    .dispatch(&ConnectionEvent::ConnectionFailed { address, error: &error });
            }
            Termination::LinkLost if was_connecting => {
                let error = ConnectionError::Transport("link lost while connecting".to_string());
                self.listeners
                    .dispatch(&ConnectionEvent::ConnectionFailed { address, error: &error });
            }
            Termination::LinkLost | Termination::Requested => {
                info!("Connection to {} torn down", address);
                self.listeners
                    .dispatch(&ConnectionEvent::Disconnect { address });
            }
        }
        true
    }
}

/// Fold a successful response into the connection state and work out
/// what to tell the continuation and the listeners.
fn apply(
    phase: &mut LinkPhase,
    operation: &Operation,
    response: Response,
) -> Result<(Response, Option<Notice>), OperationError> {
    let unexpected = |response: &Response| {
        OperationError::Failed(ConnectionError::Transport(format!(
            "unexpected response to {}: {:?}",
            operation.name(),
            response
        )))
    };

    match (operation, response) {
        // Setup completes once; a later rediscovery only refreshes the tree.
        (Operation::DiscoverServices, Response::Services(services)) => {
            let (mtu, first) = match phase {
                LinkPhase::Ready(ready) => (ready.mtu, false),
                _ => (GATT_MIN_MTU, true),
            };
            *phase = LinkPhase::Ready(ReadyLink {
                services: services.clone(),
                mtu,
            });
            let notice = first.then(|| Notice::SetupComplete(services.clone()));
            Ok((Response::Services(services), notice))
        }
        (Operation::RequestMtu { .. }, Response::Mtu(mtu)) => {
            if let LinkPhase::Ready(ready) = phase {
                ready.mtu = mtu;
            }
            Ok((Response::Mtu(mtu), Some(Notice::MtuChanged(mtu))))
        }
        (Operation::ReadCharacteristic { id }, Response::Value(value)) => Ok((
            Response::Value(value.clone()),
            Some(Notice::Read(*id, value)),
        )),
        (Operation::WriteCharacteristic { id, .. }, Response::Done) => {
            Ok((Response::Done, Some(Notice::Write(*id))))
        }
        (Operation::EnableNotifications { id }, Response::Done) => {
            Ok((Response::Done, Some(Notice::NotificationsEnabled(*id))))
        }
        (Operation::DisableNotifications { id }, Response::Done) => {
            Ok((Response::Done, Some(Notice::NotificationsDisabled(*id))))
        }
        (_, response) => Err(unexpected(&response)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::gatt::{CharacteristicProperties, GattCharacteristic};
    use crate::infrastructure::bluetooth::listener::ConnectionEventListener;
    use std::collections::VecDeque;
    use std::sync::OnceLock;
    use tokio::sync::oneshot::error::TryRecvError;

    const SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
    const COMMAND: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
    const TELEMETRY: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
    const READ_ONLY: Uuid = Uuid::from_u128(0x2a19);

    fn address() -> DeviceAddress {
        DeviceAddress::new(0xC0FFEE_000001)
    }

    fn services() -> Vec<GattService> {
        vec![GattService {
            uuid: SERVICE,
            characteristics: vec![
                GattCharacteristic {
                    uuid: COMMAND,
                    properties: CharacteristicProperties::from_bits(
                        CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
                    ),
                },
                GattCharacteristic {
                    uuid: TELEMETRY,
                    properties: CharacteristicProperties::from_bits(
                        CharacteristicProperties::NOTIFY,
                    ),
                },
                GattCharacteristic {
                    uuid: READ_ONLY,
                    properties: CharacteristicProperties::from_bits(CharacteristicProperties::READ),
                },
            ],
        }]
    }

    struct Started {
        link: LinkId,
        id: OperationId,
        request: Request,
        sink: CompletionSink,
    }

    /// Records requests; the test decides when and how each completes.
    #[derive(Default)]
    struct ScriptedTransport {
        started: Mutex<VecDeque<Started>>,
        released: Mutex<Vec<LinkId>>,
    }

    impl GattTransport for ScriptedTransport {
        fn start(&self, link: LinkId, id: OperationId, request: Request, sink: CompletionSink) {
            self.started.lock().unwrap().push_back(Started {
                link,
                id,
                request,
                sink,
            });
        }

        fn release(&self, link: LinkId) {
            self.released.lock().unwrap().push(link);
        }
    }

    impl ScriptedTransport {
        fn next(&self) -> Started {
            self.started
                .lock()
                .unwrap()
                .pop_front()
                .expect("no request in flight")
        }

        fn outstanding(&self) -> usize {
            self.started.lock().unwrap().len()
        }

        /// Complete the oldest outstanding request.
        fn respond(&self, result: Result<Response, ConnectionError>) -> Request {
            let started = self.next();
            started.sink.complete(started.link, started.id, result);
            started.request
        }
    }

    struct Harness {
        transport: Arc<ScriptedTransport>,
        manager: ConnectionManager,
        events: Arc<Mutex<Vec<String>>>,
    }

    fn harness_with(config: ManagerConfig) -> Harness {
        let transport = Arc::new(ScriptedTransport::default());
        let registry = Arc::new(EventListenerRegistry::new());
        let events = Arc::new(Mutex::new(Vec::new()));

        let log = |events: &Arc<Mutex<Vec<String>>>| {
            let events = events.clone();
            move |entry: String| events.lock().unwrap().push(entry)
        };
        let (a, b, c, d, e, f, g, h) = (
            log(&events),
            log(&events),
            log(&events),
            log(&events),
            log(&events),
            log(&events),
            log(&events),
            log(&events),
        );
        registry.register(Arc::new(
            ConnectionEventListener::new()
                .on_connection_setup_complete(move |_, services| {
                    a(format!("setup:{}", services.len()));
                    Ok(())
                })
                .on_connection_failed(move |_, error| {
                    b(format!("failed:{}", error));
                    Ok(())
                })
                .on_disconnect(move |_| {
                    c("disconnect".to_string());
                    Ok(())
                })
                .on_mtu_changed(move |_, mtu| {
                    d(format!("mtu:{}", mtu));
                    Ok(())
                })
                .on_characteristic_read(move |_, _, value| {
                    e(format!("read:{:?}", value));
                    Ok(())
                })
                .on_characteristic_write(move |_, id| {
                    f(format!("write:{}", id == COMMAND));
                    Ok(())
                })
                .on_characteristic_changed(move |_, _, value| {
                    g(format!("changed:{:?}", value));
                    Ok(())
                })
                .on_notifications_enabled(move |_, _| {
                    h("notify-on".to_string());
                    Ok(())
                }),
        ));

        let manager = ConnectionManager::with_config(transport.clone(), registry, config);
        Harness {
            transport,
            manager,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(ManagerConfig::default())
    }

    impl Harness {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn connect_ready(&self) {
            self.manager.connect(address());
            assert_eq!(self.transport.respond(Ok(Response::Done)), Request::Connect);
            assert_eq!(
                self.transport.respond(Ok(Response::Services(services()))),
                Request::DiscoverServices
            );
            assert!(self.manager.is_connected(address()));
        }
    }

    #[test]
    fn test_connect_runs_discovery_then_reports_setup() {
        let h = harness();
        h.manager.connect(address());
        assert_eq!(h.manager.status(address()), ConnectionStatus::Connecting);
        assert!(h.manager.services_on_device(address()).is_empty());

        h.connect_ready();
        assert_eq!(h.events(), vec!["setup:1"]);
        assert_eq!(h.manager.services_on_device(address()), services());
        assert_eq!(h.manager.mtu(address()), Some(GATT_MIN_MTU));
    }

    #[test]
    fn test_second_connect_is_ignored() {
        let h = harness();
        h.manager.connect(address());
        let mut rx = h.manager.submit(address(), Operation::Connect);
        assert_eq!(rx.try_recv(), Ok(Err(OperationError::AlreadyConnected)));
        assert_eq!(h.transport.outstanding(), 1);
    }

    #[test]
    fn test_operations_complete_in_fifo_order() {
        let h = harness();
        h.connect_ready();

        let mut a = h.manager.submit(
            address(),
            Operation::WriteCharacteristic {
                id: COMMAND,
                payload: vec![1],
            },
        );
        let mut b = h
            .manager
            .submit(address(), Operation::ReadCharacteristic { id: READ_ONLY });
        let mut c = h.manager.submit(address(), Operation::RequestMtu { size: 185 });

        // Only the head of the queue reaches the transport.
        assert_eq!(h.transport.outstanding(), 1);
        assert_eq!(b.try_recv(), Err(TryRecvError::Empty));

        assert_eq!(
            h.transport.respond(Ok(Response::Done)),
            Request::Write {
                characteristic: COMMAND,
                payload: vec![1],
                write_type: WriteType::WithoutResponse,
            }
        );
        assert_eq!(a.try_recv(), Ok(Ok(Response::Done)));
        assert_eq!(b.try_recv(), Err(TryRecvError::Empty));

        h.transport.respond(Ok(Response::Value(vec![0x64])));
        assert_eq!(b.try_recv(), Ok(Ok(Response::Value(vec![0x64]))));

        h.transport.respond(Ok(Response::Mtu(185)));
        assert_eq!(c.try_recv(), Ok(Ok(Response::Mtu(185))));
        assert_eq!(h.manager.mtu(address()), Some(185));

        assert_eq!(
            h.events(),
            vec!["setup:1", "write:true", "read:[100]", "mtu:185"]
        );
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let h = harness();
        h.connect_ready();
        h.manager.write_characteristic(address(), COMMAND, vec![1]);

        let started = h.transport.next();
        started
            .sink
            .complete(started.link, started.id + 100, Ok(Response::Done));
        assert_eq!(h.events(), vec!["setup:1"]);

        started.sink.complete(started.link, started.id, Ok(Response::Done));
        assert_eq!(h.events(), vec!["setup:1", "write:true"]);
    }

    #[test]
    fn test_validation_failures_advance_the_queue() {
        let h = harness();
        h.connect_ready();

        let unknown = Uuid::from_u128(0xdead);
        let mut bad = h
            .manager
            .submit(address(), Operation::ReadCharacteristic { id: unknown });
        let mut read_only_write = h.manager.submit(
            address(),
            Operation::WriteCharacteristic {
                id: READ_ONLY,
                payload: vec![0],
            },
        );
        let mut good = h
            .manager
            .submit(address(), Operation::EnableNotifications { id: TELEMETRY });

        assert_eq!(
            bad.try_recv(),
            Ok(Err(OperationError::UnknownCharacteristic(unknown)))
        );
        assert!(matches!(
            read_only_write.try_recv(),
            Ok(Err(OperationError::Unsupported {
                operation: "write",
                ..
            }))
        ));

        assert_eq!(
            h.transport.respond(Ok(Response::Done)),
            Request::SetNotifications {
                characteristic: TELEMETRY,
                mode: NotificationMode::Notify,
            }
        );
        assert_eq!(good.try_recv(), Ok(Ok(Response::Done)));
        assert_eq!(h.events(), vec!["setup:1", "notify-on"]);
    }

    #[test]
    fn test_gatt_failure_fails_only_that_operation() {
        let h = harness();
        h.connect_ready();

        let mut first = h.manager.submit(address(), Operation::ReadCharacteristic { id: READ_ONLY });
        let mut second = h.manager.submit(address(), Operation::RequestMtu { size: 64 });

        h.transport.respond(Err(ConnectionError::Gatt {
            status: "ProtocolError".to_string(),
        }));
        assert!(matches!(
            first.try_recv(),
            Ok(Err(OperationError::Failed(ConnectionError::Gatt { .. })))
        ));
        assert!(h.manager.is_connected(address()));

        assert_eq!(h.transport.respond(Ok(Response::Mtu(64))), Request::RequestMtu { size: 64 });
        assert_eq!(second.try_recv(), Ok(Ok(Response::Mtu(64))));
    }

    #[test]
    fn test_mtu_request_is_clamped() {
        let h = harness();
        h.connect_ready();

        h.manager.request_mtu(address(), 1000);
        assert_eq!(
            h.transport.respond(Ok(Response::Mtu(517))),
            Request::RequestMtu { size: 517 }
        );
        h.manager.request_mtu(address(), 5);
        assert_eq!(
            h.transport.respond(Ok(Response::Mtu(23))),
            Request::RequestMtu { size: 23 }
        );
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let h = harness();
        h.connect_ready();

        let mut in_flight = h.manager.submit(
            address(),
            Operation::WriteCharacteristic {
                id: COMMAND,
                payload: vec![1],
            },
        );
        let mut queued = h.manager.submit(address(), Operation::RequestMtu { size: 100 });

        h.manager.teardown_connection(address());
        h.manager.teardown_connection(address());

        assert_eq!(in_flight.try_recv(), Ok(Err(OperationError::LinkLost)));
        assert_eq!(queued.try_recv(), Ok(Err(OperationError::LinkLost)));
        assert_eq!(h.transport.released.lock().unwrap().len(), 1);
        assert_eq!(h.events(), vec!["setup:1", "disconnect"]);
        assert_eq!(h.manager.status(address()), ConnectionStatus::Disconnected);

        // The transport finishing the old write afterwards changes nothing.
        h.transport.respond(Ok(Response::Done));
        assert_eq!(h.events(), vec!["setup:1", "disconnect"]);
    }

    #[test]
    fn test_connect_failure_discards_queue() {
        let h = harness();
        h.manager.connect(address());
        let mut queued = h.manager.submit(address(), Operation::RequestMtu { size: 100 });

        h.transport.respond(Err(ConnectionError::NotFound));

        assert_eq!(queued.try_recv(), Ok(Err(OperationError::ConnectionFailed)));
        assert_eq!(h.events(), vec!["failed:device not found"]);
        assert_eq!(h.manager.status(address()), ConnectionStatus::Disconnected);
        assert_eq!(h.transport.released.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_link_lost_mid_flight() {
        let h = harness();
        h.connect_ready();

        let mut a = h.manager.submit(address(), Operation::ReadCharacteristic { id: READ_ONLY });
        let mut b = h.manager.submit(address(), Operation::ReadCharacteristic { id: READ_ONLY });

        let started = h.transport.next();
        started.sink.link_lost(started.link);
        started.sink.link_lost(started.link);

        assert_eq!(a.try_recv(), Ok(Err(OperationError::LinkLost)));
        assert_eq!(b.try_recv(), Ok(Err(OperationError::LinkLost)));
        assert_eq!(h.events(), vec!["setup:1", "disconnect"]);
    }

    #[test]
    fn test_graceful_disconnect_waits_for_queue() {
        let h = harness();
        h.connect_ready();

        h.manager.write_characteristic(address(), COMMAND, vec![7]);
        h.manager.disconnect(address());
        let mut late = h.manager.submit(address(), Operation::RequestMtu { size: 100 });

        h.transport.respond(Ok(Response::Done));
        assert_eq!(h.transport.respond(Ok(Response::Done)), Request::Disconnect);

        assert_eq!(late.try_recv(), Ok(Err(OperationError::LinkLost)));
        assert_eq!(h.events(), vec!["setup:1", "write:true", "disconnect"]);
        assert_eq!(h.transport.outstanding(), 0);
    }

    #[test]
    fn test_not_connected_fails_immediately() {
        let h = harness();
        let mut rx = h.manager.submit(address(), Operation::ReadCharacteristic { id: READ_ONLY });
        assert_eq!(rx.try_recv(), Ok(Err(OperationError::NotConnected)));
        assert_eq!(h.transport.outstanding(), 0);
    }

    #[test]
    fn test_reconnect_ignores_previous_session() {
        let h = harness();
        h.connect_ready();
        h.manager.read_characteristic(address(), READ_ONLY);
        let old = h.transport.next();
        h.manager.teardown_connection(address());

        h.manager.connect(address());
        old.sink.complete(old.link, old.id, Ok(Response::Value(vec![1])));
        old.sink.notification(old.link, TELEMETRY, &[9]);
        assert_eq!(h.manager.status(address()), ConnectionStatus::Connecting);
        assert_eq!(h.events(), vec!["setup:1", "disconnect"]);

        let fresh = h.transport.next();
        assert_ne!(fresh.link.session, old.link.session);
        assert_eq!(fresh.request, Request::Connect);
    }

    #[test]
    fn test_notifications_reach_listeners() {
        let h = harness();
        h.connect_ready();
        h.manager.enable_notifications(address(), TELEMETRY);
        let started = h.transport.next();
        started.sink.notification(started.link, TELEMETRY, &[2, 1]);
        assert_eq!(h.events(), vec!["setup:1", "changed:[2, 1]"]);
    }

    #[test]
    fn test_connections_are_independent() {
        let h = harness();
        let other = DeviceAddress::new(0xC0FFEE_000002);
        h.manager.connect(address());
        h.manager.connect(other);

        // Both links have a request in flight at once.
        assert_eq!(h.transport.outstanding(), 2);
        h.manager.teardown_connection(other);
        assert_eq!(h.manager.status(address()), ConnectionStatus::Connecting);
        assert_eq!(h.manager.connected_devices(), vec![address()]);
    }

    #[test]
    fn test_rediscovery_does_not_repeat_setup() {
        let h = harness();
        h.connect_ready();

        let mut rx = h.manager.submit(address(), Operation::DiscoverServices);
        h.manager.request_mtu(address(), 185);
        assert_eq!(
            h.transport.respond(Ok(Response::Services(services()))),
            Request::DiscoverServices
        );
        assert_eq!(rx.try_recv(), Ok(Ok(Response::Services(services()))));

        // The negotiated MTU survives the refresh.
        h.transport.respond(Ok(Response::Mtu(185)));
        let _ = h.manager.submit(address(), Operation::DiscoverServices);
        h.transport.respond(Ok(Response::Services(services())));
        assert_eq!(h.manager.mtu(address()), Some(185));
        assert_eq!(h.events(), vec!["setup:1", "mtu:185"]);
    }

    /// Completes every request before `start` returns.
    struct InstantTransport;

    impl GattTransport for InstantTransport {
        fn start(&self, link: LinkId, id: OperationId, request: Request, sink: CompletionSink) {
            let response = match request {
                Request::DiscoverServices => Response::Services(services()),
                Request::Read { .. } => Response::Value(vec![1]),
                Request::RequestMtu { size } => Response::Mtu(size),
                _ => Response::Done,
            };
            sink.complete(link, id, Ok(response));
        }

        fn release(&self, _link: LinkId) {}
    }

    #[test]
    fn test_operation_queued_from_hook_reports_after_its_trigger() {
        let registry = Arc::new(EventListenerRegistry::new());
        let slot: Arc<OnceLock<ConnectionManager>> = Arc::new(OnceLock::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        // Queues a read while the write's event is still being delivered.
        let manager_slot = slot.clone();
        registry.register(Arc::new(ConnectionEventListener::new().on_characteristic_write(
            move |address, _| {
                if let Some(manager) = manager_slot.get() {
                    manager.read_characteristic(address, READ_ONLY);
                }
                Ok(())
            },
        )));
        let (writes, reads) = (seen.clone(), seen.clone());
        registry.register(Arc::new(
            ConnectionEventListener::new()
                .on_characteristic_write(move |_, _| {
                    writes.lock().unwrap().push("write");
                    Ok(())
                })
                .on_characteristic_read(move |_, _, _| {
                    reads.lock().unwrap().push("read");
                    Ok(())
                }),
        ));

        let manager = ConnectionManager::new(Arc::new(InstantTransport), registry);
        let _ = slot.set(manager.clone());
        manager.connect(address());
        assert!(manager.is_connected(address()));

        let mut write = manager.submit(
            address(),
            Operation::WriteCharacteristic {
                id: COMMAND,
                payload: vec![1],
            },
        );
        assert_eq!(write.try_recv(), Ok(Ok(Response::Done)));
        assert_eq!(*seen.lock().unwrap(), vec!["write", "read"]);

        manager.teardown_connection(address());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_stalled_operation() {
        let h = harness_with(ManagerConfig {
            operation_timeout: Some(Duration::from_secs(2)),
        });
        h.connect_ready();

        let mut stalled = h.manager.submit(address(), Operation::ReadCharacteristic { id: READ_ONLY });
        let mut next = h.manager.submit(address(), Operation::RequestMtu { size: 100 });
        let _never_answered = h.transport.next();

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(stalled.try_recv(), Ok(Err(OperationError::TimedOut)));
        assert_eq!(h.transport.respond(Ok(Response::Mtu(100))), Request::RequestMtu { size: 100 });
        assert_eq!(next.try_recv(), Ok(Ok(Response::Mtu(100))));
    }

    #[test]
    fn test_without_timeout_a_stalled_operation_blocks_the_queue() {
        let h = harness();
        h.connect_ready();
        h.manager.read_characteristic(address(), READ_ONLY);
        h.manager.request_mtu(address(), 100);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(h.transport.outstanding(), 1);
    }
}
