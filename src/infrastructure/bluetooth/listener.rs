//! Connection Event Listeners
//!
//! A listener is a bundle of optional hooks. The registry fans every
//! connection event out to all registered listeners, in registration
//! order, regardless of which peripheral produced it.

use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::error::ConnectionError;
use crate::infrastructure::bluetooth::gatt::GattService;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, warn};
use uuid::Uuid;

/// Hooks report failures instead of unwinding; the registry logs them and
/// keeps dispatching.
pub type HookResult = anyhow::Result<()>;

type AddressHook = Box<dyn Fn(DeviceAddress) -> HookResult + Send + Sync>;
type SetupHook = Box<dyn Fn(DeviceAddress, &[GattService]) -> HookResult + Send + Sync>;
type FailedHook = Box<dyn Fn(DeviceAddress, &ConnectionError) -> HookResult + Send + Sync>;
type MtuHook = Box<dyn Fn(DeviceAddress, u16) -> HookResult + Send + Sync>;
type CharacteristicHook = Box<dyn Fn(DeviceAddress, Uuid) -> HookResult + Send + Sync>;
type ValueHook = Box<dyn Fn(DeviceAddress, Uuid, &[u8]) -> HookResult + Send + Sync>;

/// Events published by the connection manager.
#[derive(Debug, Clone, Copy)]
pub enum ConnectionEvent<'a> {
    SetupComplete {
        address: DeviceAddress,
        services: &'a [GattService],
    },
    ConnectionFailed {
        address: DeviceAddress,
        error: &'a ConnectionError,
    },
    Disconnect {
        address: DeviceAddress,
    },
    MtuChanged {
        address: DeviceAddress,
        mtu: u16,
    },
    CharacteristicRead {
        address: DeviceAddress,
        characteristic: Uuid,
        value: &'a [u8],
    },
    CharacteristicWrite {
        address: DeviceAddress,
        characteristic: Uuid,
    },
    CharacteristicChanged {
        address: DeviceAddress,
        characteristic: Uuid,
        value: &'a [u8],
    },
    NotificationsEnabled {
        address: DeviceAddress,
        characteristic: Uuid,
    },
    NotificationsDisabled {
        address: DeviceAddress,
        characteristic: Uuid,
    },
}

impl ConnectionEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetupComplete { .. } => "connection_setup_complete",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::Disconnect { .. } => "disconnect",
            Self::MtuChanged { .. } => "mtu_changed",
            Self::CharacteristicRead { .. } => "characteristic_read",
            Self::CharacteristicWrite { .. } => "characteristic_write",
            Self::CharacteristicChanged { .. } => "characteristic_changed",
            Self::NotificationsEnabled { .. } => "notifications_enabled",
            Self::NotificationsDisabled { .. } => "notifications_disabled",
        }
    }
}

/// A set of optional hooks, built with the `on_*` methods.
///
/// ```ignore
/// let listener = ConnectionEventListener::new()
///     .on_disconnect(|address| {
///         info!("{} disconnected", address);
///         Ok(())
///     });
/// ```
#[derive(Default)]
pub struct ConnectionEventListener {
    on_connection_setup_complete: Option<SetupHook>,
    on_connection_failed: Option<FailedHook>,
    on_disconnect: Option<AddressHook>,
    on_mtu_changed: Option<MtuHook>,
    on_characteristic_read: Option<ValueHook>,
    on_characteristic_write: Option<CharacteristicHook>,
    on_characteristic_changed: Option<ValueHook>,
    on_notifications_enabled: Option<CharacteristicHook>,
    on_notifications_disabled: Option<CharacteristicHook>,
}

impl ConnectionEventListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connection_setup_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceAddress, &[GattService]) -> HookResult + Send + Sync + 'static,
    {
        self.on_connection_setup_complete = Some(Box::new(f));
        self
    }

    pub fn on_connection_failed<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceAddress, &ConnectionError) -> HookResult + Send + Sync + 'static,
    {
        self.on_connection_failed = Some(Box::new(f));
        self
    }

    pub fn on_disconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceAddress) -> HookResult + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Box::new(f));
        self
    }

    pub fn on_mtu_changed<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceAddress, u16) -> HookResult + Send + Sync + 'static,
    {
        self.on_mtu_changed = Some(Box::new(f));
        self
    }

    pub fn on_characteristic_read<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceAddress, Uuid, &[u8]) -> HookResult + Send + Sync + 'static,
    {
        self.on_characteristic_read = Some(Box::new(f));
        self
    }

    pub fn on_characteristic_write<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceAddress, Uuid) -> HookResult + Send + Sync + 'static,
    {
        self.on_characteristic_write = Some(Box::new(f));
        self
    }

    pub fn on_characteristic_changed<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceAddress, Uuid, &[u8]) -> HookResult + Send + Sync + 'static,
    {
        self.on_characteristic_changed = Some(Box::new(f));
        self
    }

    pub fn on_notifications_enabled<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceAddress, Uuid) -> HookResult + Send + Sync + 'static,
    {
        self.on_notifications_enabled = Some(Box::new(f));
        self
    }

    pub fn on_notifications_disabled<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceAddress, Uuid) -> HookResult + Send + Sync + 'static,
    {
        self.on_notifications_disabled = Some(Box::new(f));
        self
    }

    /// Run the hook matching `event`. `None` when this listener does not
    /// define it.
    fn invoke(&self, event: &ConnectionEvent<'_>) -> Option<HookResult> {
        match *event {
            ConnectionEvent::SetupComplete { address, services } => self
                .on_connection_setup_complete
                .as_ref()
                .map(|f| f(address, services)),
            ConnectionEvent::ConnectionFailed { address, error } => self
                .on_connection_failed
                .as_ref()
                .map(|f| f(address, error)),
            ConnectionEvent::Disconnect { address } => {
                self.on_disconnect.as_ref().map(|f| f(address))
            }
            ConnectionEvent::MtuChanged { address, mtu } => {
                self.on_mtu_changed.as_ref().map(|f| f(address, mtu))
            }
            ConnectionEvent::CharacteristicRead {
                address,
                characteristic,
                value,
            } => self
                .on_characteristic_read
                .as_ref()
                .map(|f| f(address, characteristic, value)),
            ConnectionEvent::CharacteristicWrite {
                address,
                characteristic,
            } => self
                .on_characteristic_write
                .as_ref()
                .map(|f| f(address, characteristic)),
            ConnectionEvent::CharacteristicChanged {
                address,
                characteristic,
                value,
            } => self
                .on_characteristic_changed
                .as_ref()
                .map(|f| f(address, characteristic, value)),
            ConnectionEvent::NotificationsEnabled {
                address,
                characteristic,
            } => self
                .on_notifications_enabled
                .as_ref()
                .map(|f| f(address, characteristic)),
            ConnectionEvent::NotificationsDisabled {
                address,
                characteristic,
            } => self
                .on_notifications_disabled
                .as_ref()
                .map(|f| f(address, characteristic)),
        }
    }
}

/// Ordered set of listeners shared by everything that publishes
/// connection events.
#[derive(Default)]
pub struct EventListenerRegistry {
    listeners: RwLock<Vec<Arc<ConnectionEventListener>>>,
}

impl EventListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `listener` at the end. Registering the same listener twice is
    /// a no-op.
    pub fn register(&self, listener: Arc<ConnectionEventListener>) {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Returns whether the listener was registered.
    pub fn unregister(&self, listener: &Arc<ConnectionEventListener>) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke the hook for `event` on every listener that defines it.
    ///
    /// Runs on a snapshot, so hooks may (un)register listeners. A hook
    /// that errors or panics is logged and skipped.
    pub fn dispatch(&self, event: &ConnectionEvent<'_>) {
        let snapshot: Vec<Arc<ConnectionEventListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener.invoke(event))) {
                Ok(None) | Ok(Some(Ok(()))) => {}
                Ok(Some(Err(e))) => {
                    warn!("Listener hook {} failed: {:#}", event.name(), e);
                }
                Err(_) => {
                    error!("Listener hook {} panicked", event.name());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const ADDRESS: u64 = 0x0102_0304_0506;

    fn address() -> DeviceAddress {
        DeviceAddress::new(ADDRESS)
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry = EventListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            registry.register(Arc::new(ConnectionEventListener::new().on_disconnect(
                move |_| {
                    order.lock().unwrap().push(tag);
                    Ok(())
                },
            )));
        }

        registry.dispatch(&ConnectionEvent::Disconnect { address: address() });
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_listeners_without_hook_are_skipped() {
        let registry = EventListenerRegistry::new();
        let mtu_seen = Arc::new(AtomicUsize::new(0));

        registry.register(Arc::new(ConnectionEventListener::new()));
        let seen = mtu_seen.clone();
        registry.register(Arc::new(ConnectionEventListener::new().on_mtu_changed(
            move |_, mtu| {
                seen.store(mtu as usize, Ordering::SeqCst);
                Ok(())
            },
        )));

        registry.dispatch(&ConnectionEvent::MtuChanged {
            address: address(),
            mtu: 185,
        });
        assert_eq!(mtu_seen.load(Ordering::SeqCst), 185);
    }

    #[test]
    fn test_failing_listener_does_not_block_the_next() {
        let registry = EventListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.register(Arc::new(
            ConnectionEventListener::new()
                .on_characteristic_changed(|_, _, _| anyhow::bail!("decoder exploded")),
        ));
        registry.register(Arc::new(
            ConnectionEventListener::new().on_characteristic_changed(|_, _, _| panic!("boom")),
        ));
        let counter = calls.clone();
        registry.register(Arc::new(ConnectionEventListener::new().on_characteristic_changed(
            move |_, _, value| {
                assert_eq!(value, &[1, 2, 3]);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )));

        registry.dispatch(&ConnectionEvent::CharacteristicChanged {
            address: address(),
            characteristic: Uuid::nil(),
            value: &[1, 2, 3],
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_is_idempotent_and_unregister_by_identity() {
        let registry = EventListenerRegistry::new();
        let a = Arc::new(ConnectionEventListener::new());
        let b = Arc::new(ConnectionEventListener::new());

        registry.register(a.clone());
        registry.register(a.clone());
        registry.register(b.clone());
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(&a));
        assert!(!registry.unregister(&a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_hook_may_unregister_itself() {
        let registry = Arc::new(EventListenerRegistry::new());
        let slot: Arc<Mutex<Option<Arc<ConnectionEventListener>>>> = Arc::new(Mutex::new(None));

        let reg = registry.clone();
        let me = slot.clone();
        let listener = Arc::new(ConnectionEventListener::new().on_disconnect(move |_| {
            if let Some(me) = me.lock().unwrap().take() {
                reg.unregister(&me);
            }
            Ok(())
        }));
        *slot.lock().unwrap() = Some(listener.clone());
        registry.register(listener);

        registry.dispatch(&ConnectionEvent::Disconnect { address: address() });
        assert!(registry.is_empty());
    }
}
