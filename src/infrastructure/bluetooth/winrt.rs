//! WinRT Transport
//!
//! [`GattTransport`] over `Windows.Devices.Bluetooth`. Each request runs as
//! a Tokio task that awaits the WinRT async operation and reports back
//! through the completion sink. Value-changed and connection-status
//! handlers fire on WinRT threads and call the sink directly.

use crate::infrastructure::bluetooth::connection::CompletionSink;
use crate::infrastructure::bluetooth::error::ConnectionError;
use crate::infrastructure::bluetooth::gatt::{
    CharacteristicProperties, GattCharacteristic, GattService, GattTransport, LinkId, LinkTable,
    NotificationMode, OperationId, Request, Response, WriteType, GATT_MIN_MTU,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::{Ref, GUID};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic as WinCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

type Links = Arc<Mutex<LinkTable<WinRtLink>>>;

/// WinRT objects held for one connection.
struct WinRtLink {
    device: BluetoothLEDevice,
    session: Option<GattSession>,
    status_token: i64,
    characteristics: HashMap<Uuid, WinCharacteristic>,
    value_tokens: HashMap<Uuid, i64>,
}

impl WinRtLink {
    fn close(self) {
        for (uuid, token) in self.value_tokens {
            if let Some(c) = self.characteristics.get(&uuid) {
                let _ = c.RemoveValueChanged(token);
            }
        }
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        if let Some(session) = self.session {
            let _ = session.Close();
        }
        let _ = self.device.Close();
    }
}

pub struct WinRtTransport {
    runtime: Handle,
    links: Links,
}

impl WinRtTransport {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            links: Arc::new(Mutex::new(LinkTable::new())),
        }
    }
}

impl GattTransport for WinRtTransport {
    fn start(&self, link: LinkId, id: OperationId, request: Request, sink: CompletionSink) {
        let links = Arc::clone(&self.links);
        self.runtime.spawn(async move {
            let result = execute(&links, link, request, &sink).await;
            sink.complete(link, id, result);
        });
    }

    fn release(&self, link: LinkId) {
        // Closing can raise the status event, which calls back into release.
        let state = lock(&self.links).release(link);
        if let Some(state) = state {
            debug!("Releasing WinRT objects for {}", link.address);
            state.close();
        }
    }
}

fn lock(links: &Links) -> MutexGuard<'_, LinkTable<WinRtLink>> {
    links.lock().unwrap_or_else(PoisonError::into_inner)
}

fn winrt(e: windows::core::Error) -> ConnectionError {
    ConnectionError::Transport(e.to_string())
}

fn check(status: GattCommunicationStatus) -> Result<(), ConnectionError> {
    if status == GattCommunicationStatus::Success {
        Ok(())
    } else {
        Err(ConnectionError::Gatt {
            status: format!("{:?}", status),
        })
    }
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn device_of(links: &Links, link: LinkId) -> Result<BluetoothLEDevice, ConnectionError> {
    lock(links)
        .get(link)
        .map(|state| state.device.clone())
        .ok_or_else(|| ConnectionError::Transport("link released".to_string()))
}

fn characteristic_of(
    links: &Links,
    link: LinkId,
    uuid: Uuid,
) -> Result<WinCharacteristic, ConnectionError> {
    lock(links)
        .get(link)
        .and_then(|state| state.characteristics.get(&uuid).cloned())
        .ok_or_else(|| ConnectionError::Transport(format!("characteristic {} not resolved", uuid)))
}

async fn execute(
    links: &Links,
    link: LinkId,
    request: Request,
    sink: &CompletionSink,
) -> Result<Response, ConnectionError> {
    match request {
        Request::Connect => connect(links, link, sink).await.map(|()| Response::Done),
        Request::Disconnect => {
            let state = lock(links).release(link);
            if let Some(state) = state {
                state.close();
            }
            Ok(Response::Done)
        }
        Request::DiscoverServices => discover(links, link).await.map(Response::Services),
        Request::Read { characteristic } => {
            let c = characteristic_of(links, link, characteristic)?;
            let result = c
                .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)
                .map_err(winrt)?
                .await
                .map_err(winrt)?;
            check(result.Status().map_err(winrt)?)?;
            let value = read_buffer(&result.Value().map_err(winrt)?).map_err(winrt)?;
            Ok(Response::Value(value))
        }
        Request::Write {
            characteristic,
            payload,
            write_type,
        } => {
            let c = characteristic_of(links, link, characteristic)?;
            let writer = DataWriter::new().map_err(winrt)?;
            writer.WriteBytes(&payload).map_err(winrt)?;
            let buffer = writer.DetachBuffer().map_err(winrt)?;
            let option = match write_type {
                WriteType::WithResponse => GattWriteOption::WriteWithResponse,
                WriteType::WithoutResponse => GattWriteOption::WriteWithoutResponse,
            };
            let status = c
                .WriteValueWithOptionAsync(&buffer, option)
                .map_err(winrt)?
                .await
                .map_err(winrt)?;
            check(status)?;
            Ok(Response::Done)
        }
        Request::SetNotifications {
            characteristic,
            mode,
        } => set_notifications(links, link, characteristic, mode, sink)
            .await
            .map(|()| Response::Done),
        Request::RequestMtu { size } => {
            // Windows negotiates the MTU itself; report what the session got.
            let session = lock(links)
                .get(link)
                .and_then(|state| state.session.clone());
            let mtu = match session {
                Some(session) => session.MaxPduSize().map_err(winrt)?,
                None => GATT_MIN_MTU,
            };
            debug!("Requested MTU {} on {}, session has {}", size, link.address, mtu);
            Ok(Response::Mtu(mtu))
        }
    }
}

async fn connect(links: &Links, link: LinkId, sink: &CompletionSink) -> Result<(), ConnectionError> {
    lock(links).begin(link);
    let opened = open(link, sink).await;

    let mut table = lock(links);
    let state = match opened {
        Ok(state) => state,
        Err(e) => {
            table.abandon(link);
            return Err(e);
        }
    };
    match table.finish(link, state) {
        Ok(()) => Ok(()),
        Err(state) => {
            drop(table);
            info!("{} released while connecting, closing", link.address);
            state.close();
            Err(ConnectionError::Transport("released while connecting".to_string()))
        }
    }
}

async fn open(link: LinkId, sink: &CompletionSink) -> Result<WinRtLink, ConnectionError> {
    info!("Connecting to Bluetooth device: {}", link.address);
    let device = BluetoothLEDevice::FromBluetoothAddressAsync(link.address.as_u64())
        .map_err(winrt)?
        .await
        .map_err(|_| ConnectionError::NotFound)?;

    // Keeps Windows from dropping the link between requests.
    let session = match GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId().map_err(winrt)?)
        .map_err(winrt)?
        .await
    {
        Ok(session) => {
            let _ = session.SetMaintainConnection(true);
            Some(session)
        }
        Err(e) => {
            warn!("Failed to create GattSession, continuing anyway: {}", e);
            None
        }
    };

    let status_sink = sink.clone();
    let handler = TypedEventHandler::new(move |dev: Ref<BluetoothLEDevice>, _| {
        if let Some(dev) = dev.as_ref() {
            if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                status_sink.link_lost(link);
            }
        }
        Ok(())
    });
    let status_token = device.ConnectionStatusChanged(&handler).map_err(winrt)?;

    Ok(WinRtLink {
        device,
        session,
        status_token,
        characteristics: HashMap::new(),
        value_tokens: HashMap::new(),
    })
}

async fn discover(links: &Links, link: LinkId) -> Result<Vec<GattService>, ConnectionError> {
    let device = device_of(links, link)?;
    let result = device
        .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)
        .map_err(winrt)?
        .await
        .map_err(winrt)?;
    check(result.Status().map_err(winrt)?)?;

    let services = result.Services().map_err(winrt)?;
    let mut tree = Vec::new();
    let mut handles = HashMap::new();

    for i in 0..services.Size().map_err(winrt)? {
        let service = services.GetAt(i).map_err(winrt)?;
        let service_uuid = to_uuid(service.Uuid().map_err(winrt)?);
        let chars = service
            .GetCharacteristicsWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(winrt)?
            .await
            .map_err(winrt)?;
        if let Err(e) = check(chars.Status().map_err(winrt)?) {
            warn!("Skipping service {}: {}", service_uuid, e);
            continue;
        }

        let list = chars.Characteristics().map_err(winrt)?;
        let mut characteristics = Vec::new();
        for j in 0..list.Size().map_err(winrt)? {
            let c = list.GetAt(j).map_err(winrt)?;
            let uuid = to_uuid(c.Uuid().map_err(winrt)?);
            // WinRT uses the same bit values as the declaration.
            let bits = c.CharacteristicProperties().map_err(winrt)?.0 as u8;
            characteristics.push(GattCharacteristic {
                uuid,
                properties: CharacteristicProperties::from_bits(bits),
            });
            handles.insert(uuid, c);
        }
        tree.push(GattService {
            uuid: service_uuid,
            characteristics,
        });
    }

    info!("Discovered {} services on {}", tree.len(), link.address);
    if let Some(state) = lock(links).get_mut(link) {
        state.characteristics = handles;
    }
    Ok(tree)
}

async fn set_notifications(
    links: &Links,
    link: LinkId,
    uuid: Uuid,
    mode: NotificationMode,
    sink: &CompletionSink,
) -> Result<(), ConnectionError> {
    let c = characteristic_of(links, link, uuid)?;

    if mode != NotificationMode::Disabled {
        let registered = lock(links)
            .get(link)
            .is_some_and(|state| state.value_tokens.contains_key(&uuid));
        if !registered {
            let value_sink = sink.clone();
            let handler = TypedEventHandler::new(
                move |_: Ref<WinCharacteristic>, args: Ref<GattValueChangedEventArgs>| {
                    if let Some(args) = args.as_ref() {
                        let value = read_buffer(&args.CharacteristicValue()?)?;
                        value_sink.notification(link, uuid, &value);
                    }
                    Ok(())
                },
            );
            let token = c.ValueChanged(&handler).map_err(winrt)?;
            if let Some(state) = lock(links).get_mut(link) {
                state.value_tokens.insert(uuid, token);
            }
        }
    }

    let value = match mode {
        NotificationMode::Notify => GattClientCharacteristicConfigurationDescriptorValue::Notify,
        NotificationMode::Indicate => GattClientCharacteristicConfigurationDescriptorValue::Indicate,
        NotificationMode::Disabled => GattClientCharacteristicConfigurationDescriptorValue::None,
    };
    let status = c
        .WriteClientCharacteristicConfigurationDescriptorAsync(value)
        .map_err(winrt)?
        .await
        .map_err(winrt)?;
    check(status)?;

    if mode == NotificationMode::Disabled {
        let token = lock(links)
            .get_mut(link)
            .and_then(|state| state.value_tokens.remove(&uuid));
        if let Some(token) = token {
            let _ = c.RemoveValueChanged(token);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_round_trip_keeps_field_order() {
        let uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
        let guid = GUID::from_u128(uuid.as_u128());
        assert_eq!(guid.data1, 0x6e400001);
        assert_eq!(guid.data2, 0xb5a3);
        assert_eq!(guid.data3, 0xf393);
        assert_eq!(to_uuid(guid), uuid);
    }
}
