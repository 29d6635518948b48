use async_trait::async_trait;
use btleplug::{
    api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter},
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::{BoxStream, StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{error::HardwareError, types::DeviceId};

/// A single advertisement report captured during scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform identifier of the advertising device.
    pub id: DeviceId,
    /// Advertised local name, when the device broadcasts one.
    pub local_name: Option<String>,
    /// Advertised service UUIDs; frequently empty on heart-rate straps.
    pub services: Vec<Uuid>,
    /// Signal strength at capture time.
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// The advertised name, or a placeholder for nameless devices.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.local_name.as_deref().unwrap_or("Unknown")
    }
}

/// Connection-level event surfaced by the transport backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An advertisement arrived during a scan.
    Discovered(Advertisement),
    /// A device finished connecting.
    Connected(DeviceId),
    /// A device dropped its connection, for any reason.
    Disconnected(DeviceId),
}

/// One GATT service with its characteristic identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// UUIDs of the characteristics the service exposes.
    pub characteristics: Vec<Uuid>,
}

/// A value delivered by a characteristic, via notification or read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicValue {
    /// Characteristic the value came from.
    pub uuid: Uuid,
    /// Raw payload bytes.
    pub value: Vec<u8>,
}

/// Adapter-level transport operations.
///
/// [`BtleplugCentral`] is the production implementation;
/// [`MockCentral`](crate::mock::MockCentral) is the scriptable test double.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Start scanning for nearby devices.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError`] if the adapter rejects the scan request.
    async fn start_scan(&self) -> Result<(), HardwareError>;

    /// Stop an active scan. Stopping when no scan is running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError`] if the adapter rejects the request.
    async fn stop_scan(&self) -> Result<(), HardwareError>;

    /// Stream of transport events: advertisements, connects, disconnects.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError`] if the adapter cannot produce an event
    /// stream.
    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>, HardwareError>;

    /// Devices the platform can already address without a fresh scan
    /// (bonded or previously seen by the adapter).
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError`] if the platform enumeration fails.
    async fn known_devices(&self) -> Result<Vec<DeviceId>, HardwareError>;

    /// Establish a connection to a device and hand back its GATT surface.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError`] if the device is unknown to the adapter or
    /// the link cannot be established.
    async fn connect(&self, id: &DeviceId) -> Result<Arc<dyn BlePeripheral>, HardwareError>;
}

/// GATT operations on one connected device.
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Platform identifier of this device.
    fn id(&self) -> DeviceId;

    /// Run service discovery. Must complete before [`services`] is useful.
    ///
    /// [`services`]: BlePeripheral::services
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError`] if discovery fails.
    async fn discover_services(&self) -> Result<(), HardwareError>;

    /// Services found by the most recent discovery.
    async fn services(&self) -> Vec<GattService>;

    /// Enable notifications on a characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError`] if the characteristic is absent or the
    /// subscription is rejected.
    async fn subscribe(&self, characteristic: Uuid) -> Result<(), HardwareError>;

    /// Disable notifications on a characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError`] if the characteristic is absent or the
    /// request is rejected.
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), HardwareError>;

    /// Read a characteristic value.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError`] if the characteristic is absent or the read
    /// fails.
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, HardwareError>;

    /// Stream of notification values from every subscribed characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError`] if the notification stream cannot be opened.
    async fn notifications(
        &self,
    ) -> Result<BoxStream<'static, CharacteristicValue>, HardwareError>;

    /// Tear down the link. Disconnecting an already-dropped link is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError`] if the adapter rejects the request.
    async fn disconnect(&self) -> Result<(), HardwareError>;
}

/// Production [`BleCentral`] backed by btleplug.
///
/// Keeps a handle map of every peripheral seen while scanning so that
/// connect-by-id works even when the platform enumeration would not return
/// the device (freshly scanned, never bonded).
pub struct BtleplugCentral {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<DeviceId, Peripheral>>>,
}

impl BtleplugCentral {
    /// Bind to the first Bluetooth adapter on the system.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError::AdapterUnavailable`] when the system has no
    /// adapter, or [`HardwareError::Ble`] if the stack cannot be initialized.
    pub async fn new() -> Result<Self, HardwareError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(HardwareError::AdapterUnavailable)?;

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Resolve a device id to a peripheral handle, preferring the scan map
    /// and falling back to the platform enumeration.
    async fn resolve(&self, id: &DeviceId) -> Result<Peripheral, HardwareError> {
        {
            let peripherals = self.peripherals.lock().await;
            if let Some(peripheral) = peripherals.get(id) {
                return Ok(peripheral.clone());
            }
        }

        debug!("device {id} not in scan map, checking platform enumeration");
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.id().to_string() == id.as_str() {
                self.peripherals
                    .lock()
                    .await
                    .insert(id.clone(), peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(HardwareError::Backend(format!(
            "device {id} is not known to the adapter"
        )))
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn start_scan(&self) -> Result<(), HardwareError> {
        // Unfiltered on purpose: straps that advertise no service UUIDs
        // would never pass an adapter-side service filter.
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("BLE scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), HardwareError> {
        self.adapter.stop_scan().await?;
        info!("BLE scan stopped");
        Ok(())
    }

    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>, HardwareError> {
        let events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let peripherals = Arc::clone(&self.peripherals);

        let stream = events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                let peripherals = Arc::clone(&peripherals);
                async move {
                    match event {
                        CentralEvent::DeviceDiscovered(pid)
                        | CentralEvent::DeviceUpdated(pid)
                        | CentralEvent::ServicesAdvertisement { id: pid, .. } => {
                            snapshot_advertisement(&adapter, &peripherals, &pid).await
                        }
                        CentralEvent::DeviceConnected(pid) => {
                            Some(TransportEvent::Connected(DeviceId::new(pid.to_string())))
                        }
                        CentralEvent::DeviceDisconnected(pid) => {
                            Some(TransportEvent::Disconnected(DeviceId::new(pid.to_string())))
                        }
                        _ => None,
                    }
                }
            })
            .boxed();

        Ok(stream)
    }

    async fn known_devices(&self) -> Result<Vec<DeviceId>, HardwareError> {
        let mut ids = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let id = DeviceId::new(peripheral.id().to_string());
            self.peripherals
                .lock()
                .await
                .insert(id.clone(), peripheral);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn connect(&self, id: &DeviceId) -> Result<Arc<dyn BlePeripheral>, HardwareError> {
        let peripheral = self.resolve(id).await?;
        peripheral.connect().await?;
        info!("connected to {id}");
        Ok(Arc::new(BtleplugPeripheral { peripheral }))
    }
}

/// Turn a discovery event into an advertisement, caching the handle for
/// later connect-by-id.
async fn snapshot_advertisement(
    adapter: &Adapter,
    peripherals: &Mutex<HashMap<DeviceId, Peripheral>>,
    pid: &PeripheralId,
) -> Option<TransportEvent> {
    let peripheral = adapter.peripheral(pid).await.ok()?;
    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        Ok(None) => return None,
        Err(e) => {
            warn!("failed to read properties for {pid}: {e}");
            return None;
        }
    };

    let id = DeviceId::new(pid.to_string());
    peripherals.lock().await.insert(id.clone(), peripheral);

    Some(TransportEvent::Discovered(Advertisement {
        id,
        local_name: properties.local_name,
        services: properties.services,
        rssi: properties.rssi,
    }))
}

/// Production [`BlePeripheral`] wrapping a connected btleplug peripheral.
pub struct BtleplugPeripheral {
    peripheral: Peripheral,
}

impl BtleplugPeripheral {
    /// Find a characteristic by UUID across every discovered service.
    fn characteristic(
        &self,
        uuid: Uuid,
    ) -> Result<btleplug::api::Characteristic, HardwareError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| {
                HardwareError::Backend(format!("characteristic {uuid} not present on device"))
            })
    }
}

#[async_trait]
impl BlePeripheral for BtleplugPeripheral {
    fn id(&self) -> DeviceId {
        DeviceId::new(self.peripheral.id().to_string())
    }

    async fn discover_services(&self) -> Result<(), HardwareError> {
        self.peripheral.discover_services().await?;
        Ok(())
    }

    async fn services(&self) -> Vec<GattService> {
        self.peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| c.uuid)
                    .collect(),
            })
            .collect()
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), HardwareError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), HardwareError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, HardwareError> {
        let characteristic = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn notifications(
        &self,
    ) -> Result<BoxStream<'static, CharacteristicValue>, HardwareError> {
        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .map(|n| CharacteristicValue {
                uuid: n.uuid,
                value: n.value,
            })
            .boxed())
    }

    async fn disconnect(&self) -> Result<(), HardwareError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
