use crate::{
    ble::{
        Advertisement, BleCentral, BlePeripheral, CharacteristicValue, GattService,
        TransportEvent,
    },
    error::HardwareError,
    types::DeviceId,
    BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID,
    HEART_RATE_SERVICE_UUID,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 64;

/// Scriptable in-process [`BleCentral`] for tests and development.
///
/// Register peripherals up front, then drive the transport from the test:
/// [`advertise`] injects scan results, [`drop_device`] simulates a hardware
/// disconnect, and the `script_connect_*` methods make upcoming connect
/// attempts fail or hang.
///
/// [`advertise`]: MockCentral::advertise
/// [`drop_device`]: MockCentral::drop_device
pub struct MockCentral {
    events_tx: broadcast::Sender<TransportEvent>,
    peripherals: Mutex<HashMap<DeviceId, Arc<MockPeripheral>>>,
    known: Mutex<Vec<DeviceId>>,
    connect_script: Mutex<HashMap<DeviceId, VecDeque<ConnectScript>>>,
    connect_attempts: Mutex<HashMap<DeviceId, usize>>,
    scan_starts: AtomicUsize,
    scan_stops: AtomicUsize,
    fail_next_scan: AtomicBool,
}

enum ConnectScript {
    Fail,
    Hang,
}

impl Default for MockCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCentral {
    /// Create an empty mock central.
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            events_tx,
            peripherals: Mutex::new(HashMap::new()),
            known: Mutex::new(Vec::new()),
            connect_script: Mutex::new(HashMap::new()),
            connect_attempts: Mutex::new(HashMap::new()),
            scan_starts: AtomicUsize::new(0),
            scan_stops: AtomicUsize::new(0),
            fail_next_scan: AtomicBool::new(false),
        }
    }

    /// Register a peripheral so connect-by-id can reach it.
    pub async fn add_peripheral(&self, peripheral: Arc<MockPeripheral>) {
        self.peripherals
            .lock()
            .await
            .insert(peripheral.id.clone(), peripheral);
    }

    /// Register a peripheral and list it in the platform enumeration.
    pub async fn add_known_device(&self, peripheral: Arc<MockPeripheral>) {
        self.known.lock().await.push(peripheral.id.clone());
        self.add_peripheral(peripheral).await;
    }

    /// Inject a scan advertisement into the event stream.
    pub fn advertise(&self, advertisement: Advertisement) {
        let _ = self
            .events_tx
            .send(TransportEvent::Discovered(advertisement));
    }

    /// Simulate the device dropping its connection.
    pub fn drop_device(&self, id: &DeviceId) {
        let _ = self.events_tx.send(TransportEvent::Disconnected(id.clone()));
    }

    /// Make the next `times` connect attempts for `id` fail.
    pub async fn script_connect_failure(&self, id: &DeviceId, times: usize) {
        let mut script = self.connect_script.lock().await;
        let queue = script.entry(id.clone()).or_default();
        for _ in 0..times {
            queue.push_back(ConnectScript::Fail);
        }
    }

    /// Make the next connect attempt for `id` hang forever.
    pub async fn script_connect_hang(&self, id: &DeviceId) {
        self.connect_script
            .lock()
            .await
            .entry(id.clone())
            .or_default()
            .push_back(ConnectScript::Hang);
    }

    /// How many connect attempts `id` has received.
    pub async fn connect_attempts(&self, id: &DeviceId) -> usize {
        self.connect_attempts
            .lock()
            .await
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// How many times scanning was started.
    #[must_use]
    pub fn scan_starts(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }

    /// How many times scanning was stopped.
    #[must_use]
    pub fn scan_stops(&self) -> usize {
        self.scan_stops.load(Ordering::SeqCst)
    }

    /// Make the next `start_scan` call fail.
    pub fn fail_next_scan(&self) {
        self.fail_next_scan.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    async fn start_scan(&self) -> Result<(), HardwareError> {
        if self.fail_next_scan.swap(false, Ordering::SeqCst) {
            return Err(HardwareError::Backend("scripted scan failure".to_string()));
        }
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), HardwareError> {
        self.scan_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>, HardwareError> {
        Ok(broadcast_stream(self.events_tx.subscribe()))
    }

    async fn known_devices(&self) -> Result<Vec<DeviceId>, HardwareError> {
        Ok(self.known.lock().await.clone())
    }

    async fn connect(&self, id: &DeviceId) -> Result<Arc<dyn BlePeripheral>, HardwareError> {
        *self
            .connect_attempts
            .lock()
            .await
            .entry(id.clone())
            .or_insert(0) += 1;

        let scripted = self
            .connect_script
            .lock()
            .await
            .get_mut(id)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(ConnectScript::Fail) => {
                return Err(HardwareError::Backend(
                    "scripted connect failure".to_string(),
                ));
            }
            Some(ConnectScript::Hang) => return futures::future::pending().await,
            None => {}
        }

        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| HardwareError::Backend(format!("unknown device {id}")))?;
        let _ = self.events_tx.send(TransportEvent::Connected(id.clone()));
        Ok(peripheral)
    }
}

/// Scriptable in-process [`BlePeripheral`].
///
/// GATT layout is set with the builder methods before the peripheral is
/// registered; notifications are pushed from the test with
/// [`push_notification`].
///
/// [`push_notification`]: MockPeripheral::push_notification
pub struct MockPeripheral {
    id: DeviceId,
    services: Mutex<Vec<GattService>>,
    discovery_script: Mutex<VecDeque<Vec<GattService>>>,
    discover_calls: AtomicUsize,
    subscriptions: Mutex<Vec<Uuid>>,
    unsubscriptions: Mutex<Vec<Uuid>>,
    read_values: Mutex<HashMap<Uuid, Vec<u8>>>,
    failing_reads: Mutex<Vec<Uuid>>,
    notify_tx: broadcast::Sender<CharacteristicValue>,
    disconnects: AtomicUsize,
}

impl MockPeripheral {
    /// Create a peripheral with no services.
    #[must_use]
    pub fn new(id: DeviceId) -> Self {
        let (notify_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            id,
            services: Mutex::new(Vec::new()),
            discovery_script: Mutex::new(VecDeque::new()),
            discover_calls: AtomicUsize::new(0),
            subscriptions: Mutex::new(Vec::new()),
            unsubscriptions: Mutex::new(Vec::new()),
            read_values: Mutex::new(HashMap::new()),
            failing_reads: Mutex::new(Vec::new()),
            notify_tx,
            disconnects: AtomicUsize::new(0),
        }
    }

    /// Set the services every discovery returns.
    #[must_use]
    pub fn with_services(mut self, services: Vec<GattService>) -> Self {
        *self.services.get_mut() = services;
        self
    }

    /// Script per-call discovery results: call *n* exposes entry *n*, and
    /// calls past the end keep the last entry.
    #[must_use]
    pub fn with_discovery_script(mut self, script: Vec<Vec<GattService>>) -> Self {
        *self.discovery_script.get_mut() = script.into();
        self
    }

    /// Add the standard Heart Rate service with its measurement
    /// characteristic.
    #[must_use]
    pub fn with_heart_rate_service(mut self) -> Self {
        self.services.get_mut().push(GattService {
            uuid: HEART_RATE_SERVICE_UUID,
            characteristics: vec![HEART_RATE_MEASUREMENT_UUID],
        });
        self
    }

    /// Add the Battery service with a readable level.
    #[must_use]
    pub fn with_battery_service(mut self, level: u8) -> Self {
        self.services.get_mut().push(GattService {
            uuid: BATTERY_SERVICE_UUID,
            characteristics: vec![BATTERY_LEVEL_UUID],
        });
        self.read_values
            .get_mut()
            .insert(BATTERY_LEVEL_UUID, vec![level]);
        self
    }

    /// Script a read result for a characteristic.
    #[must_use]
    pub fn with_read_value(mut self, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.read_values.get_mut().insert(characteristic, value);
        self
    }

    /// Make every read of a characteristic fail.
    #[must_use]
    pub fn with_failing_read(mut self, characteristic: Uuid) -> Self {
        self.failing_reads.get_mut().push(characteristic);
        self
    }

    /// Deliver a notification to every open notification stream.
    pub fn push_notification(&self, characteristic: Uuid, value: Vec<u8>) {
        let _ = self.notify_tx.send(CharacteristicValue {
            uuid: characteristic,
            value,
        });
    }

    /// How many times notifications were enabled on a characteristic.
    pub async fn subscribe_count(&self, characteristic: Uuid) -> usize {
        self.subscriptions
            .lock()
            .await
            .iter()
            .filter(|&&uuid| uuid == characteristic)
            .count()
    }

    /// How many times notifications were disabled on a characteristic.
    pub async fn unsubscribe_count(&self, characteristic: Uuid) -> usize {
        self.unsubscriptions
            .lock()
            .await
            .iter()
            .filter(|&&uuid| uuid == characteristic)
            .count()
    }

    /// How many times service discovery ran.
    #[must_use]
    pub fn discover_count(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    /// How many times the link was torn down.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    async fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.services
            .lock()
            .await
            .iter()
            .any(|service| service.characteristics.contains(&characteristic))
    }
}

#[async_trait]
impl BlePeripheral for MockPeripheral {
    fn id(&self) -> DeviceId {
        self.id.clone()
    }

    async fn discover_services(&self) -> Result<(), HardwareError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.discovery_script.lock().await.pop_front() {
            *self.services.lock().await = next;
        }
        Ok(())
    }

    async fn services(&self) -> Vec<GattService> {
        self.services.lock().await.clone()
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), HardwareError> {
        if !self.has_characteristic(characteristic).await {
            return Err(HardwareError::Backend(format!(
                "characteristic {characteristic} not present on device"
            )));
        }
        self.subscriptions.lock().await.push(characteristic);
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), HardwareError> {
        self.unsubscriptions.lock().await.push(characteristic);
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, HardwareError> {
        if self.failing_reads.lock().await.contains(&characteristic) {
            return Err(HardwareError::Backend("scripted read failure".to_string()));
        }
        self.read_values
            .lock()
            .await
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| {
                HardwareError::Backend(format!("no value scripted for {characteristic}"))
            })
    }

    async fn notifications(
        &self,
    ) -> Result<BoxStream<'static, CharacteristicValue>, HardwareError> {
        Ok(broadcast_stream(self.notify_tx.subscribe()))
    }

    async fn disconnect(&self) -> Result<(), HardwareError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Adapt a broadcast receiver into the seam's stream type, skipping lag
/// gaps the way a live transport would.
fn broadcast_stream<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
