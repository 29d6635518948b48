use crate::{
    ble::{BleCentral, BlePeripheral, CharacteristicValue, TransportEvent},
    codec,
    demo::DemoSession,
    error::ConnectError,
    registry::DeviceRegistry,
    storage::{self, SettingsStore},
    types::{
        BatteryLevel, ConnectivityState, DeviceId, HeartRateSample, ScannedDevice, SessionConfig,
    },
    BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID,
    HEART_RATE_SERVICE_UUID,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
    time::{sleep, sleep_until, timeout, Instant},
};
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 64;

/// One heart-rate device connection with its live data streams.
///
/// [`BleSession`] talks to real hardware; [`DemoSession`] produces synthetic
/// data with identical lifecycle behavior. Both are driven through this
/// trait, so everything above the session (reconnection, recording, UI)
/// works against either without knowing which it has.
#[async_trait]
pub trait HeartRateSession: Send + Sync {
    /// Start (or restart) a device scan and stream snapshots of the devices
    /// found so far. The hardware scan stops itself after the configured
    /// window; dropping the receiver does not affect it.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Hardware`] if scanning cannot start.
    async fn scan(&self) -> Result<broadcast::Receiver<Vec<ScannedDevice>>, ConnectError>;

    /// Connect to a device and enable heart-rate notifications.
    ///
    /// On any failure the session cleans up, lands in
    /// [`ConnectivityState::Disconnected`], and reports the original error.
    ///
    /// # Errors
    ///
    /// See [`ConnectError`] for the failure taxonomy.
    async fn connect(&self, id: &DeviceId) -> Result<(), ConnectError>;

    /// Tear the connection down. Infallible: hardware teardown errors are
    /// logged and the session still lands in `Disconnected`. Disconnecting
    /// while already disconnected is a no-op.
    async fn disconnect(&self);

    /// Subscribe to decoded heart-rate samples. Every subscriber sees every
    /// sample; slow subscribers lose the oldest values first.
    fn subscribe_to_heart_rate(&self) -> broadcast::Receiver<HeartRateSample>;

    /// Subscribe to battery level reports. Best-effort: devices without the
    /// Battery service never produce a value here.
    fn battery_updates(&self) -> broadcast::Receiver<BatteryLevel>;

    /// Subscribe to connectivity transitions, in order, without consecutive
    /// duplicates.
    fn monitor_connectivity(&self) -> broadcast::Receiver<ConnectivityState>;

    /// The current connectivity state.
    async fn connectivity(&self) -> ConnectivityState;

    /// The most recent BPM decoded during this or an earlier connection.
    async fn last_known_bpm(&self) -> Option<u16>;

    /// The device currently connected, if any.
    async fn connected_device(&self) -> Option<DeviceId>;
}

/// Pick the right session strategy for a device identifier.
///
/// The demo identifier gets a [`DemoSession`]; everything else gets a
/// [`BleSession`] over the given transport.
///
/// # Errors
///
/// Returns [`ConnectError::Hardware`] if the hardware session cannot bind
/// to the transport event stream.
pub async fn session_for(
    id: &DeviceId,
    central: Arc<dyn BleCentral>,
    store: Arc<dyn SettingsStore>,
    config: SessionConfig,
) -> Result<Arc<dyn HeartRateSession>, ConnectError> {
    if id.is_demo() {
        Ok(Arc::new(DemoSession::new()))
    } else {
        Ok(Arc::new(BleSession::new(central, store, config).await?))
    }
}

struct SessionInner {
    peripheral: Option<Arc<dyn BlePeripheral>>,
    battery_subscribed: bool,
    pump: Option<JoinHandle<()>>,
    scan_window: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
}

struct StateSnapshot {
    connectivity: ConnectivityState,
    connected_device: Option<DeviceId>,
    last_bpm: Option<u16>,
}

struct SessionShared {
    central: Arc<dyn BleCentral>,
    store: Arc<dyn SettingsStore>,
    config: SessionConfig,
    scanning: AtomicBool,
    registry: Mutex<DeviceRegistry>,
    inner: Mutex<SessionInner>,
    state: RwLock<StateSnapshot>,
    state_tx: broadcast::Sender<ConnectivityState>,
    sample_tx: broadcast::Sender<HeartRateSample>,
    battery_tx: broadcast::Sender<BatteryLevel>,
    scan_tx: broadcast::Sender<Vec<ScannedDevice>>,
}

impl SessionShared {
    /// Publish a connectivity transition, suppressing consecutive
    /// duplicates.
    async fn publish_state(&self, next: ConnectivityState) {
        let mut state = self.state.write().await;
        if state.connectivity == next {
            return;
        }
        state.connectivity = next;
        drop(state);
        debug!("connectivity -> {next}");
        let _ = self.state_tx.send(next);
    }

    /// Best-effort teardown after a failed connect attempt. The original
    /// error stays with the caller; secondary errors are only logged.
    async fn fail_connect(&self, peripheral: Option<&Arc<dyn BlePeripheral>>) {
        if let Some(peripheral) = peripheral {
            if let Err(e) = peripheral.disconnect().await {
                warn!("cleanup disconnect failed: {e}");
            }
        }
        self.publish_state(ConnectivityState::Disconnected).await;
    }

    fn send_scan_snapshot(&self, mut devices: Vec<ScannedDevice>) {
        devices.push(ScannedDevice::demo());
        let _ = self.scan_tx.send(devices);
    }
}

/// Hardware-backed [`HeartRateSession`] over a [`BleCentral`] transport.
pub struct BleSession {
    shared: Arc<SessionShared>,
}

impl BleSession {
    /// Create a session over the given transport, settings store, and
    /// timing configuration, and start watching transport events.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Hardware`] if the transport cannot produce
    /// an event stream.
    pub async fn new(
        central: Arc<dyn BleCentral>,
        store: Arc<dyn SettingsStore>,
        config: SessionConfig,
    ) -> Result<Self, ConnectError> {
        let (state_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (sample_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (battery_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (scan_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        let registry = DeviceRegistry::new(Duration::from_millis(config.registry_grace_ms));
        let events = central.events().await?;

        let shared = Arc::new(SessionShared {
            central,
            store,
            config,
            scanning: AtomicBool::new(false),
            registry: Mutex::new(registry),
            inner: Mutex::new(SessionInner {
                peripheral: None,
                battery_subscribed: false,
                pump: None,
                scan_window: None,
                grace_timer: None,
            }),
            state: RwLock::new(StateSnapshot {
                connectivity: ConnectivityState::Disconnected,
                connected_device: None,
                last_bpm: None,
            }),
            state_tx,
            sample_tx,
            battery_tx,
            scan_tx,
        });

        tokio::spawn(run_transport_watcher(Arc::clone(&shared), events));

        Ok(Self { shared })
    }
}

#[async_trait]
impl HeartRateSession for BleSession {
    async fn scan(&self) -> Result<broadcast::Receiver<Vec<ScannedDevice>>, ConnectError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;

        if let Some(handle) = inner.scan_window.take() {
            handle.abort();
        }
        if let Some(handle) = inner.grace_timer.take() {
            handle.abort();
        }
        if shared.scanning.swap(false, Ordering::SeqCst) {
            if let Err(e) = shared.central.stop_scan().await {
                warn!("failed to stop previous scan: {e}");
            }
        }

        shared.registry.lock().await.clear();
        shared.central.start_scan().await.map_err(ConnectError::from)?;
        shared.scanning.store(true, Ordering::SeqCst);
        info!("device scan started");

        let receiver = shared.scan_tx.subscribe();
        shared.send_scan_snapshot(Vec::new());

        // Both timers anchor to the scan call, not to when their tasks first run
        let window_deadline = Instant::now() + Duration::from_millis(shared.config.scan_window_ms);
        let window_shared = Arc::clone(shared);
        inner.scan_window = Some(tokio::spawn(async move {
            sleep_until(window_deadline).await;
            window_shared.scanning.store(false, Ordering::SeqCst);
            if let Err(e) = window_shared.central.stop_scan().await {
                warn!("failed to stop scan at window end: {e}");
            }
            info!("scan window elapsed");
        }));

        let grace_deadline = Instant::now() + Duration::from_millis(shared.config.registry_grace_ms);
        let grace_shared = Arc::clone(shared);
        inner.grace_timer = Some(tokio::spawn(async move {
            sleep_until(grace_deadline).await;
            let mut registry = grace_shared.registry.lock().await;
            if registry.grace_flush() {
                let snapshot = registry.snapshot();
                drop(registry);
                grace_shared.send_scan_snapshot(snapshot);
            }
        }));

        Ok(receiver)
    }

    async fn connect(&self, id: &DeviceId) -> Result<(), ConnectError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;

        // A connect supersedes any existing connection.
        if shared.state.read().await.connected_device.is_some() {
            info!("dropping current connection before connecting to {id}");
            teardown(shared, &mut inner).await;
        }

        info!("connecting to {id}");
        shared.publish_state(ConnectivityState::Connecting).await;

        let seen_in_scan = shared.registry.lock().await.lookup(id).is_some();
        if !seen_in_scan {
            let known = match shared.central.known_devices().await {
                Ok(known) => known,
                Err(e) => {
                    error!("platform device enumeration failed: {e}");
                    shared.fail_connect(None).await;
                    return Err(e.into());
                }
            };
            if !known.contains(id) {
                error!("device {id} not found in scan results or platform list");
                shared.fail_connect(None).await;
                return Err(ConnectError::DeviceNotFound(id.clone()));
            }
            debug!("device {id} resolved from the platform list");
        }

        let timeout_ms = shared.config.connect_timeout_ms;
        let peripheral = match timeout(
            Duration::from_millis(timeout_ms),
            shared.central.connect(id),
        )
        .await
        {
            Err(_) => {
                error!("connect to {id} timed out after {timeout_ms}ms");
                shared.fail_connect(None).await;
                return Err(ConnectError::Timeout { timeout_ms });
            }
            Ok(Err(e)) => {
                error!("connect to {id} failed: {e}");
                shared.fail_connect(None).await;
                return Err(e.into());
            }
            Ok(Ok(peripheral)) => peripheral,
        };

        if let Err(e) = peripheral.discover_services().await {
            error!("service discovery on {id} failed: {e}");
            shared.fail_connect(Some(&peripheral)).await;
            return Err(e.into());
        }
        let mut services = peripheral.services().await;
        if !services.iter().any(|s| s.uuid == HEART_RATE_SERVICE_UUID) {
            // Some straps need a moment before their GATT table is complete.
            debug!("heart rate service not yet visible on {id}, retrying discovery");
            sleep(Duration::from_millis(shared.config.discovery_retry_delay_ms)).await;
            if let Err(e) = peripheral.discover_services().await {
                error!("repeat service discovery on {id} failed: {e}");
                shared.fail_connect(Some(&peripheral)).await;
                return Err(e.into());
            }
            services = peripheral.services().await;
        }

        let Some(service) = services.iter().find(|s| s.uuid == HEART_RATE_SERVICE_UUID) else {
            error!("device {id} does not expose the heart rate service");
            shared.fail_connect(Some(&peripheral)).await;
            return Err(ConnectError::ServiceNotFound);
        };
        if !service
            .characteristics
            .contains(&HEART_RATE_MEASUREMENT_UUID)
        {
            error!("device {id} is missing the measurement characteristic");
            shared.fail_connect(Some(&peripheral)).await;
            return Err(ConnectError::CharacteristicNotFound);
        }

        // Notifications are per physical connection, so this runs on every
        // connect, reconnections included.
        if let Err(e) = peripheral.subscribe(HEART_RATE_MEASUREMENT_UUID).await {
            error!("enabling heart rate notifications on {id} failed: {e}");
            shared.fail_connect(Some(&peripheral)).await;
            return Err(e.into());
        }

        let mut battery_subscribed = false;
        let battery_present = services.iter().any(|s| {
            s.uuid == BATTERY_SERVICE_UUID && s.characteristics.contains(&BATTERY_LEVEL_UUID)
        });
        if battery_present {
            match peripheral.read(BATTERY_LEVEL_UUID).await {
                Ok(payload) => match codec::parse_battery_level(&payload) {
                    Ok(level) => {
                        debug!("battery level on {id}: {level}");
                        let _ = shared.battery_tx.send(level);
                    }
                    Err(e) => warn!("undecodable battery level from {id}: {e}"),
                },
                Err(e) => warn!("battery level read on {id} failed: {e}"),
            }
            match peripheral.subscribe(BATTERY_LEVEL_UUID).await {
                Ok(()) => battery_subscribed = true,
                Err(e) => warn!("battery notifications on {id} unavailable: {e}"),
            }
        }

        let notifications = match peripheral.notifications().await {
            Ok(notifications) => notifications,
            Err(e) => {
                error!("opening the notification stream for {id} failed: {e}");
                shared.fail_connect(Some(&peripheral)).await;
                return Err(e.into());
            }
        };

        inner.pump = Some(tokio::spawn(run_notification_pump(
            Arc::clone(shared),
            notifications,
        )));
        inner.peripheral = Some(Arc::clone(&peripheral));
        inner.battery_subscribed = battery_subscribed;

        {
            let mut state = shared.state.write().await;
            state.connected_device = Some(id.clone());
        }
        storage::save_last_device(shared.store.as_ref(), id).await;

        shared.publish_state(ConnectivityState::Connected).await;
        info!("connected to {id}, notifications active");
        Ok(())
    }

    async fn disconnect(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;

        if inner.peripheral.is_some() {
            info!("disconnecting");
        }
        teardown(shared, &mut inner).await;
        shared.publish_state(ConnectivityState::Disconnected).await;
    }

    fn subscribe_to_heart_rate(&self) -> broadcast::Receiver<HeartRateSample> {
        self.shared.sample_tx.subscribe()
    }

    fn battery_updates(&self) -> broadcast::Receiver<BatteryLevel> {
        self.shared.battery_tx.subscribe()
    }

    fn monitor_connectivity(&self) -> broadcast::Receiver<ConnectivityState> {
        self.shared.state_tx.subscribe()
    }

    async fn connectivity(&self) -> ConnectivityState {
        self.shared.state.read().await.connectivity
    }

    async fn last_known_bpm(&self) -> Option<u16> {
        self.shared.state.read().await.last_bpm
    }

    async fn connected_device(&self) -> Option<DeviceId> {
        self.shared.state.read().await.connected_device.clone()
    }
}

/// Stop the pump, release hardware subscriptions, and drop the link.
/// Everything is best-effort; the session ends up disconnected regardless.
async fn teardown(shared: &SessionShared, inner: &mut SessionInner) {
    if let Some(pump) = inner.pump.take() {
        pump.abort();
    }

    if let Some(peripheral) = inner.peripheral.take() {
        if let Err(e) = peripheral.unsubscribe(HEART_RATE_MEASUREMENT_UUID).await {
            debug!("heart rate unsubscribe failed: {e}");
        }
        if inner.battery_subscribed {
            if let Err(e) = peripheral.unsubscribe(BATTERY_LEVEL_UUID).await {
                debug!("battery unsubscribe failed: {e}");
            }
        }
        if let Err(e) = peripheral.disconnect().await {
            warn!("hardware disconnect failed, treating as disconnected: {e}");
        }
    }
    inner.battery_subscribed = false;

    shared.state.write().await.connected_device = None;
}

/// Consume transport events: feed the registry while scanning and surface
/// hardware-initiated disconnects. Exits when the transport closes the
/// stream.
async fn run_transport_watcher(
    shared: Arc<SessionShared>,
    mut events: BoxStream<'static, TransportEvent>,
) {
    while let Some(event) = events.next().await {
        match event {
            TransportEvent::Discovered(advertisement) => {
                if !shared.scanning.load(Ordering::SeqCst) {
                    continue;
                }
                let mut registry = shared.registry.lock().await;
                if registry.record(advertisement) {
                    let snapshot = registry.snapshot();
                    drop(registry);
                    shared.send_scan_snapshot(snapshot);
                }
            }
            TransportEvent::Connected(id) => {
                debug!("transport reports {id} connected");
            }
            TransportEvent::Disconnected(id) => {
                let mut inner = shared.inner.lock().await;
                let ours = shared.state.read().await.connected_device.as_ref() == Some(&id);
                if !ours {
                    debug!("ignoring disconnect event for {id}");
                    continue;
                }

                warn!("device {id} dropped the connection");
                if let Some(pump) = inner.pump.take() {
                    pump.abort();
                }
                inner.peripheral = None;
                inner.battery_subscribed = false;
                shared.state.write().await.connected_device = None;
                shared.publish_state(ConnectivityState::Disconnected).await;
            }
        }
    }
    debug!("transport event stream ended");
}

/// Decode notifications into samples and battery levels. Malformed payloads
/// are logged and dropped; the stream continues with the next notification.
async fn run_notification_pump(
    shared: Arc<SessionShared>,
    mut notifications: BoxStream<'static, CharacteristicValue>,
) {
    while let Some(value) = notifications.next().await {
        if value.uuid == HEART_RATE_MEASUREMENT_UUID {
            match codec::parse_heart_rate(&value.value) {
                Ok(bpm) => {
                    shared.state.write().await.last_bpm = Some(bpm);
                    let _ = shared.sample_tx.send(HeartRateSample::new(bpm));
                }
                Err(e) => {
                    warn!("dropping malformed heart rate payload ({e}): {:02X?}", value.value);
                }
            }
        } else if value.uuid == BATTERY_LEVEL_UUID {
            match codec::parse_battery_level(&value.value) {
                Ok(level) => {
                    let _ = shared.battery_tx.send(level);
                }
                Err(e) => warn!("dropping malformed battery payload: {e}"),
            }
        }
    }
    debug!("notification stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ble::{Advertisement, GattService},
        mock::{MockCentral, MockPeripheral},
        storage::{MemorySettingsStore, LAST_DEVICE_KEY},
    };

    fn strap_id() -> DeviceId {
        DeviceId::new("AA:BB:CC:DD:EE:FF")
    }

    fn strap_advertisement() -> Advertisement {
        Advertisement {
            id: strap_id(),
            local_name: Some("Polar H10".to_string()),
            services: vec![HEART_RATE_SERVICE_UUID],
            rssi: Some(-58),
        }
    }

    async fn session_over(central: &Arc<MockCentral>) -> (BleSession, Arc<MemorySettingsStore>) {
        let store = Arc::new(MemorySettingsStore::new());
        let session = BleSession::new(
            Arc::clone(central) as Arc<dyn BleCentral>,
            Arc::clone(&store) as Arc<dyn SettingsStore>,
            SessionConfig::default(),
        )
        .await
        .unwrap();
        (session, store)
    }

    /// Let spawned tasks drain their queues on the test runtime.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_happy_path() {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(MockPeripheral::new(strap_id()).with_heart_rate_service());
        central.add_known_device(Arc::clone(&peripheral)).await;

        let (session, store) = session_over(&central).await;
        let mut states = session.monitor_connectivity();

        session.connect(&strap_id()).await.unwrap();

        assert_eq!(states.recv().await.unwrap(), ConnectivityState::Connecting);
        assert_eq!(states.recv().await.unwrap(), ConnectivityState::Connected);
        assert_eq!(session.connectivity().await, ConnectivityState::Connected);
        assert_eq!(session.connected_device().await, Some(strap_id()));
        assert_eq!(peripheral.subscribe_count(HEART_RATE_MEASUREMENT_UUID).await, 1);
        assert_eq!(
            store.get_setting(LAST_DEVICE_KEY).await.unwrap(),
            Some(strap_id().as_str().to_string())
        );
    }

    #[tokio::test]
    async fn test_samples_flow_after_connect() {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(MockPeripheral::new(strap_id()).with_heart_rate_service());
        central.add_known_device(Arc::clone(&peripheral)).await;

        let (session, _) = session_over(&central).await;
        let mut samples = session.subscribe_to_heart_rate();
        session.connect(&strap_id()).await.unwrap();

        peripheral.push_notification(HEART_RATE_MEASUREMENT_UUID, vec![0x00, 72]);
        peripheral.push_notification(HEART_RATE_MEASUREMENT_UUID, vec![0x01, 0x2C, 0x01]);

        assert_eq!(samples.recv().await.unwrap().bpm, 72);
        assert_eq!(samples.recv().await.unwrap().bpm, 300);
        assert_eq!(session.last_known_bpm().await, Some(300));
    }

    #[tokio::test]
    async fn test_malformed_payload_dropped_stream_continues() {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(MockPeripheral::new(strap_id()).with_heart_rate_service());
        central.add_known_device(Arc::clone(&peripheral)).await;

        let (session, _) = session_over(&central).await;
        let mut samples = session.subscribe_to_heart_rate();
        session.connect(&strap_id()).await.unwrap();

        peripheral.push_notification(HEART_RATE_MEASUREMENT_UUID, vec![0x01]);
        peripheral.push_notification(HEART_RATE_MEASUREMENT_UUID, vec![]);
        peripheral.push_notification(HEART_RATE_MEASUREMENT_UUID, vec![0x00, 65]);

        assert_eq!(samples.recv().await.unwrap().bpm, 65);
        assert_eq!(session.connectivity().await, ConnectivityState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(MockPeripheral::new(strap_id()).with_heart_rate_service());
        central.add_known_device(Arc::clone(&peripheral)).await;
        central.script_connect_hang(&strap_id()).await;

        let (session, _) = session_over(&central).await;
        let error = session.connect(&strap_id()).await.unwrap_err();

        assert!(error.is_timeout());
        assert!(matches!(error, ConnectError::Timeout { timeout_ms: 15_000 }));
        assert_eq!(session.connectivity().await, ConnectivityState::Disconnected);
    }

    #[tokio::test]
    async fn test_unknown_device_fails_without_hardware_call() {
        let central = Arc::new(MockCentral::new());
        let (session, _) = session_over(&central).await;

        let id = DeviceId::new("11:22:33:44:55:66");
        let error = session.connect(&id).await.unwrap_err();

        assert!(matches!(error, ConnectError::DeviceNotFound(_)));
        assert_eq!(central.connect_attempts(&id).await, 0);
        assert_eq!(session.connectivity().await, ConnectivityState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_service_after_retry() {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(MockPeripheral::new(strap_id()));
        central.add_known_device(Arc::clone(&peripheral)).await;

        let (session, _) = session_over(&central).await;
        let error = session.connect(&strap_id()).await.unwrap_err();

        assert!(matches!(error, ConnectError::ServiceNotFound));
        // Discovery ran twice before giving up, then cleanup dropped the link
        assert_eq!(peripheral.discover_count(), 2);
        assert_eq!(peripheral.disconnect_count(), 1);
        assert_eq!(session.connectivity().await, ConnectivityState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_gatt_table_recovers_on_retry() {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(MockPeripheral::new(strap_id()).with_discovery_script(vec![
            vec![],
            vec![GattService {
                uuid: HEART_RATE_SERVICE_UUID,
                characteristics: vec![HEART_RATE_MEASUREMENT_UUID],
            }],
        ]));
        central.add_known_device(Arc::clone(&peripheral)).await;

        let (session, _) = session_over(&central).await;
        session.connect(&strap_id()).await.unwrap();

        assert_eq!(peripheral.discover_count(), 2);
        assert_eq!(session.connectivity().await, ConnectivityState::Connected);
    }

    #[tokio::test]
    async fn test_missing_characteristic() {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(MockPeripheral::new(strap_id()).with_services(vec![
            GattService {
                uuid: HEART_RATE_SERVICE_UUID,
                characteristics: vec![],
            },
        ]));
        central.add_known_device(Arc::clone(&peripheral)).await;

        let (session, _) = session_over(&central).await;
        let error = session.connect(&strap_id()).await.unwrap_err();

        assert!(matches!(error, ConnectError::CharacteristicNotFound));
        assert!(error.is_wrong_device());
        assert_eq!(peripheral.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_hardware_drop_lands_disconnected() {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(MockPeripheral::new(strap_id()).with_heart_rate_service());
        central.add_known_device(Arc::clone(&peripheral)).await;

        let (session, _) = session_over(&central).await;
        let mut states = session.monitor_connectivity();
        session.connect(&strap_id()).await.unwrap();
        assert_eq!(states.recv().await.unwrap(), ConnectivityState::Connecting);
        assert_eq!(states.recv().await.unwrap(), ConnectivityState::Connected);

        central.drop_device(&strap_id());
        assert_eq!(states.recv().await.unwrap(), ConnectivityState::Disconnected);
        assert_eq!(session.connected_device().await, None);

        // A duplicate disconnect event for the same device is a no-op
        central.drop_device(&strap_id());
        settle().await;
        assert!(states.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let central = Arc::new(MockCentral::new());
        let (session, _) = session_over(&central).await;
        let mut states = session.monitor_connectivity();

        session.disconnect().await;
        session.disconnect().await;

        settle().await;
        // Already disconnected: no transition was published
        assert!(states.try_recv().is_err());
        assert_eq!(session.connectivity().await, ConnectivityState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_enables_notifications_again() {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(MockPeripheral::new(strap_id()).with_heart_rate_service());
        central.add_known_device(Arc::clone(&peripheral)).await;

        let (session, _) = session_over(&central).await;
        session.connect(&strap_id()).await.unwrap();
        session.disconnect().await;
        session.connect(&strap_id()).await.unwrap();

        assert_eq!(peripheral.subscribe_count(HEART_RATE_MEASUREMENT_UUID).await, 2);
        assert_eq!(peripheral.unsubscribe_count(HEART_RATE_MEASUREMENT_UUID).await, 1);
    }

    #[tokio::test]
    async fn test_connect_while_connected_supersedes() {
        let central = Arc::new(MockCentral::new());
        let first = Arc::new(MockPeripheral::new(strap_id()).with_heart_rate_service());
        let second_id = DeviceId::new("11:22:33:44:55:66");
        let second = Arc::new(MockPeripheral::new(second_id.clone()).with_heart_rate_service());
        central.add_known_device(Arc::clone(&first)).await;
        central.add_known_device(Arc::clone(&second)).await;

        let (session, _) = session_over(&central).await;
        session.connect(&strap_id()).await.unwrap();
        session.connect(&second_id).await.unwrap();

        assert_eq!(first.disconnect_count(), 1);
        assert_eq!(session.connected_device().await, Some(second_id));
    }

    #[tokio::test]
    async fn test_battery_reported_best_effort() {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(
            MockPeripheral::new(strap_id())
                .with_heart_rate_service()
                .with_battery_service(85),
        );
        central.add_known_device(Arc::clone(&peripheral)).await;

        let (session, _) = session_over(&central).await;
        let mut battery = session.battery_updates();
        session.connect(&strap_id()).await.unwrap();

        assert_eq!(battery.recv().await.unwrap(), BatteryLevel::Level(85));
        assert_eq!(peripheral.subscribe_count(BATTERY_LEVEL_UUID).await, 1);
    }

    #[tokio::test]
    async fn test_battery_read_failure_does_not_fail_connect() {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(
            MockPeripheral::new(strap_id())
                .with_heart_rate_service()
                .with_battery_service(85)
                .with_failing_read(BATTERY_LEVEL_UUID),
        );
        central.add_known_device(Arc::clone(&peripheral)).await;

        let (session, _) = session_over(&central).await;
        session.connect(&strap_id()).await.unwrap();
        assert_eq!(session.connectivity().await, ConnectivityState::Connected);
    }

    #[tokio::test]
    async fn test_scan_snapshots_include_demo_entry() {
        let central = Arc::new(MockCentral::new());
        let (session, _) = session_over(&central).await;

        let mut snapshots = session.scan().await.unwrap();
        let first = snapshots.recv().await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].is_demo);

        central.advertise(strap_advertisement());
        let next = snapshots.recv().await.unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].name, "Polar H10");
        assert!(next[1].is_demo);
    }

    #[tokio::test]
    async fn test_scanned_device_connects_without_platform_listing() {
        let central = Arc::new(MockCentral::new());
        let peripheral = Arc::new(MockPeripheral::new(strap_id()).with_heart_rate_service());
        // Registered for connect, but absent from the platform list
        central.add_peripheral(Arc::clone(&peripheral)).await;

        let (session, _) = session_over(&central).await;
        let mut snapshots = session.scan().await.unwrap();
        snapshots.recv().await.unwrap();
        central.advertise(strap_advertisement());
        snapshots.recv().await.unwrap();

        session.connect(&strap_id()).await.unwrap();
        assert_eq!(session.connectivity().await, ConnectivityState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_window_stops_hardware() {
        let central = Arc::new(MockCentral::new());
        let (session, _) = session_over(&central).await;

        let mut snapshots = session.scan().await.unwrap();
        snapshots.recv().await.unwrap();
        assert_eq!(central.scan_starts(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(central.scan_stops(), 1);

        // Advertisements after the window no longer update the list
        central.advertise(strap_advertisement());
        settle().await;
        assert!(snapshots.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scan_start_failure_propagates() {
        let central = Arc::new(MockCentral::new());
        central.fail_next_scan();
        let (session, _) = session_over(&central).await;

        assert!(session.scan().await.is_err());
    }

    #[tokio::test]
    async fn test_session_for_picks_strategy() {
        let central = Arc::new(MockCentral::new());
        let store = Arc::new(MemorySettingsStore::new());

        let demo = session_for(
            &DeviceId::demo(),
            Arc::clone(&central) as Arc<dyn BleCentral>,
            Arc::clone(&store) as Arc<dyn SettingsStore>,
            SessionConfig::default(),
        )
        .await
        .unwrap();
        demo.connect(&DeviceId::demo()).await.unwrap();
        assert_eq!(demo.connectivity().await, ConnectivityState::Connected);

        let hardware = session_for(
            &strap_id(),
            Arc::clone(&central) as Arc<dyn BleCentral>,
            store as Arc<dyn SettingsStore>,
            SessionConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(hardware.connectivity().await, ConnectivityState::Disconnected);
    }
}
