use crate::{
    error::ConnectError,
    session::HeartRateSession,
    types::{
        BatteryLevel, ConnectivityState, DeviceId, HeartRateSample, ScannedDevice,
    },
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{info, warn};

const CHANNEL_CAPACITY: usize = 64;
const DEMO_SEED: u64 = 0x5EED_CAFE;
const DEMO_BATTERY_LEVEL: u8 = 85;

/// Deterministic BPM source: a slow sine swell around a resting rate with
/// a small amount of pseudo-random jitter. Same seed, same sequence.
struct BpmGenerator {
    step: u64,
    lcg: u64,
}

impl BpmGenerator {
    const fn new(seed: u64) -> Self {
        Self { step: 0, lcg: seed }
    }

    fn next_bpm(&mut self) -> u16 {
        let phase = (self.step as f64) * std::f64::consts::TAU / 60.0;
        let base = 72.0 + 8.0 * phase.sin();

        self.lcg = self
            .lcg
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let jitter = ((self.lcg >> 33) % 5) as i64 - 2;

        self.step += 1;
        (base as i64 + jitter).clamp(40, 220) as u16
    }
}

struct DemoState {
    connectivity: ConnectivityState,
    connected: bool,
    last_bpm: Option<u16>,
}

struct DemoShared {
    state: RwLock<DemoState>,
    state_tx: broadcast::Sender<ConnectivityState>,
    sample_tx: broadcast::Sender<HeartRateSample>,
    battery_tx: broadcast::Sender<BatteryLevel>,
    scan_tx: broadcast::Sender<Vec<ScannedDevice>>,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl DemoShared {
    async fn publish_state(&self, next: ConnectivityState) {
        let mut state = self.state.write().await;
        if state.connectivity == next {
            return;
        }
        state.connectivity = next;
        drop(state);
        let _ = self.state_tx.send(next);
    }

    async fn stop_generator(&self) {
        if let Some(handle) = self.generator.lock().await.take() {
            handle.abort();
        }
        self.state.write().await.connected = false;
    }
}

/// Synthetic [`HeartRateSession`] that needs no hardware.
///
/// Runs the same lifecycle as the hardware session, with connects that
/// always succeed instantly and a deterministic sample stream at one-second
/// cadence. [`inject_drop`] simulates the strap falling off, so reconnection
/// and recording flows can be exercised on a desk.
///
/// [`inject_drop`]: DemoSession::inject_drop
pub struct DemoSession {
    shared: Arc<DemoShared>,
}

impl Default for DemoSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoSession {
    /// Create a disconnected demo session.
    #[must_use]
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (sample_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (battery_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (scan_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(DemoShared {
                state: RwLock::new(DemoState {
                    connectivity: ConnectivityState::Disconnected,
                    connected: false,
                    last_bpm: None,
                }),
                state_tx,
                sample_tx,
                battery_tx,
                scan_tx,
                generator: Mutex::new(None),
            }),
        }
    }

    /// Simulate the device dropping the connection unexpectedly.
    pub async fn inject_drop(&self) {
        if !self.shared.state.read().await.connected {
            return;
        }
        warn!("demo device dropped the connection");
        self.shared.stop_generator().await;
        self.shared
            .publish_state(ConnectivityState::Disconnected)
            .await;
    }
}

#[async_trait]
impl HeartRateSession for DemoSession {
    async fn scan(&self) -> Result<broadcast::Receiver<Vec<ScannedDevice>>, ConnectError> {
        let receiver = self.shared.scan_tx.subscribe();
        let _ = self.shared.scan_tx.send(vec![ScannedDevice::demo()]);
        Ok(receiver)
    }

    async fn connect(&self, id: &DeviceId) -> Result<(), ConnectError> {
        if !id.is_demo() {
            return Err(ConnectError::DeviceNotFound(id.clone()));
        }

        self.shared.stop_generator().await;
        info!("connecting to the demo device");
        self.shared
            .publish_state(ConnectivityState::Connecting)
            .await;

        let shared = Arc::clone(&self.shared);
        *self.shared.generator.lock().await = Some(tokio::spawn(run_generator(shared)));
        self.shared.state.write().await.connected = true;

        let _ = self
            .shared
            .battery_tx
            .send(BatteryLevel::Level(DEMO_BATTERY_LEVEL));
        self.shared
            .publish_state(ConnectivityState::Connected)
            .await;
        info!("demo device connected");
        Ok(())
    }

    async fn disconnect(&self) {
        if self.shared.state.read().await.connected {
            info!("disconnecting the demo device");
        }
        self.shared.stop_generator().await;
        self.shared
            .publish_state(ConnectivityState::Disconnected)
            .await;
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
        if self.shared.state.read().await.connected {
            Some(DeviceId::demo())
        } else {
            None
        }
    }
}

/// Emit one synthetic sample per second until aborted.
async fn run_generator(shared: Arc<DemoShared>) {
    let mut generator = BpmGenerator::new(DEMO_SEED);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let bpm = generator.next_bpm();
        shared.state.write().await.last_bpm = Some(bpm);
        let _ = shared.sample_tx.send(HeartRateSample::new(bpm));
    }
}
