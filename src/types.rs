use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, SystemTime},
};

/// Opaque platform identifier for a BLE device.
///
/// The wrapped string is whatever the platform backend uses to address a
/// peripheral (a MAC address on Linux, a CoreBluetooth UUID on macOS, and so
/// on). The library never interprets it beyond equality, with one exception:
/// the distinguished demo identifier returned by [`DeviceId::demo`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Identifier of the built-in demo device.
    pub const DEMO: &'static str = "demo-heart-rate-monitor";

    /// Wrap a platform identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier of the synthetic demo device, which is served by
    /// [`DemoSession`](crate::demo::DemoSession) instead of real hardware.
    #[must_use]
    pub fn demo() -> Self {
        Self(Self::DEMO.to_string())
    }

    /// Whether this identifier names the synthetic demo device.
    #[must_use]
    pub fn is_demo(&self) -> bool {
        self.0 == Self::DEMO
    }

    /// The raw platform identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A device observed during the current scan.
///
/// Scanned devices are ephemeral: they exist from the moment a matching
/// advertisement arrives until the next scan clears the registry. Identity is
/// the platform identifier; a later advertisement for the same identifier
/// replaces the earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedDevice {
    /// Platform identifier used to connect.
    pub id: DeviceId,
    /// Human-readable name for the selection UI.
    pub name: String,
    /// Whether this entry is the synthetic demo device.
    pub is_demo: bool,
}

impl ScannedDevice {
    /// Create a scanned-device entry for a real peripheral.
    #[must_use]
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_demo: false,
        }
    }

    /// The entry representing the synthetic demo device.
    #[must_use]
    pub fn demo() -> Self {
        Self {
            id: DeviceId::demo(),
            name: "Demo Heart Rate Monitor".to_string(),
            is_demo: true,
        }
    }
}

/// One decoded heart-rate reading.
///
/// Produced once per BLE notification (typically every 1-2 seconds) and handed
/// straight to subscribers; the session retains nothing beyond the most recent
/// BPM value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// Beats per minute.
    pub bpm: u16,
    /// Wall-clock capture time.
    pub captured_at: SystemTime,
}

impl HeartRateSample {
    /// Create a sample captured now.
    #[must_use]
    pub fn new(bpm: u16) -> Self {
        Self {
            bpm,
            captured_at: SystemTime::now(),
        }
    }
}

/// Battery charge reported by the optional Battery Service.
///
/// Best-effort telemetry: an absent service, a failed read, or the reserved
/// `0xFF` "unavailable" byte all collapse to [`BatteryLevel::Unknown`] and
/// never affect the connection lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryLevel {
    /// Level not reported or not readable.
    #[default]
    Unknown,
    /// Charge percentage, `0..=100`.
    Level(u8),
}

impl From<u8> for BatteryLevel {
    fn from(raw: u8) -> Self {
        if raw <= 100 {
            Self::Level(raw)
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for BatteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Level(pct) => write!(f, "{pct}%"),
        }
    }
}

/// Connection lifecycle state of a session.
///
/// Owned exclusively by the session: sessions emit `Disconnected`,
/// `Connecting` and `Connected`. The `Reconnecting` variant is a display
/// overlay derived via [`ConnectivityState::with_reconnect_overlay`] from the
/// reconnection controller's state; the controller never mutates the
/// session's state directly, it only calls `connect` on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    /// No device connected.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected with notifications active.
    Connected,
    /// Disconnected, with an automatic reconnection campaign running.
    Reconnecting,
}

impl ConnectivityState {
    /// Overlay the reconnection controller's activity onto the session state
    /// for status display. While a campaign runs, everything short of
    /// `Connected` renders as `Reconnecting`.
    #[must_use]
    pub const fn with_reconnect_overlay(self, reconnecting: bool) -> Self {
        match self {
            Self::Connected => self,
            _ if reconnecting => Self::Reconnecting,
            _ => self,
        }
    }

    /// Whether a device is currently connected.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Progress of the automatic reconnection controller.
///
/// A tagged union so that impossible combinations (failed *and* reconnecting)
/// cannot be represented. The flattened accessors ([`is_reconnecting`],
/// [`current_attempt`] and [`has_failed`]) exist for UI code that renders the
/// fields individually.
///
/// [`is_reconnecting`]: ReconnectionState::is_reconnecting
/// [`current_attempt`]: ReconnectionState::current_attempt
/// [`has_failed`]: ReconnectionState::has_failed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconnectionState {
    /// No campaign running and none has failed.
    #[default]
    Idle,
    /// A campaign is running.
    Reconnecting {
        /// Attempt currently in flight, starting at 1.
        attempt: u32,
        /// Attempts the campaign will make before giving up.
        max_attempts: u32,
        /// Most recent BPM reading, for dimmed display.
        last_known_bpm: Option<u16>,
    },
    /// The campaign exhausted its attempts; explicit action required.
    Failed {
        /// Attempts made before giving up.
        attempts_made: u32,
        /// Most recent BPM reading, for dimmed display.
        last_known_bpm: Option<u16>,
        /// Human-readable description of the final failure.
        message: String,
    },
}

impl ReconnectionState {
    /// Whether a campaign is currently running.
    #[must_use]
    pub const fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Reconnecting { .. })
    }

    /// Whether the controller gave up after exhausting its attempts.
    #[must_use]
    pub const fn has_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// The attempt counter: the in-flight attempt while reconnecting, the
    /// total attempts made once failed, zero when idle.
    #[must_use]
    pub const fn current_attempt(&self) -> u32 {
        match self {
            Self::Idle => 0,
            Self::Reconnecting { attempt, .. } => *attempt,
            Self::Failed { attempts_made, .. } => *attempts_made,
        }
    }

    /// Most recent BPM reading carried for dimmed display, if any.
    #[must_use]
    pub const fn last_known_bpm(&self) -> Option<u16> {
        match self {
            Self::Idle => None,
            Self::Reconnecting { last_known_bpm, .. }
            | Self::Failed { last_known_bpm, .. } => *last_known_bpm,
        }
    }

    /// The failure message, once failed.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Failed { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Deterministic, table-driven retry delay schedule.
///
/// Attempt numbers are 1-based: the delay for attempt *n* is waited after
/// attempt *n* fails, before attempt *n + 1* starts. Attempts past the end of
/// the table use the flat tail delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    steps: Vec<Duration>,
    tail: Duration,
}

impl BackoffPolicy {
    /// Build a policy from an explicit step table and tail delay.
    #[must_use]
    pub fn new(steps: Vec<Duration>, tail: Duration) -> Self {
        Self { steps, tail }
    }

    /// A flat policy, useful for tests that want fast, uniform retries.
    #[must_use]
    pub fn flat(delay: Duration) -> Self {
        Self {
            steps: Vec::new(),
            tail: delay,
        }
    }

    /// Delay to wait after `attempt` (1-based) fails.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.steps.get(index).copied().unwrap_or(self.tail)
    }
}

impl Default for BackoffPolicy {
    /// The production schedule: 2 s, 4 s, 8 s, then a flat 30 s.
    fn default() -> Self {
        Self {
            steps: vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ],
            tail: Duration::from_secs(30),
        }
    }
}

/// Session timing configuration.
///
/// Every duration is injectable so tests can run against a paused clock.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connection timeout in milliseconds, raced against the hardware
    /// connect call.
    pub connect_timeout_ms: u64,
    /// Hardware scan window in milliseconds; the scan stops itself after
    /// this long regardless of consumer lifetimes.
    pub scan_window_ms: u64,
    /// Pause before the single service-discovery retry, for devices that are
    /// slow to expose their GATT table.
    pub discovery_retry_delay_ms: u64,
    /// Registry grace window in milliseconds: after this long with zero rule
    /// matches, every scanned device is admitted.
    pub registry_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            scan_window_ms: 30_000,
            discovery_retry_delay_ms: 500,
            registry_grace_ms: 5_000,
        }
    }
}

/// Reconnection controller configuration.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Attempts per campaign before publishing the terminal failed state.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub policy: BackoffPolicy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            policy: BackoffPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_table() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(11), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_attempt_zero_clamps_to_first_step() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
    }

    #[test]
    fn test_flat_backoff() {
        let policy = BackoffPolicy::flat(Duration::from_millis(10));
        for attempt in 1..=5 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(10));
        }
    }

    #[test]
    fn test_battery_level_from_u8() {
        assert_eq!(BatteryLevel::from(0), BatteryLevel::Level(0));
        assert_eq!(BatteryLevel::from(73), BatteryLevel::Level(73));
        assert_eq!(BatteryLevel::from(100), BatteryLevel::Level(100));
        assert_eq!(BatteryLevel::from(101), BatteryLevel::Unknown);
        assert_eq!(BatteryLevel::from(0xFF), BatteryLevel::Unknown);
    }

    #[test]
    fn test_demo_device_id() {
        let id = DeviceId::demo();
        assert!(id.is_demo());
        assert!(!DeviceId::new("AA:BB:CC:DD:EE:FF").is_demo());
        assert!(ScannedDevice::demo().is_demo);
    }

    #[test]
    fn test_reconnect_overlay() {
        assert_eq!(
            ConnectivityState::Disconnected.with_reconnect_overlay(true),
            ConnectivityState::Reconnecting
        );
        assert_eq!(
            ConnectivityState::Connecting.with_reconnect_overlay(true),
            ConnectivityState::Reconnecting
        );
        assert_eq!(
            ConnectivityState::Connected.with_reconnect_overlay(true),
            ConnectivityState::Connected
        );
        assert_eq!(
            ConnectivityState::Disconnected.with_reconnect_overlay(false),
            ConnectivityState::Disconnected
        );
    }

    #[test]
    fn test_reconnection_state_accessors() {
        let idle = ReconnectionState::Idle;
        assert!(!idle.is_reconnecting());
        assert!(!idle.has_failed());
        assert_eq!(idle.current_attempt(), 0);
        assert_eq!(idle.last_known_bpm(), None);

        let running = ReconnectionState::Reconnecting {
            attempt: 3,
            max_attempts: 10,
            last_known_bpm: Some(68),
        };
        assert!(running.is_reconnecting());
        assert!(!running.has_failed());
        assert_eq!(running.current_attempt(), 3);
        assert_eq!(running.last_known_bpm(), Some(68));

        let failed = ReconnectionState::Failed {
            attempts_made: 10,
            last_known_bpm: Some(71),
            message: "gave up".to_string(),
        };
        assert!(!failed.is_reconnecting());
        assert!(failed.has_failed());
        assert_eq!(failed.current_attempt(), 10);
        assert_eq!(failed.error_message(), Some("gave up"));
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();

        assert_eq!(config.connect_timeout_ms, 15_000);
        assert_eq!(config.scan_window_ms, 30_000);
        assert_eq!(config.discovery_retry_delay_ms, 500);
        assert_eq!(config.registry_grace_ms, 5_000);
    }

    #[test]
    fn test_reconnect_config_defaults() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, 10);
    }
}
