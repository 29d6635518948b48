use crate::{
    ble::Advertisement,
    types::{DeviceId, ScannedDevice},
    HEART_RATE_SERVICE_UUID,
};
use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;
use tracing::debug;

/// Name fragments that identify heart-rate hardware when a strap advertises
/// neither the Heart Rate service nor an empty service list.
const VENDOR_HINTS: &[&str] = &[
    "polar", "garmin", "wahoo", "coospo", "magene", "decathlon", "hrm", "tickr", "h6", "h9",
    "h10", "oh1", "verity", "rhythm",
];

/// Scan-time device registry.
///
/// Advertisements are admitted to the visible scan list when any rule holds:
///
/// 1. the Heart Rate service (0x180D) is advertised,
/// 2. no service UUIDs are advertised at all (common for straps, so the
///    device cannot be ruled out until connect-time discovery),
/// 3. the advertised name contains a known vendor fragment, or
/// 4. the grace window elapsed with zero rule matches, after which every
///    device seen so far and every later arrival is admitted.
///
/// Advertisements that match no rule are parked rather than discarded:
/// the grace flush admits them retroactively, and [`lookup`] consults them
/// so a connect request for a parked device still resolves.
///
/// Entries are ephemeral. [`clear`] empties both maps and restarts the
/// grace window for the next scan.
///
/// [`lookup`]: DeviceRegistry::lookup
/// [`clear`]: DeviceRegistry::clear
pub struct DeviceRegistry {
    grace: Duration,
    epoch: Instant,
    grace_open: bool,
    accepted: HashMap<DeviceId, Advertisement>,
    parked: HashMap<DeviceId, Advertisement>,
}

impl DeviceRegistry {
    /// Create a registry whose grace window starts now.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            epoch: Instant::now(),
            grace_open: false,
            accepted: HashMap::new(),
            parked: HashMap::new(),
        }
    }

    /// Record one advertisement. Returns `true` when the visible scan list
    /// changed (new device, renamed device, or a grace flush).
    pub fn record(&mut self, advertisement: Advertisement) -> bool {
        let flushed = self.maybe_open_grace();

        let id = advertisement.id.clone();
        if self.grace_open || Self::matches_rules(&advertisement) {
            let name = advertisement.display_name().to_string();
            let name_before = self
                .accepted
                .get(&id)
                .map(|previous| previous.display_name().to_string());
            self.accepted.insert(id.clone(), advertisement);
            self.parked.remove(&id);
            flushed || name_before.as_deref() != Some(name.as_str())
        } else {
            debug!(
                "parking {} ({}) until the grace window opens",
                id,
                advertisement.display_name()
            );
            self.parked.insert(id, advertisement);
            flushed
        }
    }

    /// The current visible scan list, sorted by name for stable display.
    pub fn snapshot(&mut self) -> Vec<ScannedDevice> {
        self.maybe_open_grace();
        let mut devices: Vec<ScannedDevice> = self
            .accepted
            .values()
            .map(|advertisement| {
                ScannedDevice::new(advertisement.id.clone(), advertisement.display_name())
            })
            .collect();
        devices.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        devices
    }

    /// Find a device seen during this scan, parked entries included.
    #[must_use]
    pub fn lookup(&self, id: &DeviceId) -> Option<&Advertisement> {
        self.accepted.get(id).or_else(|| self.parked.get(id))
    }

    /// Forget every entry and restart the grace window.
    pub fn clear(&mut self) {
        self.accepted.clear();
        self.parked.clear();
        self.epoch = Instant::now();
        self.grace_open = false;
    }

    /// Run the grace check now. Returns `true` when parked devices were
    /// just admitted, so the caller knows the visible list changed.
    pub fn grace_flush(&mut self) -> bool {
        self.maybe_open_grace()
    }

    /// Flush parked entries once the grace window elapses with zero rule
    /// matches. Returns `true` when the flush admitted at least one device.
    fn maybe_open_grace(&mut self) -> bool {
        if self.grace_open || !self.accepted.is_empty() || self.epoch.elapsed() < self.grace {
            return false;
        }

        self.grace_open = true;
        let flushed = self.parked.len();
        for (id, advertisement) in self.parked.drain() {
            self.accepted.insert(id, advertisement);
        }
        if flushed > 0 {
            debug!("grace window elapsed, admitting {flushed} unmatched device(s)");
        }
        flushed > 0
    }

    fn matches_rules(advertisement: &Advertisement) -> bool {
        if advertisement.services.contains(&HEART_RATE_SERVICE_UUID) {
            return true;
        }
        if advertisement.services.is_empty() {
            return true;
        }
        if let Some(name) = &advertisement.local_name {
            let name = name.to_lowercase();
            if VENDOR_HINTS.iter().any(|hint| name.contains(hint)) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BATTERY_SERVICE_UUID;
    use uuid::Uuid;

    fn adv(id: &str, name: Option<&str>, services: Vec<Uuid>) -> Advertisement {
        Advertisement {
            id: DeviceId::new(id),
            local_name: name.map(str::to_string),
            services,
            rssi: Some(-55),
        }
    }

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepts_heart_rate_service() {
        let mut registry = registry();
        let changed = registry.record(adv(
            "AA:01",
            Some("Generic Strap"),
            vec![HEART_RATE_SERVICE_UUID, BATTERY_SERVICE_UUID],
        ));
        assert!(changed);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepts_empty_service_list() {
        let mut registry = registry();
        registry.record(adv("AA:02", Some("Quiet Strap"), vec![]));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepts_vendor_name_case_insensitive() {
        let mut registry = registry();
        registry.record(adv("AA:03", Some("TICKR FIT 0A2B"), vec![BATTERY_SERVICE_UUID]));
        registry.record(adv("AA:04", Some("coospo h6m"), vec![BATTERY_SERVICE_UUID]));
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_device_is_parked_but_findable() {
        let mut registry = registry();
        let changed = registry.record(adv(
            "AA:05",
            Some("Mystery Band"),
            vec![BATTERY_SERVICE_UUID],
        ));

        assert!(!changed);
        assert!(registry.snapshot().is_empty());
        assert!(registry.lookup(&DeviceId::new("AA:05")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_flush_admits_parked_devices() {
        let mut registry = registry();
        registry.record(adv("AA:06", None, vec![BATTERY_SERVICE_UUID]));
        assert!(registry.snapshot().is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "Unknown");

        // Later unmatched arrivals go straight in once the window is open.
        let changed = registry.record(adv("AA:07", Some("Another Band"), vec![BATTERY_SERVICE_UUID]));
        assert!(changed);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_stays_closed_after_a_rule_match() {
        let mut registry = registry();
        registry.record(adv("AA:08", Some("Polar H10"), vec![]));

        tokio::time::advance(Duration::from_secs(6)).await;
        registry.record(adv("AA:09", Some("Mystery Band"), vec![BATTERY_SERVICE_UUID]));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, DeviceId::new("AA:08"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_seen_wins() {
        let mut registry = registry();
        registry.record(adv("AA:0A", None, vec![]));
        assert_eq!(registry.snapshot()[0].name, "Unknown");

        // The name often arrives in a later advertisement.
        let changed = registry.record(adv("AA:0A", Some("Polar H10 B81F"), vec![]));
        assert!(changed);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "Polar H10 B81F");

        // An identical re-advertisement is not a visible change.
        let changed = registry.record(adv("AA:0A", Some("Polar H10 B81F"), vec![]));
        assert!(!changed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_restarts_the_grace_window() {
        let mut registry = registry();
        tokio::time::advance(Duration::from_secs(5)).await;
        registry.record(adv("AA:0B", Some("Mystery Band"), vec![BATTERY_SERVICE_UUID]));
        assert_eq!(registry.snapshot().len(), 1);

        registry.clear();
        assert!(registry.snapshot().is_empty());

        // Window restarted: unmatched devices park again.
        registry.record(adv("AA:0C", Some("Mystery Band"), vec![BATTERY_SERVICE_UUID]));
        assert!(registry.snapshot().is_empty());
        assert!(registry.lookup(&DeviceId::new("AA:0C")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_sorted_by_name() {
        let mut registry = registry();
        registry.record(adv("AA:0E", Some("Wahoo TICKR"), vec![]));
        registry.record(adv("AA:0D", Some("Garmin HRM-Pro"), vec![]));

        let snapshot = registry.snapshot();
        let names: Vec<&str> = snapshot.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Garmin HRM-Pro", "Wahoo TICKR"]);
    }
}
