use crate::{
    session::HeartRateSession,
    types::{ConnectivityState, DeviceId, ReconnectConfig, ReconnectionState},
};
use std::sync::Arc;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 64;

struct ControllerInner {
    target: Option<DeviceId>,
    manual_disconnect: bool,
    resume_session_id: Option<String>,
    state: ReconnectionState,
    watcher: Option<JoinHandle<()>>,
    campaign: Option<JoinHandle<()>>,
}

struct ControllerShared {
    session: Arc<dyn HeartRateSession>,
    config: ReconnectConfig,
    state_tx: broadcast::Sender<ReconnectionState>,
    inner: Mutex<ControllerInner>,
}

/// Automatic reconnection over a [`HeartRateSession`].
///
/// Watches the session's connectivity stream; an unexpected `Disconnected`
/// starts a campaign of connect attempts against the monitored device, with
/// the configured backoff between attempts. The controller never drives the
/// session state directly, it only calls `connect` on it.
///
/// A campaign ends one of three ways: an attempt succeeds (back to idle),
/// the attempts run out (a terminal failed state that persists until the
/// next [`retry_reconnection`], monitor cycle, stop or [`reset`]), or the
/// caller cancels it via [`stop_monitoring`] or [`reset`]. Disconnects
/// announced in advance with [`mark_manual_disconnect`] never start a
/// campaign.
///
/// [`retry_reconnection`]: ReconnectionController::retry_reconnection
/// [`reset`]: ReconnectionController::reset
/// [`stop_monitoring`]: ReconnectionController::stop_monitoring
/// [`mark_manual_disconnect`]: ReconnectionController::mark_manual_disconnect
pub struct ReconnectionController {
    shared: Arc<ControllerShared>,
}

impl ReconnectionController {
    /// Create a controller over a session. No monitoring happens until
    /// [`start_monitoring`](ReconnectionController::start_monitoring).
    #[must_use]
    pub fn new(session: Arc<dyn HeartRateSession>, config: ReconnectConfig) -> Self {
        let (state_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(ControllerShared {
                session,
                config,
                state_tx,
                inner: Mutex::new(ControllerInner {
                    target: None,
                    manual_disconnect: false,
                    resume_session_id: None,
                    state: ReconnectionState::Idle,
                    watcher: None,
                    campaign: None,
                }),
            }),
        }
    }

    /// Begin a monitor cycle: watch the session for unexpected disconnects
    /// of `target`.
    ///
    /// Each call starts the cycle over, from any state: a pending campaign
    /// and its backoff timer are cancelled, a stale manual-disconnect flag
    /// and failed record are cleared, and the connectivity subscription is
    /// live before this returns, so a drop right after the call is caught.
    pub async fn start_monitoring(&self, target: DeviceId) {
        let mut inner = self.shared.inner.lock().await;
        info!("monitoring {target} for connection drops");

        if let Some(watcher) = inner.watcher.take() {
            watcher.abort();
        }
        if let Some(campaign) = inner.campaign.take() {
            campaign.abort();
            info!("reconnection campaign cancelled");
        }
        inner.target = Some(target);
        inner.manual_disconnect = false;
        publish_locked(&self.shared, &mut inner, ReconnectionState::Idle);

        let states = self.shared.session.monitor_connectivity();
        inner.watcher = Some(tokio::spawn(run_watcher(Arc::clone(&self.shared), states)));
    }

    /// Announce that the next disconnect is intentional. One-shot: the flag
    /// is consumed by the disconnect it suppresses, and cleared by any
    /// successful connect or a fresh monitor cycle.
    pub async fn mark_manual_disconnect(&self) {
        self.shared.inner.lock().await.manual_disconnect = true;
    }

    /// Manually start a campaign at attempt one, from idle or failed state.
    /// No-op when no device is monitored or a campaign is already running.
    pub async fn retry_reconnection(&self) {
        let mut inner = self.shared.inner.lock().await;
        let Some(target) = inner.target.clone() else {
            warn!("retry requested with no monitored device");
            return;
        };
        if inner.campaign.is_some() {
            debug!("retry requested while a campaign is running");
            return;
        }

        publish_locked(&self.shared, &mut inner, ReconnectionState::Idle);
        info!("manual retry for {target}");
        let shared = Arc::clone(&self.shared);
        inner.campaign = Some(tokio::spawn(run_campaign(shared, target)));
    }

    /// Stop watching and cancel any campaign, keeping the monitored device
    /// so monitoring or a retry can resume later. Always leaves the
    /// controller idle; safe to call repeatedly and from any state.
    pub async fn stop_monitoring(&self) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(watcher) = inner.watcher.take() {
            watcher.abort();
        }
        if let Some(campaign) = inner.campaign.take() {
            campaign.abort();
            info!("reconnection campaign cancelled");
        }
        publish_locked(&self.shared, &mut inner, ReconnectionState::Idle);
    }

    /// Stop everything and forget the monitored device, the manual flag,
    /// and the resume hand-off.
    pub async fn reset(&self) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(watcher) = inner.watcher.take() {
            watcher.abort();
        }
        if let Some(campaign) = inner.campaign.take() {
            campaign.abort();
        }
        inner.target = None;
        inner.manual_disconnect = false;
        inner.resume_session_id = None;
        publish_locked(&self.shared, &mut inner, ReconnectionState::Idle);
        info!("reconnection controller reset");
    }

    /// Carry an opaque recording-session identifier across the reconnect
    /// gap, for the recorder to resume the same logical workout.
    pub async fn set_resume_session_id(&self, id: Option<String>) {
        self.shared.inner.lock().await.resume_session_id = id;
    }

    /// The identifier stored by
    /// [`set_resume_session_id`](ReconnectionController::set_resume_session_id).
    pub async fn resume_session_id(&self) -> Option<String> {
        self.shared.inner.lock().await.resume_session_id.clone()
    }

    /// Subscribe to controller state changes. Consecutive duplicates are
    /// not emitted.
    #[must_use]
    pub fn state_updates(&self) -> broadcast::Receiver<ReconnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// The current controller state.
    pub async fn current_state(&self) -> ReconnectionState {
        self.shared.inner.lock().await.state.clone()
    }
}

fn publish_locked(
    shared: &ControllerShared,
    inner: &mut ControllerInner,
    next: ReconnectionState,
) {
    if inner.state == next {
        return;
    }
    inner.state = next.clone();
    let _ = shared.state_tx.send(next);
}

/// Watch session connectivity. `Disconnected` may start a campaign;
/// `Connected` from any source ends one. The receiver is created by
/// [`ReconnectionController::start_monitoring`] before the task runs.
async fn run_watcher(
    shared: Arc<ControllerShared>,
    mut states: broadcast::Receiver<ConnectivityState>,
) {
    loop {
        match states.recv().await {
            Ok(ConnectivityState::Disconnected) => on_disconnected(&shared).await,
            Ok(ConnectivityState::Connected) => on_connected(&shared).await,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("connectivity watcher lagged, skipped {skipped} transitions");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("connectivity stream closed, watcher exiting");
}

async fn on_disconnected(shared: &Arc<ControllerShared>) {
    let mut inner = shared.inner.lock().await;

    let Some(target) = inner.target.clone() else {
        return;
    };
    if inner.manual_disconnect {
        // One-shot: consumed by the disconnect it suppresses
        inner.manual_disconnect = false;
        info!("manual disconnect, no reconnection");
        return;
    }
    if inner.campaign.is_some() {
        debug!("disconnect during an active campaign, ignoring");
        return;
    }
    if inner.state != ReconnectionState::Idle {
        debug!("controller is {:?}, not starting a campaign", inner.state);
        return;
    }

    warn!("unexpected disconnect from {target}, starting reconnection");
    let campaign_shared = Arc::clone(shared);
    inner.campaign = Some(tokio::spawn(run_campaign(campaign_shared, target)));
}

async fn on_connected(shared: &Arc<ControllerShared>) {
    let mut inner = shared.inner.lock().await;
    if let Some(campaign) = inner.campaign.take() {
        // The device came back through some other path
        campaign.abort();
        info!("connected outside the campaign, cancelling it");
    }
    inner.manual_disconnect = false;
    publish_locked(shared, &mut inner, ReconnectionState::Idle);
}

/// One reconnection campaign: attempts with backoff until success or the
/// configured maximum is exhausted.
async fn run_campaign(shared: Arc<ControllerShared>, target: DeviceId) {
    let max_attempts = shared.config.max_attempts;
    let last_known_bpm = shared.session.last_known_bpm().await;
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=max_attempts {
        {
            let mut inner = shared.inner.lock().await;
            publish_locked(
                &shared,
                &mut inner,
                ReconnectionState::Reconnecting {
                    attempt,
                    max_attempts,
                    last_known_bpm,
                },
            );
        }
        info!("reconnection attempt {attempt}/{max_attempts} to {target}");

        match shared.session.connect(&target).await {
            Ok(()) => {
                let mut inner = shared.inner.lock().await;
                inner.campaign.take();
                inner.manual_disconnect = false;
                publish_locked(&shared, &mut inner, ReconnectionState::Idle);
                info!("reconnected to {target} on attempt {attempt}");
                return;
            }
            Err(e) => {
                warn!("reconnection attempt {attempt}/{max_attempts} failed: {e}");
                last_error = e.to_string();
                if attempt < max_attempts {
                    let delay = shared.config.policy.delay_for_attempt(attempt);
                    debug!("next attempt in {delay:?}");
                    sleep(delay).await;
                }
            }
        }
    }

    error!("giving up on {target} after {max_attempts} attempts");
    let mut inner = shared.inner.lock().await;
    inner.campaign.take();
    publish_locked(
        &shared,
        &mut inner,
        ReconnectionState::Failed {
            attempts_made: max_attempts,
            last_known_bpm,
            message: last_error,
        },
    );
}
