//! Polling/motion coordinator
//!
//! Publishes the hub's snapshot to subscribers and keeps it fresh according
//! to the configured `RefreshPolicy`. While the gate is seen moving, a
//! bounded motion watch forces a REST refresh every `moving_poll_interval`
//! until the gate reports Closed or `motion_timeout` elapses.

pub mod motion;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::came::GateApi;
use crate::config::PollingConfig;
use crate::error::GateResult;
use crate::hub::EventHub;
use crate::models::{DeviceSnapshot, GateCommand, GateState, Phase, PhaseEvent, RefreshPolicy};

pub use motion::infer_direction;
use motion::{cancel_and_join, ActiveWatch};

pub struct Coordinator {
    device_id: String,
    policy: RefreshPolicy,
    poll_interval: Duration,
    moving_poll_interval: Duration,
    motion_timeout: Duration,
    api: Arc<dyn GateApi>,
    hub: Arc<EventHub>,
    published: watch::Sender<Option<DeviceSnapshot>>,
    gate: Mutex<GateState>,
    motion_watch: Mutex<Option<ActiveWatch>>,
    next_watch_id: AtomicU64,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        device_id: &str,
        polling: &PollingConfig,
        api: Arc<dyn GateApi>,
        hub: Arc<EventHub>,
    ) -> Arc<Self> {
        let (published, _) = watch::channel(None);
        Arc::new(Self {
            device_id: device_id.to_string(),
            policy: polling.refresh_policy,
            poll_interval: polling.poll_interval(),
            moving_poll_interval: polling.moving_poll_interval(),
            motion_timeout: polling.motion_timeout(),
            api,
            hub,
            published,
            gate: Mutex::new(GateState::default()),
            motion_watch: Mutex::new(None),
            next_watch_id: AtomicU64::new(1),
            poller: Mutex::new(None),
        })
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    /// Receiver that sees every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Option<DeviceSnapshot>> {
        self.published.subscribe()
    }

    /// Last published snapshot
    pub fn snapshot(&self) -> Option<DeviceSnapshot> {
        self.published.borrow().clone()
    }

    pub fn gate_state(&self) -> GateState {
        *self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_watching(&self) -> bool {
        let slot = self.motion_watch.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().is_some_and(ActiveWatch::is_live)
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Fetch status over REST, reseed the hub and publish.
    ///
    /// On failure the previously published snapshot stays in place.
    pub async fn refresh(self: &Arc<Self>) -> GateResult<DeviceSnapshot> {
        let raw = self.api.get_device_status(&self.device_id).await?;
        let snapshot = self.hub.seed_from_status(&raw);
        self.publish(snapshot.clone());
        Ok(snapshot)
    }

    /// WebSocket callback entry point; runs inline on the read loop
    pub fn handle_event(self: &Arc<Self>, event: PhaseEvent) {
        if let Some(snapshot) = self.hub.apply(event) {
            self.publish(snapshot);
        }
    }

    fn publish(self: &Arc<Self>, snapshot: DeviceSnapshot) {
        let [phase, pos] = snapshot.status_pair();
        {
            let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            gate.direction = infer_direction(phase, gate.position, pos);
            gate.position = Some(pos);
            gate.phase_code = Some(phase);
        }

        let moving = snapshot.phase().is_some_and(|p| p.is_moving());
        self.published.send_replace(Some(snapshot));

        // Covers motion started outside this process too
        if moving {
            self.ensure_motion_watch();
        }
    }

    async fn refresh_logged(self: &Arc<Self>, context: &str) {
        if let Err(e) = self.refresh().await {
            if e.is_auth() {
                tracing::error!("[Coordinator] {} refresh failed: {}", context, e);
            } else {
                tracing::warn!("[Coordinator] {} refresh failed: {}", context, e);
            }
        }
    }

    /// Start periodic polling when the policy asks for it
    pub fn start(self: &Arc<Self>) {
        if !self.policy.polls() {
            return;
        }

        let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        tracing::info!(
            "[Coordinator] Polling device {} every {}s",
            self.device_id,
            self.poll_interval.as_secs()
        );
        let this = self.clone();
        *poller = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.poll_interval).await;
                this.refresh_logged("Periodic").await;
            }
        }));
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub async fn open(self: &Arc<Self>) -> GateResult<()> {
        self.api
            .send_command(&self.device_id, GateCommand::Open.id())
            .await?;
        self.restart_motion_watch().await;
        Ok(())
    }

    pub async fn close(self: &Arc<Self>) -> GateResult<()> {
        self.api
            .send_command(&self.device_id, GateCommand::Close.id())
            .await?;
        self.restart_motion_watch().await;
        Ok(())
    }

    /// STOP always ends the motion watch, whatever the phase
    pub async fn stop(self: &Arc<Self>) -> GateResult<()> {
        self.api
            .send_command(&self.device_id, GateCommand::Stop.id())
            .await?;
        self.cancel_motion_watch().await;
        self.refresh_logged("Post-stop").await;
        Ok(())
    }

    // ========================================================================
    // Motion watch
    // ========================================================================

    /// Start a watch unless one is already running
    fn ensure_motion_watch(self: &Arc<Self>) {
        let mut slot = self.motion_watch.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(ActiveWatch::is_live) {
            return;
        }
        *slot = Some(self.spawn_motion_watch());
    }

    /// Replace any running watch with a fresh one (new deadline)
    async fn restart_motion_watch(self: &Arc<Self>) {
        self.cancel_motion_watch().await;

        let mut slot = self.motion_watch.lock().unwrap_or_else(|e| e.into_inner());
        // A push event may have started one while we waited
        if slot.as_ref().is_some_and(ActiveWatch::is_live) {
            return;
        }
        *slot = Some(self.spawn_motion_watch());
    }

    /// Cancel the running watch, if any, and wait for it to finish
    pub async fn cancel_motion_watch(&self) {
        let active = self
            .motion_watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(active) = active {
            cancel_and_join(active.handle, "Motion watch").await;
            tracing::info!("[Coordinator] Stopped motion watch #{}", active.id);
        }
    }

    fn spawn_motion_watch(self: &Arc<Self>) -> ActiveWatch {
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.watch_motion(id).await });
        ActiveWatch { id, handle }
    }

    async fn watch_motion(self: Arc<Self>, id: u64) {
        let deadline = Instant::now() + self.motion_timeout;
        tracing::info!(
            "[Coordinator] Started motion watch #{} (timeout {}s, every {}s)",
            id,
            self.motion_timeout.as_secs(),
            self.moving_poll_interval.as_secs()
        );

        let fast_poll = async {
            loop {
                self.refresh_logged("Motion").await;
                // Dwell at Open/Stopped keeps polling; only Closed ends early
                if self.snapshot().and_then(|s| s.phase()) == Some(Phase::Closed) {
                    break;
                }
                tokio::time::sleep(self.moving_poll_interval).await;
            }
        };

        match tokio::time::timeout_at(deadline, fast_poll).await {
            Ok(()) => tracing::info!("[Coordinator] Motion watch #{} ended: gate closed", id),
            Err(_) => tracing::info!("[Coordinator] Motion watch #{} ended: timeout", id),
        }

        let mut slot = self.motion_watch.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|w| w.id == id) {
            slot.take();
        }
    }

    /// Stop polling and any motion watch
    pub async fn shutdown(&self) {
        let poller = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = poller {
            cancel_and_join(handle, "Poller").await;
        }
        self.cancel_motion_watch().await;
    }
}
