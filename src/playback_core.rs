//! Component D: the command scheduler and drift corrector (§4.D) — the
//! state machine that turns remote-timed commands into local player
//! actions and keeps the player aligned with the estimated remote position
//! between commands.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::manager::SessionState;
use crate::player::{PlaybackEvent, PlayerAdapter, PlayerError};
use crate::protocol::{BufferingRequest, PlaybackCommand, PlaybackCommandKind};
use crate::scheduler::TimerHandle;
use crate::settings::SyncPlaySettings;
use crate::time::{non_negative_std_duration, LocalInstant, Ticks, TICKS_PER_MILLISECOND};
use crate::time_sync::TimeSync;
use crate::transport::TransportProvider;

/// §4.D "State machine" states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Disabled,
    Enabling,
    Idle,
    Scheduled,
    Syncing,
    Buffering,
}

/// Drift-correction strategy actually applied on a given cycle (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftCorrection {
    SpeedToSync { rate: i64 },
    SkipToSync,
    None,
}

/// Observable events a collaborator (Manager, UI) might want (§6 subset
/// owned by PlaybackCore rather than Manager).
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Syncing { active: bool, method: &'static str },
    NotifyOsd(&'static str),
}

struct DriftState {
    sync_enabled: bool,
    disabled_until: Option<LocalInstant>,
    last_correction_at: Option<LocalInstant>,
    in_sync_count: u64,
}

impl DriftState {
    fn new() -> Self {
        Self {
            sync_enabled: false,
            disabled_until: None,
            last_correction_at: None,
            in_sync_count: 0,
        }
    }
}

struct BufferingState {
    buffering: bool,
    start_sent: bool,
    timer: Option<TimerHandle>,
}

impl BufferingState {
    fn new() -> Self {
        Self {
            buffering: false,
            start_sent: false,
            timer: None,
        }
    }
}

/// The scheduler + drift corrector (§2 "D").
pub struct PlaybackCore {
    session: Rc<RefCell<SessionState>>,
    player: Rc<PlayerAdapter>,
    time_sync: Rc<TimeSync>,
    settings_rx: tokio::sync::watch::Receiver<SyncPlaySettings>,
    transport: Rc<dyn TransportProvider>,

    state: Cell<PlaybackState>,
    drift: RefCell<DriftState>,
    buffering: RefCell<BufferingState>,

    scheduled_timer: RefCell<Option<TimerHandle>>,
    sync_enable_timer: RefCell<Option<TimerHandle>>,
    playback_start_timer: RefCell<Option<TimerHandle>>,
    speed_restore_timer: RefCell<Option<TimerHandle>>,

    events_tx: broadcast::Sender<CoreEvent>,
}

impl PlaybackCore {
    #[must_use]
    pub fn new(
        session: Rc<RefCell<SessionState>>,
        player: Rc<PlayerAdapter>,
        time_sync: Rc<TimeSync>,
        settings_rx: tokio::sync::watch::Receiver<SyncPlaySettings>,
        transport: Rc<dyn TransportProvider>,
    ) -> Rc<Self> {
        let (events_tx, _) = broadcast::channel(16);
        Rc::new(Self {
            session,
            player,
            time_sync,
            settings_rx,
            transport,
            state: Cell::new(PlaybackState::Disabled),
            drift: RefCell::new(DriftState::new()),
            buffering: RefCell::new(BufferingState::new()),
            scheduled_timer: RefCell::new(None),
            sync_enable_timer: RefCell::new(None),
            playback_start_timer: RefCell::new(None),
            speed_restore_timer: RefCell::new(None),
            events_tx,
        })
    }

    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.state.get()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events_tx.subscribe()
    }

    fn settings(&self) -> SyncPlaySettings {
        self.settings_rx.borrow().clone()
    }

    /// Cancel every pending timer (§5 "disable() cancels all timers").
    pub fn cancel_all_timers(&self) {
        self.scheduled_timer.borrow_mut().take();
        self.sync_enable_timer.borrow_mut().take();
        self.playback_start_timer.borrow_mut().take();
        self.speed_restore_timer.borrow_mut().take();
        self.buffering.borrow_mut().timer.take();
    }

    /// §4.D "Disabled -> Enabling" transition on `GroupJoined`.
    pub fn enable(&self) {
        self.state.set(PlaybackState::Enabling);
    }

    /// §5 "disable() cancels all timers ... clears SessionState fields":
    /// the `PlaybackCore`-owned half of that reset.
    pub fn disable(&self) {
        self.state.set(PlaybackState::Disabled);
        self.cancel_all_timers();
        let mut drift = self.drift.borrow_mut();
        drift.sync_enabled = false;
        drift.disabled_until = None;
        let mut buffering = self.buffering.borrow_mut();
        buffering.buffering = false;
        buffering.start_sent = false;
    }

    /// §4.D "Enabling -> Idle" transition on the first `timeSyncUpdate`.
    pub fn on_time_sync_ready(&self) {
        self.state.set(PlaybackState::Idle);
    }

    /// §4.D "any -> Enabling on timeSyncLost".
    pub fn on_time_sync_lost(&self) {
        self.state.set(PlaybackState::Enabling);
        self.drift.borrow_mut().sync_enabled = false;
        self.cancel_all_timers();
    }

    /// Start the background loop reacting to player events (§5
    /// "bindToPlayer"): drift correction on `timeupdate`, the buffering
    /// protocol on `waiting`/`playing`.
    pub fn bind_to_player(self: &Rc<Self>) {
        let Some(mut rx) = self.player.subscribe() else {
            return;
        };
        let this = self.clone();
        tokio::task::spawn_local(async move {
            loop {
                match rx.recv().await {
                    Ok(PlaybackEvent::TimeUpdate(ticks)) => this.on_time_update(ticks).await,
                    Ok(PlaybackEvent::Waiting) => this.on_waiting().await,
                    Ok(PlaybackEvent::Playing) => this.on_playing().await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // ---- command scheduling (§4.D) ----------------------------------

    /// `applyCommand(cmd)` (§4.D).
    pub async fn apply_command(self: &Rc<Self>, cmd: PlaybackCommand) {
        let now = LocalInstant::now();
        let fire_at = self.time_sync.remote_to_local(cmd.when);

        // 1. Duplicate detection.
        let prior = self.session.borrow().last_command.clone();
        if let Some(prior) = &prior {
            if prior.is_duplicate_of(&cmd) {
                if fire_at > now {
                    debug!(target: "syncplay_core::playback_core", "duplicate command, already scheduled in the future");
                    return;
                }
                if !self.player_state_diverges(&cmd) {
                    debug!(target: "syncplay_core::playback_core", "duplicate command, player already matches, dropping");
                    return;
                }
                // Player state diverges: fall through to a corrective
                // dispatch of the same kind, jittered for Seek (§4.D
                // "Duplicate-with-past-fireAt repair").
            }
        }

        // 2. Cancel any prior pending scheduled action / sync-enable timer.
        self.scheduled_timer.borrow_mut().take();
        self.sync_enable_timer.borrow_mut().take();
        self.state.set(PlaybackState::Idle);

        self.session.borrow_mut().last_command = Some(cmd.clone());

        // 3. Remote-self-managed short-circuit.
        if self.player.is_remote() {
            debug!(target: "syncplay_core::playback_core", "remote adapter, recording command without local dispatch");
            return;
        }

        // 4. Dispatch by kind, with repair jitter if this was a
        // divergent duplicate.
        let repaired = prior.as_ref().is_some_and(|p| p.is_duplicate_of(&cmd));
        if fire_at <= now {
            self.dispatch(&cmd, repaired, true).await;
        } else {
            self.state.set(PlaybackState::Scheduled);
            let this_cmd = cmd.clone();
            let delay = non_negative_std_duration(fire_at.0 - now.0);
            // SAFETY: caller runs inside a `LocalSet`; see `TimerHandle`.
            let handle = self.spawn_dispatch(delay, this_cmd, repaired);
            self.scheduled_timer.borrow_mut().replace(handle);
        }
    }

    /// Whether the live player state diverges from what `cmd` demands,
    /// used to decide whether a duplicate whose fire time has passed needs
    /// a corrective re-dispatch (§4.D step 1).
    fn player_state_diverges(&self, cmd: &PlaybackCommand) -> bool {
        match cmd.command {
            PlaybackCommandKind::Unpause => {
                !self.player.is_playing()
                    || cmd
                        .position_ticks
                        .is_some_and(|want| (self.player.current_time_ticks() - want).abs().0 > Ticks::from_millis(self.settings().min_delay_skip_to_sync_ms).0)
            }
            PlaybackCommandKind::Pause => self.player.is_playing(),
            PlaybackCommandKind::Stop => self.player.is_playback_active(),
            PlaybackCommandKind::Seek => true,
        }
    }

    fn spawn_dispatch(self: &Rc<Self>, delay: Duration, cmd: PlaybackCommand, repaired: bool) -> TimerHandle {
        let this = self.clone();
        TimerHandle::spawn_after(delay, async move {
            // Fires exactly at its scheduled instant, so this is never
            // the "fireAt already past" case (§4.D).
            this.dispatch(&cmd, repaired, false).await;
        })
    }

    async fn dispatch(self: &Rc<Self>, cmd: &PlaybackCommand, repaired: bool, late: bool) {
        let settings = self.settings();
        match cmd.command {
            PlaybackCommandKind::Unpause => self.dispatch_unpause(cmd, &settings, late).await,
            PlaybackCommandKind::Pause => self.dispatch_pause(cmd, &settings).await,
            PlaybackCommandKind::Stop => self.dispatch_stop().await,
            PlaybackCommandKind::Seek => self.dispatch_seek(cmd, &settings, repaired).await,
        }
    }

    async fn dispatch_unpause(self: &Rc<Self>, cmd: &PlaybackCommand, settings: &SyncPlaySettings, late: bool) {
        if let Some(want) = cmd.position_ticks {
            let min_skip = Ticks::from_millis(settings.min_delay_skip_to_sync_ms);
            if (self.player.current_time_ticks() - want).abs() > min_skip {
                let _ = self.player.local_seek(want).await;
            }
        }

        // Subscribe before firing so the catch-up branch below can't miss
        // the `unpause` event it's waiting for.
        let rx = if late { self.player.subscribe() } else { None };
        let _ = self.player.local_unpause().await;
        let _ = self.events_tx.send(CoreEvent::NotifyOsd("unpause"));

        // §4.D Unpause row: "If fireAt was already past, seek to
        // estimateCurrentTicks(cmd.positionTicks, cmd.when) after the
        // first unpause player event."
        if let (true, Some(mut rx), Some(want)) = (late, rx, cmd.position_ticks) {
            let timeout = Duration::from_millis(settings.pause_event_timeout_ms.max(0) as u64);
            let saw_unpause = tokio::time::timeout(timeout, async {
                loop {
                    match rx.recv().await {
                        Ok(PlaybackEvent::Unpause) => return true,
                        Ok(_) => continue,
                        Err(_) => return false,
                    }
                }
            })
            .await
            .unwrap_or(false);
            if !saw_unpause {
                warn!(target: "syncplay_core::playback_core", "timed out waiting for unpause event before catch-up seek");
            }
            let catch_up = self.estimate_current_ticks(want, cmd.when);
            let _ = self.player.local_seek(catch_up).await;
        }

        let delay = Duration::from_millis((settings.max_delay_speed_to_sync_ms / 2).max(0) as u64);
        self.arm_sync_enable_timer(delay);
    }

    /// Arm the "after-fire" sync-enable timer (§4.D table, "After-fire
    /// arming" column): `syncEnabled` flips to true `maxDelaySpeedToSync/2`
    /// ms after an Unpause is dispatched.
    fn arm_sync_enable_timer(self: &Rc<Self>, delay: Duration) {
        let this = self.clone();
        let handle = TimerHandle::spawn_after(delay, async move {
            this.enable_sync();
        });
        self.sync_enable_timer.borrow_mut().replace(handle);
    }

    /// §4.D SpeedToSync: "Disable further sync for T ms; then restore rate
    /// 1.0 and re-enable." Without this timer the player is left running
    /// at the nudged rate if the next `timeupdate` cycle resolves to no
    /// correction at all.
    fn arm_speed_restore_timer(self: &Rc<Self>, delay: Duration) {
        let this = self.clone();
        let handle = TimerHandle::spawn_after(delay, async move {
            this.player.set_playback_rate(1.0);
            let _ = this.events_tx.send(CoreEvent::Syncing { active: false, method: "SpeedToSync" });
        });
        self.speed_restore_timer.borrow_mut().replace(handle);
    }

    async fn dispatch_pause(&self, cmd: &PlaybackCommand, settings: &SyncPlaySettings) {
        let _ = self.player.local_pause().await;
        let mut rx = match self.player.subscribe() {
            Some(rx) => rx,
            None => return,
        };
        let timeout = Duration::from_millis(settings.pause_event_timeout_ms.max(0) as u64);
        let got_event = tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(PlaybackEvent::Pause) => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await
        .unwrap_or(false);

        if !got_event {
            warn!(target: "syncplay_core::playback_core", "timed out waiting for pause event, seeking anyway");
        }
        if let Some(position) = cmd.position_ticks {
            let _ = self.player.local_seek(position).await;
        }
    }

    async fn dispatch_stop(&self) {
        let _ = self.player.local_stop().await;
    }

    async fn dispatch_seek(&self, cmd: &PlaybackCommand, settings: &SyncPlaySettings, repaired: bool) {
        let position = jittered_position(cmd.position_ticks.unwrap_or(Ticks::ZERO), repaired);

        let _ = self.player.local_unpause().await;
        let _ = self.player.local_seek(position).await;

        let mut rx = match self.player.subscribe() {
            Some(rx) => rx,
            None => return,
        };
        let timeout = Duration::from_millis(settings.playing_event_timeout_ms.max(0) as u64);
        let saw_playing = tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(PlaybackEvent::Playing) => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await
        .unwrap_or(false);

        if !saw_playing {
            warn!(target: "syncplay_core::playback_core", "timed out waiting for playing event, re-seeking");
            let _ = self.player.local_seek(position).await;
            return;
        }

        let _ = self.player.local_pause().await;
        self.send_buffering(true).await;
    }

    // ---- drift correction (§4.D) ------------------------------------

    async fn on_time_update(self: &Rc<Self>, current_from_event: Ticks) {
        let _ = current_from_event;
        let settings = self.settings();
        let throttle = Duration::from_millis((settings.max_delay_speed_to_sync_ms / 2).max(0) as u64);

        let is_syncing_candidate = {
            let drift = self.drift.borrow();
            let session = self.session.borrow();
            drift.sync_enabled
                && !self.buffering.borrow().buffering
                && session.last_command.as_ref().is_some_and(|c| c.command == PlaybackCommandKind::Unpause)
                && drift.disabled_until.is_none_or(|until| LocalInstant::now() >= until)
        };
        if !is_syncing_candidate {
            return;
        }

        {
            let mut drift = self.drift.borrow_mut();
            if let Some(last) = drift.last_correction_at {
                if LocalInstant::now() - last < chrono::Duration::from_std(throttle).unwrap_or_default() {
                    return;
                }
            }
            drift.last_correction_at = Some(LocalInstant::now());
        }

        let last_cmd = self.session.borrow().last_command.clone();
        let Some(last_cmd) = last_cmd else { return };
        let Some(base_ticks) = last_cmd.position_ticks else {
            return;
        };
        let server_ticks = self.estimate_current_ticks(base_ticks, last_cmd.when);
        let current_ticks = self.player.current_time_ticks();
        let diff_ms = (server_ticks - current_ticks).as_millis();

        let correction = self.choose_correction(diff_ms, &settings);
        self.apply_correction(correction, server_ticks, &settings).await;
    }

    fn choose_correction(&self, diff_ms: i64, settings: &SyncPlaySettings) -> DriftCorrection {
        let abs_diff = diff_ms.abs();
        if self.player.has_playback_rate()
            && settings.use_speed_to_sync
            && abs_diff >= settings.min_delay_speed_to_sync_ms
            && abs_diff < settings.max_delay_speed_to_sync_ms
        {
            DriftCorrection::SpeedToSync { rate: diff_ms }
        } else if settings.use_skip_to_sync && abs_diff >= settings.min_delay_skip_to_sync_ms {
            DriftCorrection::SkipToSync
        } else {
            DriftCorrection::None
        }
    }

    async fn apply_correction(self: &Rc<Self>, correction: DriftCorrection, server_ticks: Ticks, settings: &SyncPlaySettings) {
        match correction {
            DriftCorrection::SpeedToSync { rate: diff_ms } => {
                let mut duration_ms = settings.speed_to_sync_duration_ms as f64;
                // Keep speed >= 0.1 (§4.D, §8 boundary).
                if (diff_ms as f64) <= -duration_ms * 0.1 {
                    duration_ms = diff_ms.unsigned_abs() as f64 / 0.9;
                }
                let rate = 1.0 + (diff_ms as f64) / duration_ms;
                self.player.set_playback_rate(rate);
                let _ = self.events_tx.send(CoreEvent::Syncing { active: true, method: "SpeedToSync" });

                let disable_for = Duration::from_millis(duration_ms.max(0.0) as u64);
                self.drift.borrow_mut().disabled_until = Some(LocalInstant::now() + chrono::Duration::from_std(disable_for).unwrap_or_default());
                self.arm_speed_restore_timer(disable_for);
            }
            DriftCorrection::SkipToSync => {
                let _ = self.player.local_seek(server_ticks).await;
                let _ = self.events_tx.send(CoreEvent::Syncing { active: true, method: "SkipToSync" });
                let disable_for = Duration::from_millis((settings.max_delay_speed_to_sync_ms / 2).max(0) as u64);
                self.drift.borrow_mut().disabled_until = Some(LocalInstant::now() + chrono::Duration::from_std(disable_for).unwrap_or_default());
            }
            DriftCorrection::None => {
                self.drift.borrow_mut().in_sync_count += 1;
            }
        }
    }

    /// `estimateCurrentTicks(ticks, when)` (§4.D).
    fn estimate_current_ticks(&self, ticks: Ticks, when: crate::time::RemoteInstant) -> Ticks {
        let now_remote = self.time_sync.local_to_remote(LocalInstant::now());
        let elapsed_ms = (now_remote - when).num_milliseconds();
        ticks + Ticks(elapsed_ms * TICKS_PER_MILLISECOND)
    }

    /// Enable the drift-correction loop; called once the sync-enable timer
    /// fires after an Unpause dispatch (§4.D "after-fire arming").
    fn enable_sync(&self) {
        self.state.set(PlaybackState::Syncing);
        self.drift.borrow_mut().sync_enabled = true;
    }

    // ---- buffering protocol (§4.D) -----------------------------------

    /// §4.D "Buffering protocol": start a `minBufferingThresholdMillis`
    /// timer; if playback hasn't resumed by the time it fires, report
    /// `buffering(start)` to the server.
    async fn on_waiting(self: &Rc<Self>) {
        let threshold = Duration::from_millis(self.settings().min_buffering_threshold_ms.max(0) as u64);
        self.buffering.borrow_mut().buffering = true;
        self.state.set(PlaybackState::Buffering);

        let this = self.clone();
        let handle = TimerHandle::spawn_after(threshold, async move {
            let still_buffering = this.buffering.borrow().buffering;
            if still_buffering {
                this.buffering.borrow_mut().start_sent = true;
                this.send_buffering(false).await;
            }
        });
        self.buffering.borrow_mut().timer.replace(handle);
    }

    async fn on_playing(&self) {
        let was_buffering = {
            let mut buffering = self.buffering.borrow_mut();
            let was = buffering.buffering && buffering.start_sent;
            buffering.buffering = false;
            buffering.start_sent = false;
            buffering.timer.take();
            was
        };
        if was_buffering {
            self.send_buffering(true).await;
        }
        if self.drift.borrow().sync_enabled {
            self.state.set(PlaybackState::Syncing);
        } else {
            self.state.set(PlaybackState::Idle);
        }
    }

    async fn send_buffering(&self, done: bool) {
        let session = self.session.borrow();
        let Some(last_cmd) = session.last_command.clone() else {
            return;
        };
        drop(session);
        let request = BufferingRequest {
            when: self.time_sync.local_to_remote(LocalInstant::now()),
            position_ticks: self.player.current_time_ticks(),
            is_playing: self.player.is_playing(),
            playlist_item_id: last_cmd.playlist_item_id,
            buffering_done: done,
        };
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_buffering(request).await {
            warn!(target: "syncplay_core::playback_core", %err, "buffering report failed");
        }
    }

    /// §4.D "Ready-on-start": register a one-shot listener for the next
    /// `playbackstart` event, called by `QueueCore` after any queue update
    /// that starts or switches playback.
    pub fn schedule_ready_request_on_playback_start(self: &Rc<Self>) {
        let Some(mut rx) = self.player.subscribe() else {
            return;
        };
        let timeout = Duration::from_millis(self.settings().playbackstart_event_timeout_ms.max(0) as u64);
        let this = self.clone();
        let handle = TimerHandle::spawn_now(async move {
            let saw_start = tokio::time::timeout(timeout, async {
                loop {
                    match rx.recv().await {
                        Ok(PlaybackEvent::PlaybackStart) => return true,
                        Ok(_) => continue,
                        Err(_) => return false,
                    }
                }
            })
            .await
            .unwrap_or(false);

            if saw_start {
                let _ = this.player.local_pause().await;
                this.send_buffering(true).await;
            } else {
                warn!(target: "syncplay_core::playback_core", "playbackstart timed out, halting group");
                this.session.borrow_mut().following_group = false;
                let transport = this.transport.current_transport();
                let _ = transport.request_set_ignore_wait(true).await;
            }
        });
        self.playback_start_timer.borrow_mut().replace(handle);
    }
}

/// §4.D "Duplicate-with-past-fireAt repair": a repaired Seek adds a random
/// offset in `±(50ms × ticks/ms)` so the underlying player observes a
/// distinct seek even when the target position is unchanged.
fn jittered_position(position: Ticks, repaired: bool) -> Ticks {
    if !repaired {
        return position;
    }
    let jitter_ticks = 50 * TICKS_PER_MILLISECOND;
    let offset = rand::rng().random_range(-jitter_ticks..=jitter_ticks);
    position + Ticks(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::SessionState;
    use crate::player::mocks::MockMediaEngine;
    use crate::protocol::PlaylistItemId;
    use crate::time::RemoteInstant;
    use crate::transport::mocks::MockTransport;
    use crate::transport::Transport;

    fn remote_instant(ms_from_epoch: i64) -> RemoteInstant {
        RemoteInstant::from_utc(chrono::DateTime::from_timestamp_millis(ms_from_epoch).unwrap())
    }

    struct FixedTransportProvider(Rc<dyn Transport>);
    impl TransportProvider for FixedTransportProvider {
        fn current_transport(&self) -> Rc<dyn Transport> {
            self.0.clone()
        }
    }

    fn make_core(engine: Rc<MockMediaEngine>) -> Rc<PlaybackCore> {
        let session = Rc::new(RefCell::new(SessionState::new()));
        let player = Rc::new(PlayerAdapter::Local(engine));
        let probe: crate::time_sync::ProbeFn = Box::new(|| Box::pin(async { None }));
        let (_settings_tx, settings_rx) = tokio::sync::watch::channel(SyncPlaySettings::default());
        let time_sync = Rc::new(TimeSync::new(probe, settings_rx.clone()));
        let transport = Rc::new(FixedTransportProvider(Rc::new(MockTransport::default())));
        PlaybackCore::new(session, player, time_sync, settings_rx, transport)
    }

    #[tokio::test]
    async fn test_stop_dispatches_local_stop() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let engine = Rc::new(MockMediaEngine::new());
                let core = make_core(engine.clone());
                let cmd = PlaybackCommand {
                    command: PlaybackCommandKind::Stop,
                    when: remote_instant(0),
                    emitted_at: remote_instant(0),
                    position_ticks: None,
                    playlist_item_id: PlaylistItemId::from("a"),
                };
                core.apply_command(cmd).await;
                assert!(engine.calls.borrow().contains(&"local_stop".to_string()));
            })
            .await;
    }

    #[tokio::test]
    async fn test_duplicate_in_future_is_ignored() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let engine = Rc::new(MockMediaEngine::new());
                let core = make_core(engine.clone());
                let far_future = remote_instant(1_000_000_000);
                let cmd = PlaybackCommand {
                    command: PlaybackCommandKind::Unpause,
                    when: far_future,
                    emitted_at: remote_instant(0),
                    position_ticks: Some(Ticks::ZERO),
                    playlist_item_id: PlaylistItemId::from("a"),
                };
                core.apply_command(cmd.clone()).await;
                let calls_after_first = engine.calls.borrow().len();
                core.apply_command(cmd).await;
                // second apply is a duplicate with a still-future fire time: ignored.
                assert_eq!(engine.calls.borrow().len(), calls_after_first);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_speed_to_sync_restores_rate_after_window() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let engine = Rc::new(MockMediaEngine::new());
                let core = make_core(engine.clone());

                // Dispatch an Unpause "now" so the sync-enable timer is
                // armed off a real wall-clock `when`, keeping the drift
                // estimate in `on_time_update` below close to zero.
                let when = RemoteInstant::from_utc(chrono::Utc::now());
                let cmd = PlaybackCommand {
                    command: PlaybackCommandKind::Unpause,
                    when,
                    emitted_at: when,
                    position_ticks: Some(Ticks::ZERO),
                    playlist_item_id: PlaylistItemId::from("a"),
                };
                core.apply_command(cmd).await;

                // Sync enables maxDelaySpeedToSync/2 ms after dispatch
                // (default 3000/2 = 1500ms).
                tokio::time::advance(Duration::from_millis(1600)).await;
                tokio::task::yield_now().await;
                assert_eq!(core.state(), PlaybackState::Syncing);

                // Player is 300ms behind schedule: within
                // [minDelaySpeedToSync, maxDelaySpeedToSync) -> SpeedToSync
                // (§8 scenario 2).
                engine.current_time.set(Ticks::from_millis(-300));
                let calls_before = engine.calls.borrow().len();
                core.on_time_update(Ticks::ZERO).await;
                {
                    let calls = engine.calls.borrow();
                    assert!(calls.len() > calls_before);
                    assert!(calls.last().unwrap().starts_with("set_playback_rate(1."));
                }

                // speedToSyncDuration elapses (default 1000ms): the restore
                // timer must put the rate back to 1.0 on its own.
                tokio::time::advance(Duration::from_millis(1100)).await;
                tokio::task::yield_now().await;
                assert_eq!(engine.calls.borrow().last().unwrap(), "set_playback_rate(1)");
            })
            .await;
    }

    #[tokio::test]
    async fn test_late_unpause_seeks_to_estimated_position_after_event() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let engine = Rc::new(MockMediaEngine::new());
                let core = make_core(engine.clone());

                // `when` is already in the past -> fireAt <= now -> late
                // dispatch; the Unpause row of §4.D requires a catch-up
                // seek to estimateCurrentTicks once the unpause event fires.
                let cmd = PlaybackCommand {
                    command: PlaybackCommandKind::Unpause,
                    when: remote_instant(0),
                    emitted_at: remote_instant(0),
                    position_ticks: Some(Ticks::ZERO),
                    playlist_item_id: PlaylistItemId::from("a"),
                };
                core.apply_command(cmd).await;

                assert!(engine.calls.borrow().contains(&"local_unpause".to_string()));
                // The catch-up seek must land after local_unpause in the
                // call log, not merely be present.
                let calls = engine.calls.borrow();
                let unpause_idx = calls.iter().position(|c| c == "local_unpause").unwrap();
                assert!(calls[unpause_idx + 1..].iter().any(|c| c.starts_with("local_seek")));
            })
            .await;
    }

    #[tokio::test]
    async fn test_unseekable_item_fails_categorized_without_corrupting_state() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let engine = Rc::new(MockMediaEngine::new());
                engine.reject_seek.set(true);
                let core = make_core(engine.clone());

                let cmd = PlaybackCommand {
                    command: PlaybackCommandKind::Unpause,
                    when: remote_instant(0),
                    emitted_at: remote_instant(0),
                    position_ticks: Some(Ticks::from_millis(60_000)),
                    playlist_item_id: PlaylistItemId::from("a"),
                };
                // §8 boundary: seek on a non-seekable item fails categorized
                // (PlayerError::NotSeekable); no state change beyond the
                // failure itself — the unpause still dispatches.
                core.apply_command(cmd).await;

                assert!(engine.calls.borrow().iter().any(|c| c.starts_with("local_seek")));
                assert!(engine.calls.borrow().contains(&"local_unpause".to_string()));
                // current_time is untouched since the rejected seek never commits.
                assert_eq!(engine.current_time_ticks(), Ticks::ZERO);
            })
            .await;
    }

    #[tokio::test]
    async fn test_remote_adapter_records_without_dispatch() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let session = Rc::new(RefCell::new(SessionState::new()));
                let player = Rc::new(PlayerAdapter::Remote);
                let probe: crate::time_sync::ProbeFn = Box::new(|| Box::pin(async { None }));
                let (_tx, settings_rx) = tokio::sync::watch::channel(SyncPlaySettings::default());
                let time_sync = Rc::new(TimeSync::new(probe, settings_rx.clone()));
                let transport = Rc::new(FixedTransportProvider(Rc::new(MockTransport::default())));
                let core = PlaybackCore::new(session.clone(), player, time_sync, settings_rx, transport);

                let cmd = PlaybackCommand {
                    command: PlaybackCommandKind::Seek,
                    when: remote_instant(0),
                    emitted_at: remote_instant(0),
                    position_ticks: Some(Ticks::from_millis(60_000)),
                    playlist_item_id: PlaylistItemId::from("a"),
                };
                core.apply_command(cmd.clone()).await;
                assert_eq!(session.borrow().last_command, Some(cmd));
            })
            .await;
    }

    #[test]
    fn test_jitter_keeps_same_position_when_not_repaired() {
        let pos = Ticks::from_millis(5_000);
        assert_eq!(jittered_position(pos, false), pos);
    }

    #[test]
    fn test_jitter_bounded_within_fifty_ms() {
        let pos = Ticks::from_millis(5_000);
        let jittered = jittered_position(pos, true);
        assert!((jittered - pos).abs() <= Ticks::from_millis(50));
    }

    #[test]
    fn test_choose_correction_boundaries() {
        let engine = Rc::new(MockMediaEngine::new());
        let core_for_settings = make_core(engine);
        let mut settings = SyncPlaySettings::default();
        settings.min_delay_speed_to_sync_ms = 200;
        settings.max_delay_speed_to_sync_ms = 3000;
        settings.min_delay_skip_to_sync_ms = 2000;

        // diff = minDelaySpeedToSync - 1ms -> no correction.
        assert_eq!(core_for_settings.choose_correction(199, &settings), DriftCorrection::None);
        // diff = minDelaySpeedToSync -> SpeedToSync.
        assert!(matches!(
            core_for_settings.choose_correction(200, &settings),
            DriftCorrection::SpeedToSync { .. }
        ));
        // diff = maxDelaySpeedToSync -> SkipToSync, not SpeedToSync.
        assert_eq!(core_for_settings.choose_correction(3000, &settings), DriftCorrection::SkipToSync);
        // diff = minDelaySkipToSync with useSpeedToSync=false -> SkipToSync.
        settings.use_speed_to_sync = false;
        assert_eq!(core_for_settings.choose_correction(2000, &settings), DriftCorrection::SkipToSync);
    }
}
