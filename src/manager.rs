//! Component F: the top-level facade (§2 "F", §4.F).
//!
//! `Manager` owns [`SessionState`], the current [`GroupInfo`], and the
//! single instances of [`TimeSync`]/[`PlaybackCore`]/[`QueueCore`]/
//! [`PlayerAdapter`] (§3 "Ownership"). It is the only component that checks
//! per-user access rights and the only one that talks to
//! [`InboundMessage`]/[`crate::transport::Transport`] directly; D and E
//! never see the wire types or the access list.
//!
//! Grounded on the circular-dependency resolution in §9 "Design notes":
//! rather than building `Manager` as a stub with getters that `PlaybackCore`
//! and `QueueCore` close over, this crate sidesteps the cycle entirely by
//! giving D and E the shared [`SessionState`] cell directly instead of a
//! reference to `Manager` itself — `Rc::new_cyclic` is only needed for the
//! one genuine back-reference, `TimeSync`'s probe callback into `Manager`
//! for ping/pong correlation.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::player::PlayerAdapter;
use crate::playback_core::{CoreEvent, PlaybackCore};
use crate::protocol::{
    GroupInfo, GroupUpdateType, InboundMessage, PlaybackCommand, PlaylistItemId, QueueMode, RepeatMode, ShuffleMode,
    UserId,
};
use crate::queue_core::QueueCore;
use crate::settings::SettingsHandle;
use crate::time::{RemoteInstant, Ticks};
use crate::time_sync::{ProbeFn, TimeSync, TimeSyncEvent};
use crate::transport::{PlayRequest, TransportProvider};

/// §3 "SessionState (process-wide singleton)". One instance per `Manager`;
/// shared with `PlaybackCore`/`QueueCore` via `Rc<RefCell<_>>` rather than
/// duplicated, since §3's invariants (`queuedCommand != None => ready =
/// false`, etc.) span all three components.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub enabled_at: Option<RemoteInstant>,
    pub ready: bool,
    pub following_group: bool,
    pub queued_command: Option<PlaybackCommand>,
    pub last_command: Option<PlaybackCommand>,
}

impl SessionState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            following_group: true,
            ..Self::default()
        }
    }

    /// §3 invariant 5 / §8 "Invariants (for all histories)": `queuedCommand
    /// != None => ready = false`. Checked after every state transition that
    /// touches either field (§7 "Invariant violation").
    fn check_invariants(&self) -> crate::Result<()> {
        if self.queued_command.is_some() && self.ready {
            return Err(crate::Error::invariant("queuedCommand set while ready"));
        }
        Ok(())
    }
}

/// Which access list a controller operation is gated by (§4.F "Each
/// controller operation checks the appropriate access right").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessKind {
    Playback,
    Playlist,
}

/// Events a collaborator (receiver UI, toast layer) observes (§6 "Emitted
/// events"), the subset `Manager` itself produces rather than forwards
/// from `PlaybackCore`'s [`CoreEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    PlayerChange,
    Enabled,
    GroupStateChange { state: String, reason: String },
    GroupStateUpdate,
    ShowMessage { key: &'static str, args: Option<String> },
    TimeSyncUpdate { offset_ms: i64, ping_ms: i64 },
    Syncing { active: bool, method: &'static str },
    NotifyOsd(&'static str),
    UserJoined(UserId),
    UserLeft(UserId),
    Denied(&'static str),
    /// §7 "Invariant violation": the session has been disabled and the
    /// embedder should surface this before the user attempts to reconnect.
    InvariantViolation(String),
}

/// `MessageSyncPlayMissingPlaybackAccess` (§7 "Access denied").
const MSG_MISSING_PLAYBACK_ACCESS: &str = "MessageSyncPlayMissingPlaybackAccess";
/// Symmetrical key for playlist-gated operations; not spelled out in §7
/// but follows the same naming scheme.
const MSG_MISSING_PLAYLIST_ACCESS: &str = "MessageSyncPlayMissingPlaylistAccess";

/// The top-level facade (§2 "F").
pub struct Manager {
    session: Rc<RefCell<SessionState>>,
    group_info: RefCell<Option<GroupInfo>>,
    current_user: UserId,

    player: Rc<PlayerAdapter>,
    time_sync: Rc<TimeSync>,
    playback_core: Rc<PlaybackCore>,
    queue_core: Rc<QueueCore>,
    transport: Rc<dyn TransportProvider>,
    #[allow(dead_code)]
    settings: SettingsHandle,

    pending_pings: RefCell<VecDeque<oneshot::Sender<RemoteInstant>>>,
    events_tx: broadcast::Sender<ManagerEvent>,
}

impl Manager {
    /// Build the whole component graph. The only genuine back-reference in
    /// the graph — `TimeSync`'s probe closure calling back into `Manager`
    /// to correlate a ping with its reply — is threaded through
    /// `Rc::new_cyclic` rather than a getter-exposing stub (§9).
    #[must_use]
    pub fn new(
        transport: Rc<dyn TransportProvider>,
        player: Rc<PlayerAdapter>,
        settings: SettingsHandle,
        current_user: UserId,
    ) -> Rc<Self> {
        let settings_rx = settings.subscribe();
        let session = Rc::new(RefCell::new(SessionState::new()));
        let (events_tx, _) = broadcast::channel(64);

        let manager = Rc::new_cyclic(|weak: &Weak<Manager>| {
            let probe = Self::make_probe(weak.clone());
            let time_sync = Rc::new(TimeSync::new(probe, settings_rx.clone()));
            let playback_core = PlaybackCore::new(
                session.clone(),
                player.clone(),
                time_sync.clone(),
                settings_rx.clone(),
                transport.clone(),
            );
            let queue_core = Rc::new(QueueCore::new(
                session.clone(),
                player.clone(),
                playback_core.clone(),
                time_sync.clone(),
                transport.clone(),
            ));

            Manager {
                session,
                group_info: RefCell::new(None),
                current_user,
                player,
                time_sync,
                playback_core,
                queue_core,
                transport,
                settings,
                pending_pings: RefCell::new(VecDeque::new()),
                events_tx,
            }
        });

        manager.playback_core.bind_to_player();
        manager.spawn_time_sync_loop();
        manager.spawn_core_event_loop();
        manager
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events_tx.subscribe()
    }

    #[must_use]
    pub fn group_info(&self) -> Option<GroupInfo> {
        self.group_info.borrow().clone()
    }

    #[must_use]
    pub fn session_snapshot(&self) -> SessionState {
        self.session.borrow().clone()
    }

    /// A probe closure for [`TimeSync`] that round-trips a ping through
    /// [`crate::transport::Transport::send_ping`] and waits for the reply
    /// to arrive via [`Manager::on_time_sync_pong`] — the echoed server
    /// time rides back on whatever inbound channel the embedder already
    /// pumps [`InboundMessage`]s through, so `TimeSync` itself never needs
    /// to know about the wire protocol (§9 Open Question: "capture the
    /// transport at dispatch", resolved the same way here by re-reading
    /// `current_transport()` on every probe rather than caching it).
    fn make_probe(weak: Weak<Manager>) -> ProbeFn {
        Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                let this = weak.upgrade()?;
                let (tx, rx) = oneshot::channel();
                this.pending_pings.borrow_mut().push_back(tx);

                let ping_ms = this.time_sync.ping();
                let ping_ms = if ping_ms == std::time::Duration::MAX { 0 } else { ping_ms.as_millis() as i64 };
                let transport = this.transport.current_transport();
                if transport.send_ping(ping_ms).await.is_err() {
                    return None;
                }

                tokio::time::timeout(std::time::Duration::from_secs(5), rx).await.ok()?.ok()
            })
        })
    }

    /// Complete the oldest outstanding probe with the server's echoed
    /// time. Called by the embedder when a ping-reply arrives out of band
    /// (§6 `sendSyncPlayPing`'s round trip).
    pub fn on_time_sync_pong(&self, remote_at: RemoteInstant) {
        if let Some(tx) = self.pending_pings.borrow_mut().pop_front() {
            let _ = tx.send(remote_at);
        }
    }

    fn spawn_time_sync_loop(self: &Rc<Self>) {
        let mut rx = self.time_sync.subscribe();
        let this = self.clone();
        tokio::task::spawn_local(async move {
            loop {
                match rx.recv().await {
                    Ok(TimeSyncEvent::Update { offset_ms, ping_ms }) => {
                        this.on_time_sync_update(offset_ms, ping_ms).await;
                    }
                    Ok(TimeSyncEvent::Lost) => this.on_time_sync_lost(),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// §4.D "Enabling -> Idle on first timeSyncUpdate (flush queuedCommand
    /// here)", §8 invariant 5.
    async fn on_time_sync_update(self: &Rc<Self>, offset_ms: i64, ping_ms: i64) {
        let was_ready = self.session.borrow().ready;
        if !was_ready {
            self.session.borrow_mut().ready = true;
            self.playback_core.on_time_sync_ready();
            self.flush_queued_command().await;
            self.enforce_invariants();
        }
        let _ = self.events_tx.send(ManagerEvent::TimeSyncUpdate { offset_ms, ping_ms });
    }

    /// §7 "Invariant violation": disable the session and surface an error
    /// event rather than let corrupted `SessionState` keep driving D/E.
    fn enforce_invariants(&self) {
        if let Err(err) = self.session.borrow().check_invariants() {
            warn!(target: "syncplay_core::manager", %err, "invariant violated, disabling session");
            self.disable();
            let _ = self.events_tx.send(ManagerEvent::InvariantViolation(err.to_string()));
        }
    }

    /// §4.D "any -> Enabling on timeSyncLost".
    fn on_time_sync_lost(&self) {
        self.session.borrow_mut().ready = false;
        self.playback_core.on_time_sync_lost();
    }

    async fn flush_queued_command(self: &Rc<Self>) {
        let queued = self.session.borrow_mut().queued_command.take();
        if let Some(cmd) = queued {
            self.process_command(cmd).await;
        }
    }

    fn spawn_core_event_loop(self: &Rc<Self>) {
        let mut rx = self.playback_core.subscribe();
        let this = self.clone();
        tokio::task::spawn_local(async move {
            loop {
                match rx.recv().await {
                    Ok(CoreEvent::Syncing { active, method }) => {
                        let _ = this.events_tx.send(ManagerEvent::Syncing { active, method });
                    }
                    Ok(CoreEvent::NotifyOsd(action)) => {
                        let _ = this.events_tx.send(ManagerEvent::NotifyOsd(action));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // ---- message dispatch (§6 "Inbound messages") --------------------

    /// Dispatch one inbound message to the appropriate core (§2 "Transport
    /// -> Manager -> {PlaybackCore, QueueCore}").
    pub async fn handle_inbound(self: &Rc<Self>, message: InboundMessage) {
        match message {
            InboundMessage::Command(cmd) => self.process_command(cmd).await,
            InboundMessage::GroupUpdate(update) => self.process_group_update(update).await,
        }
    }

    /// `processGroupUpdate(update)` (§4.F "Group-update routing").
    pub async fn process_group_update(self: &Rc<Self>, update: GroupUpdateType) {
        match update {
            GroupUpdateType::PlayQueue(queue_update) => {
                self.queue_core.update_play_queue(queue_update).await;
            }
            GroupUpdateType::GroupJoined(info) => self.enable(info),
            GroupUpdateType::GroupLeft | GroupUpdateType::NotInGroup => self.disable(),
            GroupUpdateType::GroupUpdate(info) => {
                *self.group_info.borrow_mut() = Some(info);
                let _ = self.events_tx.send(ManagerEvent::GroupStateUpdate);
            }
            GroupUpdateType::StateUpdate { state, reason } => {
                let _ = self.events_tx.send(ManagerEvent::GroupStateChange { state, reason });
            }
            GroupUpdateType::UserJoined(user) => {
                let _ = self.events_tx.send(ManagerEvent::UserJoined(user));
            }
            GroupUpdateType::UserLeft(user) => {
                let _ = self.events_tx.send(ManagerEvent::UserLeft(user));
            }
            GroupUpdateType::SyncPlayIsDisabled => {
                self.disable();
                let _ = self.events_tx.send(ManagerEvent::Denied("SyncPlayIsDisabled"));
            }
            GroupUpdateType::GroupDoesNotExist => {
                let _ = self.events_tx.send(ManagerEvent::Denied("GroupDoesNotExist"));
            }
            GroupUpdateType::CreateGroupDenied => {
                let _ = self.events_tx.send(ManagerEvent::Denied("CreateGroupDenied"));
            }
            GroupUpdateType::JoinGroupDenied => {
                let _ = self.events_tx.send(ManagerEvent::Denied("JoinGroupDenied"));
            }
            GroupUpdateType::LibraryAccessDenied => {
                let _ = self.events_tx.send(ManagerEvent::Denied("LibraryAccessDenied"));
            }
        }
    }

    /// `enable(groupInfo)` (§4.F): `Disabled -> Enabling` (§4.D).
    pub fn enable(self: &Rc<Self>, group_info: GroupInfo) {
        let enabled_at = group_info.last_updated_at;
        *self.group_info.borrow_mut() = Some(group_info);
        {
            let mut session = self.session.borrow_mut();
            session.enabled_at = Some(enabled_at);
            session.ready = false;
            session.following_group = true;
            session.queued_command = None;
            session.last_command = None;
        }
        self.playback_core.enable();
        self.time_sync.clone().start();
        let _ = self.events_tx.send(ManagerEvent::Enabled);
    }

    /// `disable()` (§4.F, §5 "Cancellation"): cancels all timers, unbinds
    /// the adapter's background sampling, clears `SessionState`.
    pub fn disable(&self) {
        self.time_sync.stop();
        self.playback_core.disable();
        *self.group_info.borrow_mut() = None;
        *self.session.borrow_mut() = SessionState::new();
        let _ = self.events_tx.send(ManagerEvent::GroupStateChange {
            state: "Disabled".to_owned(),
            reason: "left or not in a group".to_owned(),
        });
    }

    /// `processCommand(cmd)` (§4.F "Command routing").
    pub async fn process_command(self: &Rc<Self>, cmd: PlaybackCommand) {
        let Some(enabled_at) = self.session.borrow().enabled_at else {
            debug!(target: "syncplay_core::manager", "not enabled, dropping command");
            return;
        };
        if cmd.emitted_at < enabled_at {
            debug!(target: "syncplay_core::manager", "stale command, emittedAt < enabledAt (§7 'Stale update')");
            return;
        }
        if !self.player.is_playback_active() {
            debug!(target: "syncplay_core::manager", "player inactive, dropping command");
            return;
        }

        if !self.session.borrow().ready {
            self.session.borrow_mut().queued_command = Some(cmd);
            return;
        }

        let current_item = self.queue_core.current_playlist_item_id();
        let matches_current = current_item.as_ref() == Some(&cmd.playlist_item_id);
        if cmd.command != crate::protocol::PlaybackCommandKind::Stop && !matches_current {
            warn!(
                target: "syncplay_core::manager",
                expected = %cmd.playlist_item_id,
                found = ?current_item,
                "mismatched playlist item (§7 'Mismatched playlist item')"
            );
            return;
        }

        self.session.borrow_mut().last_command = Some(cmd.clone());
        self.playback_core.apply_command(cmd).await;
    }

    /// `followGroup()` (§4.F): resume following without rejoining.
    pub async fn follow_group(&self) {
        self.session.borrow_mut().following_group = true;
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_set_ignore_wait(false).await {
            warn!(target: "syncplay_core::manager", %err, "request_set_ignore_wait failed");
        }
    }

    /// `haltGroup()` (§4.F): stop following without leaving the group.
    pub async fn halt_group(&self) {
        self.session.borrow_mut().following_group = false;
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_set_ignore_wait(true).await {
            warn!(target: "syncplay_core::manager", %err, "request_set_ignore_wait failed");
        }
    }

    // ---- access control (§4.F, §7 "Access denied") --------------------

    fn has_access(&self, kind: AccessKind) -> bool {
        let Some(group) = self.group_info.borrow().clone() else {
            return false;
        };
        let rights = group.access_for(&self.current_user);
        match kind {
            AccessKind::Playback => rights.playback_access,
            AccessKind::Playlist => rights.playlist_access,
        }
    }

    /// Returns `false` (and emits `show-message`) iff the operation should
    /// be aborted without a Transport request (§7 "Access denied").
    fn check_access(&self, kind: AccessKind) -> bool {
        if self.has_access(kind) {
            return true;
        }
        let key = match kind {
            AccessKind::Playback => MSG_MISSING_PLAYBACK_ACCESS,
            AccessKind::Playlist => MSG_MISSING_PLAYLIST_ACCESS,
        };
        let _ = self.events_tx.send(ManagerEvent::ShowMessage { key, args: None });
        false
    }

    // ---- controller pass-throughs (§4.F) -------------------------------

    pub async fn play_pause(&self) {
        if !self.check_access(AccessKind::Playback) {
            return;
        }
        let transport = self.transport.current_transport();
        let result = if self.player.is_playing() {
            transport.request_pause().await
        } else {
            transport.request_unpause().await
        };
        if let Err(err) = result {
            warn!(target: "syncplay_core::manager", %err, "play_pause request failed");
        }
    }

    pub async fn unpause(&self) {
        if !self.check_access(AccessKind::Playback) {
            return;
        }
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_unpause().await {
            warn!(target: "syncplay_core::manager", %err, "unpause request failed");
        }
    }

    pub async fn pause(&self) {
        if !self.check_access(AccessKind::Playback) {
            return;
        }
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_pause().await {
            warn!(target: "syncplay_core::manager", %err, "pause request failed");
        }
    }

    pub async fn seek(&self, position_ticks: Ticks) {
        if !self.check_access(AccessKind::Playback) {
            return;
        }
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_seek(position_ticks).await {
            warn!(target: "syncplay_core::manager", %err, "seek request failed");
        }
    }

    pub async fn play(&self, req: PlayRequest) {
        if !self.check_access(AccessKind::Playlist) {
            return;
        }
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_play(req).await {
            warn!(target: "syncplay_core::manager", %err, "play request failed");
        }
    }

    pub async fn set_current_playlist_item(&self, id: PlaylistItemId) {
        if !self.check_access(AccessKind::Playlist) {
            return;
        }
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_set_playlist_item(id).await {
            warn!(target: "syncplay_core::manager", %err, "set_current_playlist_item request failed");
        }
    }

    pub async fn remove_from_playlist(&self, ids: Vec<PlaylistItemId>) {
        if !self.check_access(AccessKind::Playlist) {
            return;
        }
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_remove_from_playlist(ids).await {
            warn!(target: "syncplay_core::manager", %err, "remove_from_playlist request failed");
        }
    }

    pub async fn move_playlist_item(&self, id: PlaylistItemId, new_index: usize) {
        if !self.check_access(AccessKind::Playlist) {
            return;
        }
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_move_playlist_item(id, new_index).await {
            warn!(target: "syncplay_core::manager", %err, "move_playlist_item request failed");
        }
    }

    pub async fn queue(&self, ids: Vec<PlaylistItemId>, mode: QueueMode) {
        if !self.check_access(AccessKind::Playlist) {
            return;
        }
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_queue(ids, mode).await {
            warn!(target: "syncplay_core::manager", %err, "queue request failed");
        }
    }

    pub async fn queue_next(&self, ids: Vec<PlaylistItemId>) {
        self.queue(ids, QueueMode::Next).await;
    }

    pub async fn next_track(&self, id: PlaylistItemId) {
        if !self.check_access(AccessKind::Playlist) {
            return;
        }
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_next_track(id).await {
            warn!(target: "syncplay_core::manager", %err, "next_track request failed");
        }
    }

    pub async fn previous_track(&self, id: PlaylistItemId) {
        if !self.check_access(AccessKind::Playlist) {
            return;
        }
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_previous_track(id).await {
            warn!(target: "syncplay_core::manager", %err, "previous_track request failed");
        }
    }

    pub async fn set_repeat_mode(&self, mode: RepeatMode) {
        if !self.check_access(AccessKind::Playlist) {
            return;
        }
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_set_repeat_mode(mode).await {
            warn!(target: "syncplay_core::manager", %err, "set_repeat_mode request failed");
        }
    }

    pub async fn set_shuffle_mode(&self, mode: ShuffleMode) {
        if !self.check_access(AccessKind::Playlist) {
            return;
        }
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_set_shuffle_mode(mode).await {
            warn!(target: "syncplay_core::manager", %err, "set_shuffle_mode request failed");
        }
    }

    pub async fn toggle_shuffle_mode(&self) {
        let next = match self.queue_core.shuffle_mode() {
            ShuffleMode::Sorted => ShuffleMode::Shuffle,
            ShuffleMode::Shuffle => ShuffleMode::Sorted,
        };
        self.set_shuffle_mode(next).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::mocks::MockMediaEngine;
    use crate::protocol::{AccessRights, GroupId, PlaybackCommandKind};
    use crate::transport::mocks::MockTransport;
    use crate::transport::Transport;
    use std::collections::HashMap;

    fn remote_instant(secs: i64) -> RemoteInstant {
        RemoteInstant::from_utc(chrono::DateTime::from_timestamp(secs, 0).unwrap())
    }

    struct FixedTransportProvider(Rc<MockTransport>);
    impl TransportProvider for FixedTransportProvider {
        fn current_transport(&self) -> Rc<dyn Transport> {
            self.0.clone()
        }
    }

    fn make_manager(allow_playback: bool, allow_playlist: bool) -> (Rc<Manager>, Rc<MockMediaEngine>, Rc<MockTransport>) {
        let engine = Rc::new(MockMediaEngine::new());
        engine.active.set(true);
        let player = Rc::new(PlayerAdapter::Local(engine.clone()));
        let mock_transport = Rc::new(MockTransport::default());
        let transport: Rc<dyn TransportProvider> = Rc::new(FixedTransportProvider(mock_transport.clone()));
        let user = UserId("me".into());
        let manager = Manager::new(transport, player, SettingsHandle::default(), user.clone());

        let mut access_list = HashMap::new();
        access_list.insert(
            user,
            AccessRights {
                playback_access: allow_playback,
                playlist_access: allow_playlist,
            },
        );
        let group_info = GroupInfo {
            group_id: GroupId("g".into()),
            participants: vec![],
            administrators: vec![],
            access_list,
            last_updated_at: remote_instant(1000),
        };
        manager.enable(group_info);
        (manager, engine, mock_transport)
    }

    #[tokio::test]
    async fn test_disabled_drops_commands() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let engine = Rc::new(MockMediaEngine::new());
                let player = Rc::new(PlayerAdapter::Local(engine));
                let transport: Rc<dyn TransportProvider> = Rc::new(FixedTransportProvider(Rc::new(MockTransport::default())));
                let manager = Manager::new(transport, player, SettingsHandle::default(), UserId("me".into()));

                let cmd = PlaybackCommand {
                    command: PlaybackCommandKind::Unpause,
                    when: remote_instant(10),
                    emitted_at: remote_instant(10),
                    position_ticks: Some(Ticks::ZERO),
                    playlist_item_id: PlaylistItemId::from("a"),
                };
                manager.process_command(cmd).await;
                assert!(manager.session_snapshot().last_command.is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_command_queued_while_not_ready_then_flushed() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (manager, _engine, _transport) = make_manager(true, true);
                assert!(!manager.session_snapshot().ready);

                let cmd = PlaybackCommand {
                    command: PlaybackCommandKind::Stop,
                    when: remote_instant(1001),
                    emitted_at: remote_instant(1001),
                    position_ticks: None,
                    playlist_item_id: PlaylistItemId::from("a"),
                };
                manager.process_command(cmd.clone()).await;
                assert_eq!(manager.session_snapshot().queued_command, Some(cmd.clone()));

                manager.on_time_sync_update(0, 0).await;
                assert!(manager.session_snapshot().ready);
                assert!(manager.session_snapshot().queued_command.is_none());
                assert_eq!(manager.session_snapshot().last_command, Some(cmd));
            })
            .await;
    }

    #[tokio::test]
    async fn test_invariant_violation_disables_and_emits_event() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (manager, _engine, _transport) = make_manager(true, true);
                let mut events = manager.subscribe();

                // Force an impossible state: queuedCommand set while ready.
                {
                    let mut session = manager.session.borrow_mut();
                    session.ready = true;
                    session.queued_command = Some(PlaybackCommand {
                        command: PlaybackCommandKind::Stop,
                        when: remote_instant(1),
                        emitted_at: remote_instant(1),
                        position_ticks: None,
                        playlist_item_id: PlaylistItemId::from("a"),
                    });
                }
                manager.enforce_invariants();

                assert!(manager.group_info().is_none());
                let mut saw_violation = false;
                while let Ok(event) = events.try_recv() {
                    if matches!(event, ManagerEvent::InvariantViolation(_)) {
                        saw_violation = true;
                    }
                }
                assert!(saw_violation);
            })
            .await;
    }

    #[tokio::test]
    async fn test_stale_command_dropped() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (manager, _engine, _transport) = make_manager(true, true);
                manager.on_time_sync_update(0, 0).await;

                let cmd = PlaybackCommand {
                    command: PlaybackCommandKind::Stop,
                    when: remote_instant(500),
                    emitted_at: remote_instant(500), // before enabledAt=1000
                    position_ticks: None,
                    playlist_item_id: PlaylistItemId::from("a"),
                };
                manager.process_command(cmd).await;
                assert!(manager.session_snapshot().last_command.is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_no_commands_accepted_after_disable() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (manager, _engine, transport) = make_manager(true, true);
                manager.on_time_sync_update(0, 0).await;
                manager.disable();

                // §8 invariant 4: once disabled, no further player commands
                // are issued, even for a command that would have matched
                // the prior session's enabledAt.
                let cmd = PlaybackCommand {
                    command: PlaybackCommandKind::Unpause,
                    when: remote_instant(2000),
                    emitted_at: remote_instant(2000),
                    position_ticks: Some(Ticks::ZERO),
                    playlist_item_id: PlaylistItemId::from("a"),
                };
                manager.process_command(cmd).await;

                assert!(manager.session_snapshot().last_command.is_none());
                assert!(transport.calls.borrow().is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn test_access_denied_emits_show_message_no_transport_call() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (manager, _engine, transport) = make_manager(false, false);
                let mut events = manager.subscribe();

                manager.unpause().await;

                assert!(transport.calls.borrow().is_empty());
                let event = events.try_recv().expect("expected ShowMessage event");
                assert!(matches!(event, ManagerEvent::ShowMessage { key, .. } if key == MSG_MISSING_PLAYBACK_ACCESS));
            })
            .await;
    }

    #[tokio::test]
    async fn test_access_granted_issues_transport_request() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (manager, _engine, transport) = make_manager(true, true);
                manager.unpause().await;
                assert_eq!(transport.calls.borrow().as_slice(), ["unpause"]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_group_left_disables_and_clears_session() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (manager, _engine, _transport) = make_manager(true, true);
                assert!(manager.group_info().is_some());

                manager.process_group_update(GroupUpdateType::NotInGroup).await;

                assert!(manager.group_info().is_none());
                assert!(manager.session_snapshot().enabled_at.is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_reconnect_drops_command_before_new_enabled_at() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (manager, _engine, _transport) = make_manager(true, true);
                manager.disable();

                let mut access_list = HashMap::new();
                access_list.insert(UserId("me".into()), AccessRights::default());
                let new_group = GroupInfo {
                    group_id: GroupId("g2".into()),
                    participants: vec![],
                    administrators: vec![],
                    access_list,
                    last_updated_at: remote_instant(5000),
                };
                manager.enable(new_group);
                manager.on_time_sync_update(0, 0).await;

                let cmd = PlaybackCommand {
                    command: PlaybackCommandKind::Stop,
                    when: remote_instant(2000),
                    emitted_at: remote_instant(2000), // < new enabledAt=5000
                    position_ticks: None,
                    playlist_item_id: PlaylistItemId::from("a"),
                };
                manager.process_command(cmd).await;
                assert!(manager.session_snapshot().last_command.is_none());
            })
            .await;
    }
}
