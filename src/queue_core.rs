//! Component E: applies queue-update events to the [`QueueModel`] and
//! drives the playback consequences of those updates (§4.E).

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::manager::SessionState;
use crate::player::{PlayOptions, PlayerAdapter};
use crate::playback_core::PlaybackCore;
use crate::protocol::{PlaybackCommand, QueueUpdate, QueueUpdateReason};
use crate::queue_model::{ApplyOutcome, QueueModel};
use crate::time::{LocalInstant, Ticks, TICKS_PER_MILLISECOND};
use crate::time_sync::TimeSync;
use crate::transport::TransportProvider;

/// Applies queue updates to [`QueueModel`] and triggers the re-start/seek
/// side effects that follow a current-item change (§2 "E").
pub struct QueueCore {
    model: RefCell<QueueModel>,
    session: Rc<RefCell<SessionState>>,
    player: Rc<PlayerAdapter>,
    playback_core: Rc<PlaybackCore>,
    time_sync: Rc<TimeSync>,
    transport: Rc<dyn TransportProvider>,
}

impl QueueCore {
    #[must_use]
    pub fn new(
        session: Rc<RefCell<SessionState>>,
        player: Rc<PlayerAdapter>,
        playback_core: Rc<PlaybackCore>,
        time_sync: Rc<TimeSync>,
        transport: Rc<dyn TransportProvider>,
    ) -> Self {
        Self {
            model: RefCell::new(QueueModel::new()),
            session,
            player,
            playback_core,
            time_sync,
            transport,
        }
    }

    #[must_use]
    pub fn current_playlist_item_id(&self) -> Option<crate::protocol::PlaylistItemId> {
        self.model.borrow().current_playlist_item_id().cloned()
    }

    #[must_use]
    pub fn shuffle_mode(&self) -> crate::protocol::ShuffleMode {
        self.model.borrow().shuffle_mode()
    }

    /// `updatePlayQueue(update)` (§4.E).
    pub async fn update_play_queue(self: &Rc<Self>, update: QueueUpdate) {
        // Remote-self-managed short-circuit (§4.E): the remote player runs
        // its own SyncPlay session, so the core only tracks bookkeeping.
        if self.player.is_remote() {
            debug!(target: "syncplay_core::queue_core", "remote adapter, not driving local playback");
            if self.model.borrow_mut().apply(update) == ApplyOutcome::Discarded {
                debug!(target: "syncplay_core::queue_core", "stale queue update discarded");
            }
            return;
        }

        let reason = update.reason;
        let outcome = self.model.borrow_mut().apply(update);
        if outcome == ApplyOutcome::Discarded {
            debug!(target: "syncplay_core::queue_core", "stale queue update discarded (§7 'Stale update')");
            return;
        }

        match reason {
            QueueUpdateReason::NewPlaylist => self.on_new_playlist().await,
            QueueUpdateReason::SetCurrentItem | QueueUpdateReason::NextTrack | QueueUpdateReason::PreviousTrack => {
                self.on_current_item_changed().await;
            }
            QueueUpdateReason::RemoveItems => self.on_remove_items().await,
            QueueUpdateReason::MoveItem | QueueUpdateReason::Queue | QueueUpdateReason::QueueNext => {
                // No playback interruption; the player surfaces the change
                // itself (§4.E: "emit a playlistitemadd event").
            }
            QueueUpdateReason::RepeatMode => {
                let mode = self.model.borrow().repeat_mode();
                if let Err(err) = self.player.local_set_repeat_mode(mode).await {
                    warn!(target: "syncplay_core::queue_core", %err, "local_set_repeat_mode failed");
                }
            }
            QueueUpdateReason::ShuffleMode => {
                let mode = self.model.borrow().shuffle_mode();
                if let Err(err) = self.player.local_set_shuffle_mode(mode).await {
                    warn!(target: "syncplay_core::queue_core", %err, "local_set_shuffle_mode failed");
                }
            }
        }
    }

    async fn on_new_playlist(self: &Rc<Self>) {
        if !self.session.borrow().following_group {
            self.follow_group_playback().await;
        }
        self.start_playback().await;
    }

    async fn on_current_item_changed(&self) {
        let current = self.model.borrow().current_playlist_item_id().cloned();
        if !self.session.borrow().following_group {
            debug!(target: "syncplay_core::queue_core", "not following group, ignoring current-item change");
            return;
        }
        if let Some(id) = current {
            if let Err(err) = self.player.local_set_current_playlist_item(id).await {
                warn!(target: "syncplay_core::queue_core", %err, "local_set_current_playlist_item failed");
            }
        }
    }

    /// §4.E "RemoveItems: if realPlaylistItemId != currentPlaylistItemId,
    /// switch current item."
    async fn on_remove_items(&self) {
        let (real, current) = {
            let model = self.model.borrow();
            (model.real_playlist_item_id().cloned(), model.current_playlist_item_id().cloned())
        };
        if real != current {
            if let Some(id) = current.clone() {
                if let Err(err) = self.player.local_set_current_playlist_item(id.clone()).await {
                    warn!(target: "syncplay_core::queue_core", %err, "local_set_current_playlist_item failed");
                    return;
                }
                self.model.borrow_mut().set_real_playlist_item_id(Some(id));
            }
        }
    }

    /// §4.F "user may halt following without leaving": flips the
    /// follow flag and asks the server to stop blocking our group
    /// position (`setIgnoreWait(false)`).
    async fn follow_group_playback(&self) {
        let transport = self.transport.current_transport();
        if let Err(err) = transport.request_set_ignore_wait(false).await {
            warn!(target: "syncplay_core::queue_core", %err, "request_set_ignore_wait failed");
        }
        self.session.borrow_mut().following_group = true;
    }

    /// `startPlayback` (§4.E): extrapolate the right start position from
    /// whichever of `lastPlaybackCommand`/`update.startPositionTicks` is
    /// fresher, then hand off to the player and arm the ready-on-start
    /// listener.
    async fn start_playback(self: &Rc<Self>) {
        let (is_empty, ids, current_index, start_ticks, last_update) = {
            let model = self.model.borrow();
            (
                model.is_empty(),
                model.playlist_as_item_ids().to_vec(),
                model.current_index(),
                model.start_position_ticks(),
                model.last_update_time(),
            )
        };
        if is_empty {
            debug!(target: "syncplay_core::queue_core", "empty playlist, nothing to play");
            return;
        }
        let Some(last_update) = last_update else {
            return;
        };

        let last_command = self.session.borrow().last_command.clone();
        let start_position_ticks = self.resolve_start_position(last_command.as_ref(), last_update, start_ticks);

        let start_index = current_index.unwrap_or(0);
        let opts = PlayOptions {
            playlist_item_ids: ids,
            start_position_ticks,
            start_index,
        };
        if let Err(err) = self.player.local_play(opts).await {
            warn!(target: "syncplay_core::queue_core", %err, "local_play failed");
            return;
        }
        self.playback_core.schedule_ready_request_on_playback_start();
    }

    /// Prefer `lastPlaybackCommand` over `update.startPositionTicks` when
    /// the command is fresher than the update (§4.E `startPlayback`).
    fn resolve_start_position(
        &self,
        last_command: Option<&PlaybackCommand>,
        update_last_update: crate::time::RemoteInstant,
        update_start_ticks: Ticks,
    ) -> Ticks {
        if let Some(cmd) = last_command {
            if cmd.emitted_at >= update_last_update {
                if let Some(base) = cmd.position_ticks {
                    return self.estimate_current_ticks(base, cmd.when);
                }
            }
        }
        self.estimate_current_ticks(update_start_ticks, update_last_update)
    }

    /// `estimateCurrentTicks(ticks, when)` (§4.D), duplicated here rather
    /// than borrowed from `PlaybackCore` since `QueueCore` needs it against
    /// a queue update's `lastUpdate` rather than a command's `when`.
    fn estimate_current_ticks(&self, ticks: Ticks, when: crate::time::RemoteInstant) -> Ticks {
        let now_remote = self.time_sync.local_to_remote(LocalInstant::now());
        let elapsed_ms = (now_remote - when).num_milliseconds();
        ticks + Ticks(elapsed_ms * TICKS_PER_MILLISECOND)
    }
}
