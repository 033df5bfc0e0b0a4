//! Component C: the in-memory shared playlist (§4.C).

use crate::protocol::{PlaylistItemId, QueueUpdate, RepeatMode, ShuffleMode};
use crate::time::{RemoteInstant, Ticks};

/// Result of [`QueueModel::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Discarded,
}

/// `apply(update)`, `currentPlaylistItemId()`, ... (§4.C).
///
/// Invariant: `lastUpdate` strictly increases; an apply whose
/// `update.lastUpdate <= current` is discarded (§4.C, §8 invariant 2).
#[derive(Debug, Clone)]
pub struct QueueModel {
    playlist: Vec<PlaylistItemId>,
    current_index: Option<usize>,
    /// The item the local player is actually playing, which can lag
    /// `current_index` across `RemoveItems` updates that don't move the
    /// cursor (§4.C `realPlaylistItemId`).
    real_item: Option<PlaylistItemId>,
    start_position_ticks: Ticks,
    last_update: Option<RemoteInstant>,
    repeat_mode: RepeatMode,
    shuffle_mode: ShuffleMode,
}

impl Default for QueueModel {
    fn default() -> Self {
        Self {
            playlist: Vec::new(),
            current_index: None,
            real_item: None,
            start_position_ticks: Ticks::ZERO,
            last_update: None,
            repeat_mode: RepeatMode::RepeatNone,
            shuffle_mode: ShuffleMode::Sorted,
        }
    }
}

impl QueueModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an update iff strictly newer than the last applied one
    /// (§4.C, §8 invariant 2, "Stale update idempotence" law).
    pub fn apply(&mut self, update: QueueUpdate) -> ApplyOutcome {
        if let Some(last) = self.last_update {
            if update.last_update <= last {
                return ApplyOutcome::Discarded;
            }
        }

        let reason = update.reason;
        self.playlist = update.playlist;
        self.current_index = update.current_index;
        // §4.C: `realPlaylistItemId` lags `currentPlaylistItemId` across a
        // `RemoveItems` update until the player actually catches up —
        // advancing it here would make `QueueCore::on_remove_items`'s
        // `real != current` check permanently false. Only `QueueCore`
        // (via `set_real_playlist_item_id`) advances it for that reason;
        // every other reason is a real switch the player is driven to
        // immediately, so the model can track it as current right away.
        if reason != QueueUpdateReason::RemoveItems {
            self.real_item = update.current_index.and_then(|i| self.playlist.get(i).cloned());
        }
        self.start_position_ticks = update.start_position_ticks;
        self.last_update = Some(update.last_update);
        self.repeat_mode = update.repeat_mode;
        self.shuffle_mode = update.shuffle_mode;

        ApplyOutcome::Applied
    }

    #[must_use]
    pub fn current_playlist_item_id(&self) -> Option<&PlaylistItemId> {
        self.current_index.and_then(|i| self.playlist.get(i))
    }

    /// The item the local player is actually on; may differ from
    /// `current_playlist_item_id` after a `RemoveItems` update (§4.C).
    #[must_use]
    pub fn real_playlist_item_id(&self) -> Option<&PlaylistItemId> {
        self.real_item.as_ref()
    }

    /// Record that the local player has caught up to the current item,
    /// called by `QueueCore` once it drives a switch (§4.E `RemoveItems`).
    pub fn set_real_playlist_item_id(&mut self, id: Option<PlaylistItemId>) {
        self.real_item = id;
    }

    #[must_use]
    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    #[must_use]
    pub fn playlist_as_item_ids(&self) -> &[PlaylistItemId] {
        &self.playlist
    }

    #[must_use]
    pub fn start_position_ticks(&self) -> Ticks {
        self.start_position_ticks
    }

    #[must_use]
    pub fn last_update_time(&self) -> Option<RemoteInstant> {
        self.last_update
    }

    #[must_use]
    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat_mode
    }

    #[must_use]
    pub fn shuffle_mode(&self) -> ShuffleMode {
        self.shuffle_mode
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.playlist.is_empty()
    }
}
