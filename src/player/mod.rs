//! Component B: the player adapter and the underlying media engine trait.
//!
//! `PlayerAdapter` gives PlaybackCore/QueueCore a single interface
//! regardless of whether the thing actually playing media lives in this
//! process (`Local`) or is driven by a remote peer that manages its own
//! SyncPlay session (`Remote`, §4.B, §4.D step 3, §8 invariant 6).

use std::rc::Rc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::protocol::{PlaylistItemId, RepeatMode, ShuffleMode};
use crate::time::Ticks;

/// Normalized events the underlying engine emits, re-broadcast unchanged to
/// PlaybackCore/QueueCore (§6 "Emitted events"). Only the subset PlaybackCore
/// and QueueCore actually react to is modeled; cast/UI-facing events
/// (`notify-osd`, `show-message`) live on `Manager` instead, since they are
/// not things the adapter itself produces.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    PlaybackStart,
    PlaybackStop,
    Unpause,
    Pause,
    TimeUpdate(Ticks),
    Playing,
    Waiting,
    PlaylistItemAdd,
}

/// Options for `localPlay` (§4.E `startPlayback`).
#[derive(Debug, Clone, PartialEq)]
pub struct PlayOptions {
    pub playlist_item_ids: Vec<PlaylistItemId>,
    pub start_position_ticks: Ticks,
    pub start_index: usize,
}

/// Recoverable failure from a `local*` operation (§7 "Player command
/// failure"). Not session-fatal: logged, and the next drift cycle or
/// command corrects the divergence.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlayerError {
    #[error("player rejected the command: {0}")]
    Rejected(String),
    #[error("item is not seekable")]
    NotSeekable,
    #[error("no active playback session")]
    Inactive,
}

/// The in-process media engine a `Local` adapter drives (§4.B capability
/// set, minus the parts — `isRemote`, binding — that belong to the adapter
/// itself rather than the engine underneath it).
///
/// Grounded on `enrichment/traits.rs`'s trait-plus-mock pattern: an
/// `async_trait` capability with a hand-written mock living next to it for
/// tests, rather than a generated/mocking-framework double.
#[async_trait(?Send)]
pub trait MediaEngine {
    fn is_playback_active(&self) -> bool;
    fn is_playing(&self) -> bool;
    fn current_time_ticks(&self) -> Ticks;
    fn has_playback_rate(&self) -> bool;
    fn get_playback_rate(&self) -> f64;
    fn set_playback_rate(&self, rate: f64);

    async fn local_play(&self, opts: PlayOptions) -> Result<(), PlayerError>;
    async fn local_pause(&self) -> Result<(), PlayerError>;
    async fn local_unpause(&self) -> Result<(), PlayerError>;
    async fn local_seek(&self, ticks: Ticks) -> Result<(), PlayerError>;
    async fn local_stop(&self) -> Result<(), PlayerError>;
    async fn local_set_current_playlist_item(&self, id: PlaylistItemId) -> Result<(), PlayerError>;
    async fn local_set_repeat_mode(&self, mode: RepeatMode) -> Result<(), PlayerError>;
    async fn local_set_shuffle_mode(&self, mode: ShuffleMode) -> Result<(), PlayerError>;

    /// Subscribe to this engine's normalized event stream.
    fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent>;
}

/// §4.B: "Local (full control...), Remote (the controlled player runs
/// elsewhere; local-* operations are no-ops that defer to PlaybackCore's
/// server-mediated variants)".
pub enum PlayerAdapter {
    Local(Rc<dyn MediaEngine>),
    Remote,
}

impl PlayerAdapter {
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, PlayerAdapter::Remote)
    }

    #[must_use]
    pub fn is_playback_active(&self) -> bool {
        match self {
            PlayerAdapter::Local(engine) => engine.is_playback_active(),
            PlayerAdapter::Remote => true,
        }
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        match self {
            PlayerAdapter::Local(engine) => engine.is_playing(),
            PlayerAdapter::Remote => false,
        }
    }

    #[must_use]
    pub fn current_time_ticks(&self) -> Ticks {
        match self {
            PlayerAdapter::Local(engine) => engine.current_time_ticks(),
            PlayerAdapter::Remote => Ticks::ZERO,
        }
    }

    #[must_use]
    pub fn has_playback_rate(&self) -> bool {
        match self {
            PlayerAdapter::Local(engine) => engine.has_playback_rate(),
            PlayerAdapter::Remote => false,
        }
    }

    #[must_use]
    pub fn get_playback_rate(&self) -> f64 {
        match self {
            PlayerAdapter::Local(engine) => engine.get_playback_rate(),
            PlayerAdapter::Remote => 1.0,
        }
    }

    pub fn set_playback_rate(&self, rate: f64) {
        if let PlayerAdapter::Local(engine) = self {
            engine.set_playback_rate(rate);
        }
    }

    pub async fn local_play(&self, opts: PlayOptions) -> Result<(), PlayerError> {
        match self {
            PlayerAdapter::Local(engine) => engine.local_play(opts).await,
            PlayerAdapter::Remote => Ok(()),
        }
    }

    pub async fn local_pause(&self) -> Result<(), PlayerError> {
        match self {
            PlayerAdapter::Local(engine) => engine.local_pause().await,
            PlayerAdapter::Remote => Ok(()),
        }
    }

    pub async fn local_unpause(&self) -> Result<(), PlayerError> {
        match self {
            PlayerAdapter::Local(engine) => engine.local_unpause().await,
            PlayerAdapter::Remote => Ok(()),
        }
    }

    pub async fn local_seek(&self, ticks: Ticks) -> Result<(), PlayerError> {
        match self {
            PlayerAdapter::Local(engine) => engine.local_seek(ticks).await,
            PlayerAdapter::Remote => Ok(()),
        }
    }

    pub async fn local_stop(&self) -> Result<(), PlayerError> {
        match self {
            PlayerAdapter::Local(engine) => engine.local_stop().await,
            PlayerAdapter::Remote => Ok(()),
        }
    }

    pub async fn local_set_current_playlist_item(&self, id: PlaylistItemId) -> Result<(), PlayerError> {
        match self {
            PlayerAdapter::Local(engine) => engine.local_set_current_playlist_item(id).await,
            PlayerAdapter::Remote => Ok(()),
        }
    }

    pub async fn local_set_repeat_mode(&self, mode: RepeatMode) -> Result<(), PlayerError> {
        match self {
            PlayerAdapter::Local(engine) => engine.local_set_repeat_mode(mode).await,
            PlayerAdapter::Remote => Ok(()),
        }
    }

    pub async fn local_set_shuffle_mode(&self, mode: ShuffleMode) -> Result<(), PlayerError> {
        match self {
            PlayerAdapter::Local(engine) => engine.local_set_shuffle_mode(mode).await,
            PlayerAdapter::Remote => Ok(()),
        }
    }

    /// Subscribe to the underlying engine's events. Panics if called on a
    /// `Remote` adapter bound with no local engine — callers only attach
    /// PlaybackCore/QueueCore's event loop once bound (§5 "bindToPlayer").
    pub fn subscribe(&self) -> Option<broadcast::Receiver<PlaybackEvent>> {
        match self {
            PlayerAdapter::Local(engine) => Some(engine.subscribe()),
            PlayerAdapter::Remote => None,
        }
    }
}
