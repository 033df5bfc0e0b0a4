//! The Transport capability (§6) the core consumes, and
//! [`TransportProvider`], the re-read-per-use accessor required by §5
//! ("components MUST re-read it per use, not cache").

use async_trait::async_trait;
use serde::Serialize;

use crate::protocol::{BufferingRequest, PlaylistItemId, QueueMode, RepeatMode, ShuffleMode};
use crate::time::Ticks;

/// A non-OK response from any Transport request (§7 "Transient transport
/// failure"). Not session-fatal: logged; the core does not retry, since the
/// next server-driven update is authoritative.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport request failed: {0}")]
pub struct TransportError(pub String);

/// `{PlayingQueue, PlayingItemPosition, StartPositionTicks}` for
/// `requestSyncPlayPlay` (§6) — distinct from [`crate::player::PlayOptions`],
/// which targets the local engine rather than the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayRequest {
    pub playing_queue: Vec<PlaylistItemId>,
    pub playing_item_position: usize,
    pub start_position_ticks: Ticks,
}

/// The server-request capability the core consumes (§6 "Transport").
///
/// Mirrors the underlying `apiClient` the source dereferences per-call
/// rather than caches; here that discipline is expressed through
/// [`TransportProvider`] rather than by this trait itself, keeping the
/// capability surface focused on what a request actually needs.
#[async_trait(?Send)]
pub trait Transport {
    async fn request_unpause(&self) -> Result<(), TransportError>;
    async fn request_pause(&self) -> Result<(), TransportError>;
    async fn request_seek(&self, position_ticks: Ticks) -> Result<(), TransportError>;
    async fn request_stop(&self) -> Result<(), TransportError>;
    async fn request_play(&self, req: PlayRequest) -> Result<(), TransportError>;
    async fn request_set_playlist_item(&self, id: PlaylistItemId) -> Result<(), TransportError>;
    async fn request_remove_from_playlist(&self, ids: Vec<PlaylistItemId>) -> Result<(), TransportError>;
    async fn request_move_playlist_item(&self, id: PlaylistItemId, new_index: usize) -> Result<(), TransportError>;
    async fn request_queue(&self, ids: Vec<PlaylistItemId>, mode: QueueMode) -> Result<(), TransportError>;
    async fn request_next_track(&self, id: PlaylistItemId) -> Result<(), TransportError>;
    async fn request_previous_track(&self, id: PlaylistItemId) -> Result<(), TransportError>;
    async fn request_set_repeat_mode(&self, mode: RepeatMode) -> Result<(), TransportError>;
    async fn request_set_shuffle_mode(&self, mode: ShuffleMode) -> Result<(), TransportError>;
    async fn request_buffering(&self, req: BufferingRequest) -> Result<(), TransportError>;
    async fn request_set_ignore_wait(&self, ignore_wait: bool) -> Result<(), TransportError>;
    async fn send_ping(&self, ping_ms: i64) -> Result<(), TransportError>;
}

/// Re-reads the current `Transport` on every call (§5 "components MUST
/// re-read it per use, not cache") rather than holding a single instance,
/// so swapping the underlying API client mid-session (reconnect) is safe.
pub trait TransportProvider {
    fn current_transport(&self) -> std::rc::Rc<dyn Transport>;
}
