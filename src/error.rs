//! Crate-wide error types.
//!
//! Per-component recoverable failures (a rejected player command, a
//! non-OK transport response, a timed-out player-event wait) are *not*
//! funneled through this type — §7 of the spec treats those as logged and
//! self-correcting, not session-fatal. [`Error`] is reserved for failures
//! that end the current SyncPlay session: invariant violations and
//! settings I/O.

use crate::protocol::PlaylistItemId;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level, session-fatal error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An internal invariant was violated (§7 "Invariant violation").
    ///
    /// Fatal to the current session: the caller should disable the
    /// manager and surface this to the user, but the process keeps
    /// running so reconnection can retry.
    #[error("SyncPlay invariant violated: {0}")]
    InvariantViolation(String),

    /// A command referenced a playlist item that isn't the one currently
    /// playing (§7 "Mismatched playlist item").
    #[error("command targets playlist item {expected}, but {found} is current")]
    MismatchedPlaylistItem {
        expected: PlaylistItemId,
        found: PlaylistItemId,
    },

    /// Settings failed to load or save.
    #[error("settings error: {0}")]
    Settings(#[from] crate::settings::SettingsError),
}

impl Error {
    /// Construct an [`Error::InvariantViolation`] with a formatted message.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_display() {
        let err = Error::invariant("queuedCommand set while ready");
        assert!(err.to_string().contains("queuedCommand set while ready"));
    }

    #[test]
    fn test_mismatched_playlist_item_display() {
        let err = Error::MismatchedPlaylistItem {
            expected: PlaylistItemId::from("a"),
            found: PlaylistItemId::from("b"),
        };
        let msg = err.to_string();
        assert!(msg.contains('a') && msg.contains('b'));
    }
}
