//! Wire types (§3, §6): group info, commands, queue updates, and inbound
//! messages as they cross the Transport boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::time::{RemoteInstant, Ticks};

/// Opaque identifier for a playlist item (§3 `GroupInfo`/`PlaybackCommand`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaylistItemId(pub String);

impl PlaylistItemId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlaylistItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlaylistItemId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PlaylistItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque identifier for a group member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Opaque identifier for a SyncPlay group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

/// Per-user access rights within a group (§3 `GroupInfo.accessList`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessRights {
    pub playback_access: bool,
    pub playlist_access: bool,
}

/// `{ groupId, participants[], administrators[], accessList, lastUpdatedAt }` (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupInfo {
    pub group_id: GroupId,
    pub participants: Vec<UserId>,
    pub administrators: Vec<UserId>,
    pub access_list: std::collections::HashMap<UserId, AccessRights>,
    pub last_updated_at: RemoteInstant,
}

impl GroupInfo {
    #[must_use]
    pub fn access_for(&self, user: &UserId) -> AccessRights {
        self.access_list.get(user).copied().unwrap_or_default()
    }
}

/// The four kinds of playback command the server can issue (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PlaybackCommandKind {
    Unpause,
    Pause,
    Seek,
    Stop,
}

/// `{ command, when, emittedAt, positionTicks, playlistItemId }` (§3).
///
/// Immutable after receipt; equality of `{when, positionTicks, command,
/// playlistItemId}` is how [`crate::playback_core::PlaybackCore`] detects a
/// duplicate (§4.D step 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlaybackCommand {
    pub command: PlaybackCommandKind,
    pub when: RemoteInstant,
    pub emitted_at: RemoteInstant,
    pub position_ticks: Option<Ticks>,
    pub playlist_item_id: PlaylistItemId,
}

impl PlaybackCommand {
    /// Whether `other` is a duplicate of `self` per §4.D step 1: matches on
    /// every field but emission time is not compared (two server resends of
    /// the same logical command carry different `emittedAt`).
    #[must_use]
    pub fn is_duplicate_of(&self, other: &PlaybackCommand) -> bool {
        self.command == other.command
            && self.when == other.when
            && self.position_ticks == other.position_ticks
            && self.playlist_item_id == other.playlist_item_id
    }
}

/// `{RepeatNone, RepeatOne, RepeatAll}` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RepeatMode {
    RepeatNone,
    RepeatOne,
    RepeatAll,
}

/// `{Sorted, Shuffle}` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShuffleMode {
    Sorted,
    Shuffle,
}

/// Why a [`QueueUpdate`] was issued (§3, §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum QueueUpdateReason {
    NewPlaylist,
    SetCurrentItem,
    NextTrack,
    PreviousTrack,
    RemoveItems,
    MoveItem,
    Queue,
    QueueNext,
    RepeatMode,
    ShuffleMode,
}

/// `{ reason, lastUpdate, playlist[], currentIndex, startPositionTicks,
/// repeatMode, shuffleMode }` (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueUpdate {
    pub reason: QueueUpdateReason,
    pub last_update: RemoteInstant,
    pub playlist: Vec<PlaylistItemId>,
    pub current_index: Option<usize>,
    pub start_position_ticks: Ticks,
    pub repeat_mode: RepeatMode,
    pub shuffle_mode: ShuffleMode,
}

/// `Queue` mode for `requestSyncPlayQueue` (§6): append at the end, or play
/// next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Default,
    Next,
}

/// The `Type` discriminant of a `SyncPlayGroupUpdate` message (§6).
#[derive(Debug, Clone, PartialEq)]
pub enum GroupUpdateType {
    PlayQueue(QueueUpdate),
    UserJoined(UserId),
    UserLeft(UserId),
    GroupJoined(GroupInfo),
    SyncPlayIsDisabled,
    NotInGroup,
    GroupLeft,
    GroupUpdate(GroupInfo),
    StateUpdate { state: String, reason: String },
    GroupDoesNotExist,
    CreateGroupDenied,
    JoinGroupDenied,
    LibraryAccessDenied,
}

/// The two inbound message kinds the server sends (§6).
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Command(PlaybackCommand),
    GroupUpdate(GroupUpdateType),
}

/// Payload for `requestSyncPlayBuffering` (§4.D "Buffering protocol").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BufferingRequest {
    pub when: RemoteInstant,
    pub position_ticks: Ticks,
    pub is_playing: bool,
    pub playlist_item_id: PlaylistItemId,
    pub buffering_done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(secs: i64) -> RemoteInstant {
        RemoteInstant::from_utc(chrono::DateTime::from_timestamp(secs, 0).unwrap())
    }

    #[test]
    fn test_playlist_item_id_display() {
        let id = PlaylistItemId::from("abc123");
        assert_eq!(id.to_string(), "abc123");
    }

    #[test]
    fn test_duplicate_detection_ignores_emitted_at() {
        let a = PlaybackCommand {
            command: PlaybackCommandKind::Unpause,
            when: instant(1000),
            emitted_at: instant(999),
            position_ticks: Some(Ticks::ZERO),
            playlist_item_id: PlaylistItemId::from("a"),
        };
        let mut b = a.clone();
        b.emitted_at = instant(1001);
        assert!(a.is_duplicate_of(&b));
    }

    #[test]
    fn test_non_duplicate_different_position() {
        let a = PlaybackCommand {
            command: PlaybackCommandKind::Seek,
            when: instant(1000),
            emitted_at: instant(999),
            position_ticks: Some(Ticks::ZERO),
            playlist_item_id: PlaylistItemId::from("a"),
        };
        let mut b = a.clone();
        b.position_ticks = Some(Ticks::from_millis(500));
        assert!(!a.is_duplicate_of(&b));
    }

    #[test]
    fn test_buffering_request_wire_shape() {
        let req = BufferingRequest {
            when: instant(1700),
            position_ticks: Ticks::from_millis(4200),
            is_playing: true,
            playlist_item_id: PlaylistItemId::from("item-1"),
            buffering_done: false,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["PositionTicks"], 42_000_000);
        assert_eq!(json["IsPlaying"], true);
        assert_eq!(json["BufferingDone"], false);
        assert_eq!(json["PlaylistItemId"], "item-1");

        let back: BufferingRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_playback_command_roundtrips_through_json() {
        let cmd = PlaybackCommand {
            command: PlaybackCommandKind::Seek,
            when: instant(10),
            emitted_at: instant(9),
            position_ticks: Some(Ticks::from_millis(2500)),
            playlist_item_id: PlaylistItemId::from("item-2"),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"Command\":\"Seek\""));
        let back: PlaybackCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_access_for_missing_user_is_default() {
        let info = GroupInfo {
            group_id: GroupId("g".into()),
            participants: vec![],
            administrators: vec![],
            access_list: Default::default(),
            last_updated_at: instant(0),
        };
        let rights = info.access_for(&UserId("nobody".into()));
        assert!(!rights.playback_access);
        assert!(!rights.playlist_access);
    }
}
