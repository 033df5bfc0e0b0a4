//! Component G: typed tunables with change-notification.
//!
//! Mirrors `Config`/`AudioConfig` in the teacher's config module — a
//! `serde`-round-trippable struct with `#[serde(default)]` fields and a
//! matching `Default` impl — but the load-bearing feature here is
//! notification: every [`SyncPlaySettings`] update is published on a
//! [`tokio::sync::watch`] channel so [`crate::time_sync::TimeSync`] and
//! [`crate::playback_core::PlaybackCore`] observe new thresholds without a
//! restart. Disk persistence is supported for parity with the teacher's
//! config module but is entirely optional: nothing in this crate requires
//! `load`/`save` to ever be called.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// All tunables named in §4.A/§4.D, with the spec's literal defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPlaySettings {
    /// TimeSync probe interval, in milliseconds (§4.A: "5-30s, configurable").
    pub time_sync_interval_ms: u64,
    /// Ring buffer size for TimeSync samples (§3 `TimeSyncSample`, N=8).
    pub time_sync_samples: usize,
    /// Dead-band below which a new best sample does not emit `timeSyncUpdate` (§4.A).
    pub time_sync_dead_band_ms: i64,
    /// Probe intervals with no reply before `timeSyncLost` fires (§4.A).
    pub time_sync_lost_after_probes: u32,

    /// `minDelaySkipToSync`, ms (§4.D).
    pub min_delay_skip_to_sync_ms: i64,
    /// `maxDelaySpeedToSync`, ms (§4.D).
    pub max_delay_speed_to_sync_ms: i64,
    /// `minDelaySpeedToSync`, ms (§4.D).
    pub min_delay_speed_to_sync_ms: i64,
    /// `speedToSyncDuration`, ms (§4.D).
    pub speed_to_sync_duration_ms: i64,
    /// Whether SpeedToSync is a candidate strategy (§4.D).
    pub use_speed_to_sync: bool,
    /// Whether SkipToSync is a candidate strategy (§4.D).
    pub use_skip_to_sync: bool,

    /// `minBufferingThresholdMillis` (§4.D "Buffering protocol").
    pub min_buffering_threshold_ms: i64,
    /// Timeout waiting for the `pause` player event (§4.D).
    pub pause_event_timeout_ms: i64,
    /// Timeout waiting for the `playing` player event (§4.D).
    pub playing_event_timeout_ms: i64,
    /// Timeout waiting for the `playbackstart` player event (§4.D "Ready-on-start").
    pub playbackstart_event_timeout_ms: i64,
}

impl Default for SyncPlaySettings {
    fn default() -> Self {
        Self {
            time_sync_interval_ms: 10_000,
            time_sync_samples: 8,
            time_sync_dead_band_ms: 50,
            time_sync_lost_after_probes: 10,

            min_delay_skip_to_sync_ms: 2_000,
            max_delay_speed_to_sync_ms: 3_000,
            min_delay_speed_to_sync_ms: 200,
            speed_to_sync_duration_ms: 1_000,
            use_speed_to_sync: true,
            use_skip_to_sync: true,

            min_buffering_threshold_ms: 1_000,
            pause_event_timeout_ms: 500,
            playing_event_timeout_ms: 30_000,
            playbackstart_event_timeout_ms: 30_000,
        }
    }
}

/// Recoverable settings I/O failure (§7 groups this with other session-fatal
/// conditions only when the embedder chooses to treat it that way; by
/// itself it's just a recoverable load/save error).
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write settings to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// A shared, watchable settings cell.
///
/// `tokio::sync::watch` is the single-writer/many-reader primitive already
/// in the dependency tree (via `tokio`), the same way `src/config.rs` keeps
/// one `Config` instance that `save`/`save_async` mutate in place — here
/// every mutation also notifies subscribers.
pub struct SettingsHandle {
    tx: watch::Sender<SyncPlaySettings>,
}

impl SettingsHandle {
    #[must_use]
    pub fn new(initial: SyncPlaySettings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncPlaySettings> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn get(&self) -> SyncPlaySettings {
        self.tx.borrow().clone()
    }

    /// Replace the settings wholesale, notifying subscribers.
    pub fn set(&self, new: SyncPlaySettings) {
        self.tx.send_replace(new);
    }

    /// Mutate in place, notifying subscribers iff `f` actually changes
    /// anything (mirrors `watch::Sender::send_if_modified`).
    pub fn update(&self, f: impl FnOnce(&mut SyncPlaySettings)) {
        self.tx.send_if_modified(|settings| {
            let before = settings.clone();
            f(settings);
            *settings != before
        });
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(SyncPlaySettings::default())
    }
}

/// Load settings from a TOML file, falling back to defaults for any field
/// the file omits (`#[serde(default)]` on every field handles partial files
/// the same way `Config::load` tolerates a config written by an older
/// version).
pub async fn load(path: impl AsRef<Path>) -> Result<SyncPlaySettings, SettingsError> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let settings = toml::from_str(&contents)?;
    Ok(settings)
}

/// Persist settings to `path`, writing to a sibling temp file and renaming
/// over the destination so a crash mid-write never leaves a truncated file
/// (same atomic-write discipline as `Config::save`).
pub async fn save(path: impl AsRef<Path>, settings: &SyncPlaySettings) -> Result<(), SettingsError> {
    let path = path.as_ref();
    let serialized = toml::to_string_pretty(settings)?;
    let tmp_path = path.with_extension("toml.tmp");
    tokio::fs::write(&tmp_path, serialized)
        .await
        .map_err(|source| SettingsError::Write {
            path: tmp_path.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}
