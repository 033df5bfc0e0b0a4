//! Tick and instant arithmetic.
//!
//! The wire protocol (§6) expresses positions and durations as integer
//! *ticks* at 10,000,000/sec, and instants as ISO-8601 UTC strings. Locally
//! we distinguish the server's clock domain (`RemoteInstant`) from our own
//! wall-clock estimate of it (`LocalInstant`) so the two are never mixed up
//! by accident — the whole point of [`crate::time_sync`] is converting
//! between them.

use std::ops::{Add, Sub};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Ticks per second on the wire (§6, GLOSSARY "Tick").
pub const TICKS_PER_SECOND: i64 = 10_000_000;
/// Ticks per millisecond, derived from [`TICKS_PER_SECOND`].
pub const TICKS_PER_MILLISECOND: i64 = TICKS_PER_SECOND / 1000;

/// A signed position or duration expressed in 100ns ticks (§3 `PlaybackCommand`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticks(pub i64);

impl Ticks {
    pub const ZERO: Ticks = Ticks(0);

    #[must_use]
    pub fn from_millis(ms: i64) -> Self {
        Ticks(ms * TICKS_PER_MILLISECOND)
    }

    #[must_use]
    pub fn as_millis(self) -> i64 {
        self.0 / TICKS_PER_MILLISECOND
    }

    #[must_use]
    pub fn abs(self) -> Ticks {
        Ticks(self.0.abs())
    }

    /// Saturating conversion to a non-negative `Duration`; negative ticks
    /// clamp to zero since a playback position can never be negative once
    /// it's about to be handed to a player.
    #[must_use]
    pub fn as_duration_saturating(self) -> std::time::Duration {
        std::time::Duration::from_millis(self.as_millis().max(0) as u64)
    }
}

impl Add for Ticks {
    type Output = Ticks;
    fn add(self, rhs: Ticks) -> Ticks {
        Ticks(self.0 + rhs.0)
    }
}

impl Sub for Ticks {
    type Output = Ticks;
    fn sub(self, rhs: Ticks) -> Ticks {
        Ticks(self.0 - rhs.0)
    }
}

/// A timestamp in the server's logical clock (GLOSSARY "Remote time").
///
/// Arrives on the wire as an ISO-8601 UTC string (§6) and is otherwise
/// opaque: the only way to compare it to "now" is through
/// [`crate::time_sync::TimeSync::remote_to_local`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteInstant(pub DateTime<Utc>);

impl RemoteInstant {
    #[must_use]
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl Sub for RemoteInstant {
    type Output = ChronoDuration;
    fn sub(self, rhs: RemoteInstant) -> ChronoDuration {
        self.0 - rhs.0
    }
}

/// Our wall-clock estimate of "now" in the local clock domain.
///
/// Distinct from [`RemoteInstant`] purely at the type level — both wrap a
/// `DateTime<Utc>` — so a caller can't accidentally compare a remote
/// instant against a local one without going through `TimeSync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LocalInstant(pub DateTime<Utc>);

impl LocalInstant {
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl Sub for LocalInstant {
    type Output = ChronoDuration;
    fn sub(self, rhs: LocalInstant) -> ChronoDuration {
        self.0 - rhs.0
    }
}

impl Add<ChronoDuration> for LocalInstant {
    type Output = LocalInstant;
    fn add(self, rhs: ChronoDuration) -> LocalInstant {
        LocalInstant(self.0 + rhs)
    }
}

/// Convert a (possibly negative) `chrono::Duration` into a `std::time::Duration`,
/// clamping negative values to zero. Used when arming a one-shot timer: a
/// fire time already in the past becomes a zero-length delay rather than an
/// error, matching §4.D ("If `fireAt <= now`, the command fires immediately").
#[must_use]
pub fn non_negative_std_duration(d: ChronoDuration) -> std::time::Duration {
    d.to_std().unwrap_or(std::time::Duration::ZERO)
}
