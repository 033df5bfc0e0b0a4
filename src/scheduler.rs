//! The drop-cancels timer primitive used by [`crate::time_sync::TimeSync`]
//! and [`crate::playback_core::PlaybackCore`] (§5 "Timers").
//!
//! §5 requires that starting a new timer of a given kind cancel the prior
//! one. Modeling each timer slot as `Option<TimerHandle>` makes that a plain
//! assignment: the old handle's `Drop` aborts its task before the new one is
//! stored.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A spawned, cancel-on-drop delayed task.
///
/// Grounded on `medea-jason`'s `TaskHandle` (`rpc/heartbeat.rs`): a thin
/// wrapper around `JoinHandle` whose only job is to abort in `Drop`.
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Spawn `fut` onto the current `LocalSet` to run after `delay`.
    ///
    /// Must be called from within a `tokio::task::LocalSet` context, since
    /// this crate's components are `!Send` and use `spawn_local`
    /// throughout (§5, §9 "single logical executor").
    pub fn spawn_after<F>(delay: Duration, fut: F) -> Self
    where
        F: Future<Output = ()> + 'static,
    {
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
        Self { handle }
    }

    /// Spawn `fut` to run immediately (used when `fireAt <= now`, §4.D).
    pub fn spawn_now<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + 'static,
    {
        let handle = tokio::task::spawn_local(fut);
        Self { handle }
    }

}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
