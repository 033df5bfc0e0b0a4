//! Component A: offset/RTT estimation between the local clock and the
//! server's reference clock (§4.A).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::scheduler::TimerHandle;
use crate::settings::SyncPlaySettings;
use crate::time::{LocalInstant, RemoteInstant};

/// `{ localSendAt, remoteAt, localReceiveAt }` (§3 `TimeSyncSample`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSyncSample {
    pub local_send_at: LocalInstant,
    pub remote_at: RemoteInstant,
    pub local_receive_at: LocalInstant,
}

impl TimeSyncSample {
    /// `remoteAt - (localSendAt + localReceiveAt) / 2` (§3).
    #[must_use]
    pub fn offset(&self) -> ChronoDuration {
        let midpoint = self.local_send_at.0 + (self.local_receive_at - self.local_send_at) / 2;
        self.remote_at.0 - midpoint
    }

    /// Round-trip time for this sample.
    #[must_use]
    pub fn rtt(&self) -> ChronoDuration {
        self.local_receive_at - self.local_send_at
    }
}

/// Events TimeSync emits (§4.A, §6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeSyncEvent {
    /// Best sample changed by more than the dead-band.
    Update { offset_ms: i64, ping_ms: i64 },
    /// No sample arrived within `timeSyncLostAfterProbes` intervals.
    Lost,
}

struct Inner {
    samples: VecDeque<TimeSyncSample>,
    best_offset_ms: i64,
    best_ping_ms: i64,
    probes_since_last_sample: u32,
    running: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            best_offset_ms: 0,
            best_ping_ms: i64::MAX,
            probes_since_last_sample: 0,
            running: false,
        }
    }

    fn has_sample(&self) -> bool {
        !self.samples.is_empty()
    }

    /// The sample with the smallest RTT (§4.A "The best sample is the one
    /// with smallest RTT").
    fn best_sample(&self) -> Option<&TimeSyncSample> {
        self.samples.iter().min_by_key(|s| s.rtt())
    }
}

/// A probe callback: send a timestamped ping and await the server's echoed
/// remote time. Abstracted so `TimeSync` doesn't depend on `Transport`
/// directly; `Manager` wires the two together.
pub type ProbeFn = Box<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<RemoteInstant>>>>>;

/// Measures the offset between the local clock and the server's (§2 "A").
///
/// Grounded on the teacher's `gardener.rs` loop shape: a `spawn_local` task
/// driven by `tokio::time::interval`, here producing samples instead of
/// health checks.
pub struct TimeSync {
    inner: Rc<RefCell<Inner>>,
    events_tx: tokio::sync::broadcast::Sender<TimeSyncEvent>,
    settings_rx: watch::Receiver<SyncPlaySettings>,
    probe: Rc<ProbeFn>,
    timer: RefCell<Option<TimerHandle>>,
}

impl TimeSync {
    #[must_use]
    pub fn new(probe: ProbeFn, settings_rx: watch::Receiver<SyncPlaySettings>) -> Self {
        let (events_tx, _) = tokio::sync::broadcast::channel(16);
        Self {
            inner: Rc::new(RefCell::new(Inner::new())),
            events_tx,
            settings_rx,
            probe: Rc::new(probe),
            timer: RefCell::new(None),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TimeSyncEvent> {
        self.events_tx.subscribe()
    }

    /// Current estimated offset `(remote - local)`; zero until the first
    /// sample arrives (§4.A "Edge cases").
    #[must_use]
    pub fn offset(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.inner.borrow().best_offset_ms)
    }

    /// RTT of the currently chosen sample; `Duration::MAX` until a sample
    /// exists (§4.A "ping = infinity").
    #[must_use]
    pub fn ping(&self) -> Duration {
        let inner = self.inner.borrow();
        if inner.has_sample() {
            Duration::from_millis(inner.best_ping_ms.max(0) as u64)
        } else {
            Duration::MAX
        }
    }

    #[must_use]
    pub fn has_sample(&self) -> bool {
        self.inner.borrow().has_sample()
    }

    #[must_use]
    pub fn local_to_remote(&self, instant: LocalInstant) -> RemoteInstant {
        RemoteInstant(instant.0 + self.offset())
    }

    #[must_use]
    pub fn remote_to_local(&self, instant: RemoteInstant) -> LocalInstant {
        LocalInstant(instant.0 - self.offset())
    }

    /// Begin periodic sampling (§4.A `start()`). Takes `Rc<Self>` because
    /// the timer loop re-arms itself recursively and needs to hold a
    /// strong reference across the `await`.
    pub fn start(self: Rc<Self>) {
        self.inner.borrow_mut().running = true;
        self.arm_timer();
    }

    /// Stop periodic sampling and cancel any pending probe (§4.A `stop()`).
    pub fn stop(&self) {
        self.inner.borrow_mut().running = false;
        self.timer.borrow_mut().take();
    }

    /// Discard all samples and restart collection (§4.A `forceUpdate()`).
    pub fn force_update(self: Rc<Self>) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.samples.clear();
            inner.best_offset_ms = 0;
            inner.best_ping_ms = i64::MAX;
            inner.probes_since_last_sample = 0;
        }
        self.arm_timer();
    }

    fn arm_timer(self: Rc<Self>) {
        let interval_ms = self.settings_rx.borrow().time_sync_interval_ms;
        let this = self.clone();
        let handle = TimerHandle::spawn_after(Duration::from_millis(interval_ms), async move {
            this.run_one_probe().await;
        });
        self.timer.borrow_mut().replace(handle);
    }

    async fn run_one_probe(self: Rc<Self>) {
        if !self.inner.borrow().running {
            return;
        }
        let send_at = LocalInstant::now();
        let probe = self.probe.clone();
        let reply = probe().await;
        let receive_at = LocalInstant::now();

        match reply {
            Some(remote_at) => {
                let sample = TimeSyncSample {
                    local_send_at: send_at,
                    remote_at,
                    local_receive_at: receive_at,
                };
                self.record_sample(sample);
            }
            None => {
                let lost_after = self.settings_rx.borrow().time_sync_lost_after_probes;
                let mut inner = self.inner.borrow_mut();
                inner.probes_since_last_sample += 1;
                if inner.probes_since_last_sample >= lost_after {
                    warn!(target: "syncplay_core::time_sync", "no time-sync reply in {} probes", inner.probes_since_last_sample);
                    drop(inner);
                    let _ = self.events_tx.send(TimeSyncEvent::Lost);
                }
            }
        }
        self.arm_timer();
    }

    fn record_sample(&self, sample: TimeSyncSample) {
        let samples_cap = self.settings_rx.borrow().time_sync_samples;
        let dead_band_ms = self.settings_rx.borrow().time_sync_dead_band_ms;

        let mut inner = self.inner.borrow_mut();
        inner.probes_since_last_sample = 0;
        inner.samples.push_back(sample);
        while inner.samples.len() > samples_cap {
            inner.samples.pop_front();
        }

        let best = *inner.best_sample().expect("just pushed a sample");
        let new_offset_ms = best.offset().num_milliseconds();
        let new_ping_ms = best.rtt().num_milliseconds();
        let changed = (new_offset_ms - inner.best_offset_ms).abs() >= dead_band_ms;

        inner.best_offset_ms = new_offset_ms;
        inner.best_ping_ms = new_ping_ms;
        drop(inner);

        if changed {
            debug!(target: "syncplay_core::time_sync", offset_ms = new_offset_ms, ping_ms = new_ping_ms, "time sync updated");
            let _ = self.events_tx.send(TimeSyncEvent::Update {
                offset_ms: new_offset_ms,
                ping_ms: new_ping_ms,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn no_reply_probe() -> ProbeFn {
        Box::new(|| Box::pin(async { None }))
    }

    #[test]
    fn test_zero_offset_before_first_sample() {
        let (_tx, rx) = watch::channel(SyncPlaySettings::default());
        let ts = TimeSync::new(no_reply_probe(), rx);
        assert_eq!(ts.offset(), ChronoDuration::zero());
        assert_eq!(ts.ping(), Duration::MAX);
        assert!(!ts.has_sample());
    }

    #[test]
    fn test_sample_offset_formula() {
        let send = LocalInstant(Utc::now());
        let receive = LocalInstant(send.0 + ChronoDuration::milliseconds(100));
        let remote = RemoteInstant(send.0 + ChronoDuration::milliseconds(60));
        let sample = TimeSyncSample {
            local_send_at: send,
            remote_at: remote,
            local_receive_at: receive,
        };
        // remoteAt - (send + receive)/2 = +60ms - (+50ms midpoint) = +10ms
        assert_eq!(sample.offset().num_milliseconds(), 10);
        assert_eq!(sample.rtt().num_milliseconds(), 100);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_lost_after_configured_probes() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut settings = SyncPlaySettings::default();
                settings.time_sync_interval_ms = 10;
                settings.time_sync_lost_after_probes = 3;
                let (_tx, rx) = watch::channel(settings);

                let ts = Rc::new(TimeSync::new(no_reply_probe(), rx));
                let mut events = ts.subscribe();
                ts.start();

                tokio::time::advance(Duration::from_millis(10 * 4)).await;
                tokio::task::yield_now().await;

                let event = events.try_recv().expect("expected a Lost event");
                assert_eq!(event, TimeSyncEvent::Lost);
            })
            .await;
    }
}
