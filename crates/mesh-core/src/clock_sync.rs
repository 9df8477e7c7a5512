//! Per-peer clock synchronization.
//!
//! Estimates the clock offset to a remote peer (`local + offset = peer`) and
//! the one-way network lag from a three-leg NTP-style exchange:
//!
//! 1. Originator sends an empty sync envelope.
//! 2. Respondent fills t0 (originator's send time) and t1 (its receipt time)
//!    and replies.
//! 3. Originator fills t2 (reply send time) and t3 (its receipt time), records
//!    a sample, and sends the full quartet back so the respondent can record
//!    the mirrored sample.
//!
//! Samples are smoothed by an EWMA that accounts for irregular sampling
//! intervals. Raw offset and lag use integer millisecond arithmetic with
//! division truncating toward zero; the smoothed statistics are `f64`.

use crate::protocol::SyncPayload;
use serde::Serialize;

/// Samples averaged with equal weight before the decay kicks in.
pub const WARMUP_SAMPLES: u32 = 4;

/// Rounds that use a shortened interval after a peer is first seen.
const FAST_ROUNDS: u32 = 3;

/// One raw offset/lag measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    pub offset_ms: i64,
    pub lag_ms: i64,
}

impl SyncSample {
    /// Compute offset and lag from a complete quartet, as seen by the
    /// originator of the exchange.
    ///
    /// ```
    /// use mesh_core::clock_sync::SyncSample;
    /// use mesh_core::protocol::SyncPayload;
    ///
    /// let sample = SyncSample::from_quartet(&SyncPayload { t0: 1000, t1: 1010, t2: 1015, t3: 1030 });
    /// assert_eq!(sample.offset_ms, -2);
    /// assert_eq!(sample.lag_ms, 12);
    /// ```
    pub fn from_quartet(p: &SyncPayload) -> Self {
        let (t0, t1, t2, t3) = (p.t0 as i64, p.t1 as i64, p.t2 as i64, p.t3 as i64);
        Self {
            offset_ms: ((t1 - t0) + (t2 - t3)) / 2,
            lag_ms: ((t3 - t0) - (t2 - t1)) / 2,
        }
    }

    /// The same exchange seen from the respondent's side.
    pub fn mirrored(self) -> Self {
        Self {
            offset_ms: -self.offset_ms,
            lag_ms: self.lag_ms,
        }
    }
}

/// Smoothed clock estimate exposed to the application.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    /// Add to local time to get the peer's time
    pub offset_ms: f64,
    /// Estimated one-way network delay
    pub lag_ms: f64,
    /// Spread of the offset estimate; lower means more confidence
    pub offset_std_dev_ms: f64,
    pub lag_std_dev_ms: f64,
    pub samples: u32,
}

/// Mean and variance under the EWMA recurrence.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RunningStat {
    mean: f64,
    variance: f64,
}

impl RunningStat {
    fn update(&mut self, value: f64, alpha: f64) {
        let delta = value - self.mean;
        self.mean += alpha * delta;
        self.variance = (1.0 - alpha) * (self.variance + alpha * delta * delta);
    }
}

/// Clock-sync estimator owned by one remote peer.
#[derive(Debug, Clone, Default)]
pub struct ClockSync {
    offset: RunningStat,
    lag: RunningStat,
    samples: u32,
    /// Running estimate of the average sync period
    window_ms: f64,
    last_sample_at: Option<u64>,
    last_round_started_at: Option<u64>,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// True if a round should be started now.
    ///
    /// The first rounds use `interval / (4 - samples)` so a new peer converges
    /// quickly. A round in progress counts as the reference point so a lost
    /// reply is retried after the interval instead of every tick.
    pub fn needs_sync(&self, now_ms: u64, interval_ms: u64) -> bool {
        let reference = match (self.last_sample_at, self.last_round_started_at) {
            (None, None) => return true,
            (a, b) => a.max(b).unwrap_or(0),
        };
        let effective = if self.samples < FAST_ROUNDS {
            interval_ms / u64::from(FAST_ROUNDS + 1 - self.samples)
        } else {
            interval_ms
        };
        now_ms.saturating_sub(reference) >= effective
    }

    /// Mark that we sent the first leg of a round.
    pub fn begin_round(&mut self, now_ms: u64) {
        self.last_round_started_at = Some(now_ms);
    }

    /// Fold a sample into the estimate and return the updated info.
    pub fn record(&mut self, sample: SyncSample, now_ms: u64, interval_ms: u64) -> SyncInfo {
        let alpha = match self.last_sample_at {
            Some(previous) => {
                let dt = now_ms.saturating_sub(previous) as f64;
                self.window_ms = (interval_ms as f64 + dt) / 2.0;
                if self.samples < WARMUP_SAMPLES {
                    1.0 / f64::from(self.samples + 1)
                } else if self.window_ms > 0.0 {
                    1.0 - (-dt / self.window_ms).exp()
                } else {
                    1.0
                }
            }
            None => 1.0,
        };

        self.offset.update(sample.offset_ms as f64, alpha);
        self.lag.update(sample.lag_ms as f64, alpha);
        self.samples += 1;
        self.last_sample_at = Some(now_ms);
        self.snapshot()
    }

    /// Current estimate, or `None` before the first sample.
    pub fn info(&self) -> Option<SyncInfo> {
        (self.samples > 0).then(|| self.snapshot())
    }

    /// Smoothed offset, if any sample has been recorded.
    pub fn offset_ms(&self) -> Option<f64> {
        (self.samples > 0).then_some(self.offset.mean)
    }

    fn snapshot(&self) -> SyncInfo {
        SyncInfo {
            offset_ms: self.offset.mean,
            lag_ms: self.lag.mean,
            offset_std_dev_ms: self.offset.variance.sqrt(),
            lag_std_dev_ms: self.lag.variance.sqrt(),
            samples: self.samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: u64 = 10_000;

    fn sample(offset_ms: i64, lag_ms: i64) -> SyncSample {
        SyncSample { offset_ms, lag_ms }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // ==================== Quartet math ====================

    #[test]
    fn test_quartet_truncates_toward_zero() {
        let s = SyncSample::from_quartet(&SyncPayload {
            t0: 1000,
            t1: 1010,
            t2: 1015,
            t3: 1030,
        });
        // ((10) + (-15)) / 2 = -2.5 -> -2
        assert_eq!(s.offset_ms, -2);
        // (30 - 5) / 2 = 12.5 -> 12
        assert_eq!(s.lag_ms, 12);
    }

    #[test]
    fn test_quartet_with_peer_ahead() {
        // Peer clock is 500ms ahead, 20ms each way
        let s = SyncSample::from_quartet(&SyncPayload {
            t0: 1000,
            t1: 1520,
            t2: 1530,
            t3: 1050,
        });
        assert_eq!(s.offset_ms, 500);
        assert_eq!(s.lag_ms, 20);
        assert_eq!(s.mirrored().offset_ms, -500);
        assert_eq!(s.mirrored().lag_ms, 20);
    }

    // ==================== EWMA ====================

    #[test]
    fn test_first_sample_sets_mean_exactly() {
        let mut sync = ClockSync::new();
        assert!(sync.info().is_none());
        let info = sync.record(sample(40, 10), 1_000, INTERVAL);
        assert!(approx(info.offset_ms, 40.0));
        assert!(approx(info.lag_ms, 10.0));
        assert!(approx(info.offset_std_dev_ms, 0.0));
        assert_eq!(info.samples, 1);
    }

    #[test]
    fn test_warmup_is_plain_average() {
        let mut sync = ClockSync::new();
        let values = [10, 20, 30, 40];
        let mut now = 1_000;
        for v in values {
            sync.record(sample(v, 0), now, INTERVAL);
            now += 2_500;
        }
        let info = sync.info().unwrap();
        assert!(approx(info.offset_ms, 25.0));
        assert_eq!(info.samples, 4);
    }

    #[test]
    fn test_variance_recurrence() {
        let mut sync = ClockSync::new();
        sync.record(sample(0, 0), 1_000, INTERVAL);
        // alpha = 1/2, delta = 10 -> mean 5, variance = 0.5 * (0 + 0.5 * 100) = 25
        let info = sync.record(sample(10, 0), 2_000, INTERVAL);
        assert!(approx(info.offset_ms, 5.0));
        assert!(approx(info.offset_std_dev_ms, 5.0));
    }

    #[test]
    fn test_decay_after_warmup_uses_interval_window() {
        let mut sync = ClockSync::new();
        let mut now = 1_000;
        for _ in 0..WARMUP_SAMPLES {
            sync.record(sample(0, 0), now, INTERVAL);
            now += INTERVAL;
        }
        // dt == interval -> window == interval -> alpha = 1 - e^-1
        let info = sync.record(sample(100, 0), now, INTERVAL);
        let alpha = 1.0 - (-1.0f64).exp();
        assert!(approx(info.offset_ms, 100.0 * alpha));
    }

    #[test]
    fn test_longer_gap_weighs_new_sample_more() {
        let mut short = ClockSync::new();
        let mut long = ClockSync::new();
        let mut now = 1_000;
        for _ in 0..WARMUP_SAMPLES {
            short.record(sample(0, 0), now, INTERVAL);
            long.record(sample(0, 0), now, INTERVAL);
            now += INTERVAL;
        }
        let a = short.record(sample(100, 0), now - INTERVAL + 1_000, INTERVAL);
        let b = long.record(sample(100, 0), now + 5 * INTERVAL, INTERVAL);
        assert!(b.offset_ms > a.offset_ms);
    }

    // ==================== Scheduling ====================

    #[test]
    fn test_needs_sync_before_any_round() {
        assert!(ClockSync::new().needs_sync(5, INTERVAL));
    }

    #[test]
    fn test_in_progress_round_defers_retry() {
        let mut sync = ClockSync::new();
        sync.begin_round(1_000);
        // No samples yet: interval / 4
        assert!(!sync.needs_sync(1_000 + 2_499, INTERVAL));
        assert!(sync.needs_sync(1_000 + 2_500, INTERVAL));
    }

    #[test]
    fn test_shortened_interval_for_first_rounds() {
        let mut sync = ClockSync::new();
        let mut now = 1_000;
        let expected = [INTERVAL / 3, INTERVAL / 2, INTERVAL, INTERVAL];
        for wait in expected {
            sync.begin_round(now);
            sync.record(sample(0, 0), now, INTERVAL);
            assert!(!sync.needs_sync(now + wait - 1, INTERVAL));
            assert!(sync.needs_sync(now + wait, INTERVAL));
            now += wait;
        }
    }
}
