use crate::lockfree::{DoubleBuffered, SeqLock};
use crate::rtlog::{RtLevel, RtLog, RtLogCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const HISTORY_LEN: usize = 48;
pub const PULSES_PER_QUARTER: f64 = 24.0;

const MIN_SAMPLES: usize = 24;
const MIN_INTERVAL_MS: f64 = 1.0;
const MAX_INTERVAL_MS: f64 = 500.0;
const OUTLIER_SIGMA: f64 = 2.5;
/// Driver timestamps are millisecond-quantized; a near-zero deviation on a
/// perfectly steady clock must not turn every rounding step into an outlier.
const MIN_OUTLIER_BAND_MS: f64 = 1.0;
const MAX_OUTLIER_STREAK: u32 = 6;
const VARIANCE_DECAY: f64 = 0.95;
const LOCK_JITTER_MS: f64 = 12.0;
const HYSTERESIS_BPM: f64 = 1.5;
const MIN_BPM: f64 = 20.0;
const MAX_BPM: f64 = 300.0;
pub const DEFAULT_BPM: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSnapshot {
    pub bpm: f64,
    pub locked: bool,
    pub confidence: f64,
    pub jitter_ms: f64,
    pub samples: usize,
}

impl Default for ClockSnapshot {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            locked: false,
            confidence: 0.0,
            jitter_ms: 0.0,
            samples: 0,
        }
    }
}

/// Clock state visible to every thread. The owner of [`ClockRecovery`]
/// publishes into it; anyone can request a reset.
pub struct ClockShared {
    snapshot: SeqLock<ClockSnapshot>,
    reset_requested: AtomicBool,
    source_name: DoubleBuffered<String>,
}

impl ClockShared {
    pub fn new() -> Self {
        Self {
            snapshot: SeqLock::new(ClockSnapshot::default()),
            reset_requested: AtomicBool::new(false),
            source_name: DoubleBuffered::new(String::from("internal")),
        }
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        self.snapshot.read()
    }

    /// Honoured on the next pulse seen by the owner.
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }

    pub fn source_name(&self) -> String {
        self.source_name.load()
    }

    pub fn set_source_name(&self, name: impl Into<String>) {
        self.source_name.store(name.into());
    }
}

impl Default for ClockShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Derives a stable tempo from 24 PPQN clock pulses.
///
/// Outliers are rejected before they reach the variance estimate, then the
/// output tempo is smoothed with hysteresis, a jitter-dependent delta clamp
/// and a jitter-dependent smoothing rate.
pub struct ClockRecovery {
    history: [f64; HISTORY_LEN],
    write_pos: usize,
    count: usize,
    running_sum: f64,
    decayed_variance: f64,
    last_pulse_time: Option<f64>,
    outlier_streak: u32,
    stable_bpm: f64,
    is_locked: bool,
    last_jitter: f64,
    shared: Option<Arc<ClockShared>>,
    rt_log: Option<Arc<RtLog>>,
}

impl ClockRecovery {
    pub fn new() -> Self {
        Self {
            history: [0.0; HISTORY_LEN],
            write_pos: 0,
            count: 0,
            running_sum: 0.0,
            decayed_variance: 0.0,
            last_pulse_time: None,
            outlier_streak: 0,
            stable_bpm: DEFAULT_BPM,
            is_locked: false,
            last_jitter: 0.0,
            shared: None,
            rt_log: None,
        }
    }

    pub fn with_shared(mut self, shared: Arc<ClockShared>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn with_rt_log(mut self, rt_log: Arc<RtLog>) -> Self {
        self.rt_log = Some(rt_log);
        self
    }

    /// Feed one pulse. Returns `false` when the pulse was rejected as
    /// implausible or as an outlier.
    pub fn on_pulse(&mut self, timestamp_ms: f64) -> bool {
        if let Some(shared) = &self.shared {
            if shared.reset_requested.swap(false, Ordering::AcqRel) {
                self.reset();
            }
        }

        let Some(last) = self.last_pulse_time.replace(timestamp_ms) else {
            return true;
        };
        let interval = timestamp_ms - last;
        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval) {
            return false;
        }

        if self.count >= MIN_SAMPLES {
            let band = (OUTLIER_SIGMA * self.decayed_variance.sqrt()).max(MIN_OUTLIER_BAND_MS);
            if (interval - self.average_interval()).abs() > band {
                self.outlier_streak += 1;
                if self.outlier_streak > MAX_OUTLIER_STREAK {
                    if let Some(log) = &self.rt_log {
                        let bpm = self.stable_bpm;
                        log.emit(RtLevel::Info, RtLogCode::ClockReacquire, interval, bpm);
                    }
                    self.reset();
                    self.last_pulse_time = Some(timestamp_ms);
                    self.publish();
                }
                return false;
            }
        }
        self.outlier_streak = 0;

        if self.count == HISTORY_LEN {
            self.running_sum -= self.history[self.write_pos];
        } else {
            self.count += 1;
        }
        self.history[self.write_pos] = interval;
        self.running_sum += interval;
        self.write_pos = (self.write_pos + 1) % HISTORY_LEN;

        let deviation = interval - self.average_interval();
        self.decayed_variance =
            VARIANCE_DECAY * self.decayed_variance + (1.0 - VARIANCE_DECAY) * deviation * deviation;

        if self.count >= MIN_SAMPLES {
            self.update_tempo();
        }
        self.publish();
        true
    }

    fn update_tempo(&mut self) {
        let raw_bpm =
            (60_000.0 / (self.average_interval() * PULSES_PER_QUARTER)).clamp(MIN_BPM, MAX_BPM);
        let jitter = self.decayed_variance.sqrt();
        self.last_jitter = jitter;
        self.is_locked = self.count >= MIN_SAMPLES && jitter < LOCK_JITTER_MS;

        let mut delta = raw_bpm - self.stable_bpm;
        if delta.abs() < HYSTERESIS_BPM {
            delta = 0.0;
        }
        if jitter > 5.0 {
            delta = delta.clamp(-2.0, 2.0);
        } else if jitter > 3.0 {
            delta = delta.clamp(-3.0, 3.0);
        }

        let alpha = if jitter > 5.0 {
            0.02
        } else if jitter > 3.0 {
            0.03
        } else {
            0.04
        };
        self.stable_bpm = (self.stable_bpm + alpha * delta).clamp(MIN_BPM, MAX_BPM);
    }

    fn publish(&self) {
        if let Some(shared) = &self.shared {
            shared.snapshot.write(self.snapshot());
        }
    }

    pub fn reset(&mut self) {
        let shared = self.shared.take();
        let rt_log = self.rt_log.take();
        *self = Self::new();
        self.shared = shared;
        self.rt_log = rt_log;
        self.publish();
    }

    pub fn average_interval(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.running_sum / self.count as f64
        }
    }

    pub fn bpm(&self) -> f64 {
        self.stable_bpm
    }

    pub fn is_locked(&self) -> bool {
        self.is_locked
    }

    pub fn jitter(&self) -> f64 {
        self.last_jitter
    }

    pub fn confidence(&self) -> f64 {
        if self.is_locked {
            (1.0 - self.last_jitter / 10.0).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn sample_count(&self) -> usize {
        self.count
    }

    pub fn running_sum(&self) -> f64 {
        self.running_sum
    }

    pub fn decayed_variance(&self) -> f64 {
        self.decayed_variance
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            bpm: self.stable_bpm,
            locked: self.is_locked,
            confidence: self.confidence(),
            jitter_ms: self.last_jitter,
            samples: self.count,
        }
    }
}

impl Default for ClockRecovery {
    fn default() -> Self {
        Self::new()
    }
}
