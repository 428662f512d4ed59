//! Realtime-safe logging.
//!
//! The realtime loop cannot format strings, so it pushes fixed-size records
//! into an airlock. A non-realtime thread drains them into `tracing`.

use crate::lockfree::Airlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtLevel {
    Debug,
    Info,
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtLogCode {
    BreakerTripped,
    PanicIssued,
    ClockReacquire,
    SchedulerEvicted,
    SchedulerCommandDropped,
    SchedulerDueCapReached,
    SchedulerJump,
    LaneFull,
    ArpLatchReleased,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtLogRecord {
    pub level: RtLevel,
    pub code: RtLogCode,
    pub a: f64,
    pub b: f64,
}

pub struct RtLog {
    lane: Airlock<RtLogRecord>,
}

impl RtLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lane: Airlock::new(capacity),
        }
    }

    #[inline]
    pub fn emit(&self, level: RtLevel, code: RtLogCode, a: f64, b: f64) {
        // A full log lane just loses the record.
        let _ = self.lane.push(RtLogRecord { level, code, a, b });
    }

    pub fn process_batch(&self, visitor: impl FnMut(RtLogRecord), max_items: usize) -> usize {
        self.lane.process_batch(visitor, max_items)
    }

    /// Forward up to `max_items` records to `tracing`.
    pub fn drain_to_tracing(&self, max_items: usize) -> usize {
        self.lane.process_batch(log_record, max_items)
    }
}

fn log_record(record: RtLogRecord) {
    let RtLogRecord { level, code, a, b } = record;
    match level {
        RtLevel::Debug => tracing::debug!(target: "pulsebridge::rt", ?code, a, b),
        RtLevel::Info => tracing::info!(target: "pulsebridge::rt", ?code, a, b),
        RtLevel::Warn => tracing::warn!(target: "pulsebridge::rt", ?code, a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_drain_in_order() {
        let log = RtLog::new(8);
        log.emit(RtLevel::Warn, RtLogCode::BreakerTripped, 501.0, 0.0);
        log.emit(RtLevel::Info, RtLogCode::PanicIssued, 0.0, 0.0);

        let mut codes = Vec::new();
        log.process_batch(|r| codes.push(r.code), 8);
        assert_eq!(codes, vec![RtLogCode::BreakerTripped, RtLogCode::PanicIssued]);
    }
}
