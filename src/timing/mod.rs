mod clock_recovery;
mod scheduler;
mod transport;

pub use clock_recovery::{
    ClockRecovery, ClockShared, ClockSnapshot, DEFAULT_BPM, HISTORY_LEN, PULSES_PER_QUARTER,
};
pub use scheduler::{
    COMMAND_QUEUE_SIZE, JUMP_THRESHOLD_BEATS, MAX_DUE_PER_BLOCK, POOL_SIZE, Scheduler,
    SchedulerCommand, SchedulerHandle,
};
pub use transport::{SharedTransport, TransportClock, TransportState};
