//! Lock-free primitives shared between the realtime loop and everything else.
//!
//! None of these block the realtime side. A full queue is normal
//! backpressure: the newest item is dropped and the caller gets `false`.

mod airlock;
mod double_buffer;
mod seqlock;
mod spsc;

pub use airlock::{Airlock, WakeFn};
pub use double_buffer::DoubleBuffered;
pub use seqlock::SeqLock;
pub use spsc::{SpscConsumer, SpscProducer, spsc_queue};
