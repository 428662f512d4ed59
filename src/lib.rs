//! Realtime bridge between hardware MIDI, OSC over UDP, an arpeggiator and a
//! UI, routed through one loop-free event stream.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lockfree;
pub mod midi_io;
pub mod network;
pub mod output;
pub mod router;
pub mod rtlog;
pub mod timing;

pub use config::BridgeConfig;
pub use engine::{BridgeCommand, BridgeHandle, BridgeUpdate, ChannelMirror, spawn_bridge};
pub use error::{BridgeError, Result};
pub use events::{Event, EventKind, EventSource, TransportCommand};
pub use output::OutputConsumer;
