//! OSC side of the bridge: address layout, self-echo suppression and the
//! worker thread that moves events between the lanes and a UDP socket.

mod address;
mod echo;
mod worker;

pub use address::{AddressCache, AddressScheme};
pub use echo::{ECHO_WINDOW_MS, EchoFilter, Fingerprint};
pub use worker::{
    BridgeWorker, DatagramSink, MAX_BUNDLE_BYTES, NetworkBridge, Pacing, UdpTransport, WorkerStats,
    estimate_message_size,
};
