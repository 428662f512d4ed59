use rosc::{OscMessage, OscType};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub const ECHO_WINDOW_MS: u64 = 50;
const HISTORY: usize = 512;

/// Content fingerprint of a sent message: address, argument hash and
/// channel, tagged with a coarse 50 ms time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub content: u64,
    pub bucket: u64,
}

impl Fingerprint {
    pub fn of(message: &OscMessage, channel: u8, now_ms: u64) -> Self {
        Self {
            content: content_hash(message, channel),
            bucket: now_ms / ECHO_WINDOW_MS,
        }
    }
}

fn content_hash(message: &OscMessage, channel: u8) -> u64 {
    let mut hasher = DefaultHasher::new();
    message.addr.hash(&mut hasher);
    for arg in &message.args {
        hash_arg(arg, &mut hasher);
    }
    channel.hash(&mut hasher);
    hasher.finish()
}

fn hash_arg(arg: &OscType, hasher: &mut DefaultHasher) {
    match arg {
        OscType::Int(i) => (0u8, *i).hash(hasher),
        OscType::Float(f) => (1u8, f.to_bits()).hash(hasher),
        OscType::String(s) => (2u8, s).hash(hasher),
        OscType::Long(l) => (3u8, *l).hash(hasher),
        OscType::Double(d) => (4u8, d.to_bits()).hash(hasher),
        OscType::Bool(b) => (5u8, *b).hash(hasher),
        OscType::Blob(b) => (6u8, b).hash(hasher),
        _ => 7u8.hash(hasher),
    }
}

/// Remembers recently sent messages so our own broadcasts can be
/// recognized when the network hands them back.
pub struct EchoFilter {
    sent: Vec<(Fingerprint, u64)>,
    next: usize,
}

impl EchoFilter {
    pub fn new() -> Self {
        Self {
            sent: Vec::with_capacity(HISTORY),
            next: 0,
        }
    }

    pub fn record(&mut self, message: &OscMessage, channel: u8, now_ms: u64) {
        let entry = (Fingerprint::of(message, channel, now_ms), now_ms);
        if self.sent.len() < HISTORY {
            self.sent.push(entry);
        } else {
            self.sent[self.next] = entry;
        }
        self.next = (self.next + 1) % HISTORY;
    }

    /// True if an identical message went out within the last 50 ms.
    pub fn is_echo(&self, message: &OscMessage, channel: u8, now_ms: u64) -> bool {
        let probe = Fingerprint::of(message, channel, now_ms);
        self.sent.iter().any(|(fingerprint, sent_ms)| {
            fingerprint.content == probe.content
                && probe.bucket.saturating_sub(fingerprint.bucket) <= 1
                && now_ms.saturating_sub(*sent_ms) <= ECHO_WINDOW_MS
        })
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

impl Default for EchoFilter {
    fn default() -> Self {
        Self::new()
    }
}
