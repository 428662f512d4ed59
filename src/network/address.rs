use crate::events::{Event, EventKind, EventSource};
use rosc::{OscMessage, OscType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// OSC address layout for channel-voice messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AddressScheme {
    /// `/ch1note`, `/ch1cc`, ...
    #[default]
    Compact,
    /// `/midi/1/note`, `/midi/1/cc`, ...
    Hierarchical,
}

const CHANNEL_KINDS: [(EventKind, &str); 6] = [
    (EventKind::NoteOn, "note"),
    (EventKind::NoteOff, "noteoff"),
    (EventKind::ControlChange, "cc"),
    (EventKind::PitchBend, "pitch"),
    (EventKind::Aftertouch, "at"),
    (EventKind::ProgramChange, "prog"),
];

const GLOBAL_KINDS: [(EventKind, &str); 5] = [
    (EventKind::SystemCommand, "/bridge/system"),
    (EventKind::Panic, "/bridge/panic"),
    (EventKind::VisualParam, "/bridge/visual"),
    (EventKind::Transport, "/bridge/transport"),
    (EventKind::PlaylistCommand, "/bridge/playlist"),
];

fn channel_address(scheme: AddressScheme, channel: u8, suffix: &str) -> String {
    match scheme {
        AddressScheme::Compact => format!("/ch{channel}{suffix}"),
        AddressScheme::Hierarchical => format!("/midi/{channel}/{suffix}"),
    }
}

/// Pre-built addresses for every channel and kind, plus the reverse map used
/// to decode inbound messages. Rebuilt whenever the scheme changes.
pub struct AddressCache {
    scheme: AddressScheme,
    // [channel - 1][kind slot]
    channels: Vec<[String; CHANNEL_KINDS.len()]>,
    reverse: HashMap<String, (EventKind, u8)>,
}

impl AddressCache {
    pub fn new(scheme: AddressScheme) -> Self {
        let mut cache = Self {
            scheme,
            channels: Vec::with_capacity(16),
            reverse: HashMap::new(),
        };
        cache.rebuild(scheme);
        cache
    }

    pub fn scheme(&self) -> AddressScheme {
        self.scheme
    }

    /// Switch to `scheme`. Returns `false` if it was already active.
    pub fn set_scheme(&mut self, scheme: AddressScheme) -> bool {
        if scheme == self.scheme && !self.channels.is_empty() {
            return false;
        }
        self.rebuild(scheme);
        true
    }

    fn rebuild(&mut self, scheme: AddressScheme) {
        self.scheme = scheme;
        self.channels.clear();
        self.reverse.clear();
        for channel in 1..=16u8 {
            let addresses =
                CHANNEL_KINDS.map(|(_, suffix)| channel_address(scheme, channel, suffix));
            for (address, (kind, _)) in addresses.iter().zip(CHANNEL_KINDS) {
                self.reverse.insert(address.clone(), (kind, channel));
            }
            self.channels.push(addresses);
        }
        for (kind, address) in GLOBAL_KINDS {
            self.reverse.insert(address.to_string(), (kind, 0));
        }
    }

    pub fn address(&self, kind: EventKind, channel: u8) -> Option<&str> {
        if let Some((_, address)) = GLOBAL_KINDS.iter().find(|(k, _)| *k == kind) {
            return Some(address);
        }
        let slot = CHANNEL_KINDS.iter().position(|(k, _)| *k == kind)?;
        let addresses = self.channels.get(usize::from(channel).checked_sub(1)?)?;
        Some(&addresses[slot])
    }

    pub fn lookup(&self, address: &str) -> Option<(EventKind, u8)> {
        self.reverse.get(address).copied()
    }

    /// `[Int(index), Float(value)]` at the cached address. Panic carries no
    /// arguments.
    pub fn to_message(&self, event: &Event) -> Option<OscMessage> {
        let addr = self.address(event.kind, event.channel)?.to_string();
        let args = if event.kind == EventKind::Panic {
            Vec::new()
        } else {
            vec![OscType::Int(event.index_value), OscType::Float(event.value)]
        };
        Some(OscMessage { addr, args })
    }

    /// Decode an inbound message into a `NetworkOsc` event. Unknown
    /// addresses and out-of-range values yield `None`.
    pub fn to_event(&self, message: &OscMessage) -> Option<Event> {
        let (mut kind, channel) = self.lookup(&message.addr)?;
        let index = match message.args.first() {
            Some(arg) => arg_as_index(arg)?,
            None => 0,
        };
        let value = match message.args.get(1) {
            Some(arg) => arg_as_value(arg)?,
            None if kind == EventKind::NoteOn => 1.0,
            None => 0.0,
        };
        if kind.is_channel_voice() && kind != EventKind::PitchBend && !(0..128).contains(&index) {
            return None;
        }
        if kind == EventKind::NoteOn && value == 0.0 {
            kind = EventKind::NoteOff;
        }
        Some(Event::new(kind, EventSource::NetworkOsc, channel, index, value))
    }
}

fn arg_as_index(arg: &OscType) -> Option<i32> {
    match arg {
        OscType::Int(i) => Some(*i),
        OscType::Long(l) => i32::try_from(*l).ok(),
        OscType::Float(f) if f.is_finite() => Some(*f as i32),
        OscType::Double(d) if d.is_finite() => Some(*d as i32),
        _ => None,
    }
}

fn arg_as_value(arg: &OscType) -> Option<f32> {
    let value = match arg {
        OscType::Float(f) => *f,
        OscType::Double(d) => *d as f32,
        OscType::Int(i) => *i as f32,
        OscType::Bool(b) => f32::from(u8::from(*b)),
        _ => return None,
    };
    value.is_finite().then(|| value.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_and_hierarchical_addresses() {
        let mut cache = AddressCache::new(AddressScheme::Compact);
        assert_eq!(cache.address(EventKind::NoteOn, 1), Some("/ch1note"));
        assert_eq!(cache.address(EventKind::ControlChange, 16), Some("/ch16cc"));
        assert_eq!(cache.address(EventKind::NoteOn, 0), None);
        assert_eq!(cache.address(EventKind::NoteOn, 17), None);
        assert_eq!(cache.address(EventKind::Transport, 0), Some("/bridge/transport"));

        assert!(cache.set_scheme(AddressScheme::Hierarchical));
        assert!(!cache.set_scheme(AddressScheme::Hierarchical));
        assert_eq!(cache.address(EventKind::NoteOn, 3), Some("/midi/3/note"));
        assert_eq!(cache.lookup("/ch3note"), None);
        assert_eq!(cache.lookup("/midi/3/noteoff"), Some((EventKind::NoteOff, 3)));
    }

    #[test]
    fn test_event_message_conversion() {
        let cache = AddressCache::new(AddressScheme::Compact);
        let event = Event::control_change(EventSource::HardwareMidi, 5, 74, 0.25);
        let message = cache.to_message(&event).unwrap();
        assert_eq!(message.addr, "/ch5cc");
        assert_eq!(message.args, vec![OscType::Int(74), OscType::Float(0.25)]);

        let decoded = cache.to_event(&message).unwrap();
        assert_eq!(decoded, event.with_source(EventSource::NetworkOsc));
    }

    #[test]
    fn test_inbound_edge_cases() {
        let cache = AddressCache::new(AddressScheme::Compact);
        let message = |addr: &str, args: Vec<OscType>| OscMessage {
            addr: addr.to_string(),
            args,
        };

        assert!(cache.to_event(&message("/unknown", vec![])).is_none());
        assert!(cache
            .to_event(&message("/ch1note", vec![OscType::Int(200), OscType::Float(1.0)]))
            .is_none());

        let off = cache
            .to_event(&message("/ch1note", vec![OscType::Int(60), OscType::Float(0.0)]))
            .unwrap();
        assert_eq!(off.kind, EventKind::NoteOff);

        let loud = cache
            .to_event(&message("/ch2cc", vec![OscType::Int(1), OscType::Double(3.0)]))
            .unwrap();
        assert_eq!(loud.value, 1.0);

        let panic = cache.to_event(&message("/bridge/panic", vec![])).unwrap();
        assert_eq!(panic.kind, EventKind::Panic);
        assert_eq!(panic.channel, 0);
    }
}
