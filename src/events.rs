#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventKind {
    NoteOn,
    NoteOff,
    ControlChange,
    PitchBend,
    Aftertouch,
    ProgramChange,
    SystemCommand,
    Panic,
    VisualParam,
    Transport,
    PlaylistCommand,
    #[default]
    None,
}

impl EventKind {
    pub fn is_note(self) -> bool {
        matches!(self, EventKind::NoteOn | EventKind::NoteOff)
    }

    pub fn is_channel_voice(self) -> bool {
        matches!(
            self,
            EventKind::NoteOn
                | EventKind::NoteOff
                | EventKind::ControlChange
                | EventKind::PitchBend
                | EventKind::Aftertouch
                | EventKind::ProgramChange
        )
    }

    /// Kinds addressed to the whole system rather than one channel.
    pub fn is_global(self) -> bool {
        matches!(
            self,
            EventKind::SystemCommand
                | EventKind::Panic
                | EventKind::Transport
                | EventKind::VisualParam
                | EventKind::PlaylistCommand
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventSource {
    HardwareMidi,
    NetworkOsc,
    UserInterface,
    EngineSequencer,
    #[default]
    Internal,
}

impl EventSource {
    /// External sources are the only ones able to close a feedback loop.
    pub fn is_external(self) -> bool {
        matches!(self, EventSource::HardwareMidi | EventSource::NetworkOsc)
    }
}

/// `index_value` of a [`EventKind::Transport`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Start = 0,
    Continue = 1,
    Stop = 2,
}

impl TransportCommand {
    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(TransportCommand::Start),
            1 => Some(TransportCommand::Continue),
            2 => Some(TransportCommand::Stop),
            _ => None,
        }
    }
}

pub const CC_SUSTAIN: i32 = 64;
pub const CC_ALL_SOUND_OFF: i32 = 120;
pub const CC_ALL_NOTES_OFF: i32 = 123;

/// The universal message passed between every part of the bridge.
///
/// `channel` is 1-16, 0 for global kinds. `index_value` carries the note,
/// controller or program number. `value` is normalized to 0.0-1.0.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Event {
    pub kind: EventKind,
    pub source: EventSource,
    pub channel: u8,
    pub index_value: i32,
    pub value: f32,
}

impl Event {
    pub fn new(
        kind: EventKind,
        source: EventSource,
        channel: u8,
        index_value: i32,
        value: f32,
    ) -> Self {
        Self {
            kind,
            source,
            channel,
            index_value,
            value,
        }
    }

    pub fn note_on(source: EventSource, channel: u8, note: u8, velocity: f32) -> Self {
        Self::new(EventKind::NoteOn, source, channel, note as i32, velocity)
    }

    pub fn note_off(source: EventSource, channel: u8, note: u8) -> Self {
        Self::new(EventKind::NoteOff, source, channel, note as i32, 0.0)
    }

    pub fn control_change(source: EventSource, channel: u8, controller: u8, value: f32) -> Self {
        Self::new(EventKind::ControlChange, source, channel, controller as i32, value)
    }

    pub fn transport(source: EventSource, command: TransportCommand) -> Self {
        Self::new(EventKind::Transport, source, 0, command as i32, 0.0)
    }

    pub fn panic(source: EventSource) -> Self {
        Self::new(EventKind::Panic, source, 0, 0, 0.0)
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    pub fn note(&self) -> Option<u8> {
        if self.kind.is_note() && (0..128).contains(&self.index_value) {
            Some(self.index_value as u8)
        } else {
            None
        }
    }

    pub fn has_valid_channel(&self) -> bool {
        (1..=16).contains(&self.channel)
    }

    /// Parse one complete MIDI message. Running status and SysEx are not
    /// handled; real-time clock bytes are not events and return `None`.
    pub fn from_midi_bytes(source: EventSource, bytes: &[u8]) -> Option<Self> {
        let status = *bytes.first()?;
        match status {
            0xFA => return Some(Self::transport(source, TransportCommand::Start)),
            0xFB => return Some(Self::transport(source, TransportCommand::Continue)),
            0xFC => return Some(Self::transport(source, TransportCommand::Stop)),
            s if s >= 0xF0 => return None,
            s if s < 0x80 => return None,
            _ => {}
        }

        let channel = (status & 0x0F) + 1;
        let data1 = bytes.get(1).copied().unwrap_or(0) & 0x7F;
        let data2 = bytes.get(2).copied().unwrap_or(0) & 0x7F;

        let event = match status & 0xF0 {
            0x80 => Self::note_off(source, channel, data1),
            0x90 if data2 == 0 => Self::note_off(source, channel, data1),
            0x90 => Self::note_on(source, channel, data1, from_7bit(data2)),
            0xA0 | 0xD0 => {
                // Poly pressure keeps its note, channel pressure uses index 0.
                let (index, pressure) = if status & 0xF0 == 0xA0 {
                    (data1 as i32, data2)
                } else {
                    (0, data1)
                };
                Self::new(EventKind::Aftertouch, source, channel, index, from_7bit(pressure))
            }
            0xB0 => Self::control_change(source, channel, data1, from_7bit(data2)),
            0xC0 => Self::new(EventKind::ProgramChange, source, channel, data1 as i32, 0.0),
            0xE0 => {
                let raw = ((data2 as u16) << 7) | data1 as u16;
                Self::new(EventKind::PitchBend, source, channel, 0, raw as f32 / 16383.0)
            }
            _ => return None,
        };
        Some(event)
    }

    /// Encode as a channel-voice or real-time message. Kinds with no MIDI
    /// representation return `None`.
    pub fn to_midi_bytes(&self) -> Option<MidiBytes> {
        if self.kind == EventKind::Transport {
            let byte = match TransportCommand::from_index(self.index_value)? {
                TransportCommand::Start => 0xFA,
                TransportCommand::Continue => 0xFB,
                TransportCommand::Stop => 0xFC,
            };
            return Some(MidiBytes::one(byte));
        }

        if !self.kind.is_channel_voice() || !self.has_valid_channel() {
            return None;
        }
        let ch = self.channel - 1;
        let index = self.index_value.clamp(0, 127) as u8;

        let bytes = match self.kind {
            EventKind::NoteOn => MidiBytes::three(0x90 | ch, index, to_7bit(self.value).max(1)),
            EventKind::NoteOff => MidiBytes::three(0x80 | ch, index, 0),
            EventKind::ControlChange => MidiBytes::three(0xB0 | ch, index, to_7bit(self.value)),
            EventKind::Aftertouch if self.index_value > 0 => {
                MidiBytes::three(0xA0 | ch, index, to_7bit(self.value))
            }
            EventKind::Aftertouch => MidiBytes::two(0xD0 | ch, to_7bit(self.value)),
            EventKind::ProgramChange => MidiBytes::two(0xC0 | ch, index),
            EventKind::PitchBend => {
                let raw = (self.value.clamp(0.0, 1.0) * 16383.0).round() as u16;
                MidiBytes::three(0xE0 | ch, (raw & 0x7F) as u8, (raw >> 7) as u8)
            }
            _ => return None,
        };
        Some(bytes)
    }
}

fn from_7bit(value: u8) -> f32 {
    value as f32 / 127.0
}

fn to_7bit(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 127.0).round() as u8
}

/// Up to three MIDI bytes, stored inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiBytes {
    data: [u8; 3],
    len: usize,
}

impl MidiBytes {
    fn one(a: u8) -> Self {
        Self { data: [a, 0, 0], len: 1 }
    }

    fn two(a: u8, b: u8) -> Self {
        Self { data: [a, b, 0], len: 2 }
    }

    fn three(a: u8, b: u8, c: u8) -> Self {
        Self { data: [a, b, c], len: 3 }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }
}
