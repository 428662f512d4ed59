use crate::events::{Event, EventSource};
use serde::{Deserialize, Serialize};

/// Everything the router reads at dispatch time. Swapped as a whole through
/// `arc_swap`, never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub filter: InputFilter,
    pub split: SplitConfig,
    pub arp: ArpConfig,
    pub routing: RoutingFlags,
}

/// Applied to hardware input before routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputFilter {
    /// Bit `n - 1` accepts channel `n`.
    pub channel_mask: u16,
    /// Semitones added to note numbers.
    pub transpose: i8,
    pub force_channel: Option<u8>,
}

impl Default for InputFilter {
    fn default() -> Self {
        Self {
            channel_mask: 0xFFFF,
            transpose: 0,
            force_channel: None,
        }
    }
}

impl InputFilter {
    pub fn apply(&self, mut event: Event) -> Option<Event> {
        if !event.kind.is_channel_voice() {
            return Some(event);
        }
        if !event.has_valid_channel() || self.channel_mask & (1u16 << (event.channel - 1)) == 0 {
            return None;
        }
        if let Some(channel) = self.force_channel.filter(|c| (1..=16).contains(c)) {
            event.channel = channel;
        }
        if event.kind.is_note() && self.transpose != 0 {
            let note = event.index_value + self.transpose as i32;
            if !(0..128).contains(&note) {
                return None;
            }
            event.index_value = note;
        }
        Some(event)
    }
}

/// Fans one keyboard out across 2-4 channels by note range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub enabled: bool,
    pub input_channel: u8,
    pub zones: u8,
    pub channels: [u8; 4],
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            input_channel: 1,
            zones: 2,
            channels: [1, 2, 3, 4],
        }
    }
}

impl SplitConfig {
    pub fn zone_for(&self, note: u8) -> usize {
        let zones = self.zones.clamp(2, 4) as usize;
        (note as usize / (128 / zones)).min(zones - 1)
    }

    pub fn apply(&self, mut event: Event) -> Event {
        if !self.enabled || event.channel != self.input_channel {
            return event;
        }
        if let Some(note) = event.note() {
            let channel = self.channels[self.zone_for(note)];
            if (1..=16).contains(&channel) {
                event.channel = channel;
            }
        }
        event
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArpPattern {
    #[default]
    Up,
    Down,
    Random,
    Diverge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArpConfig {
    pub enabled: bool,
    pub pattern: ArpPattern,
    /// Steps per beat.
    pub rate: f64,
    /// Fraction of a step the note is held, 0.0-1.0.
    pub gate: f64,
    pub velocity: f32,
    pub channel: u8,
    /// 1-4
    pub octaves: u8,
    pub latch: bool,
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pattern: ArpPattern::Up,
            rate: 4.0,
            gate: 0.5,
            velocity: 0.8,
            channel: 1,
            octaves: 1,
            latch: false,
        }
    }
}

impl ArpConfig {
    pub fn step_beats(&self) -> f64 {
        if self.rate > 0.0 { 1.0 / self.rate } else { 0.25 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingFlags {
    /// Network events reach MIDI out.
    pub network_to_midi: bool,
    /// UI and sequencer events reach MIDI out.
    pub midi_thru: bool,
    pub hardware_to_network: bool,
    pub ui_to_network: bool,
    pub sequencer_to_network: bool,
}

impl Default for RoutingFlags {
    fn default() -> Self {
        Self {
            network_to_midi: true,
            midi_thru: true,
            hardware_to_network: true,
            ui_to_network: true,
            sequencer_to_network: true,
        }
    }
}

impl RoutingFlags {
    pub fn publishes(&self, source: EventSource) -> bool {
        match source {
            EventSource::HardwareMidi => self.hardware_to_network,
            EventSource::UserInterface => self.ui_to_network,
            EventSource::EngineSequencer => self.sequencer_to_network,
            EventSource::NetworkOsc | EventSource::Internal => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_zones() {
        let split = SplitConfig {
            enabled: true,
            zones: 4,
            ..Default::default()
        };
        assert_eq!(split.zone_for(0), 0);
        assert_eq!(split.zone_for(31), 0);
        assert_eq!(split.zone_for(32), 1);
        assert_eq!(split.zone_for(127), 3);

        let three = SplitConfig { zones: 3, ..split.clone() };
        // 128 / 3 = 42, the top zone absorbs the remainder.
        assert_eq!(three.zone_for(126), 2);
        assert_eq!(three.zone_for(127), 2);
    }

    #[test]
    fn test_split_only_touches_input_channel() {
        let split = SplitConfig {
            enabled: true,
            input_channel: 1,
            zones: 2,
            channels: [5, 6, 0, 0],
        };
        let low = Event::note_on(EventSource::HardwareMidi, 1, 40, 1.0);
        let high = Event::note_on(EventSource::HardwareMidi, 1, 90, 1.0);
        let other = Event::note_on(EventSource::HardwareMidi, 2, 90, 1.0);
        assert_eq!(split.apply(low).channel, 5);
        assert_eq!(split.apply(high).channel, 6);
        assert_eq!(split.apply(other).channel, 2);
    }

    #[test]
    fn test_filter_mask_transpose_force() {
        let filter = InputFilter {
            channel_mask: 0b0000_0000_0000_0011,
            transpose: 12,
            force_channel: Some(10),
        };
        let event = Event::note_on(EventSource::HardwareMidi, 2, 60, 1.0);
        let filtered = filter.apply(event).unwrap();
        assert_eq!(filtered.channel, 10);
        assert_eq!(filtered.note(), Some(72));

        assert!(filter.apply(Event::note_on(EventSource::HardwareMidi, 3, 60, 1.0)).is_none());
        assert!(filter.apply(Event::note_on(EventSource::HardwareMidi, 1, 120, 1.0)).is_none());
    }
}
