//! Hardware MIDI through `midir`.

use crate::error::{BridgeError, Result};
use crate::events::{Event, EventSource};
use crate::lockfree::SpscProducer;
use crate::output::OutputConsumer;
use crate::timing::ClockRecovery;
use midir::{
    Ignore, MidiInput, MidiInputConnection, MidiInputPort, MidiOutput, MidiOutputConnection,
    MidiOutputPort,
};

const CLOCK: u8 = 0xF8;
const START: u8 = 0xFA;
const CONTINUE: u8 = 0xFB;

/// Everything the input callback owns: the clock recovery for the port and
/// the producer half of the router's hardware queue.
pub struct MidiInputState {
    clock: ClockRecovery,
    events: SpscProducer<Event>,
    dropped: u64,
}

impl MidiInputState {
    pub fn new(clock: ClockRecovery, events: SpscProducer<Event>) -> Self {
        Self {
            clock,
            events,
            dropped: 0,
        }
    }

    pub fn clock(&self) -> &ClockRecovery {
        &self.clock
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Handle one raw message stamped in microseconds. Returns `true` if an
    /// event was queued for the router.
    pub fn on_message(&mut self, timestamp_us: u64, bytes: &[u8]) -> bool {
        match bytes.first() {
            Some(&CLOCK) => {
                self.clock.on_pulse(timestamp_us as f64 / 1000.0);
                return false;
            }
            Some(&START) | Some(&CONTINUE) => self.clock.reset(),
            _ => {}
        }

        let Some(event) = Event::from_midi_bytes(EventSource::HardwareMidi, bytes) else {
            return false;
        };
        if self.events.push(event) {
            true
        } else {
            self.dropped += 1;
            false
        }
    }
}

fn matches(name: &str, pattern: &str) -> bool {
    pattern.is_empty() || name.to_lowercase().contains(&pattern.to_lowercase())
}

fn find_input_port(input: &MidiInput, pattern: &str) -> Result<(MidiInputPort, String)> {
    input
        .ports()
        .into_iter()
        .find_map(|port| {
            let name = input.port_name(&port).ok()?;
            matches(&name, pattern).then_some((port, name))
        })
        .ok_or_else(|| BridgeError::MidiPortNotFound(pattern.to_string()))
}

fn find_output_port(output: &MidiOutput, pattern: &str) -> Result<(MidiOutputPort, String)> {
    output
        .ports()
        .into_iter()
        .find_map(|port| {
            let name = output.port_name(&port).ok()?;
            matches(&name, pattern).then_some((port, name))
        })
        .ok_or_else(|| BridgeError::MidiPortNotFound(pattern.to_string()))
}

pub fn list_input_ports(client_name: &str) -> Result<Vec<String>> {
    let input = MidiInput::new(client_name).map_err(|e| BridgeError::MidiInit(e.to_string()))?;
    Ok(input.ports().iter().filter_map(|port| input.port_name(port).ok()).collect())
}

pub fn list_output_ports(client_name: &str) -> Result<Vec<String>> {
    let output = MidiOutput::new(client_name).map_err(|e| BridgeError::MidiInit(e.to_string()))?;
    Ok(output.ports().iter().filter_map(|port| output.port_name(port).ok()).collect())
}

/// Open the first input port whose name contains `pattern` and feed it into
/// `state`. The connection stays open until dropped.
pub fn connect_input(
    client_name: &str,
    pattern: &str,
    state: MidiInputState,
) -> Result<(MidiInputConnection<MidiInputState>, String)> {
    let mut input = MidiInput::new(client_name).map_err(|e| BridgeError::MidiInit(e.to_string()))?;
    // Clock and transport bytes are needed.
    input.ignore(Ignore::None);

    let (port, name) = find_input_port(&input, pattern)?;
    tracing::info!(port = %name, "connecting MIDI input");
    let connection = input
        .connect(
            &port,
            "pulsebridge-in",
            |timestamp_us, bytes, state: &mut MidiInputState| {
                state.on_message(timestamp_us, bytes);
            },
            state,
        )
        .map_err(|e| BridgeError::MidiConnect(e.to_string()))?;
    Ok((connection, name))
}

/// MIDI out as a realtime output consumer.
pub struct MidiOutputSink {
    connection: MidiOutputConnection,
    failed: u64,
}

impl MidiOutputSink {
    pub fn connect(client_name: &str, pattern: &str) -> Result<(Self, String)> {
        let output =
            MidiOutput::new(client_name).map_err(|e| BridgeError::MidiInit(e.to_string()))?;
        let (port, name) = find_output_port(&output, pattern)?;
        tracing::info!(port = %name, "connecting MIDI output");
        let connection = output
            .connect(&port, "pulsebridge-out")
            .map_err(|e| BridgeError::MidiConnect(e.to_string()))?;
        Ok((Self { connection, failed: 0 }, name))
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }
}

impl OutputConsumer for MidiOutputSink {
    fn deliver(&mut self, event: Event, _sample_offset: usize) {
        let Some(bytes) = event.to_midi_bytes() else {
            return;
        };
        if self.connection.send(bytes.as_slice()).is_err() {
            self.failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, TransportCommand};
    use crate::lockfree::spsc_queue;

    const PULSE_US: u64 = 20_833;

    #[test]
    fn test_clock_bytes_feed_recovery_not_queue() {
        let (producer, mut consumer) = spsc_queue(64);
        let mut state = MidiInputState::new(ClockRecovery::new(), producer);
        for i in 0..60 {
            assert!(!state.on_message(i * PULSE_US, &[0xF8]));
        }
        assert!(consumer.pop().is_none());
        assert!(state.clock().is_locked());
        assert!((state.clock().bpm() - 120.0).abs() < 5.0);
    }

    #[test]
    fn test_start_resets_clock_and_queues_transport() {
        let (producer, mut consumer) = spsc_queue(64);
        let mut state = MidiInputState::new(ClockRecovery::new(), producer);
        for i in 0..60 {
            state.on_message(i * PULSE_US, &[0xF8]);
        }
        assert!(state.on_message(60 * PULSE_US, &[0xFA]));
        assert!(!state.clock().is_locked());
        assert_eq!(state.clock().sample_count(), 0);

        let event = consumer.pop().unwrap();
        assert_eq!(event.kind, EventKind::Transport);
        assert_eq!(TransportCommand::from_index(event.index_value), Some(TransportCommand::Start));
    }

    #[test]
    fn test_channel_messages_are_queued() {
        let (producer, mut consumer) = spsc_queue(1);
        let mut state = MidiInputState::new(ClockRecovery::new(), producer);
        assert!(state.on_message(0, &[0x90, 60, 100]));
        assert!(!state.on_message(0, &[0x80, 60, 0]));
        assert_eq!(state.dropped(), 1);

        let event = consumer.pop().unwrap();
        assert_eq!(event.source, EventSource::HardwareMidi);
        assert_eq!(event.note(), Some(60));
        assert!(!state.on_message(0, &[0xF0, 0x7E, 0xF7]));
    }

    #[test]
    fn test_port_pattern_matching() {
        assert!(matches("USB MIDI Interface", ""));
        assert!(matches("USB MIDI Interface", "midi"));
        assert!(!matches("USB MIDI Interface", "launchpad"));
    }
}
