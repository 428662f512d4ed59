use approx::assert_abs_diff_eq;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use pulsebridge::config::NetworkSettings;
use pulsebridge::lockfree::{Airlock, spsc_queue};
use pulsebridge::network::{AddressScheme, BridgeWorker, DatagramSink};
use pulsebridge::router::{ArpPattern, BREAKER_THRESHOLD, Router, RouterConfig};
use pulsebridge::timing::{ClockRecovery, ClockShared, PULSES_PER_QUARTER, Scheduler};
use pulsebridge::{Event, EventKind, EventSource};
use rosc::{OscMessage, OscPacket, OscType};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

#[derive(Default)]
struct MemorySink {
    sent: Vec<Vec<u8>>,
    incoming: VecDeque<Vec<u8>>,
}

impl DatagramSink for MemorySink {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.sent.push(payload.to_vec());
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        Ok(self.incoming.pop_front().map(|datagram| {
            buf[..datagram.len()].copy_from_slice(&datagram);
            datagram.len()
        }))
    }
}

type Delivered = Arc<Mutex<Vec<Event>>>;

fn recording_router(config: RouterConfig) -> (Router, Delivered, Arc<Airlock<Event>>) {
    let delivered: Delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let network_lane = Arc::new(Airlock::new(4096));
    let router = Router::new(config)
        .with_output(move |event: Event, _offset: usize| sink.lock().push(event))
        .with_network_lane(network_lane.clone());
    (router, delivered, network_lane)
}

fn messages(bytes: &[u8]) -> Vec<OscMessage> {
    fn flatten(packet: OscPacket, out: &mut Vec<OscMessage>) {
        match packet {
            OscPacket::Message(message) => out.push(message),
            OscPacket::Bundle(bundle) => bundle.content.into_iter().for_each(|p| flatten(p, out)),
        }
    }
    let mut out = Vec::new();
    flatten(rosc::decoder::decode_udp(bytes).unwrap().1, &mut out);
    out
}

#[test]
fn network_input_is_never_sent_back_out() {
    let (mut router, delivered, network_lane) = recording_router(RouterConfig::default());
    let (inbound_tx, mut inbound_rx) = spsc_queue(64);
    let scheme = Arc::new(ArcSwap::from_pointee(AddressScheme::Compact));
    let mut worker = BridgeWorker::new(
        network_lane.clone(),
        inbound_tx,
        MemorySink::default(),
        scheme,
        &NetworkSettings::default(),
    );

    let datagram = rosc::encoder::encode(&OscPacket::Message(OscMessage {
        addr: "/ch1note".to_string(),
        args: vec![OscType::Int(60), OscType::Float(0.8)],
    }))
    .unwrap();
    worker.sink_mut().incoming.push_back(datagram);
    worker.run_cycle(0);

    while let Some(event) = inbound_rx.pop() {
        assert!(router.handle_bridge_event(event));
    }
    assert!(network_lane.is_empty());
    assert_eq!(delivered.lock().len(), 1);

    worker.run_cycle(10);
    assert!(worker.sink().sent.is_empty());
}

#[test]
fn hardware_input_is_published_and_its_echo_suppressed() {
    let (mut router, _delivered, network_lane) = recording_router(RouterConfig::default());
    let (inbound_tx, mut inbound_rx) = spsc_queue(64);
    let scheme = Arc::new(ArcSwap::from_pointee(AddressScheme::Hierarchical));
    let mut worker = BridgeWorker::new(
        network_lane.clone(),
        inbound_tx,
        MemorySink::default(),
        scheme,
        &NetworkSettings::default(),
    );

    let hardware = Event::from_midi_bytes(EventSource::HardwareMidi, &[0x92, 67, 127]).unwrap();
    assert!(router.handle_bridge_event(hardware));
    worker.run_cycle(500);

    let sent = worker.sink().sent.clone();
    assert_eq!(sent.len(), 1);
    let published = messages(&sent[0]);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].addr, "/midi/3/note");

    // A multicast loopback hands the same datagram straight back.
    worker.sink_mut().incoming.push_back(sent[0].clone());
    worker.run_cycle(520);
    assert!(inbound_rx.pop().is_none());
    assert_eq!(worker.stats().echoes_dropped, 1);
}

#[test]
fn feedback_loop_trips_breaker_and_panic_clears_it() {
    let (mut router, delivered, _network_lane) = recording_router(RouterConfig::default());
    let echo = Event::control_change(EventSource::NetworkOsc, 1, 1, 0.5);

    let accepted = (0..1000).filter(|_| router.handle_bridge_event(echo)).count();
    assert_eq!(accepted, BREAKER_THRESHOLD as usize);
    assert!(router.breaker().is_tripped());

    delivered.lock().clear();
    router.panic();
    assert!(!router.breaker().is_tripped());
    assert_eq!(delivered.lock().len(), 48);
    assert!(router.handle_bridge_event(echo));
}

#[test]
fn clock_recovery_locks_and_publishes() {
    let shared = Arc::new(ClockShared::new());
    let mut clock = ClockRecovery::new().with_shared(shared.clone());
    let step = 60_000.0 / 120.0 / PULSES_PER_QUARTER;
    for i in 0..60 {
        clock.on_pulse(1_000.0 + i as f64 * step);
    }

    let snapshot = shared.snapshot();
    assert!(snapshot.locked);
    assert_abs_diff_eq!(snapshot.bpm, 120.0, epsilon = 5.0);
    assert!(snapshot.confidence > 0.9);

    shared.request_reset();
    clock.on_pulse(1_000.0 + 60.0 * step);
    assert!(!shared.snapshot().locked);
    assert_eq!(clock.sample_count(), 0);
}

#[test]
fn arpeggiator_diverge_plays_through_scheduler() {
    let mut config = RouterConfig::default();
    config.arp.enabled = true;
    config.arp.pattern = ArpPattern::Diverge;
    config.arp.channel = 2;
    config.arp.rate = 4.0;
    config.arp.gate = 0.5;
    config.routing.hardware_to_network = false;

    let mut scheduler = Scheduler::new();
    let (router, delivered, _lane) = recording_router(config);
    let mut router = router.with_scheduler(scheduler.handle());

    for note in [67, 60, 64, 62, 65] {
        router.handle_bridge_event(Event::note_on(EventSource::HardwareMidi, 1, note, 1.0));
    }

    // 48 kHz, 120 BPM: a 1200-sample block is 1/20 beat, five blocks per step.
    let (sample_rate, bpm, block) = (48_000.0, 120.0, 1200);
    let block_beats = block as f64 * bpm / 60.0 / sample_rate;
    let mut beat = 0.0;
    let mut fired = Vec::new();
    for i in 0..25 {
        if i % 5 == 0 {
            router.on_sequencer_tick(beat);
        }
        scheduler.set_beat_position(beat);
        scheduler.process_block(block, bpm, sample_rate, &mut |event: Event, _offset: usize| {
            fired.push(event)
        });
        beat += block_beats;
    }

    let played: Vec<u8> = delivered
        .lock()
        .iter()
        .filter(|e| e.kind == EventKind::NoteOn)
        .filter_map(|e| e.note())
        .collect();
    assert_eq!(played, vec![64, 62, 65, 60, 67]);
    assert!(delivered.lock().iter().all(|e| e.channel == 2));

    let released: Vec<u8> = fired.iter().filter_map(|e| e.note()).collect();
    assert_eq!(released, vec![64, 62, 65, 60, 67]);
    assert!(fired.iter().all(|e| e.kind == EventKind::NoteOff));
}
