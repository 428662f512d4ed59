//! Composition root: builds every component, wires the lanes and runs the
//! realtime loop and the control thread.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::events::{CC_ALL_NOTES_OFF, CC_ALL_SOUND_OFF, Event, EventKind};
use crate::lockfree::{Airlock, SpscConsumer, SpscProducer, spsc_queue};
use crate::midi_io::{self, MidiInputState, MidiOutputSink};
use crate::network::{AddressScheme, BridgeWorker, NetworkBridge, Pacing, UdpTransport};
use crate::router::{NoteSet, Router, RouterConfig, RouterControl};
use crate::rtlog::RtLog;
use crate::timing::{
    ClockRecovery, ClockShared, ClockSnapshot, Scheduler, SchedulerHandle, SharedTransport,
    TransportState,
};
use arc_swap::ArcSwap;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(10);
const UPDATE_QUEUE_SIZE: usize = 4096;
const UI_QUEUE_SIZE: usize = 1024;
const RT_LOG_BATCH: usize = 256;
const VISUAL_BATCH: usize = 512;
/// A loop this many blocks late gives up on catching up.
const MAX_LATE_BLOCKS: u32 = 8;

#[derive(Debug, Clone)]
pub enum BridgeCommand {
    Panic,
    ResetBreaker,
    UpdateRouterConfig(RouterConfig),
    SetAddressScheme(AddressScheme),
    /// Feed an event into the router as if it arrived from its source.
    InjectEvent(Event),
    SetBpm(f64),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum BridgeUpdate {
    Clock(ClockSnapshot),
    BreakerTripped,
    Visual(Event),
    Log(String),
    Stopped,
}

/// Last known state of one MIDI channel as seen on the engine lane.
#[derive(Debug, Clone)]
pub struct ChannelState {
    pub notes: NoteSet,
    pub controllers: [f32; 128],
    pub program: u8,
    pub pitch_bend: f32,
    pub aftertouch: f32,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            notes: NoteSet::new(),
            controllers: [0.0; 128],
            program: 0,
            pitch_bend: 0.5,
            aftertouch: 0.0,
        }
    }
}

/// Mirror of the channel-voice state the internal engine would act on.
#[derive(Debug, Clone, Default)]
pub struct ChannelMirror {
    channels: [ChannelState; 16],
}

impl ChannelMirror {
    pub fn channel(&self, channel: u8) -> Option<&ChannelState> {
        self.channels.get(usize::from(channel).checked_sub(1)?)
    }

    pub fn apply(&mut self, event: Event) {
        let Some(state) = usize::from(event.channel)
            .checked_sub(1)
            .and_then(|i| self.channels.get_mut(i))
        else {
            return;
        };
        match event.kind {
            EventKind::NoteOn => {
                if let Some(note) = event.note() {
                    state.notes.insert(note);
                }
            }
            EventKind::NoteOff => {
                if let Some(note) = event.note() {
                    state.notes.remove(note);
                }
            }
            EventKind::ControlChange => {
                if event.index_value == CC_ALL_NOTES_OFF || event.index_value == CC_ALL_SOUND_OFF {
                    state.notes.clear();
                }
                if let Some(slot) = usize::try_from(event.index_value)
                    .ok()
                    .and_then(|i| state.controllers.get_mut(i))
                {
                    *slot = event.value;
                }
            }
            EventKind::ProgramChange => state.program = event.index_value.clamp(0, 127) as u8,
            EventKind::PitchBend => state.pitch_bend = event.value,
            EventKind::Aftertouch => state.aftertouch = event.value,
            _ => {}
        }
    }
}

pub struct BridgeHandle {
    pub command_tx: Sender<BridgeCommand>,
    pub update_rx: Receiver<BridgeUpdate>,
    router: RouterControl,
    clock: Arc<ClockShared>,
    transport: Arc<SharedTransport>,
    mirror: Arc<Mutex<ChannelMirror>>,
    control_thread: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeHandle {
    pub fn router(&self) -> &RouterControl {
        &self.router
    }

    pub fn clock(&self) -> ClockSnapshot {
        self.clock.snapshot()
    }

    pub fn clock_source(&self) -> String {
        self.clock.source_name()
    }

    pub fn transport(&self) -> TransportState {
        self.transport.state()
    }

    pub fn mirror(&self) -> ChannelMirror {
        self.mirror.lock().clone()
    }

    pub fn send(&self, command: BridgeCommand) -> Result<()> {
        self.command_tx.send(command).map_err(|_| BridgeError::NotRunning)
    }

    /// Stop every thread and wait for them. Safe to call more than once.
    pub fn shutdown(&self) {
        let Some(handle) = self.control_thread.lock().take() else {
            return;
        };
        let _ = self.command_tx.send(BridgeCommand::Shutdown);
        if handle.join().is_err() {
            tracing::error!("control thread panicked");
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Tracks the beat of the next arpeggiator step across blocks.
#[derive(Debug, Default)]
struct StepClock {
    next_step: Option<f64>,
}

impl StepClock {
    /// Step beats falling in `[start, end)`, in order.
    fn steps(&mut self, step: f64, start: f64, end: f64, mut tick: impl FnMut(f64)) {
        if !(step > 0.0) {
            self.next_step = None;
            return;
        }
        let mut beat = match self.next_step {
            Some(beat) if beat >= start && beat < start + step => beat,
            _ => (start / step).ceil() * step,
        };
        while beat < end {
            tick(beat);
            beat += step;
        }
        self.next_step = Some(beat);
    }

    fn reset(&mut self) {
        self.next_step = None;
    }
}

struct RealtimeLoop {
    router: Router,
    scheduler: Scheduler,
    scheduler_handle: SchedulerHandle,
    transport: Arc<SharedTransport>,
    clock: Arc<ClockShared>,
    hardware_rx: Option<SpscConsumer<Event>>,
    network_rx: Option<SpscConsumer<Event>>,
    ui_rx: SpscConsumer<Event>,
    steps: StepClock,
    was_playing: bool,
    block_size: usize,
    sample_rate: f64,
    follow_external_clock: bool,
}

impl RealtimeLoop {
    fn process_block(&mut self) {
        self.router.service_requests();
        for queue in [self.hardware_rx.as_mut(), self.network_rx.as_mut(), Some(&mut self.ui_rx)]
            .into_iter()
            .flatten()
        {
            while let Some(event) = queue.pop() {
                self.router.handle_bridge_event(event);
            }
        }

        if self.follow_external_clock {
            let clock = self.clock.snapshot();
            if clock.locked {
                self.transport.set_bpm(clock.bpm);
            }
        }

        let state = self.transport.state();
        if self.was_playing && !state.playing {
            self.scheduler_handle.all_notes_off();
            self.steps.reset();
        }
        self.was_playing = state.playing;

        if state.playing {
            let (start, end) = self.transport.advance(self.block_size, self.sample_rate);
            if let Some(step) = self.router.arp_step_beats() {
                let router = &mut self.router;
                self.steps.steps(step, start, end, |beat| {
                    router.on_sequencer_tick(beat);
                });
            } else {
                self.steps.reset();
            }
        }

        let router = &mut self.router;
        self.scheduler.set_beat_position(state.beat);
        self.scheduler.process_block(
            self.block_size,
            state.bpm,
            self.sample_rate,
            &mut |event: Event, offset: usize| router.deliver_scheduled(event, offset),
        );
    }

    fn run(mut self, block: Duration, stop: Arc<AtomicBool>) {
        tracing::info!(block_us = block.as_micros() as u64, "realtime loop started");
        let mut deadline = Instant::now();
        while !stop.load(Ordering::Acquire) {
            self.process_block();

            deadline += block;
            let now = Instant::now();
            if let Some(wait) = deadline.checked_duration_since(now) {
                thread::sleep(wait);
            } else if now.duration_since(deadline) > block * MAX_LATE_BLOCKS {
                deadline = now;
            }
        }
        tracing::info!("realtime loop stopped");
    }
}

struct ControlLoop {
    command_rx: Receiver<BridgeCommand>,
    update_tx: Sender<BridgeUpdate>,
    router: RouterControl,
    scheme: Arc<ArcSwap<AddressScheme>>,
    transport: Arc<SharedTransport>,
    clock: Arc<ClockShared>,
    rt_log: Arc<RtLog>,
    visual_lane: Arc<Airlock<Event>>,
    engine_lane: Arc<Airlock<Event>>,
    mirror: Arc<Mutex<ChannelMirror>>,
    ui_tx: SpscProducer<Event>,
    breaker_window: Duration,
    last_clock: ClockSnapshot,
    breaker_was_tripped: bool,
    window_started: Instant,
}

impl ControlLoop {
    fn publish(&self, update: BridgeUpdate) {
        match self.update_tx.try_send(update) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => tracing::trace!("update queue full"),
        }
    }

    fn apply(&mut self, command: BridgeCommand) {
        tracing::debug!(?command, "bridge command");
        match command {
            BridgeCommand::Panic => self.router.request_panic(),
            BridgeCommand::ResetBreaker => {
                self.router.reset_breaker();
                self.breaker_was_tripped = false;
            }
            BridgeCommand::UpdateRouterConfig(config) => self.router.update_config(config),
            BridgeCommand::SetAddressScheme(scheme) => self.scheme.store(Arc::new(scheme)),
            BridgeCommand::InjectEvent(event) => {
                if !self.ui_tx.push(event) {
                    tracing::warn!("injected event dropped, queue full");
                }
            }
            BridgeCommand::SetBpm(bpm) => self.transport.set_bpm(bpm),
            BridgeCommand::Shutdown => {}
        }
    }

    fn housekeeping(&mut self) {
        if self.window_started.elapsed() >= self.breaker_window {
            self.router.start_window();
            self.window_started = Instant::now();
        }

        let tripped = self.router.breaker_tripped();
        if tripped && !self.breaker_was_tripped {
            tracing::warn!("feedback breaker tripped, dropping all traffic until reset");
            self.publish(BridgeUpdate::BreakerTripped);
        }
        self.breaker_was_tripped = tripped;

        let clock = self.clock.snapshot();
        let bpm_moved = (clock.bpm - self.last_clock.bpm).abs() >= 0.1;
        if clock.locked != self.last_clock.locked || bpm_moved {
            if clock.locked != self.last_clock.locked {
                tracing::info!(bpm = clock.bpm, locked = clock.locked, "external clock");
            }
            self.last_clock = clock;
            self.publish(BridgeUpdate::Clock(clock));
        }

        self.rt_log.drain_to_tracing(RT_LOG_BATCH);

        let mut visual = Vec::new();
        self.visual_lane.process_batch(|event| visual.push(event), VISUAL_BATCH);
        for event in visual {
            self.publish(BridgeUpdate::Visual(event));
        }

        let mut mirror = self.mirror.lock();
        let capacity = self.engine_lane.capacity();
        self.engine_lane.process_batch(|event| mirror.apply(event), capacity);
    }

    fn run(mut self) {
        self.publish(BridgeUpdate::Clock(self.last_clock));
        loop {
            match self.command_rx.recv_timeout(HOUSEKEEPING_INTERVAL) {
                Ok(BridgeCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => self.apply(command),
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.housekeeping();
        }
    }
}

/// Build the whole bridge from `config` and start its threads.
///
/// Missing MIDI ports are logged and skipped; an unusable network address is
/// an error.
pub fn spawn_bridge(config: BridgeConfig) -> Result<BridgeHandle> {
    let BridgeConfig {
        engine,
        midi,
        network,
        router: router_config,
    } = config;

    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::bounded(UPDATE_QUEUE_SIZE);
    let mut startup_log = Vec::new();

    let rt_log = Arc::new(RtLog::new(engine.rt_log_capacity.max(1)));
    let clock = Arc::new(ClockShared::new());
    let transport = Arc::new(SharedTransport::new(engine.default_bpm));
    let visual_lane = Arc::new(Airlock::new(engine.visual_lane_capacity.max(1)));
    let engine_lane = Arc::new(Airlock::new(engine.engine_lane_capacity.max(1)));
    let network_lane = Arc::new(Airlock::new(network.lane_capacity.max(1)));
    let scheme = Arc::new(ArcSwap::from_pointee(network.address_scheme));
    let (ui_tx, ui_rx) = spsc_queue(UI_QUEUE_SIZE);

    let scheduler = Scheduler::new().with_rt_log(rt_log.clone());
    let scheduler_handle = scheduler.handle();
    let mut router = Router::new(router_config)
        .with_scheduler(scheduler_handle.clone())
        .with_transport(transport.clone())
        .with_clock(clock.clone())
        .with_visual_lane(visual_lane.clone())
        .with_engine_lane(engine_lane.clone())
        .with_rt_log(rt_log.clone());

    let mut midi_input = None;
    let mut hardware_rx = None;
    if midi.enabled {
        let (hardware_tx, rx) = spsc_queue(engine.inbound_queue_capacity.max(1));
        let recovery = ClockRecovery::new()
            .with_shared(clock.clone())
            .with_rt_log(rt_log.clone());
        let state = MidiInputState::new(recovery, hardware_tx);
        match midi_io::connect_input(&midi.client_name, &midi.input_port, state) {
            Ok((connection, name)) => {
                clock.set_source_name(name.clone());
                startup_log.push(format!("MIDI input: {name}"));
                midi_input = Some(connection);
                hardware_rx = Some(rx);
            }
            Err(e) => {
                tracing::warn!(error = %e, "running without MIDI input");
                startup_log.push(format!("MIDI input unavailable: {e}"));
            }
        }

        match MidiOutputSink::connect(&midi.client_name, &midi.output_port) {
            Ok((sink, name)) => {
                startup_log.push(format!("MIDI output: {name}"));
                router.set_output(Box::new(sink));
            }
            Err(e) => {
                tracing::warn!(error = %e, "running without MIDI output");
                startup_log.push(format!("MIDI output unavailable: {e}"));
            }
        }
    }

    let mut network_bridge = None;
    let mut network_rx = None;
    if network.enabled {
        let transport_socket = UdpTransport::bind(&network.listen, &network.target)?;
        tracing::info!(listen = %network.listen, target = %network.target, "OSC bridge");
        let (inbound_tx, rx) = spsc_queue(engine.inbound_queue_capacity.max(1));
        let worker = BridgeWorker::new(
            network_lane.clone(),
            inbound_tx,
            transport_socket,
            scheme.clone(),
            &network,
        );
        network_bridge = Some(NetworkBridge::spawn(worker, Pacing::from(&network))?);
        network_rx = Some(rx);
        router = router.with_network_lane(network_lane);
        startup_log.push(format!("OSC: {} -> {}", network.listen, network.target));
    }

    let router_control = router.control();
    let realtime = RealtimeLoop {
        router,
        scheduler,
        scheduler_handle,
        transport: transport.clone(),
        clock: clock.clone(),
        hardware_rx,
        network_rx,
        ui_rx,
        steps: StepClock::default(),
        was_playing: false,
        block_size: engine.block_size.max(1),
        sample_rate: f64::from(engine.sample_rate.max(1)),
        follow_external_clock: engine.follow_external_clock,
    };
    let rt_stop = Arc::new(AtomicBool::new(false));
    let block = engine.block_duration();
    let rt_thread = {
        let stop = rt_stop.clone();
        thread::Builder::new()
            .name("pulsebridge-rt".into())
            .spawn(move || realtime.run(block, stop))?
    };

    let mirror = Arc::new(Mutex::new(ChannelMirror::default()));
    let control = ControlLoop {
        command_rx,
        update_tx,
        router: router_control.clone(),
        scheme,
        transport: transport.clone(),
        clock: clock.clone(),
        rt_log,
        visual_lane,
        engine_lane,
        mirror: mirror.clone(),
        ui_tx,
        breaker_window: Duration::from_millis(engine.breaker_window_ms.max(1)),
        last_clock: clock.snapshot(),
        breaker_was_tripped: false,
        window_started: Instant::now(),
    };
    for line in startup_log {
        control.publish(BridgeUpdate::Log(line));
    }

    let control_thread = thread::Builder::new()
        .name("pulsebridge-ctl".into())
        .spawn(move || {
            let update_tx = control.update_tx.clone();
            control.run();

            rt_stop.store(true, Ordering::Release);
            if rt_thread.join().is_err() {
                tracing::error!("realtime thread panicked");
            }
            if let Some(mut bridge) = network_bridge {
                bridge.stop();
            }
            drop(midi_input);
            tracing::info!("bridge stopped");
            let _ = update_tx.try_send(BridgeUpdate::Stopped);
        })?;

    Ok(BridgeHandle {
        command_tx,
        update_rx,
        router: router_control,
        clock,
        transport,
        mirror,
        control_thread: Mutex::new(Some(control_thread)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSource;

    #[test]
    fn test_step_clock_ticks_on_grid() {
        let mut steps = StepClock::default();
        let mut ticks = Vec::new();
        steps.steps(0.25, 0.0, 0.1, |b| ticks.push(b));
        steps.steps(0.25, 0.1, 0.3, |b| ticks.push(b));
        steps.steps(0.25, 0.3, 0.8, |b| ticks.push(b));
        assert_eq!(ticks, vec![0.0, 0.25, 0.5, 0.75]);
    }

    #[test]
    fn test_step_clock_realigns_after_seek() {
        let mut steps = StepClock::default();
        let mut ticks = Vec::new();
        steps.steps(0.25, 0.0, 0.3, |b| ticks.push(b));
        steps.steps(0.25, 10.1, 10.3, |b| ticks.push(b));
        assert_eq!(ticks, vec![0.0, 0.25, 10.25]);
    }

    #[test]
    fn test_mirror_tracks_channel_state() {
        let mut mirror = ChannelMirror::default();
        mirror.apply(Event::note_on(EventSource::HardwareMidi, 2, 60, 1.0));
        mirror.apply(Event::note_on(EventSource::HardwareMidi, 2, 64, 1.0));
        mirror.apply(Event::control_change(EventSource::HardwareMidi, 2, 7, 0.5));
        mirror.apply(Event::note_on(EventSource::HardwareMidi, 0, 64, 1.0));

        let channel = mirror.channel(2).unwrap();
        assert_eq!(channel.notes.as_slice(), &[60, 64]);
        assert_eq!(channel.controllers[7], 0.5);

        mirror.apply(Event::control_change(EventSource::Internal, 2, CC_ALL_NOTES_OFF as u8, 0.0));
        assert!(mirror.channel(2).unwrap().notes.is_empty());
        assert!(mirror.channel(0).is_none());
    }

    fn offline_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.midi.enabled = false;
        config.network.enabled = false;
        config
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_injected_events_reach_visual_updates() {
        let bridge = spawn_bridge(offline_config()).unwrap();
        let note = Event::note_on(EventSource::UserInterface, 1, 60, 1.0);
        bridge.send(BridgeCommand::InjectEvent(note)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = false;
        while Instant::now() < deadline && !seen {
            let update = bridge.update_rx.recv_timeout(Duration::from_millis(50));
            if let Ok(BridgeUpdate::Visual(event)) = update {
                seen = event.note() == Some(60);
            }
        }
        assert!(seen);

        bridge.shutdown();
        let stopped = bridge.update_rx.try_iter().any(|u| matches!(u, BridgeUpdate::Stopped));
        assert!(stopped);
        assert!(bridge.send(BridgeCommand::Panic).is_err());
    }

    #[test]
    fn test_set_bpm_reaches_transport() {
        let bridge = spawn_bridge(offline_config()).unwrap();
        bridge.send(BridgeCommand::SetBpm(90.0)).unwrap();
        assert!(wait_for(|| bridge.transport().bpm == 90.0));
        assert!(bridge.transport().playing);
    }

    #[test]
    fn test_panic_command_silences_idle_bridge() {
        let bridge = spawn_bridge(offline_config()).unwrap();
        let note = Event::note_on(EventSource::UserInterface, 1, 60, 1.0);
        bridge.send(BridgeCommand::InjectEvent(note)).unwrap();
        let sounding = |bridge: &BridgeHandle| {
            bridge.mirror().channel(1).is_some_and(|c| c.notes.contains(60))
        };
        assert!(wait_for(|| sounding(&bridge)));

        // Nothing else arrives and the arpeggiator is off.
        bridge.send(BridgeCommand::Panic).unwrap();
        assert!(wait_for(|| !sounding(&bridge)));
    }
}
