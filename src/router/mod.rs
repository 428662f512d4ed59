//! Central event router.
//!
//! Every inbound event passes the feedback guard and validity checks, then
//! is routed by source so that nothing received from the network is ever
//! sent back to it. The router owns the arpeggiator and drives panic.
//!
//! All methods run on the realtime thread: no allocation, no locks. Other
//! threads talk to the router through [`RouterControl`].

mod arpeggiator;
mod breaker;
mod config;
mod notes;

pub use arpeggiator::{Arpeggiator, diverge_index};
pub use breaker::{BREAKER_THRESHOLD, TrafficBreaker};
pub use config::{ArpConfig, ArpPattern, InputFilter, RouterConfig, RoutingFlags, SplitConfig};
pub use notes::NoteSet;

use crate::events::{
    CC_ALL_NOTES_OFF, CC_ALL_SOUND_OFF, CC_SUSTAIN, Event, EventKind, EventSource, TransportCommand,
};
use crate::lockfree::Airlock;
use crate::output::OutputConsumer;
use crate::rtlog::{RtLevel, RtLog, RtLogCode};
use crate::timing::{ClockShared, SchedulerHandle, SharedTransport};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lane ids reported with [`RtLogCode::LaneFull`].
const LANE_NETWORK: f64 = 0.0;
const LANE_VISUAL: f64 = 1.0;
const LANE_ENGINE: f64 = 2.0;

/// Thread-safe control surface for a [`Router`] living on another thread.
#[derive(Clone)]
pub struct RouterControl {
    config: Arc<ArcSwap<RouterConfig>>,
    breaker: Arc<TrafficBreaker>,
    panic_requested: Arc<AtomicBool>,
}

impl RouterControl {
    /// Serviced at the start of the router's next block.
    pub fn request_panic(&self) {
        self.panic_requested.store(true, Ordering::Release);
    }

    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    pub fn start_window(&self) {
        self.breaker.start_window();
    }

    pub fn breaker_tripped(&self) -> bool {
        self.breaker.is_tripped()
    }

    pub fn config(&self) -> Arc<RouterConfig> {
        self.config.load_full()
    }

    pub fn update_config(&self, config: RouterConfig) {
        self.config.store(Arc::new(config));
    }
}

pub struct Router {
    config: Arc<ArcSwap<RouterConfig>>,
    breaker: Arc<TrafficBreaker>,
    panic_requested: Arc<AtomicBool>,
    arp: Arpeggiator,
    sustained: NoteSet,
    sustain_down: bool,
    output: Option<Box<dyn OutputConsumer>>,
    scheduler: Option<SchedulerHandle>,
    transport: Option<Arc<SharedTransport>>,
    clock: Option<Arc<ClockShared>>,
    network_lane: Option<Arc<Airlock<Event>>>,
    visual_lane: Option<Arc<Airlock<Event>>>,
    engine_lane: Option<Arc<Airlock<Event>>>,
    rt_log: Option<Arc<RtLog>>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            breaker: Arc::new(TrafficBreaker::new()),
            panic_requested: Arc::new(AtomicBool::new(false)),
            arp: Arpeggiator::new(),
            sustained: NoteSet::new(),
            sustain_down: false,
            output: None,
            scheduler: None,
            transport: None,
            clock: None,
            network_lane: None,
            visual_lane: None,
            engine_lane: None,
            rt_log: None,
        }
    }

    pub fn with_output(mut self, output: impl OutputConsumer + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    pub fn set_output(&mut self, output: Box<dyn OutputConsumer>) {
        self.output = Some(output);
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerHandle) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_transport(mut self, transport: Arc<SharedTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_clock(mut self, clock: Arc<ClockShared>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_network_lane(mut self, lane: Arc<Airlock<Event>>) -> Self {
        self.network_lane = Some(lane);
        self
    }

    pub fn with_visual_lane(mut self, lane: Arc<Airlock<Event>>) -> Self {
        self.visual_lane = Some(lane);
        self
    }

    pub fn with_engine_lane(mut self, lane: Arc<Airlock<Event>>) -> Self {
        self.engine_lane = Some(lane);
        self
    }

    pub fn with_rt_log(mut self, rt_log: Arc<RtLog>) -> Self {
        self.rt_log = Some(rt_log);
        self
    }

    pub fn control(&self) -> RouterControl {
        RouterControl {
            config: self.config.clone(),
            breaker: self.breaker.clone(),
            panic_requested: self.panic_requested.clone(),
        }
    }

    pub fn breaker(&self) -> &TrafficBreaker {
        &self.breaker
    }

    pub fn arpeggiator(&self) -> &Arpeggiator {
        &self.arp
    }

    pub fn sustained_notes(&self) -> &NoteSet {
        &self.sustained
    }

    /// Beats between arpeggiator steps, or `None` while it is disabled.
    pub fn arp_step_beats(&self) -> Option<f64> {
        let config = self.config.load();
        config.arp.enabled.then(|| config.arp.step_beats())
    }

    /// Start a new feedback-counting window.
    pub fn poll_window(&self) {
        self.breaker.start_window();
    }

    /// Run anything other threads asked for: a pending panic and latch
    /// changes from a swapped config. Called at the top of every block.
    pub fn service_requests(&mut self) {
        if self.panic_requested.load(Ordering::Acquire) {
            self.panic();
        }
        let config = self.config.load();
        self.sync_latch(&config);
    }

    /// Route one inbound event. Returns `false` if it was dropped.
    pub fn handle_bridge_event(&mut self, event: Event) -> bool {
        self.service_requests();

        if self.breaker.is_tripped() {
            return false;
        }
        if event.source.is_external() && self.breaker.record() {
            self.log(RtLevel::Warn, RtLogCode::BreakerTripped, self.breaker.count() as f64, 0.0);
            return false;
        }

        match event.kind {
            EventKind::None => return false,
            EventKind::Panic => {
                self.panic();
                return true;
            }
            EventKind::SystemCommand => {}
            kind if kind.is_global() => {
                if event.channel != 0 && !event.has_valid_channel() {
                    return false;
                }
            }
            _ => {
                if !event.has_valid_channel() {
                    return false;
                }
            }
        }

        let config = self.config.load();
        self.sync_latch(&config);

        let event = if event.source == EventSource::HardwareMidi {
            match config.filter.apply(event) {
                Some(filtered) => filtered,
                None => return false,
            }
        } else {
            event
        };

        if event.kind == EventKind::Transport {
            self.handle_transport(event);
        }
        if event.source == EventSource::HardwareMidi {
            self.track_hardware_notes(event);
        }

        self.route(event, &config, 0);
        true
    }

    /// Advance the arpeggiator one step at `beat`. Emits the NoteOn now and
    /// schedules its NoteOff. Returns the NoteOn, if any.
    pub fn on_sequencer_tick(&mut self, beat: f64) -> Option<Event> {
        self.service_requests();
        if self.breaker.is_tripped() {
            return None;
        }

        let config = self.config.load();
        self.sync_latch(&config);
        let arp = &config.arp;
        if !arp.enabled || !(1..=16).contains(&arp.channel) {
            return None;
        }

        let note = self.arp.next_note(arp.pattern, arp.octaves)?;
        let note_on = config.split.apply(Event::note_on(
            EventSource::EngineSequencer,
            arp.channel,
            note,
            arp.velocity,
        ));
        self.forward(note_on, &config, 0);

        if let Some(scheduler) = &self.scheduler {
            // The note-off keeps the zone its note-on was split to.
            let note_off = Event::note_off(EventSource::EngineSequencer, note_on.channel, note);
            let off_beat = beat + arp.gate.clamp(0.0, 1.0) * arp.step_beats();
            scheduler.schedule(note_off, off_beat);
        }
        Some(note_on)
    }

    /// Deliver an event that the scheduler found due in this block. It was
    /// split-mapped when scheduled, so only the routing flags apply here.
    pub fn deliver_scheduled(&mut self, event: Event, sample_offset: usize) {
        let config = self.config.load();
        match event.source {
            EventSource::HardwareMidi
            | EventSource::UserInterface
            | EventSource::EngineSequencer => self.forward(event, &config, sample_offset),
            EventSource::NetworkOsc | EventSource::Internal => {
                self.route(event, &config, sample_offset)
            }
        }
    }

    /// Silence everything and drop all pending state.
    pub fn panic(&mut self) {
        self.panic_requested.store(false, Ordering::Release);
        self.arp.clear();
        self.sustained.clear();
        self.sustain_down = false;

        let internal = EventSource::Internal;
        if let Some(output) = &mut self.output {
            for channel in 1..=16u8 {
                for controller in [CC_ALL_NOTES_OFF, CC_ALL_SOUND_OFF, CC_SUSTAIN] {
                    let event = Event::control_change(internal, channel, controller as u8, 0.0);
                    output.deliver(event, 0);
                }
            }
        }
        if let Some(lane) = &self.engine_lane {
            for channel in 1..=16u8 {
                let off = CC_ALL_NOTES_OFF as u8;
                let _ = lane.push(Event::control_change(internal, channel, off, 0.0));
            }
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.clear();
        }
        self.breaker.reset();
        if let Some(lane) = &self.network_lane {
            lane.clear();
        }
        self.log(RtLevel::Info, RtLogCode::PanicIssued, 0.0, 0.0);
    }

    fn sync_latch(&mut self, config: &RouterConfig) {
        if config.arp.latch == self.arp.is_latched() {
            return;
        }
        let released = self.arp.set_latch(config.arp.latch);
        if released.is_empty() || !(1..=16).contains(&config.arp.channel) {
            return;
        }
        self.log(RtLevel::Debug, RtLogCode::ArpLatchReleased, released.len() as f64, 0.0);
        for note in released.iter() {
            let off = Event::note_off(EventSource::EngineSequencer, config.arp.channel, note);
            self.route(off, config, 0);
        }
    }

    fn handle_transport(&mut self, event: Event) {
        let Some(command) = TransportCommand::from_index(event.index_value) else {
            return;
        };
        match command {
            TransportCommand::Start | TransportCommand::Continue => {
                if let Some(clock) = &self.clock {
                    clock.request_reset();
                }
                if let Some(transport) = &self.transport {
                    if command == TransportCommand::Start {
                        transport.start();
                    } else {
                        transport.resume();
                    }
                }
            }
            TransportCommand::Stop => {
                if let Some(transport) = &self.transport {
                    transport.stop();
                }
            }
        }
    }

    fn track_hardware_notes(&mut self, event: Event) {
        match event.kind {
            EventKind::NoteOn => {
                if let Some(note) = event.note() {
                    self.sustained.remove(note);
                    self.arp.note_on(note);
                }
            }
            EventKind::NoteOff => {
                if let Some(note) = event.note() {
                    // Held by the pedal: keeps feeding the arpeggiator.
                    if self.sustain_down {
                        self.sustained.insert(note);
                    } else {
                        self.arp.note_off(note);
                    }
                }
            }
            EventKind::ControlChange if event.index_value == CC_SUSTAIN => {
                self.sustain_down = event.value >= 0.5;
                if !self.sustain_down {
                    for note in self.sustained.iter() {
                        self.arp.note_off(note);
                    }
                    self.sustained.clear();
                }
            }
            _ => {}
        }
    }

    fn route(&mut self, event: Event, config: &RouterConfig, sample_offset: usize) {
        match event.source {
            EventSource::NetworkOsc => {
                if config.routing.network_to_midi {
                    self.send_output(event, sample_offset);
                }
                self.dispatch_local(event);
            }
            EventSource::HardwareMidi
            | EventSource::UserInterface
            | EventSource::EngineSequencer => {
                self.forward(config.split.apply(event), config, sample_offset)
            }
            EventSource::Internal => {
                self.dispatch_local(event);
                self.send_output(event, sample_offset);
            }
        }
    }

    /// Fan out a split-mapped hardware, UI or sequencer event.
    fn forward(&mut self, event: Event, config: &RouterConfig, sample_offset: usize) {
        if config.routing.publishes(event.source) {
            self.publish_network(event);
        }
        self.dispatch_local(event);
        if event.source != EventSource::HardwareMidi && config.routing.midi_thru {
            self.send_output(event, sample_offset);
        }
    }

    fn send_output(&mut self, event: Event, sample_offset: usize) {
        if !(event.kind.is_channel_voice() || event.kind == EventKind::Transport) {
            return;
        }
        if let Some(output) = &mut self.output {
            output.deliver(event, sample_offset);
        }
    }

    fn publish_network(&self, event: Event) {
        if let Some(lane) = &self.network_lane {
            if !lane.push(event) {
                self.log(RtLevel::Debug, RtLogCode::LaneFull, LANE_NETWORK, lane.len() as f64);
            }
        }
    }

    fn dispatch_local(&self, event: Event) {
        if let Some(lane) = &self.visual_lane {
            if !lane.push(event) {
                self.log(RtLevel::Debug, RtLogCode::LaneFull, LANE_VISUAL, lane.len() as f64);
            }
        }
        if event.kind.is_channel_voice() {
            if let Some(lane) = &self.engine_lane {
                if !lane.push(event) {
                    self.log(RtLevel::Debug, RtLogCode::LaneFull, LANE_ENGINE, lane.len() as f64);
                }
            }
        }
    }

    fn log(&self, level: RtLevel, code: RtLogCode, a: f64, b: f64) {
        if let Some(log) = &self.rt_log {
            log.emit(level, code, a, b);
        }
    }
}
