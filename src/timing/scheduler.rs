use crate::events::{Event, EventKind};
use crate::lockfree::Airlock;
use crate::output::OutputConsumer;
use crate::rtlog::{RtLevel, RtLog, RtLogCode};
use std::sync::Arc;

pub const POOL_SIZE: usize = 1024;
pub const MAX_DUE_PER_BLOCK: usize = 128;
pub const JUMP_THRESHOLD_BEATS: f64 = 1.0;
pub const COMMAND_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SchedulerCommand {
    Schedule { event: Event, beat: f64 },
    Clear,
    AllNotesOff,
}

#[derive(Debug, Clone, Copy, Default)]
struct ScheduledSlot {
    event: Event,
    scheduled_beat: f64,
    is_active: bool,
}

/// Producer side of the scheduler's command queue. Cheap to clone, usable
/// from any thread, never blocks.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: Arc<Airlock<SchedulerCommand>>,
    rt_log: Option<Arc<RtLog>>,
}

impl SchedulerHandle {
    pub fn schedule(&self, event: Event, beat: f64) -> bool {
        self.send(SchedulerCommand::Schedule { event, beat })
    }

    pub fn clear(&self) -> bool {
        self.send(SchedulerCommand::Clear)
    }

    pub fn all_notes_off(&self) -> bool {
        self.send(SchedulerCommand::AllNotesOff)
    }

    fn send(&self, command: SchedulerCommand) -> bool {
        let sent = self.commands.push(command);
        if !sent {
            if let Some(log) = &self.rt_log {
                log.emit(RtLevel::Warn, RtLogCode::SchedulerCommandDropped, 0.0, 0.0);
            }
        }
        sent
    }
}

/// Beat-quantized event scheduler.
///
/// Commands arrive from any thread through [`SchedulerHandle`]; the slot
/// pool is only touched by the thread calling [`Scheduler::process_block`].
pub struct Scheduler {
    commands: Arc<Airlock<SchedulerCommand>>,
    pool: Box<[ScheduledSlot]>,
    last_processed_beat: f64,
    current_beat: f64,
    catch_up: bool,
    rt_log: Option<Arc<RtLog>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            commands: Arc::new(Airlock::new(COMMAND_QUEUE_SIZE)),
            pool: vec![ScheduledSlot::default(); POOL_SIZE].into_boxed_slice(),
            last_processed_beat: 0.0,
            current_beat: 0.0,
            catch_up: false,
            rt_log: None,
        }
    }

    pub fn with_rt_log(mut self, rt_log: Arc<RtLog>) -> Self {
        self.rt_log = Some(rt_log);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            commands: self.commands.clone(),
            rt_log: self.rt_log.clone(),
        }
    }

    /// Position reported by the tempo authority. A value far from the last
    /// processed beat is treated as a seek on the next block.
    pub fn set_beat_position(&mut self, beat: f64) {
        self.current_beat = beat;
    }

    pub fn last_processed_beat(&self) -> f64 {
        self.last_processed_beat
    }

    pub fn active_count(&self) -> usize {
        self.pool.iter().filter(|slot| slot.is_active).count()
    }

    pub fn drain_command_queue(&mut self) {
        let Self {
            commands,
            pool,
            catch_up,
            rt_log,
            ..
        } = self;
        let max = commands.capacity();
        commands.process_batch(
            |command| match command {
                SchedulerCommand::Schedule { event, beat } => {
                    insert_slot(pool, event, beat, rt_log.as_deref());
                }
                SchedulerCommand::Clear => {
                    pool.iter_mut().for_each(|slot| slot.is_active = false);
                }
                SchedulerCommand::AllNotesOff => {
                    for slot in pool.iter_mut().filter(|slot| slot.is_active) {
                        match slot.event.kind {
                            EventKind::NoteOn => slot.is_active = false,
                            // Pending note-offs fire at the start of the next block.
                            EventKind::NoteOff => {
                                slot.scheduled_beat = f64::NEG_INFINITY;
                                *catch_up = true;
                            }
                            _ => {}
                        }
                    }
                }
            },
            max,
        );
    }

    /// Deliver every slot due in this block to `sink`. Returns the number
    /// of events delivered.
    pub fn process_block<S>(
        &mut self,
        num_samples: usize,
        bpm: f64,
        sample_rate: f64,
        sink: &mut S,
    ) -> usize
    where
        S: OutputConsumer + ?Sized,
    {
        self.drain_command_queue();
        if num_samples == 0 || !(bpm > 0.0) || !(sample_rate > 0.0) {
            return 0;
        }

        let samples_per_beat = sample_rate * 60.0 / bpm;
        let block_beats = num_samples as f64 / samples_per_beat;
        let start_beat = self.last_processed_beat;
        let end_beat = self.current_beat + block_beats;
        let jumped = (end_beat - start_beat).abs() > JUMP_THRESHOLD_BEATS;
        let sweep_past_due = jumped || self.catch_up;
        self.catch_up = false;

        if jumped {
            if let Some(log) = &self.rt_log {
                log.emit(RtLevel::Debug, RtLogCode::SchedulerJump, start_beat, end_beat);
            }
        }

        let last_sample = (num_samples - 1) as f64;
        let mut delivered = 0;
        for slot in self.pool.iter_mut().filter(|slot| slot.is_active) {
            let beat = slot.scheduled_beat;
            let due = if sweep_past_due {
                beat < end_beat
            } else {
                beat >= start_beat && beat < end_beat
            };
            if !due {
                continue;
            }
            if delivered == MAX_DUE_PER_BLOCK {
                // Whatever is left gets swept on the next block.
                self.catch_up = true;
                if let Some(log) = &self.rt_log {
                    log.emit(RtLevel::Warn, RtLogCode::SchedulerDueCapReached, end_beat, 0.0);
                }
                break;
            }

            let offset = ((beat - start_beat) * samples_per_beat).max(0.0).min(last_sample);
            sink.deliver(slot.event, offset as usize);
            slot.is_active = false;
            delivered += 1;
        }

        self.last_processed_beat = end_beat;
        self.current_beat = end_beat;
        delivered
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_slot(pool: &mut [ScheduledSlot], event: Event, beat: f64, rt_log: Option<&RtLog>) {
    let index = match pool.iter().position(|slot| !slot.is_active) {
        Some(free) => free,
        None => {
            // Pool full: the slot with the earliest deadline is evicted.
            let mut oldest = 0;
            for (i, slot) in pool.iter().enumerate() {
                if slot.scheduled_beat < pool[oldest].scheduled_beat {
                    oldest = i;
                }
            }
            if let Some(log) = rt_log {
                let evicted = pool[oldest].scheduled_beat;
                log.emit(RtLevel::Warn, RtLogCode::SchedulerEvicted, evicted, beat);
            }
            oldest
        }
    };
    pool[index] = ScheduledSlot {
        event,
        scheduled_beat: beat,
        is_active: true,
    };
}
