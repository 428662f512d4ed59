use super::config::ArpPattern;
use super::notes::NoteSet;
use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Index visited at `step` by the Diverge pattern: the center first, then
/// alternating one to the left and one to the right.
pub fn diverge_index(step: usize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let step = step % len;
    let center = len / 2;
    let distance = step.div_ceil(2);
    let index = if step % 2 == 1 {
        center.checked_sub(distance)
    } else {
        Some(center + distance)
    };
    index.filter(|i| *i < len).unwrap_or(center)
}

pub struct Arpeggiator {
    held: NoteSet,
    latched: NoteSet,
    latch: bool,
    step: usize,
    rng: SmallRng,
}

impl Arpeggiator {
    pub fn new() -> Self {
        Self {
            held: NoteSet::new(),
            latched: NoteSet::new(),
            latch: false,
            step: 0,
            rng: SmallRng::seed_from_u64(0x5eed),
        }
    }

    pub fn note_on(&mut self, note: u8) {
        if self.latch {
            // A fresh chord replaces the latched one.
            if self.held.is_empty() {
                self.latched.clear();
            }
            self.latched.insert(note);
        }
        if self.held.is_empty() {
            self.step = 0;
        }
        self.held.insert(note);
    }

    pub fn note_off(&mut self, note: u8) {
        self.held.remove(note);
    }

    pub fn is_latched(&self) -> bool {
        self.latch
    }

    /// Switch latch mode. Turning it off returns the notes that were only
    /// sounding because of the latch; the caller owes them a note-off.
    pub fn set_latch(&mut self, latch: bool) -> NoteSet {
        let mut released = NoteSet::new();
        if latch == self.latch {
            return released;
        }
        self.latch = latch;
        if latch {
            self.latched = self.held.clone();
        } else {
            for note in self.latched.iter() {
                if !self.held.contains(note) {
                    released.insert(note);
                }
            }
            self.latched.clear();
        }
        released
    }

    pub fn held(&self) -> &NoteSet {
        &self.held
    }

    pub fn latched(&self) -> &NoteSet {
        &self.latched
    }

    fn source(&self) -> &NoteSet {
        if self.latch { &self.latched } else { &self.held }
    }

    /// Advance one step and return the note to play.
    pub fn next_note(&mut self, pattern: ArpPattern, octaves: u8) -> Option<u8> {
        let len = self.source().len();
        if len == 0 {
            return None;
        }
        let total = len * octaves.clamp(1, 4) as usize;
        let step = self.step;
        self.step = self.step.wrapping_add(1);

        let index = match pattern {
            ArpPattern::Up => step % total,
            ArpPattern::Down => total - 1 - step % total,
            ArpPattern::Random => self.rng.gen_range(0..total),
            ArpPattern::Diverge => diverge_index(step, total),
        };
        let base = self.source().get(index % len)?;
        let note = base as usize + 12 * (index / len);
        Some(note.min(127) as u8)
    }

    pub fn clear(&mut self) {
        self.held.clear();
        self.latched.clear();
        self.step = 0;
    }
}

impl Default for Arpeggiator {
    fn default() -> Self {
        Self::new()
    }
}
