/// Ordered set of MIDI note numbers with inline storage.
#[derive(Clone, PartialEq, Eq)]
pub struct NoteSet {
    notes: [u8; 128],
    len: usize,
}

impl NoteSet {
    pub const fn new() -> Self {
        Self {
            notes: [0; 128],
            len: 0,
        }
    }

    /// Returns `false` if the note was already present or is not 0-127.
    pub fn insert(&mut self, note: u8) -> bool {
        if note > 127 {
            return false;
        }
        match self.as_slice().binary_search(&note) {
            Ok(_) => false,
            Err(pos) => {
                self.notes.copy_within(pos..self.len, pos + 1);
                self.notes[pos] = note;
                self.len += 1;
                true
            }
        }
    }

    pub fn remove(&mut self, note: u8) -> bool {
        match self.as_slice().binary_search(&note) {
            Ok(pos) => {
                self.notes.copy_within(pos + 1..self.len, pos);
                self.len -= 1;
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, note: u8) -> bool {
        self.as_slice().binary_search(&note).is_ok()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.as_slice().get(index).copied()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.notes[..self.len]
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.as_slice().iter().copied()
    }
}

impl Default for NoteSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NoteSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_order_and_uniqueness() {
        let mut set = NoteSet::new();
        assert!(set.insert(64));
        assert!(set.insert(60));
        assert!(set.insert(67));
        assert!(!set.insert(60));
        assert!(!set.insert(200));
        assert_eq!(set.as_slice(), &[60, 64, 67]);

        assert!(set.remove(64));
        assert!(!set.remove(64));
        assert_eq!(set.as_slice(), &[60, 67]);
        assert!(set.contains(67));
    }

    #[test]
    fn test_full_range_fits() {
        let mut set = NoteSet::new();
        for note in (0..128u8).rev() {
            assert!(set.insert(note));
        }
        assert_eq!(set.len(), 128);
        assert_eq!(set.get(0), Some(0));
        assert_eq!(set.get(127), Some(127));
    }
}
