use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

/// Sequence-locked value for small `Copy` payloads.
///
/// The writer moves the sequence to an odd number, writes, and moves it to
/// the next even number. Readers retry while the sequence is odd or changed
/// during the copy. Reads never block the writer.
pub struct SeqLock<T> {
    seq: AtomicUsize,
    data: UnsafeCell<T>,
}

// Safety: readers validate every copy against `seq`; writers are serialized
// by the odd/even handshake in `write`.
unsafe impl<T: Copy + Send> Send for SeqLock<T> {}
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            seq: AtomicUsize::new(0),
            data: UnsafeCell::new(value),
        }
    }

    pub fn read(&self) -> T {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            // Safety: a torn copy is discarded below; volatile keeps the
            // compiler from caching the read across the validation.
            let value = unsafe { std::ptr::read_volatile(self.data.get()) };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return value;
            }
        }
    }

    pub fn write(&self, value: T) {
        // A second writer would find an odd sequence and wait here.
        let mut current = self.seq.load(Ordering::Relaxed);
        loop {
            if current & 1 == 1 {
                std::hint::spin_loop();
                current = self.seq.load(Ordering::Relaxed);
                continue;
            }
            match self.seq.compare_exchange_weak(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        fence(Ordering::Release);
        // Safety: the odd sequence excludes other writers.
        unsafe { std::ptr::write_volatile(self.data.get(), value) };
        self.seq.store(current.wrapping_add(2), Ordering::Release);
    }

    /// Read-modify-write for the single writer.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut value = self.read();
        f(&mut value);
        self.write(value);
    }
}

impl<T: Copy + Default> Default for SeqLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Clone, Copy, Default)]
    struct Pair {
        beat: f64,
        doubled: f64,
    }

    #[test]
    fn test_read_after_write() {
        let lock = SeqLock::new(120.0f64);
        lock.write(128.5);
        assert_eq!(lock.read(), 128.5);
        lock.update(|bpm| *bpm += 1.5);
        assert_eq!(lock.read(), 130.0);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_payload() {
        let lock = Arc::new(SeqLock::new(Pair::default()));
        let writer = {
            let lock = lock.clone();
            thread::spawn(move || {
                for i in 0..50_000 {
                    let beat = i as f64 * 0.25;
                    lock.write(Pair { beat, doubled: beat * 2.0 });
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..50_000 {
                        let pair = lock.read();
                        assert_eq!(pair.doubled, pair.beat * 2.0);
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
