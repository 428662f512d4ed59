use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Two slots and a published index.
///
/// `store` writes the inactive slot and then publishes it. `load` clones the
/// published slot. Each slot counts its active readers; the writer waits for
/// the inactive slot to drain before overwriting it, so a reader never
/// observes a half-written value and never waits on the writer.
///
/// At most one thread may call `store` at a time.
pub struct DoubleBuffered<T> {
    slots: [UnsafeCell<T>; 2],
    readers: [AtomicUsize; 2],
    active: AtomicUsize,
}

// Safety: slot access is mediated by `active` and the per-slot reader counts.
unsafe impl<T: Send> Send for DoubleBuffered<T> {}
unsafe impl<T: Send + Sync> Sync for DoubleBuffered<T> {}

impl<T: Clone> DoubleBuffered<T> {
    pub fn new(value: T) -> Self {
        Self {
            slots: [UnsafeCell::new(value.clone()), UnsafeCell::new(value)],
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            active: AtomicUsize::new(0),
        }
    }

    pub fn load(&self) -> T {
        loop {
            let idx = self.active.load(Ordering::SeqCst);
            self.readers[idx].fetch_add(1, Ordering::SeqCst);
            // The slot may have been retired between the two loads.
            if self.active.load(Ordering::SeqCst) == idx {
                // Safety: `idx` is published and our reader count keeps the
                // writer off it until we are done.
                let value = unsafe { (*self.slots[idx].get()).clone() };
                self.readers[idx].fetch_sub(1, Ordering::SeqCst);
                return value;
            }
            self.readers[idx].fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn store(&self, value: T) {
        let inactive = 1 - self.active.load(Ordering::SeqCst);
        while self.readers[inactive].load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }
        // Safety: `inactive` is unpublished and has no readers.
        unsafe {
            *self.slots[inactive].get() = value;
        }
        self.active.store(inactive, Ordering::SeqCst);
    }
}

impl<T: Clone + Default> Default for DoubleBuffered<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
