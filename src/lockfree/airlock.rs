use arc_swap::ArcSwapOption;
use crossbeam::queue::ArrayQueue;
use std::sync::Arc;

/// Callback run after every successful push, used to wake a sleeping
/// consumer thread.
pub struct WakeFn(Box<dyn Fn() + Send + Sync>);

impl WakeFn {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }
}

/// Bounded multi-producer batching queue.
///
/// Producers never wait on the consumer: a full airlock drops the pushed
/// item. The consumer drains in bounded batches so a realtime callback has a
/// known worst case. Each producer's own pushes arrive in order; ordering
/// between producers is unspecified.
pub struct Airlock<T> {
    queue: ArrayQueue<T>,
    waker: ArcSwapOption<WakeFn>,
}

impl<T> Airlock<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            waker: ArcSwapOption::empty(),
        }
    }

    pub fn set_waker(&self, waker: Option<WakeFn>) {
        self.waker.store(waker.map(Arc::new));
    }

    pub fn push(&self, item: T) -> bool {
        if self.queue.push(item).is_err() {
            return false;
        }
        if let Some(waker) = &*self.waker.load() {
            (waker.0)();
        }
        true
    }

    /// Hand at most `max_items` queued items to `visitor`. Returns how many
    /// were processed.
    pub fn process_batch(&self, mut visitor: impl FnMut(T), max_items: usize) -> usize {
        let mut processed = 0;
        while processed < max_items {
            match self.queue.pop() {
                Some(item) => {
                    visitor(item);
                    processed += 1;
                }
                None => break,
            }
        }
        processed
    }

    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn fill_ratio(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_full_airlock_drops_newest() {
        let airlock = Airlock::new(2);
        assert!(airlock.push(1));
        assert!(airlock.push(2));
        assert!(!airlock.push(3));

        let mut seen = Vec::new();
        airlock.process_batch(|item| seen.push(item), 16);
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_batch_is_bounded() {
        let airlock = Airlock::new(32);
        for i in 0..10 {
            airlock.push(i);
        }
        let mut seen = Vec::new();
        assert_eq!(airlock.process_batch(|item| seen.push(item), 4), 4);
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(airlock.len(), 6);
        assert_eq!(airlock.clear(), 6);
        assert!(airlock.is_empty());
    }

    #[test]
    fn test_waker_runs_on_push() {
        let wakes = Arc::new(AtomicUsize::new(0));
        let airlock = Airlock::new(4);
        let counter = wakes.clone();
        airlock.set_waker(Some(WakeFn::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })));
        airlock.push(1u8);
        airlock.push(2u8);
        assert_eq!(wakes.load(Ordering::Relaxed), 2);

        airlock.set_waker(None);
        airlock.push(3u8);
        assert_eq!(wakes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_per_producer_order_with_many_producers() {
        let airlock = Arc::new(Airlock::new(4096));
        let handles: Vec<_> = (0..4u32)
            .map(|producer| {
                let airlock = airlock.clone();
                thread::spawn(move || {
                    for seq in 0..500u32 {
                        while !airlock.push((producer, seq)) {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut last = [None::<u32>; 4];
        let total = airlock.process_batch(
            |(producer, seq)| {
                let slot = &mut last[producer as usize];
                if let Some(prev) = *slot {
                    assert!(seq > prev);
                }
                *slot = Some(seq);
            },
            usize::MAX,
        );
        assert_eq!(total, 2000);
    }
}
