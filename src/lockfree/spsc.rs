use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};

/// Create a bounded single-producer/single-consumer queue.
///
/// The halves are separate owned values, so the single-producer and
/// single-consumer discipline is enforced by the type system.
pub fn spsc_queue<T>(capacity: usize) -> (SpscProducer<T>, SpscConsumer<T>) {
    let (inner_prod, inner_cons) = HeapRb::<T>::new(capacity.max(1)).split();
    (SpscProducer { inner: inner_prod }, SpscConsumer { inner: inner_cons })
}

pub struct SpscProducer<T> {
    inner: HeapProd<T>,
}

impl<T> SpscProducer<T> {
    /// Returns `false` if the queue is full. Never blocks or allocates.
    #[inline]
    pub fn push(&mut self, item: T) -> bool {
        self.inner.try_push(item).is_ok()
    }

    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }
}

pub struct SpscConsumer<T> {
    inner: HeapCons<T>,
}

impl<T> SpscConsumer<T> {
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        self.inner.try_pop()
    }

    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::SmallRng};
    use std::thread;

    #[test]
    fn test_push_fails_when_full() {
        let (mut tx, mut rx) = spsc_queue::<u32>(2);
        assert!(tx.push(1));
        assert!(tx.push(2));
        assert!(!tx.push(3));
        assert_eq!(rx.pop(), Some(1));
        assert!(tx.push(3));
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), Some(3));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_stress_single_producer_single_consumer() {
        const ITEMS: u64 = 100_000;
        let (mut tx, mut rx) = spsc_queue::<u64>(256);

        let producer = thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(7);
            let mut next = 0;
            while next < ITEMS {
                if tx.push(next) {
                    next += 1;
                }
                if rng.gen_range(0..16) == 0 {
                    thread::yield_now();
                }
            }
        });

        let consumer = thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(11);
            let mut expected = 0;
            while expected < ITEMS {
                match rx.pop() {
                    Some(value) => {
                        assert_eq!(value, expected, "FIFO order violated");
                        expected += 1;
                    }
                    None => thread::yield_now(),
                }
                if rng.gen_range(0..16) == 0 {
                    thread::yield_now();
                }
            }
            expected
        });

        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), ITEMS);
    }
}
