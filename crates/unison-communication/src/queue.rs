use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::Duration,
};

/// Blocking FIFO handing events from one thread to another.
///
/// The producer side never blocks; `get` parks the consumer until an event
/// arrives. Delivery order is the enqueue order, which makes the queue the
/// linearization point for everything the consumer observes.
pub struct EventQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self { items: Mutex::new(VecDeque::new()), available: Condvar::new() }
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, item: T) {
        let mut items = self.items.lock().expect("event queue poisoned");
        items.push_back(item);
        self.available.notify_one();
    }

    /// Blocks until an event is available.
    pub fn get(&self) -> T {
        let mut items = self.items.lock().expect("event queue poisoned");
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self.available.wait(items).expect("event queue poisoned");
        }
    }

    /// Blocks for at most `timeout`, returning `None` if nothing arrived.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let items = self.items.lock().expect("event queue poisoned");
        let (mut items, _) = self
            .available
            .wait_timeout_while(items, timeout, |items| items.is_empty())
            .expect("event queue poisoned");
        items.pop_front()
    }

    pub fn try_get(&self) -> Option<T> {
        self.items.lock().expect("event queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("event queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn fifo_order() {
        let q = EventQueue::new();
        for i in 0..8 {
            q.put(i);
        }
        for i in 0..8 {
            assert_eq!(q.get(), i);
        }
        assert!(q.try_get().is_none());
    }

    #[test]
    fn get_blocks_until_put() {
        let q = Arc::new(EventQueue::new());
        let q2 = q.clone();
        let consumer = thread::spawn(move || q2.get());
        thread::sleep(Duration::from_millis(20));
        q.put(42u32);
        assert_eq!(consumer.join().unwrap(), 42);
    }

    #[test]
    fn get_timeout_expires_empty() {
        let q: EventQueue<u32> = EventQueue::new();
        assert!(q.get_timeout(Duration::from_millis(10)).is_none());
        q.put(7);
        assert_eq!(q.get_timeout(Duration::from_millis(10)), Some(7));
    }

    #[test]
    fn producer_consumer_threads() {
        let q = Arc::new(EventQueue::new());
        let total = 10_000usize;

        let consumer = {
            let q = q.clone();
            thread::spawn(move || (0..total).map(|_| q.get()).sum::<usize>())
        };
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..total {
                    q.put(i);
                }
            })
        };

        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), (0..total).sum::<usize>());
    }
}
