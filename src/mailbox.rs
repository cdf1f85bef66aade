//! Thread-safe FIFO shared between the I/O runtime and application threads

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.queue.lock().push_back(item);
        self.ready.notify_one();
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// Take the oldest item, waiting up to `wait` for one to arrive
    pub fn pop_timeout(&self, wait: Duration) -> Option<T> {
        let deadline = Instant::now() + wait;
        let mut q = self.queue.lock();
        loop {
            if let Some(item) = q.pop_front() {
                return Some(item);
            }
            if self.ready.wait_until(&mut q, deadline).timed_out() {
                return q.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let mb = Mailbox::new();
        mb.push("a");
        mb.push("b");
        mb.push("c");
        assert_eq!(mb.len(), 3);
        assert_eq!(mb.pop(), Some("a"));
        assert_eq!(mb.pop(), Some("b"));
        assert_eq!(mb.pop(), Some("c"));
        assert!(mb.is_empty());
        assert_eq!(mb.pop(), None);
    }

    #[test]
    fn test_pop_timeout_expires_when_empty() {
        let mb: Mailbox<u32> = Mailbox::new();
        let start = Instant::now();
        assert_eq!(mb.pop_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_pop_timeout_wakes_on_push() {
        let mb = Arc::new(Mailbox::new());
        let producer = {
            let mb = mb.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                mb.push(7u32);
            })
        };
        assert_eq!(mb.pop_timeout(Duration::from_secs(5)), Some(7));
        producer.join().unwrap();
    }
}
