//! Done signal
//!
//! A closed-once flag shared between a cancellable context and whoever waits
//! on it. Waiters can block on it or subscribe a callback that runs when it
//! closes.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

type Subscriber = Box<dyn FnOnce() + Send>;

struct DoneInner {
    closed: bool,
    next_id: u64,
    subscribers: Vec<(u64, Subscriber)>,
}

pub struct DoneSignal {
    inner: Mutex<DoneInner>,
    cond: Condvar,
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl DoneSignal {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DoneInner {
                closed: false,
                next_id: 0,
                subscribers: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Block until closed.
    pub fn wait(&self) {
        let mut s = self.inner.lock();
        while !s.closed {
            self.cond.wait(&mut s);
        }
    }

    /// Block until closed or `timeout` elapses. Returns whether it closed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut s = self.inner.lock();
        while !s.closed {
            if self.cond.wait_until(&mut s, deadline).timed_out() {
                return s.closed;
            }
        }
        true
    }

    /// Close the signal, waking waiters and running subscribers on the
    /// calling thread. Only the first call has any effect.
    pub fn close(&self) -> bool {
        let subscribers = {
            let mut s = self.inner.lock();
            if s.closed {
                return false;
            }
            s.closed = true;
            std::mem::take(&mut s.subscribers)
        };
        self.cond.notify_all();
        for (_, f) in subscribers {
            f();
        }
        true
    }

    /// Run `f` when the signal closes. If it is already closed, `f` runs now
    /// and no subscription is returned.
    pub fn subscribe(&self, f: impl FnOnce() + Send + 'static) -> Option<u64> {
        let mut s = self.inner.lock();
        if s.closed {
            drop(s);
            f();
            return None;
        }
        let id = s.next_id;
        s.next_id += 1;
        s.subscribers.push((id, Box::new(f)));
        Some(id)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = {
            let mut s = self.inner.lock();
            let Some(pos) = s.subscribers.iter().position(|(sid, _)| *sid == id) else {
                return false;
            };
            s.subscribers.remove(pos)
        };
        // The callback may own a context; drop it outside the lock.
        drop(removed);
        true
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_close_once() {
        let done = DoneSignal::new();
        assert!(!done.is_closed());
        assert!(done.close());
        assert!(!done.close());
        assert!(done.is_closed());
    }

    #[test]
    fn test_subscribers_run_on_close() {
        let done = DoneSignal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            done.subscribe(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        done.close();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(done.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribe_after_close_runs_now() {
        let done = DoneSignal::new();
        done.close();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        assert!(done
            .subscribe(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let done = DoneSignal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = done
            .subscribe(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(done.unsubscribe(id));
        assert!(!done.unsubscribe(id));
        done.close();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_wakes_on_close() {
        let done = Arc::new(DoneSignal::new());
        let d = done.clone();
        let waiter = thread::spawn(move || d.wait());
        thread::sleep(Duration::from_millis(5));
        done.close();
        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let done = DoneSignal::new();
        assert!(!done.wait_timeout(Duration::from_millis(5)));
        done.close();
        assert!(done.wait_timeout(Duration::from_millis(5)));
    }
}
