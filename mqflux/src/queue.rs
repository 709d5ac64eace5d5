use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use mqflux_utils::Counter;

pub enum Policy {
    //Discard current value
    Current,
    //Discard earliest value
    Early,
}

/// Bounded multi-producer queue with an async `pop`.
///
/// When full, the overflow policy decides which value is discarded and the
/// `dropped` counter is incremented; producers never wait.
pub struct Queue<T> {
    cap: usize,
    policy: Policy,
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: Counter,
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue {{ cap: {}, len: {}, dropped: {:?} }}", self.cap, self.len(), self.dropped)
    }
}

impl<T> Drop for Queue<T> {
    #[inline]
    fn drop(&mut self) {
        log::debug!("Queue Drop ... len: {}", self.len());
    }
}

impl<T> Queue<T> {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self::with_policy(cap, Policy::Early)
    }

    #[inline]
    pub fn with_policy(cap: usize, policy: Policy) -> Self {
        Self {
            cap: cap.max(1),
            policy,
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: Counter::new(),
        }
    }

    ///If the queue is full, a value is discarded according to the policy and returned
    #[inline]
    pub fn push(&self, v: T) -> Result<(), T> {
        if self.is_closed() {
            return Err(v);
        }
        let discarded = {
            let mut inner = self.inner.lock();
            if inner.len() >= self.cap {
                match self.policy {
                    Policy::Current => Some(v),
                    Policy::Early => {
                        let removed = inner.pop_front();
                        inner.push_back(v);
                        removed
                    }
                }
            } else {
                inner.push_back(v);
                None
            }
        };
        self.notify.notify_one();
        match discarded {
            Some(d) => {
                self.dropped.inc();
                Err(d)
            }
            None => Ok(()),
        }
    }

    ///Puts a value back at the head, ignoring the capacity
    #[inline]
    pub fn push_front(&self, v: T) {
        self.inner.lock().push_front(v);
        self.notify.notify_one();
    }

    #[inline]
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Waits for the next value, `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            if let Some(v) = self.try_pop() {
                return Some(v);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    #[inline]
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn dropped(&self) -> &Counter {
        &self.dropped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn early_policy_drops_oldest() {
        let q = Queue::new(2);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.push(3), Err(1));
        assert_eq!(q.dropped().count(), 1);
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn current_policy_rejects_newest() {
        let q = Queue::with_policy(1, Policy::Current);
        assert!(q.push("a").is_ok());
        assert_eq!(q.push("b"), Err("b"));
        q.push_front("z");
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_pop(), Some("z"));
    }

    #[tokio::test]
    async fn pop_waits_for_push_and_close() {
        let q = Arc::new(Queue::new(8));
        let q1 = q.clone();
        let h = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(v) = q1.pop().await {
                got.push(v);
            }
            got
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(1).unwrap();
        q.push(2).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert_eq!(h.await.unwrap(), vec![1, 2]);
        assert!(q.push(3).is_err());
    }
}
