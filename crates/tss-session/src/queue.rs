//! Bounded single-consumer session queue.
//!
//! The transport's receive path pushes without ever waiting: when the queue
//! is full the oldest envelope is evicted and counted as
//! [`DropReason::Overflow`]. After [`QueueReceiver::close`] every pushed or
//! still-buffered envelope is counted as [`DropReason::Closed`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tss_transport::{DropCounters, DropReason, Envelope};

struct Inner {
    buf: VecDeque<Envelope>,
    closed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    counters: Arc<DropCounters>,
}

/// Create a queue holding at most `capacity` envelopes (minimum 1).
pub fn channel(capacity: usize, counters: Arc<DropCounters>) -> (QueueSender, QueueReceiver) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            buf: VecDeque::with_capacity(capacity.max(1)),
            closed: false,
        }),
        notify: Notify::new(),
        capacity: capacity.max(1),
        counters,
    });
    (
        QueueSender {
            shared: shared.clone(),
        },
        QueueReceiver { shared },
    )
}

#[derive(Clone)]
pub struct QueueSender {
    shared: Arc<Shared>,
}

impl QueueSender {
    /// Enqueue without blocking. Returns `false` if the queue is closed.
    pub fn push(&self, envelope: Envelope) -> bool {
        let mut inner = self
            .shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            self.shared.counters.bump(DropReason::Closed);
            return false;
        }
        if inner.buf.len() >= self.shared.capacity {
            if let Some(evicted) = inner.buf.pop_front() {
                tracing::debug!(
                    session_id = %evicted.session_id,
                    sender = %evicted.sender,
                    "session queue full, dropping oldest"
                );
                self.shared.counters.bump(DropReason::Overflow);
            }
        }
        inner.buf.push_back(envelope);
        drop(inner);
        self.shared.notify.notify_one();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}

pub struct QueueReceiver {
    shared: Arc<Shared>,
}

impl QueueReceiver {
    /// Next envelope, or `None` once closed.
    ///
    /// Cancel-safe: nothing is dequeued unless the future completes.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            {
                let mut inner = self
                    .shared
                    .inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if inner.closed {
                    return None;
                }
                if let Some(envelope) = inner.buf.pop_front() {
                    return Some(envelope);
                }
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buf
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting envelopes; buffered ones are counted as closed drops.
    pub fn close(&self) {
        let mut inner = self
            .shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return;
        }
        inner.closed = true;
        for _ in inner.buf.drain(..) {
            self.shared.counters.bump(DropReason::Closed);
        }
        drop(inner);
        self.shared.notify.notify_one();
    }
}

impl Drop for QueueReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tss_transport::RequestType;

    fn env(n: u8) -> Envelope {
        Envelope::new("SIGN:evm/1", RequestType::TssRound, "bridge1a".into(), vec![n])
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let counters = Arc::new(DropCounters::new());
        let (tx, rx) = channel(4, counters);
        for n in 0..3 {
            assert!(tx.push(env(n)));
        }
        for n in 0..3 {
            assert_eq!(rx.recv().await.expect("env").payload, vec![n]);
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let counters = Arc::new(DropCounters::new());
        let (tx, rx) = channel(2, counters.clone());
        for n in 0..3 {
            tx.push(env(n));
        }
        assert_eq!(counters.snapshot().overflow, 1);
        assert_eq!(rx.recv().await.expect("env").payload, vec![1]);
        assert_eq!(rx.recv().await.expect("env").payload, vec![2]);
    }

    #[tokio::test]
    async fn test_close_counts_remaining_and_later_pushes() {
        let counters = Arc::new(DropCounters::new());
        let (tx, rx) = channel(4, counters.clone());
        tx.push(env(0));
        tx.push(env(1));
        rx.close();
        assert!(!tx.push(env(2)));
        assert!(tx.is_closed());
        assert_eq!(counters.snapshot().closed, 3);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let counters = Arc::new(DropCounters::new());
        let (tx, rx) = channel(4, counters);
        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.push(env(9));
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("join");
        assert_eq!(got.map(|e| e.payload), Some(vec![9]));
    }
}
