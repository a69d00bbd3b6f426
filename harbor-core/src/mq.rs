//! Cross-thread handoff into a service loop.
//!
//! Many producers, one consumer (the owning service). FIFO per producer;
//! the consumer drains bounded batches per tick to protect the frame budget.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{CoreResult, Error};
use crate::variant::Variant;

pub type ServiceId = u64;

/// Opaque message handed into a service loop from another thread or service.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub tag: String,
    pub payload: Variant,
    /// Originating service, when posted through the manager.
    pub from: Option<ServiceId>,
}

impl Envelope {
    pub fn new(tag: impl Into<String>, payload: Variant) -> Self {
        Envelope {
            tag: tag.into(),
            payload,
            from: None,
        }
    }
}

/// Consumer half, owned by the service loop.
pub struct MessageQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

/// Producer half. Cheap to clone and hand out across threads.
pub struct MessageSender<T>(Sender<T>);

impl<T> Clone for MessageSender<T> {
    fn clone(&self) -> Self {
        MessageSender(self.0.clone())
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        MessageQueue { tx, rx }
    }

    pub fn sender(&self) -> MessageSender<T> {
        MessageSender(self.tx.clone())
    }

    /// Non-blocking bounded drain; returns how many items were moved into
    /// `out`.
    pub fn drain_up_to(&self, cap: usize, out: &mut Vec<T>) -> usize {
        let mut drained = 0;
        while drained < cap {
            match self.rx.try_recv() {
                Ok(item) => {
                    out.push(item);
                    drained += 1;
                }
                Err(_) => break,
            }
        }
        drained
    }

    /// Waits up to `timeout` for the first item, then drains whatever else
    /// is immediately available, up to `cap` in total.
    pub fn blocking_drain(&self, timeout: Duration, cap: usize, out: &mut Vec<T>) -> usize {
        if cap == 0 {
            return 0;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(item) => {
                out.push(item);
                1 + self.drain_up_to(cap - 1, out)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }
}

impl<T> MessageSender<T> {
    /// Never blocks; fails only after the consumer has shut down.
    pub fn push(&self, item: T) -> CoreResult<()> {
        self.0
            .send(item)
            .map_err(|_| Error::Closed("message queue consumer is gone".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[test]
    fn fifo_per_producer() {
        let q = MessageQueue::new();
        let tx = q.sender();
        for seq in 0..5i64 {
            tx.push(Envelope::new("ping", Variant::from(seq))).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(q.drain_up_to(10, &mut out), 5);
        let seqs: Vec<i64> = out.iter().filter_map(|e| e.payload.as_int()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn drain_respects_cap() {
        let q = MessageQueue::new();
        let tx = q.sender();
        for _ in 0..10 {
            tx.push(1u8).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(q.drain_up_to(3, &mut out), 3);
        assert_eq!(q.drain_up_to(100, &mut out), 7);
    }

    #[test]
    fn blocking_drain_times_out_empty() {
        let q: MessageQueue<u8> = MessageQueue::new();
        let mut out = Vec::new();
        let n = q.blocking_drain(Duration::from_millis(5), 8, &mut out);
        assert_eq!(n, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn blocking_drain_wakes_on_push() {
        let q: MessageQueue<u8> = MessageQueue::new();
        let tx = q.sender();
        let handle = std::thread::spawn(move || tx.push(9).unwrap());
        let mut out = Vec::new();
        let n = q.blocking_drain(Duration::from_secs(5), 8, &mut out);
        handle.join().unwrap();
        assert_eq!(n, 1);
        assert_eq!(out, vec![9]);
    }

    #[test]
    fn push_after_consumer_drop_reports_closed() {
        let q: MessageQueue<u8> = MessageQueue::new();
        let tx = q.sender();
        drop(q);
        assert_eq!(tx.push(1).unwrap_err().kind(), Kind::Closed);
    }
}
