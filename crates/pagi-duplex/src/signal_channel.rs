//! Bounded, non-blocking hand-off of VAD signals from the capture domain to the
//! control plane.
//!
//! When the queue is full the newest signal replaces the oldest one: VAD relevance
//! decays within a few hundred milliseconds, so a stale backlog is worth less than
//! the latest frame. Both ends are wait-free (crossbeam `ArrayQueue`).

use crate::vad::VadSignal;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Create a latest-signal-wins channel with the given capacity (must be > 0).
pub fn signal_channel(capacity: usize) -> (SignalSender, SignalReceiver) {
    let queue = Arc::new(ArrayQueue::new(capacity.max(1)));
    let overwritten = Arc::new(AtomicU64::new(0));
    (
        SignalSender {
            queue: Arc::clone(&queue),
            overwritten: Arc::clone(&overwritten),
        },
        SignalReceiver { queue, overwritten },
    )
}

/// Producer half. Safe to call from an audio callback.
#[derive(Clone)]
pub struct SignalSender {
    queue: Arc<ArrayQueue<VadSignal>>,
    overwritten: Arc<AtomicU64>,
}

impl SignalSender {
    /// Push a signal, evicting the oldest one when full. Returns true if a signal was evicted.
    pub fn send(&self, signal: VadSignal) -> bool {
        match self.queue.force_push(signal) {
            Some(_) => {
                self.overwritten.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

/// Consumer half, drained by the control plane.
pub struct SignalReceiver {
    queue: Arc<ArrayQueue<VadSignal>>,
    overwritten: Arc<AtomicU64>,
}

impl SignalReceiver {
    pub fn try_recv(&self) -> Option<VadSignal> {
        self.queue.pop()
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<VadSignal> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(signal) = self.queue.pop() {
            out.push(signal);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Signals evicted because the control plane fell behind.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::VadSource;
    use std::time::Duration;

    fn signal(ms: u64) -> VadSignal {
        VadSignal::new(VadSource::Local, 0.9, Duration::from_millis(ms), false)
    }

    #[test]
    fn newest_signal_overwrites_oldest_when_full() {
        let (tx, rx) = signal_channel(2);
        assert!(!tx.send(signal(0)));
        assert!(!tx.send(signal(30)));
        assert!(tx.send(signal(60)));

        let drained = rx.drain();
        let stamps: Vec<u64> = drained.iter().map(|s| s.timestamp.as_millis() as u64).collect();
        assert_eq!(stamps, vec![30, 60]);
        assert_eq!(rx.overwritten(), 1);
        assert!(rx.is_empty());
    }

    #[test]
    fn sender_works_across_threads() {
        let (tx, rx) = signal_channel(8);
        let handle = std::thread::spawn(move || {
            for i in 0..4 {
                tx.send(signal(i * 30));
            }
        });
        handle.join().unwrap();
        assert_eq!(rx.len(), 4);
        assert_eq!(rx.try_recv().unwrap().timestamp, Duration::ZERO);
    }
}
