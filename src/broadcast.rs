//! Fan-out of encoded frames to connected sessions.
//!
//! Frames are encoded once and shared as `Arc<Vec<u8>>`. Every session owns a
//! bounded FIFO queue drained by its connection task; a full or closed queue
//! marks the session dead and it is dropped from the set, which ends its
//! writer. Counters are atomics so the send paths never take an extra lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

/// A pre-encoded wire frame, shared across queues.
pub type Frame = Arc<Vec<u8>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_sessions: usize,
}

#[derive(Default)]
struct AtomicStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// The set of connected sessions and their outbound queues.
pub struct BroadcastSet {
    sessions: Vec<(Uuid, mpsc::Sender<Frame>)>,
    stats: AtomicStats,
}

impl BroadcastSet {
    pub fn new() -> Self {
        Self {
            sessions: Vec::new(),
            stats: AtomicStats::default(),
        }
    }

    /// Register a session's outbound queue.
    pub fn add_session(&mut self, id: Uuid, tx: mpsc::Sender<Frame>) {
        self.sessions.push((id, tx));
    }

    /// Drop a session from the set. Its queue sender is released, which ends
    /// the session's writer once the queue drains.
    pub fn remove_session(&mut self, id: Uuid) {
        self.sessions.retain(|(sid, _)| *sid != id);
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.iter().any(|(sid, _)| *sid == id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Enqueue `frame` to every session, in registration order. Sessions
    /// whose queue is full or closed are dropped from the set.
    pub fn broadcast(&mut self, frame: Frame) {
        let stats = &self.stats;
        self.sessions.retain(|(id, tx)| match tx.try_send(frame.clone()) {
            Ok(()) => {
                stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                log::warn!("dropping session {id}: outbound queue {err}");
                stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        });
    }

    /// Enqueue `frame` to a single session. Returns false (and drops the
    /// session) if the queue is full or closed.
    pub fn send_to(&mut self, id: Uuid, frame: Frame) -> bool {
        let Some((_, tx)) = self.sessions.iter().find(|(sid, _)| *sid == id) else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                log::warn!("dropping session {id}: outbound queue {err}");
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                self.remove_session(id);
                false
            }
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_sessions: self.sessions.len(),
        }
    }
}

impl Default for BroadcastSet {
    fn default() -> Self {
        Self::new()
    }
}
