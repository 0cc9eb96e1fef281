//! Bounded in-memory publish buffer.
//!
//! Hot-path publishes never touch storage directly; they land here and a
//! background flusher appends them to the stream stores. Per-kind FIFO keeps
//! per-key publish order intact. On overflow the oldest entry is dropped and
//! counted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::event::{Event, EventKind};

pub struct Outbox {
    cap_per_kind: usize,
    queues: Mutex<HashMap<EventKind, VecDeque<Event>>>,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(cap_per_kind: usize) -> Self {
        Self {
            cap_per_kind: cap_per_kind.max(1),
            queues: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Buffer an event. Returns `false` when the kind's queue was full and the
    /// oldest entry had to be dropped to make room.
    pub fn push(&self, event: Event) -> bool {
        let mut queues = self.queues.lock();
        let queue = queues.entry(event.kind).or_default();

        let mut fit = true;
        if queue.len() >= self.cap_per_kind {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            fit = false;
        }
        queue.push_back(event);
        fit
    }

    /// FIFO drain of up to `max` events, walking kinds in declaration order.
    pub fn drain(&self, max: usize) -> Vec<Event> {
        let mut queues = self.queues.lock();
        let mut out = Vec::new();

        for kind in EventKind::ALL {
            let Some(queue) = queues.get_mut(&kind) else {
                continue;
            };
            while out.len() < max {
                match queue.pop_front() {
                    Some(ev) => out.push(ev),
                    None => break,
                }
            }
            if out.len() >= max {
                break;
            }
        }
        out
    }

    /// Put an event back at the head of its queue after a failed append, so
    /// the next flush retries it first and order is preserved.
    pub fn requeue_front(&self, event: Event) {
        let mut queues = self.queues.lock();
        queues.entry(event.kind).or_default().push_front(event);
    }

    pub fn len(&self) -> usize {
        self.queues.lock().values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
