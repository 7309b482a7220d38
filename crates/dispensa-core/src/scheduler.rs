//! Deadline scheduling for active sessions
//!
//! A single min-heap of `(deadline, session)` entries, drained either
//! synchronously via [`DeadlineScheduler::fire_due`] or by the background
//! loop started with [`DeadlineScheduler::spawn`].

use dispensa_util::{Clock, MonotonicInstant, SessionId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Receives deadline callbacks
pub trait ExpiryHandler: Send + Sync {
    /// Called at or after the deadline registered for `attempt`
    fn on_deadline(&self, session_id: &SessionId, attempt: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline: MonotonicInstant,
    generation: u64,
    session_id: SessionId,
    attempt: u32,
}

#[derive(Debug, Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Entry>>,
    /// Live generation per session; heap entries with another generation are stale
    armed: HashMap<SessionId, u64>,
    next_generation: u64,
}

impl Queue {
    fn is_live(&self, entry: &Entry) -> bool {
        self.armed.get(&entry.session_id) == Some(&entry.generation)
    }

    fn drop_stale_head(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.is_live(head) {
                break;
            }
            self.heap.pop();
        }
    }
}

struct Inner {
    queue: Mutex<Queue>,
    wake: Notify,
    clock: Arc<dyn Clock>,
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one scheduled deadline
#[derive(Debug, Clone)]
pub struct DeadlineHandle {
    session_id: SessionId,
    generation: u64,
    deadline: MonotonicInstant,
}

impl DeadlineHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn deadline(&self) -> MonotonicInstant {
        self.deadline
    }
}

/// One-shot expiry timers keyed by session.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct DeadlineScheduler {
    inner: Arc<Inner>,
}

impl DeadlineScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(Queue::default()),
                wake: Notify::new(),
                clock,
            }),
        }
    }

    /// Arm a deadline for `session_id`, replacing any earlier one
    pub fn schedule(
        &self,
        session_id: SessionId,
        attempt: u32,
        deadline: MonotonicInstant,
    ) -> DeadlineHandle {
        let generation = {
            let mut queue = self.inner.queue();
            let generation = queue.next_generation;
            queue.next_generation += 1;
            queue.armed.insert(session_id, generation);
            queue.heap.push(Reverse(Entry {
                deadline,
                generation,
                session_id,
                attempt,
            }));
            generation
        };

        // The loop may be sleeping towards a later deadline
        self.inner.wake.notify_one();

        trace!(session_id = %session_id, attempt, "Deadline scheduled");

        DeadlineHandle {
            session_id,
            generation,
            deadline,
        }
    }

    /// Disarm the deadline for `session_id`. Returns whether one was armed.
    ///
    /// Advisory: a callback already taken off the queue still runs.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        let removed = self.inner.queue().armed.remove(session_id).is_some();
        if removed {
            trace!(session_id = %session_id, "Deadline cancelled");
        }
        removed
    }

    /// Disarm only if `handle` is still the live deadline for its session
    pub fn cancel_handle(&self, handle: &DeadlineHandle) -> bool {
        let mut queue = self.inner.queue();
        if queue.armed.get(&handle.session_id) == Some(&handle.generation) {
            queue.armed.remove(&handle.session_id);
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self, session_id: &SessionId) -> bool {
        self.inner.queue().armed.contains_key(session_id)
    }

    /// Number of armed deadlines
    pub fn pending(&self) -> usize {
        self.inner.queue().armed.len()
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<MonotonicInstant> {
        let mut queue = self.inner.queue();
        queue.drop_stale_head();
        queue.heap.peek().map(|Reverse(e)| e.deadline)
    }

    /// Disarm and return every entry due at `now`
    fn take_due(&self, now: MonotonicInstant) -> Vec<(SessionId, u32)> {
        let mut queue = self.inner.queue();
        let mut due = Vec::new();

        while let Some(Reverse(head)) = queue.heap.peek() {
            if head.deadline > now {
                break;
            }
            let entry = *head;
            queue.heap.pop();
            if queue.is_live(&entry) {
                queue.armed.remove(&entry.session_id);
                due.push((entry.session_id, entry.attempt));
            }
        }

        due
    }

    /// Invoke `handler` for every deadline that has passed. Returns how many fired.
    ///
    /// The queue lock is not held while the handler runs.
    pub fn fire_due(&self, handler: &dyn ExpiryHandler) -> usize {
        let due = self.take_due(self.inner.clock.now_mono());

        for (session_id, attempt) in &due {
            debug!(session_id = %session_id, attempt, "Deadline reached");
            handler.on_deadline(session_id, *attempt);
        }

        due.len()
    }

    /// Run the scheduler loop on the tokio runtime.
    ///
    /// Sleeps until the earliest deadline but never longer than `poll`, so a
    /// clock that is not tied to real time is still observed. Exits once
    /// `handler` has been dropped.
    pub fn spawn<H>(&self, handler: Weak<H>, poll: Duration) -> JoinHandle<()>
    where
        H: ExpiryHandler + 'static,
    {
        let scheduler = self.clone();

        tokio::spawn(async move {
            debug!(poll_ms = poll.as_millis() as u64, "Deadline scheduler started");

            loop {
                match handler.upgrade() {
                    Some(handler) => {
                        scheduler.fire_due(handler.as_ref());
                    }
                    None => break,
                }

                let now = scheduler.inner.clock.now_mono();
                let sleep_for = scheduler
                    .next_deadline()
                    .map(|d| d.saturating_duration_until(now).min(poll))
                    .unwrap_or(poll);

                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = scheduler.inner.wake.notified() => {}
                }
            }

            debug!("Deadline scheduler stopped");
        })
    }
}
