//! Deadline-ordered store of scheduled calls.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::Instant;

type Action = Box<dyn FnOnce()>;

#[derive(Debug)]
struct CallState {
    deadline: Instant,
    cancelled: Cell<bool>,
    fired: Cell<bool>,
}

/// Handle to a call scheduled with `Reactor::call_later`.
#[derive(Debug, Clone)]
pub struct DelayedCall {
    state: Rc<CallState>,
}

impl DelayedCall {
    /// Cancel the call. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        if !self.active() {
            return false;
        }
        self.state.cancelled.set(true);
        true
    }

    /// Still waiting to fire.
    #[must_use]
    pub fn active(&self) -> bool {
        !self.state.cancelled.get() && !self.state.fired.get()
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.state.deadline
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    state: Rc<CallState>,
    action: Action,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: `BinaryHeap` is a max-heap and the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A call whose deadline has passed, taken out of the queue but not yet run.
pub struct DueCall {
    state: Rc<CallState>,
    action: Action,
}

impl DueCall {
    /// Run the action unless it was cancelled after being taken.
    ///
    /// Returns whether the action ran.
    pub fn run(self) -> bool {
        if self.state.cancelled.get() {
            return false;
        }
        self.state.fired.set(true);
        (self.action)();
        true
    }
}

/// Scheduled calls ordered by deadline, ties broken by scheduling order.
///
/// Cancelled calls are discarded lazily, when they reach the head.
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimerQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, action: impl FnOnce() + 'static) -> DelayedCall {
        let state = Rc::new(CallState {
            deadline,
            cancelled: Cell::new(false),
            fired: Cell::new(false),
        });
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline,
            seq,
            state: Rc::clone(&state),
            action: Box::new(action),
        });
        DelayedCall { state }
    }

    /// Earliest deadline among calls that are still active.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_cancelled();
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Remove every call due at `now`, earliest first.
    ///
    /// The calls stay cancellable until [`DueCall::run`] reaches them, so an
    /// earlier action in the batch can still cancel a later one. Calls the
    /// actions schedule land in the queue for a later pass.
    pub fn take_due(&mut self, now: Instant) -> Vec<DueCall> {
        let mut due = Vec::new();
        loop {
            self.discard_cancelled();
            match self.heap.peek() {
                Some(entry) if entry.deadline <= now => {}
                _ => break,
            }
            if let Some(entry) = self.heap.pop() {
                due.push(DueCall {
                    state: entry.state,
                    action: entry.action,
                });
            }
        }
        due
    }

    /// Number of calls that have neither fired nor been cancelled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.heap
            .iter()
            .filter(|entry| !entry.state.cancelled.get())
            .count()
    }

    fn discard_cancelled(&mut self) {
        while self
            .heap
            .peek()
            .is_some_and(|entry| entry.state.cancelled.get())
        {
            self.heap.pop();
        }
    }
}
