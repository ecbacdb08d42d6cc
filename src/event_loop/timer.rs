// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{cell::RefCell, cmp::Ordering, fmt, rc::Rc, time::Instant};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Deferred callback with a deadline.
///
/// The handle returned by `call_later`; cancellation takes the callback in
/// O(1) and leaves the heap entry behind to be discarded lazily.
#[derive(Clone)]
pub struct Timer {
    state: Rc<TimerState>,
}

struct TimerState {
    due: Instant,
    callback: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// Heap entry ordering timers by deadline.
pub(crate) struct TimerEntry(Rc<TimerState>);

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Timer].
impl Timer {
    /// Creates a timer firing `callback` at `due`.
    pub(crate) fn new(due: Instant, callback: Box<dyn FnOnce()>) -> Self {
        Self {
            state: Rc::new(TimerState {
                due,
                callback: RefCell::new(Some(callback)),
            }),
        }
    }

    /// Returns the timer's deadline.
    pub fn due(&self) -> Instant {
        self.state.due
    }

    /// Takes the callback out, marking the timer cancelled. Returns `false`
    /// if the timer had already fired or been cancelled.
    pub(crate) fn cancel(&self) -> bool {
        self.state.callback.borrow_mut().take().is_some()
    }

    /// Creates the heap entry for this timer.
    pub(crate) fn entry(&self) -> TimerEntry {
        TimerEntry(self.state.clone())
    }
}

/// Associate functions for [TimerEntry].
impl TimerEntry {
    /// Returns the entry's deadline.
    pub(crate) fn due(&self) -> Instant {
        self.0.due
    }

    /// Returns `true` if the timer behind this entry was cancelled.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.callback.borrow().is_none()
    }

    /// Takes the callback for dispatch.
    pub(crate) fn take_callback(&self) -> Option<Box<dyn FnOnce()>> {
        self.0.callback.borrow_mut().take()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Debug trait implementation for [Timer].
impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Timer(due={:?})", self.state.due)
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.0.due == other.0.due
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> Ordering {
        // `BinaryHeap` is a max-heap, so comparisons are reversed to get
        // `peek()` and `pop()` to return the earliest deadline.
        match self.0.due.cmp(&other.0.due) {
            Ordering::Equal => Ordering::Equal,
            Ordering::Less => Ordering::Greater,
            Ordering::Greater => Ordering::Less,
        }
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::BinaryHeap, time::Duration};

    /// Tests that the heap surfaces the earliest deadline first.
    #[test]
    fn heap_orders_by_deadline() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for delay in &[30u64, 10, 20] {
            let timer = Timer::new(now + Duration::from_millis(*delay), Box::new(|| {}));
            heap.push(timer.entry());
        }
        let mut due = Vec::new();
        while let Some(entry) = heap.pop() {
            due.push(entry.due());
        }
        let mut sorted = due.clone();
        sorted.sort();
        assert_eq!(due, sorted);
    }

    /// Tests that cancellation takes the callback exactly once.
    #[test]
    fn cancel_is_one_shot() {
        let timer = Timer::new(Instant::now(), Box::new(|| {}));
        let entry = timer.entry();
        assert!(!entry.is_cancelled());
        assert!(timer.cancel());
        assert!(entry.is_cancelled());
        assert!(!timer.cancel());
        assert!(entry.take_callback().is_none());
    }
}
