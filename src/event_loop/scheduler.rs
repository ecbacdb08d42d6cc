// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use futures::future::LocalBoxFuture;
use slab::Slab;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Storage for spawned coroutine tasks.
///
/// A task is taken out of its slot while it is being polled, so that the slot
/// table is not borrowed when the poll re-enters the loop (spawning, timers,
/// registrations). A poll against an absent or in-flight slot is a no-op;
/// stale wake-ups after slab reuse degenerate into spurious polls, which
/// tasks tolerate.
pub(crate) struct TaskSet {
    tasks: Slab<Option<LocalBoxFuture<'static, ()>>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [TaskSet].
impl TaskSet {
    /// Creates an empty task set.
    pub(crate) fn new() -> Self {
        Self { tasks: Slab::new() }
    }

    /// Inserts a task and returns its id.
    pub(crate) fn insert(&mut self, task: LocalBoxFuture<'static, ()>) -> usize {
        self.tasks.insert(Some(task))
    }

    /// Takes the task out of its slot for polling.
    pub(crate) fn begin_poll(&mut self, id: usize) -> Option<LocalBoxFuture<'static, ()>> {
        self.tasks.get_mut(id).and_then(|slot| slot.take())
    }

    /// Puts a still-pending task back into its slot. The slot may have been
    /// cleared by `stop()` in the meantime, in which case the task is dropped.
    pub(crate) fn park(&mut self, id: usize, task: LocalBoxFuture<'static, ()>) {
        if let Some(slot) = self.tasks.get_mut(id) {
            *slot = Some(task);
        }
    }

    /// Releases the slot of a completed task.
    pub(crate) fn complete(&mut self, id: usize) {
        if self.tasks.contains(id) {
            self.tasks.remove(id);
        }
    }

    /// Drops all tasks.
    pub(crate) fn clear(&mut self) -> Slab<Option<LocalBoxFuture<'static, ()>>> {
        std::mem::replace(&mut self.tasks, Slab::new())
    }

    /// Returns the number of live tasks.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}
