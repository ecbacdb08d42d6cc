// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Thread-unsafe task waker.
//!
//! The runtime is single-threaded by contract, so wakers are built over `Rc`
//! rather than `Arc`. A waker must never be sent to another thread.

use super::{EventLoop, Inner};

use std::{
    cell::RefCell,
    mem::ManuallyDrop,
    rc::{Rc, Weak},
    task::{RawWaker, RawWakerVTable, Waker},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Wake handle for one spawned task.
pub(crate) struct TaskWaker {
    loop_: Weak<RefCell<Inner>>,
    task: usize,
}

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [TaskWaker].
impl TaskWaker {
    /// Creates a wake handle for task `task` on the given loop.
    pub(crate) fn new(loop_: &EventLoop, task: usize) -> Rc<TaskWaker> {
        Rc::new(TaskWaker {
            loop_: loop_.downgrade(),
            task,
        })
    }

    /// Enqueues a poll of the task on the loop's ready queue. Waking after
    /// the loop has stopped (or dropped) is a no-op.
    fn wake_task(&self) {
        if let Some(loop_) = EventLoop::upgrade(&self.loop_) {
            loop_.schedule_poll(self.task);
        }
    }
}

/// Builds a standard [Waker] from a wake handle.
pub(crate) fn task_waker(waker: Rc<TaskWaker>) -> Waker {
    unsafe { Waker::from_raw(raw_waker(waker)) }
}

fn raw_waker(waker: Rc<TaskWaker>) -> RawWaker {
    RawWaker::new(Rc::into_raw(waker) as *const (), &VTABLE)
}

unsafe fn clone_raw(ptr: *const ()) -> RawWaker {
    let waker = ManuallyDrop::new(Rc::from_raw(ptr as *const TaskWaker));
    raw_waker(Rc::clone(&waker))
}

unsafe fn wake_raw(ptr: *const ()) {
    let waker = Rc::from_raw(ptr as *const TaskWaker);
    waker.wake_task();
}

unsafe fn wake_by_ref_raw(ptr: *const ()) {
    let waker = ManuallyDrop::new(Rc::from_raw(ptr as *const TaskWaker));
    waker.wake_task();
}

unsafe fn drop_raw(ptr: *const ()) {
    drop(Rc::from_raw(ptr as *const TaskWaker));
}
