// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod poller;
mod scheduler;
mod timer;
mod waker;

pub use poller::EventFlags;
pub use timer::Timer;

use self::{
    poller::Poller,
    scheduler::TaskSet,
    timer::TimerEntry,
    waker::{task_waker, TaskWaker},
};
use crate::{fail::Fail, future::Oneshot};

use futures::future::FutureExt;

use std::{
    cell::RefCell,
    collections::{BinaryHeap, HashMap, VecDeque},
    future::Future,
    mem,
    os::unix::io::RawFd,
    rc::{Rc, Weak},
    task::{Context, Poll},
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Poll ceiling when no callback or timer is due.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Cancelled-timer count beyond which the heap is considered for compaction.
const TIMER_CANCEL_THRESHOLD: usize = 512;

/// Readiness callback for a registered file descriptor.
///
/// Handlers receive the delivered flags as a mask and must tolerate spurious
/// wake-ups and arbitrary READ/WRITE/ERROR orderings.
pub trait EventHandler {
    fn on_event(&self, fd: RawFd, events: EventFlags);
}

/// Single-threaded event loop.
///
/// Owns the ready queue, the timer heap, the file-descriptor table, the
/// readiness backend, and the task set of spawned coroutines. One instance
/// per thread is reachable through [EventLoop::current]; independent
/// instances can be constructed for tests.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<Inner>>,
}

pub(crate) struct Inner {
    poller: Poller,
    ready: VecDeque<Box<dyn FnOnce()>>,
    timers: BinaryHeap<TimerEntry>,
    timer_cancels: usize,
    fds: HashMap<RawFd, (EventFlags, Rc<dyn EventHandler>)>,
    tasks: TaskSet,
    stopped: bool,
}

thread_local! {
    static CURRENT: RefCell<Option<EventLoop>> = RefCell::new(None);
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Inner].
impl Inner {
    /// Moves the callbacks of all expired timers onto the ready queue and
    /// compacts the heap when cancelled entries dominate it.
    fn pop_due_timers(&mut self, now: Instant) {
        while let Some(top) = self.timers.peek() {
            if top.is_cancelled() {
                self.timers.pop();
                self.timer_cancels = self.timer_cancels.saturating_sub(1);
            } else if top.due() <= now {
                let entry = self.timers.pop().unwrap();
                if let Some(callback) = entry.take_callback() {
                    self.ready.push_back(callback);
                }
            } else {
                break;
            }
        }
        if self.timer_cancels > TIMER_CANCEL_THRESHOLD && self.timer_cancels > self.timers.len() / 2 {
            self.timer_cancels = 0;
            let entries = mem::take(&mut self.timers).into_vec();
            self.timers = entries.into_iter().filter(|e| !e.is_cancelled()).collect();
        }
    }

    /// Computes the poll timeout for the current iteration.
    fn poll_timeout(&self, now: Instant) -> Duration {
        if !self.ready.is_empty() {
            return Duration::from_secs(0);
        }
        match self.timers.peek() {
            Some(entry) => entry.due().saturating_duration_since(now),
            None => DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Associate functions for [EventLoop].
impl EventLoop {
    /// Creates a fresh event loop.
    pub fn new() -> Result<Self, Fail> {
        let inner = Inner {
            poller: Poller::new()?,
            ready: VecDeque::new(),
            timers: BinaryHeap::new(),
            timer_cancels: 0,
            fds: HashMap::new(),
            tasks: TaskSet::new(),
            stopped: false,
        };
        Ok(Self {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Returns the calling thread's event loop, constructing it on first use.
    pub fn current() -> EventLoop {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.is_none() {
                *current = Some(EventLoop::new().expect("failed to create event loop"));
            }
            current.as_ref().unwrap().clone()
        })
    }

    /// Appends a callback to the ready queue.
    pub fn call_soon(&self, callback: impl FnOnce() + 'static) {
        let mut inner = self.inner.borrow_mut();
        if inner.stopped {
            return;
        }
        inner.ready.push_back(Box::new(callback));
    }

    /// Schedules a callback to run after `delay`.
    pub fn call_later(&self, delay: Duration, callback: impl FnOnce() + 'static) -> Timer {
        let timer = Timer::new(Instant::now() + delay, Box::new(callback));
        let mut inner = self.inner.borrow_mut();
        if !inner.stopped {
            inner.timers.push(timer.entry());
        }
        timer
    }

    /// Cancels a timer. O(1); the heap entry is discarded lazily.
    pub fn cancel_timer(&self, timer: &Timer) {
        if timer.cancel() {
            self.inner.borrow_mut().timer_cancels += 1;
        }
    }

    /// Inserts or overwrites the handler and interest mask for a file
    /// descriptor. The backend is told only when the mask actually changes.
    pub fn register(
        &self,
        fd: RawFd,
        flags: EventFlags,
        handler: Rc<dyn EventHandler>,
    ) -> Result<(), Fail> {
        let mut inner = self.inner.borrow_mut();
        if inner.stopped {
            return Ok(());
        }
        let Inner { poller, fds, .. } = &mut *inner;
        match fds.get_mut(&fd) {
            Some(entry) => {
                let changed = entry.0 != flags;
                entry.0 = flags;
                entry.1 = handler;
                if changed {
                    poller.modify(fd, flags)?;
                }
            }
            None => {
                poller.register(fd, flags)?;
                fds.insert(fd, (flags, handler));
            }
        }
        Ok(())
    }

    /// Changes the interest mask of a registered descriptor, keeping its
    /// handler.
    pub fn modify(&self, fd: RawFd, flags: EventFlags) -> Result<(), Fail> {
        let mut inner = self.inner.borrow_mut();
        if inner.stopped {
            return Ok(());
        }
        let Inner { poller, fds, .. } = &mut *inner;
        match fds.get_mut(&fd) {
            Some(entry) => {
                if entry.0 != flags {
                    entry.0 = flags;
                    poller.modify(fd, flags)?;
                }
                Ok(())
            }
            None => Err(Fail::Os {
                errno: libc::ENOENT,
            }),
        }
    }

    /// Removes a file descriptor from the loop. Tolerates descriptors that
    /// are already gone.
    pub fn unregister(&self, fd: RawFd) {
        let mut inner = self.inner.borrow_mut();
        if inner.fds.remove(&fd).is_some() {
            if let Err(e) = inner.poller.unregister(fd) {
                trace!("unregister({}) ignored: {}", fd, e);
            }
        }
    }

    /// Spawns a coroutine and returns its completion future.
    pub fn spawn<F, T>(&self, coroutine: F) -> Oneshot<T>
    where
        F: Future<Output = Result<T, Fail>> + 'static,
        T: 'static,
    {
        let handle: Oneshot<T> = Oneshot::new();
        let completion = handle.clone();
        let task = async move {
            match coroutine.await {
                Ok(value) => completion.set_result(value),
                Err(e) => completion.set_error(e),
            }
        }
        .boxed_local();
        let id = {
            let mut inner = self.inner.borrow_mut();
            if inner.stopped {
                handle.cancel_default();
                return handle;
            }
            inner.tasks.insert(task)
        };
        self.schedule_poll(id);
        handle
    }

    /// Schedules `callback(result)` on the ready queue once `future`
    /// completes. The callback never runs inline with the completion.
    pub fn add_future<T: 'static>(
        &self,
        future: Oneshot<T>,
        callback: impl FnOnce(Result<T, Fail>) + 'static,
    ) {
        self.spawn(async move {
            callback(future.await);
            Ok::<(), Fail>(())
        });
    }

    /// Resolves after `delay`. A zero delay yields to other coroutines
    /// without waiting.
    pub fn sleep(&self, delay: Duration) -> Oneshot<()> {
        if delay == Duration::from_secs(0) {
            return self.sched();
        }
        let future = Oneshot::new();
        let f = future.clone();
        self.call_later(delay, move || f.set_result(()));
        future
    }

    /// Releases the CPU and schedules other coroutines to run.
    pub fn sched(&self) -> Oneshot<()> {
        let future = Oneshot::new();
        let f = future.clone();
        self.call_soon(move || f.set_result(()));
        future
    }

    /// Stops the loop: drops pending callbacks, timers, handlers, and tasks,
    /// and closes the readiness backend. Terminal.
    pub fn stop(&self) {
        let (fds, tasks) = {
            let mut inner = self.inner.borrow_mut();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            inner.ready.clear();
            inner.timers.clear();
            inner.timer_cancels = 0;
            inner.poller.close();
            (mem::take(&mut inner.fds), inner.tasks.clear())
        };
        // Handlers and tasks may own connections that unregister on drop, so
        // they go down only after the loop borrow is released.
        drop(fds);
        drop(tasks);
    }

    /// Runs the loop until [stop](EventLoop::stop) is called.
    pub fn run(&self) {
        while !self.inner.borrow().stopped {
            self.run_once();
        }
    }

    /// Runs the loop until the given future completes, then returns its
    /// result. A stopped loop yields [Fail::Cancelled].
    ///
    /// The poll phase is skipped once the future is done, so a completion
    /// that lands in the callback drain returns without waiting out the idle
    /// poll ceiling.
    pub fn run_until<T: 'static>(&self, future: Oneshot<T>) -> Result<T, Fail> {
        loop {
            if future.done() || self.inner.borrow().stopped {
                break;
            }
            self.run_callbacks();
            if future.done() || self.inner.borrow().stopped {
                break;
            }
            self.poll_io();
        }
        future.try_take().unwrap_or(Err(Fail::Cancelled {}))
    }

    /// Runs a single loop iteration: one ready-queue drain, due timers, one
    /// poll, and the dispatch of its events.
    pub fn run_once(&self) {
        self.run_callbacks();
        self.poll_io();
    }

    /// Drains a snapshot of the ready queue, then moves due timer callbacks
    /// onto it for the next drain. Callbacks enqueued mid-drain also wait for
    /// the next iteration.
    fn run_callbacks(&self) {
        let mut batch = {
            let mut inner = self.inner.borrow_mut();
            if inner.stopped {
                return;
            }
            mem::take(&mut inner.ready)
        };
        for callback in batch.drain(..) {
            callback();
        }
        let mut inner = self.inner.borrow_mut();
        if !inner.stopped {
            inner.pop_due_timers(Instant::now());
        }
    }

    /// Polls the readiness backend once and dispatches its events.
    fn poll_io(&self) {
        let (timeout, mut events) = {
            let inner = self.inner.borrow();
            if inner.stopped {
                return;
            }
            (inner.poll_timeout(Instant::now()), Vec::new())
        };
        {
            let mut inner = self.inner.borrow_mut();
            if inner.stopped {
                return;
            }
            if let Err(e) = inner.poller.poll(timeout, &mut events) {
                warn!("poll failed: {}", e);
            }
        }
        for (fd, flags) in events {
            let handler = {
                let inner = self.inner.borrow();
                if inner.stopped {
                    return;
                }
                inner.fds.get(&fd).map(|(_, handler)| handler.clone())
            };
            if let Some(handler) = handler {
                handler.on_event(fd, flags);
            }
        }
    }

    /// Enqueues a poll of the given task.
    pub(crate) fn schedule_poll(&self, task: usize) {
        let loop_ = self.clone();
        self.call_soon(move || loop_.poll_task(task));
    }

    /// Polls one spawned task. Absent or in-flight slots are ignored.
    fn poll_task(&self, id: usize) {
        let mut task = match self.inner.borrow_mut().tasks.begin_poll(id) {
            Some(task) => task,
            None => return,
        };
        let waker = task_waker(TaskWaker::new(self, id));
        let mut ctx = Context::from_waker(&waker);
        match task.as_mut().poll(&mut ctx) {
            Poll::Ready(()) => self.inner.borrow_mut().tasks.complete(id),
            Poll::Pending => self.inner.borrow_mut().tasks.park(id, task),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<Inner>> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<RefCell<Inner>>) -> Option<EventLoop> {
        weak.upgrade().map(|inner| EventLoop { inner })
    }

    #[cfg(test)]
    fn timer_heap_len(&self) -> usize {
        self.inner.borrow().timers.len()
    }

    #[cfg(test)]
    fn task_count(&self) -> usize {
        self.inner.borrow().tasks.len()
    }
}

//==============================================================================
// Free Functions
//==============================================================================

/// Resolves after `delay` on the current thread's loop. A zero delay yields
/// control without waiting.
pub fn sleep(delay: Duration) -> Oneshot<()> {
    EventLoop::current().sleep(delay)
}

/// Releases the CPU and schedules other coroutines to run.
pub fn sched() -> Oneshot<()> {
    EventLoop::current().sched()
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Drives full loop iterations, bounding each poll with a short tick
    /// timer so an idle poll cannot stall the test.
    fn drive(loop_: &EventLoop, until: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !until() && Instant::now() < deadline {
            loop_.call_later(Duration::from_millis(5), || {});
            loop_.run_once();
        }
        assert!(until(), "loop made no progress within the test deadline");
    }

    /// Tests that callbacks run in insertion order within a drain.
    #[test]
    fn call_soon_is_fifo() {
        let loop_ = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            loop_.call_soon(move || order.borrow_mut().push(i));
        }
        loop_.run_callbacks();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    /// Tests that a callback enqueued during a drain waits for the next one.
    #[test]
    fn drain_is_snapshot() {
        let loop_ = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let l2 = loop_.clone();
        let h2 = hits.clone();
        loop_.call_soon(move || {
            h2.set(h2.get() + 1);
            let h3 = h2.clone();
            l2.call_soon(move || h3.set(h3.get() + 1));
        });
        loop_.run_callbacks();
        assert_eq!(hits.get(), 1);
        loop_.run_callbacks();
        assert_eq!(hits.get(), 2);
    }

    /// Tests that timers fire in non-decreasing deadline order.
    #[test]
    fn timers_fire_in_deadline_order() {
        let loop_ = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        for delay in &[30u64, 10, 20] {
            let order = order.clone();
            let delay = *delay;
            loop_.call_later(Duration::from_millis(delay), move || {
                order.borrow_mut().push(delay)
            });
        }
        drive(&loop_, || order.borrow().len() == 3);
        assert_eq!(*order.borrow(), vec![10, 20, 30]);
    }

    /// Tests that a cancelled timer never fires.
    #[test]
    fn cancelled_timer_does_not_fire() {
        let loop_ = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let f2 = fired.clone();
        let timer = loop_.call_later(Duration::from_millis(10), move || f2.set(true));
        loop_.cancel_timer(&timer);
        let gate = Rc::new(Cell::new(false));
        let g2 = gate.clone();
        loop_.call_later(Duration::from_millis(30), move || g2.set(true));
        drive(&loop_, || gate.get());
        assert!(!fired.get());
    }

    /// Tests heap compaction once cancellations dominate.
    #[test]
    fn timer_heap_compaction() {
        let loop_ = EventLoop::new().unwrap();
        let mut timers = Vec::new();
        for _ in 0..1200 {
            timers.push(loop_.call_later(Duration::from_secs(60), || {}));
        }
        // Cancel the later deadlines so the live ones stay at the heap top
        // and the rebuild path, not the pop path, has to discard them.
        for timer in timers.iter().skip(100) {
            loop_.cancel_timer(timer);
        }
        assert_eq!(loop_.timer_heap_len(), 1200);
        loop_.run_callbacks();
        assert_eq!(loop_.timer_heap_len(), 100);
    }

    /// Tests that a spawned coroutine's value arrives through `run_until`.
    #[test]
    fn spawn_returns_value() {
        let loop_ = EventLoop::new().unwrap();
        let handle = loop_.spawn(async { Ok(42u32) });
        assert_eq!(loop_.run_until(handle).unwrap(), 42);
        assert_eq!(loop_.task_count(), 0);
    }

    /// Tests that a coroutine error surfaces through `run_until`.
    #[test]
    fn spawn_returns_error() {
        let loop_ = EventLoop::new().unwrap();
        let handle = loop_.spawn(async { Err::<(), Fail>(Fail::Timeout {}) });
        assert_eq!(loop_.run_until(handle), Err(Fail::Timeout {}));
    }

    /// Tests that a coroutine yielding N times completes within the expected
    /// number of iterations.
    #[test]
    fn yield_loop_completes() {
        let loop_ = EventLoop::new().unwrap();
        let l2 = loop_.clone();
        let count = Rc::new(Cell::new(0u32));
        let c2 = count.clone();
        let handle = loop_.spawn(async move {
            for _ in 0..10 {
                l2.sched().await?;
                c2.set(c2.get() + 1);
            }
            Ok(())
        });
        let mut iters = 0;
        while !handle.done() && iters < 64 {
            loop_.run_callbacks();
            iters += 1;
        }
        assert!(handle.done());
        assert_eq!(count.get(), 10);
        assert!(iters <= 22, "took {} iterations", iters);
    }

    /// Tests `add_future` delivery through the ready queue.
    #[test]
    fn add_future_delivers_result() {
        let loop_ = EventLoop::new().unwrap();
        let future: Oneshot<u32> = Oneshot::new();
        let seen = Rc::new(Cell::new(0u32));
        let s2 = seen.clone();
        loop_.add_future(future.clone(), move |result| s2.set(result.unwrap()));
        future.set_result(17);
        assert_eq!(seen.get(), 0);
        for _ in 0..4 {
            loop_.run_callbacks();
        }
        assert_eq!(seen.get(), 17);
    }

    /// Tests that sleeping coroutines wake in deadline order, concurrently.
    #[test]
    fn sleep_ordering() {
        let loop_ = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let started = Instant::now();
        let (la, lb) = (loop_.clone(), loop_.clone());
        let (oa, ob) = (order.clone(), order.clone());
        let a = loop_.spawn(async move {
            la.sleep(Duration::from_millis(200)).await?;
            oa.borrow_mut().push('a');
            Ok(())
        });
        let b = loop_.spawn(async move {
            lb.sleep(Duration::from_millis(100)).await?;
            ob.borrow_mut().push('b');
            Ok(())
        });
        loop_.run_until(a).unwrap();
        loop_.run_until(b).unwrap();
        assert_eq!(*order.borrow(), vec!['b', 'a']);
        // Sleeps overlap: the total is one deadline, not the sum.
        assert!(started.elapsed() < Duration::from_millis(290));
    }

    /// Tests that `stop` is terminal and `run_until` bails out.
    #[test]
    fn stop_cancels_run_until() {
        let loop_ = EventLoop::new().unwrap();
        let l2 = loop_.clone();
        loop_.call_soon(move || l2.stop());
        let pending: Oneshot<()> = Oneshot::new();
        assert_eq!(loop_.run_until(pending), Err(Fail::Cancelled {}));
    }
}
