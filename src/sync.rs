// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Coroutine synchronization primitives.
//!
//! [Lock] and [Queue] synchronize coroutines on one event loop, not OS
//! threads: every wait is a one-shot future resolved through the loop's
//! ready queue.

use crate::{
    event_loop::{EventLoop, Timer},
    fail::Fail,
    future::Oneshot,
};

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::Duration,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Mutual exclusion between coroutines.
///
/// Strict FIFO: a release hands ownership directly to the longest-waiting
/// acquirer. Not reentrant.
#[derive(Clone)]
pub struct Lock {
    inner: Rc<RefCell<LockInner>>,
}

struct LockInner {
    loop_: EventLoop,
    locked: bool,
    waiters: VecDeque<Oneshot<()>>,
}

/// Bounded multi-producer multi-consumer queue for coroutines.
///
/// A queue of capacity zero is unbounded. Waiting putters carry their item
/// with them, and hand-offs are direct: an item that wakes a getter never
/// transits the item list, and a get that frees a slot immediately admits
/// the head putter's item.
pub struct Queue<T> {
    inner: Rc<RefCell<QueueInner<T>>>,
}

struct QueueInner<T> {
    loop_: EventLoop,
    items: VecDeque<T>,
    maxsize: usize,
    get_waiters: VecDeque<(u64, Oneshot<T>)>,
    put_waiters: VecDeque<(u64, Oneshot<()>, T)>,
    timers: HashMap<u64, Timer>,
    next_waiter: u64,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Lock].
impl Lock {
    /// Creates an unlocked lock on the current thread's loop.
    pub fn new() -> Self {
        Self::with_loop(&EventLoop::current())
    }

    /// Creates an unlocked lock on the given loop.
    pub fn with_loop(loop_: &EventLoop) -> Self {
        Self {
            inner: Rc::new(RefCell::new(LockInner {
                loop_: loop_.clone(),
                locked: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquires the lock: resolves immediately (through the ready queue) if
    /// unlocked, else parks in FIFO order.
    pub fn acquire(&self) -> Oneshot<()> {
        let mut inner = self.inner.borrow_mut();
        let future = Oneshot::new();
        if !inner.locked {
            inner.locked = true;
            let f = future.clone();
            inner.loop_.call_soon(move || f.set_result(()));
        } else {
            inner.waiters.push_back(future.clone());
        }
        future
    }

    /// Releases the lock, transferring ownership to the head waiter if any.
    pub fn release(&self) {
        let waiter = {
            let mut inner = self.inner.borrow_mut();
            match inner.waiters.pop_front() {
                Some(waiter) => Some(waiter),
                None => {
                    inner.locked = false;
                    None
                }
            }
        };
        if let Some(waiter) = waiter {
            waiter.set_result(());
        }
    }

    /// Returns `true` while some coroutine holds the lock.
    pub fn locked(&self) -> bool {
        self.inner.borrow().locked
    }
}

/// Associate functions for [Queue].
impl<T: 'static> Queue<T> {
    /// Creates a queue holding at most `maxsize` items (zero = unbounded) on
    /// the current thread's loop.
    pub fn new(maxsize: usize) -> Self {
        Self::with_loop(&EventLoop::current(), maxsize)
    }

    /// Creates a queue on the given loop.
    pub fn with_loop(loop_: &EventLoop, maxsize: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(QueueInner {
                loop_: loop_.clone(),
                items: VecDeque::new(),
                maxsize,
                get_waiters: VecDeque::new(),
                put_waiters: VecDeque::new(),
                timers: HashMap::new(),
                next_waiter: 0,
            })),
        }
    }

    /// Returns the number of stored items.
    pub fn qsize(&self) -> usize {
        self.inner.borrow().items.len()
    }

    /// Returns `true` if the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }

    /// Returns `true` if the queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.inner.borrow().full()
    }

    /// Enqueues `item`, waiting for room if the queue is full.
    pub fn put(&self, item: T) -> Oneshot<()> {
        self.put_deadline(item, None)
    }

    /// [put](Queue::put) that gives up with [Fail::QueueFull] after `timeout`.
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Oneshot<()> {
        self.put_deadline(item, Some(timeout))
    }

    /// Enqueues `item` without blocking, failing with [Fail::QueueFull] if no
    /// room is available.
    pub fn try_put(&self, item: T) -> Result<(), Fail> {
        let mut inner = self.inner.borrow_mut();
        if let Some((id, getter)) = inner.get_waiters.pop_front() {
            inner.disarm(id);
            getter.set_result(item);
            return Ok(());
        }
        if !inner.full() {
            inner.items.push_back(item);
            return Ok(());
        }
        Err(Fail::QueueFull {})
    }

    /// Dequeues the next item, waiting for one if the queue is empty.
    pub fn get(&self) -> Oneshot<T> {
        self.get_deadline(None)
    }

    /// [get](Queue::get) that gives up with [Fail::QueueEmpty] after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Oneshot<T> {
        self.get_deadline(Some(timeout))
    }

    /// Dequeues without blocking, failing with [Fail::QueueEmpty] if no item
    /// is stored.
    pub fn try_get(&self) -> Result<T, Fail> {
        let mut inner = self.inner.borrow_mut();
        match inner.items.pop_front() {
            Some(item) => {
                inner.admit_putter();
                Ok(item)
            }
            None => Err(Fail::QueueEmpty {}),
        }
    }

    fn put_deadline(&self, item: T, timeout: Option<Duration>) -> Oneshot<()> {
        let future: Oneshot<()> = Oneshot::new();
        let mut inner = self.inner.borrow_mut();
        // A waiting getter takes the item directly.
        if let Some((id, getter)) = inner.get_waiters.pop_front() {
            inner.disarm(id);
            getter.set_result(item);
            let f = future.clone();
            inner.loop_.call_soon(move || f.set_result(()));
            return future;
        }
        if !inner.full() {
            inner.items.push_back(item);
            let f = future.clone();
            inner.loop_.call_soon(move || f.set_result(()));
            return future;
        }
        let id = inner.alloc_id();
        if let Some(timeout) = timeout {
            let queue = self.clone();
            let fut = future.clone();
            let timer = inner
                .loop_
                .call_later(timeout, move || queue.expire_putter(id, fut));
            inner.timers.insert(id, timer);
        }
        inner.put_waiters.push_back((id, future.clone(), item));
        future
    }

    fn get_deadline(&self, timeout: Option<Duration>) -> Oneshot<T> {
        let future: Oneshot<T> = Oneshot::new();
        let mut inner = self.inner.borrow_mut();
        if let Some(item) = inner.items.pop_front() {
            inner.admit_putter();
            let f = future.clone();
            inner.loop_.call_soon(move || f.set_result(item));
            return future;
        }
        let id = inner.alloc_id();
        if let Some(timeout) = timeout {
            let queue = self.clone();
            let fut = future.clone();
            let timer = inner
                .loop_
                .call_later(timeout, move || queue.expire_getter(id, fut));
            inner.timers.insert(id, timer);
        }
        inner.get_waiters.push_back((id, future.clone()));
        future
    }

    fn expire_putter(&self, id: u64, future: Oneshot<()>) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.timers.remove(&id);
            if let Some(pos) = inner.put_waiters.iter().position(|(wid, _, _)| *wid == id) {
                inner.put_waiters.remove(pos);
            }
        }
        future.cancel(Fail::QueueFull {});
    }

    fn expire_getter(&self, id: u64, future: Oneshot<T>) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.timers.remove(&id);
            if let Some(pos) = inner.get_waiters.iter().position(|(wid, _)| *wid == id) {
                inner.get_waiters.remove(pos);
            }
        }
        future.cancel(Fail::QueueEmpty {});
    }
}

/// Associate functions for [QueueInner].
impl<T> QueueInner<T> {
    fn full(&self) -> bool {
        self.maxsize > 0 && self.items.len() >= self.maxsize
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_waiter;
        self.next_waiter += 1;
        id
    }

    fn disarm(&mut self, id: u64) {
        if let Some(timer) = self.timers.remove(&id) {
            self.loop_.cancel_timer(&timer);
        }
    }

    /// Moves the head putter's item into the freed slot and resolves it.
    fn admit_putter(&mut self) {
        if let Some((id, future, item)) = self.put_waiters.pop_front() {
            self.disarm(id);
            self.items.push_back(item);
            future.set_result(());
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Clone trait implementation for [Queue].
impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
