// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::fail::Fail;

use std::{
    io,
    mem,
    ops::{BitOr, BitOrAssign},
    os::unix::io::RawFd,
    time::Duration,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Maximum number of events drained per poll.
const MAX_EVENTS: usize = 256;

/// Readiness interest/event mask.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EventFlags(u32);

/// Readiness backend.
///
/// Thin wrapper over `epoll`, registered level-triggered. ERROR conditions
/// (`EPOLLERR`/`EPOLLHUP`) are reported regardless of the requested mask, so
/// handlers must treat delivered flags as a mask and tolerate spurious
/// wake-ups.
pub struct Poller {
    epfd: RawFd,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [EventFlags].
impl EventFlags {
    pub const NONE: EventFlags = EventFlags(0);
    pub const READ: EventFlags = EventFlags(0x1);
    pub const WRITE: EventFlags = EventFlags(0x2);
    pub const ERROR: EventFlags = EventFlags(0x4);

    /// Returns `true` if all flags in `other` are set.
    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no flags are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn to_epoll(self) -> u32 {
        let mut events = 0u32;
        if self.contains(Self::READ) {
            events |= libc::EPOLLIN as u32;
        }
        if self.contains(Self::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn from_epoll(events: u32) -> Self {
        let mut flags = Self::NONE;
        if events & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
            flags |= Self::READ;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            flags |= Self::WRITE;
        }
        if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            flags |= Self::ERROR;
        }
        flags
    }
}

/// Associate functions for [Poller].
impl Poller {
    /// Creates a poller.
    pub fn new() -> Result<Self, Fail> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Fail::last_os_error());
        }
        Ok(Self { epfd })
    }

    /// Starts watching a file descriptor.
    pub fn register(&self, fd: RawFd, flags: EventFlags) -> Result<(), Fail> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, flags)
    }

    /// Changes the interest mask of a watched file descriptor.
    pub fn modify(&self, fd: RawFd, flags: EventFlags) -> Result<(), Fail> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, flags)
    }

    /// Stops watching a file descriptor.
    pub fn unregister(&self, fd: RawFd) -> Result<(), Fail> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, EventFlags::NONE)
    }

    /// Waits up to `timeout` for readiness events and appends them to `out`.
    pub fn poll(&self, timeout: Duration, out: &mut Vec<(RawFd, EventFlags)>) -> Result<(), Fail> {
        if self.epfd < 0 {
            return Ok(());
        }
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }
        for event in &events[..n as usize] {
            out.push((event.u64 as RawFd, EventFlags::from_epoll(event.events)));
        }
        Ok(())
    }

    /// Closes the backend. Further polls report nothing.
    pub fn close(&mut self) {
        if self.epfd >= 0 {
            unsafe { libc::close(self.epfd) };
            self.epfd = -1;
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, flags: EventFlags) -> Result<(), Fail> {
        let mut event = libc::epoll_event {
            events: flags.to_epoll(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc < 0 {
            return Err(Fail::last_os_error());
        }
        Ok(())
    }
}

/// Rounds a poll timeout up to whole milliseconds.
fn timeout_ms(timeout: Duration) -> libc::c_int {
    let mut ms = timeout.as_millis();
    if Duration::from_millis(ms as u64) < timeout {
        ms += 1;
    }
    if ms > libc::c_int::MAX as u128 {
        ms = libc::c_int::MAX as u128;
    }
    ms as libc::c_int
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Bit-or trait implementation for [EventFlags].
impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

/// Bit-or-assign trait implementation for [EventFlags].
impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: EventFlags) {
        self.0 |= rhs.0;
    }
}

/// Drop trait implementation for [Poller].
impl Drop for Poller {
    fn drop(&mut self) {
        self.close();
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests flag mask arithmetic.
    #[test]
    fn flag_masks() {
        let flags = EventFlags::READ | EventFlags::ERROR;
        assert!(flags.contains(EventFlags::READ));
        assert!(flags.contains(EventFlags::ERROR));
        assert!(!flags.contains(EventFlags::WRITE));
        assert!(!flags.contains(EventFlags::READ | EventFlags::WRITE));
        assert!(EventFlags::NONE.is_empty());
    }

    /// Tests the epoll mask round trip.
    #[test]
    fn epoll_mask_round_trip() {
        let flags = EventFlags::READ | EventFlags::WRITE;
        assert_eq!(EventFlags::from_epoll(flags.to_epoll()), flags);
        let err = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
        assert_eq!(EventFlags::from_epoll(err), EventFlags::ERROR);
    }

    /// Tests that a zero-timeout poll on an empty interest set returns nothing.
    #[test]
    fn empty_poll() {
        let poller = Poller::new().unwrap();
        let mut events = Vec::new();
        poller.poll(Duration::from_millis(0), &mut events).unwrap();
        assert!(events.is_empty());
    }
}
