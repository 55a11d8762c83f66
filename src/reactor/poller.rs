//! poll(2) readiness backend.
//!
//! Keeps its own copy of each descriptor's interest mask and rebuilds the
//! `pollfd` array up to the highest registered descriptor on every call.

use super::Interest;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct Poller {
    interest: Vec<Interest>,
    fired: Vec<(RawFd, Interest)>,
}

impl Poller {
    pub fn new(setsize: usize) -> Self {
        Self {
            interest: vec![Interest::NONE; setsize],
            fired: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        "poll"
    }

    pub fn resize(&mut self, setsize: usize) {
        self.interest.resize(setsize, Interest::NONE);
    }

    pub fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let slot = usize::try_from(fd)
            .ok()
            .and_then(|idx| self.interest.get_mut(idx))
            .ok_or_else(|| io::Error::from(Errno::ERANGE))?;
        *slot |= interest;
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd, interest: Interest) {
        if let Some(slot) = usize::try_from(fd).ok().and_then(|idx| self.interest.get_mut(idx)) {
            *slot = slot.remove(interest);
        }
    }

    /// Waits for readiness on descriptors `0..=max_fd`.
    ///
    /// `None` blocks until a descriptor is ready. Interrupted waits report
    /// no events.
    ///
    /// # Errors
    ///
    /// Any other poll(2) failure, such as more registered descriptors than
    /// `RLIMIT_NOFILE` allows.
    pub fn poll(&mut self, max_fd: Option<RawFd>, timeout: Option<Duration>) -> io::Result<&[(RawFd, Interest)]> {
        self.fired.clear();
        let mut pollfds = Vec::new();
        if let Some(max_fd) = max_fd {
            for fd in 0..=max_fd {
                let interest = self.interest.get(fd as usize).copied().unwrap_or(Interest::NONE);
                if interest.is_empty() {
                    continue;
                }
                pollfds.push(PollFd::new(borrow(fd), to_poll_flags(interest)));
            }
        }

        match poll(&mut pollfds, poll_timeout(timeout_ms(timeout))) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(&self.fired),
            Err(errno) => return Err(errno.into()),
        }

        for pfd in &pollfds {
            let fd = pfd.as_fd().as_raw_fd();
            let revents = pfd.revents().unwrap_or(PollFlags::POLLERR);
            if revents.is_empty() {
                continue;
            }
            let registered = self.interest[fd as usize];
            let ready = from_poll_flags(revents, registered) & registered;
            if !ready.is_empty() {
                self.fired.push((fd, ready));
            }
        }
        Ok(&self.fired)
    }
}

/// Waits up to `timeout_ms` for a single descriptor; a negative timeout
/// blocks. Error and hangup conditions report the requested interest.
pub fn wait_fd(fd: RawFd, interest: Interest, timeout_ms: i32) -> io::Result<Interest> {
    let mut pfd = [PollFd::new(borrow(fd), to_poll_flags(interest))];
    match poll(&mut pfd, poll_timeout(timeout_ms)) {
        Ok(0) | Err(Errno::EINTR) => Ok(Interest::NONE),
        Ok(_) => {
            let revents = pfd[0].revents().unwrap_or(PollFlags::POLLERR);
            Ok(from_poll_flags(revents, interest) & interest)
        }
        Err(errno) => Err(errno.into()),
    }
}

fn borrow<'fd>(fd: RawFd) -> BorrowedFd<'fd> {
    // SAFETY: descriptors stay open while registered, and every borrow is
    // dropped before the wait returns.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

fn to_poll_flags(interest: Interest) -> PollFlags {
    let mut flags = PollFlags::empty();
    if interest.is_readable() {
        flags |= PollFlags::POLLIN;
    }
    if interest.is_writable() {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

fn from_poll_flags(revents: PollFlags, on_error: Interest) -> Interest {
    let mut ready = Interest::NONE;
    if revents.contains(PollFlags::POLLIN) {
        ready |= Interest::READABLE;
    }
    if revents.contains(PollFlags::POLLOUT) {
        ready |= Interest::WRITABLE;
    }
    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
        ready |= on_error;
    }
    ready
}

fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            // Sub-millisecond remainders round up.
            let ms = d.as_micros().div_ceil(1000);
            ms.min(i32::MAX as u128) as i32
        }
    }
}

fn poll_timeout(ms: i32) -> PollTimeout {
    if ms < 0 {
        PollTimeout::NONE
    } else {
        PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
    }
}
