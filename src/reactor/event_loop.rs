//! The event loop: descriptor table, timer list and dispatch.

use super::clock::{Clock, SystemClock};
use super::poller::Poller;
use super::{Interest, ProcessFlags, ReactorError, TimerId};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

/// Descriptor callback. Registering one `Rc` for both interests makes the
/// loop call it once per readiness report.
pub type FileProc<S> = Rc<dyn Fn(&mut EventLoop<S>, &mut S, RawFd, Interest)>;

type TimeProc<S> = Box<dyn FnMut(&mut EventLoop<S>, &mut S, TimerId) -> TimerAction>;
type Finalizer<S> = Box<dyn FnOnce(&mut EventLoop<S>, &mut S)>;
type SleepHook<S> = Box<dyn FnMut(&mut EventLoop<S>, &mut S)>;

/// Returned by a timer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Fire again this many milliseconds from now.
    Reschedule(u64),
    /// Delete the timer; its finalizer runs on the next sweep.
    Remove,
}

struct FileEvent<S> {
    mask: Interest,
    read: Option<FileProc<S>>,
    write: Option<FileProc<S>>,
}

impl<S> Default for FileEvent<S> {
    fn default() -> Self {
        Self {
            mask: Interest::NONE,
            read: None,
            write: None,
        }
    }
}

enum TimerState {
    Armed,
    /// Canceled; unlinked and finalized by the next sweep.
    Deleted,
}

struct TimeEvent<S> {
    id: TimerId,
    when_ms: u64,
    state: TimerState,
    /// Taken out while the callback runs.
    callback: Option<TimeProc<S>>,
    finalizer: Option<Finalizer<S>>,
}

/// Single-threaded reactor over loop state `S`.
///
/// # Example
///
/// ```
/// use emberkv::reactor::{EventLoop, ManualClock, ProcessFlags, TimerAction};
///
/// let clock = ManualClock::new(1_000_000);
/// let mut el: EventLoop<u32> = EventLoop::with_clock(64, clock.clone());
/// let mut fired = 0u32;
///
/// el.add_timer(100, |_, count: &mut u32, _| {
///     *count += 1;
///     TimerAction::Remove
/// });
///
/// el.process_events(&mut fired, ProcessFlags::TIME_EVENTS | ProcessFlags::DONT_WAIT).unwrap();
/// assert_eq!(fired, 0);
///
/// clock.advance(100);
/// el.process_events(&mut fired, ProcessFlags::TIME_EVENTS | ProcessFlags::DONT_WAIT).unwrap();
/// assert_eq!(fired, 1);
/// ```
pub struct EventLoop<S> {
    events: Vec<FileEvent<S>>,
    max_fd: Option<RawFd>,
    poller: Poller,
    timers: Vec<TimeEvent<S>>,
    next_timer_id: u64,
    last_time_secs: u64,
    stopped: bool,
    before_sleep: Option<SleepHook<S>>,
    after_sleep: Option<SleepHook<S>>,
    clock: Box<dyn Clock>,
}

impl<S> EventLoop<S> {
    /// Creates a loop able to track descriptors `0..setsize`.
    pub fn new(setsize: usize) -> Self {
        Self::with_clock(setsize, SystemClock)
    }

    pub fn with_clock(setsize: usize, clock: impl Clock + 'static) -> Self {
        let mut events = Vec::with_capacity(setsize);
        events.resize_with(setsize, FileEvent::default);
        let last_time_secs = clock.now_ms() / 1000;
        Self {
            events,
            max_fd: None,
            poller: Poller::new(setsize),
            timers: Vec::new(),
            next_timer_id: 0,
            last_time_secs,
            stopped: false,
            before_sleep: None,
            after_sleep: None,
            clock: Box::new(clock),
        }
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    /// Highest descriptor with a non-empty interest mask.
    pub fn max_fd(&self) -> Option<RawFd> {
        self.max_fd
    }

    pub fn backend_name(&self) -> &'static str {
        self.poller.name()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Changes the descriptor capacity. Fails if a registered descriptor
    /// would fall outside it.
    pub fn resize_capacity(&mut self, setsize: usize) -> Result<(), ReactorError> {
        if setsize == self.events.len() {
            return Ok(());
        }
        if let Some(max_fd) = self.max_fd {
            if max_fd as usize >= setsize {
                return Err(ReactorError::Capacity {
                    requested: setsize,
                    max_fd,
                });
            }
        }
        self.poller.resize(setsize);
        self.events.resize_with(setsize, FileEvent::default);
        Ok(())
    }

    // ========================================================================
    // File events
    // ========================================================================

    /// Adds `interest` for `fd`, invoking `callback` when it is ready.
    pub fn add_file_event<F>(&mut self, fd: RawFd, interest: Interest, callback: F) -> Result<(), ReactorError>
    where
        F: Fn(&mut EventLoop<S>, &mut S, RawFd, Interest) + 'static,
    {
        self.add_file_proc(fd, interest, Rc::new(callback))
    }

    /// Like [`add_file_event`](Self::add_file_event) with an already shared
    /// callback.
    pub fn add_file_proc(&mut self, fd: RawFd, interest: Interest, callback: FileProc<S>) -> Result<(), ReactorError> {
        let capacity = self.events.len();
        let idx = usize::try_from(fd)
            .ok()
            .filter(|&idx| idx < capacity)
            .ok_or(ReactorError::OutOfRange { fd, capacity })?;

        self.poller.add(fd, interest)?;

        let fe = &mut self.events[idx];
        fe.mask |= interest;
        if interest.is_readable() {
            fe.read = Some(Rc::clone(&callback));
        }
        if interest.is_writable() {
            fe.write = Some(callback);
        }
        if self.max_fd.map_or(true, |max| fd > max) {
            self.max_fd = Some(fd);
        }
        Ok(())
    }

    /// Clears `interest` for `fd`. A no-op for descriptors that are out of
    /// range or not registered.
    pub fn remove_file_event(&mut self, fd: RawFd, interest: Interest) {
        let Some(fe) = usize::try_from(fd).ok().and_then(|idx| self.events.get_mut(idx)) else {
            return;
        };
        if fe.mask.is_empty() {
            return;
        }
        fe.mask = fe.mask.remove(interest);
        if interest.is_readable() {
            fe.read = None;
        }
        if interest.is_writable() {
            fe.write = None;
        }
        let remaining = fe.mask;
        self.poller.remove(fd, interest);

        if self.max_fd == Some(fd) && remaining.is_empty() {
            self.max_fd = (0..fd).rev().find(|&j| !self.events[j as usize].mask.is_empty());
        }
    }

    /// Interest currently registered for `fd`.
    pub fn file_interest(&self, fd: RawFd) -> Interest {
        usize::try_from(fd)
            .ok()
            .and_then(|idx| self.events.get(idx))
            .map_or(Interest::NONE, |fe| fe.mask)
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Schedules `callback` to run `delay_ms` from now.
    pub fn add_timer<F>(&mut self, delay_ms: u64, callback: F) -> TimerId
    where
        F: FnMut(&mut EventLoop<S>, &mut S, TimerId) -> TimerAction + 'static,
    {
        self.push_timer(delay_ms, Box::new(callback), None)
    }

    /// Like [`add_timer`](Self::add_timer); `finalizer` runs exactly once
    /// when the timer is eventually unlinked.
    pub fn add_timer_with_finalizer<F, G>(&mut self, delay_ms: u64, callback: F, finalizer: G) -> TimerId
    where
        F: FnMut(&mut EventLoop<S>, &mut S, TimerId) -> TimerAction + 'static,
        G: FnOnce(&mut EventLoop<S>, &mut S) + 'static,
    {
        self.push_timer(delay_ms, Box::new(callback), Some(Box::new(finalizer)))
    }

    fn push_timer(&mut self, delay_ms: u64, callback: TimeProc<S>, finalizer: Option<Finalizer<S>>) -> TimerId {
        let id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        self.timers.push(TimeEvent {
            id,
            when_ms: self.clock.now_ms().saturating_add(delay_ms),
            state: TimerState::Armed,
            callback: Some(callback),
            finalizer,
        });
        id
    }

    /// Tombstones a timer. Unlinking and the finalizer happen on the next
    /// sweep.
    pub fn cancel_timer(&mut self, id: TimerId) -> Result<(), ReactorError> {
        let timer = self
            .timers
            .iter_mut()
            .find(|t| t.id == id && matches!(t.state, TimerState::Armed))
            .ok_or(ReactorError::NoSuchTimer(id))?;
        timer.state = TimerState::Deleted;
        Ok(())
    }

    /// Number of timers still linked, tombstones included.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Wait until the nearest deadline; zero while tombstones await
    /// collection.
    fn time_to_nearest_timer(&self) -> Option<Duration> {
        if self.timers.iter().any(|t| matches!(t.state, TimerState::Deleted)) {
            return Some(Duration::ZERO);
        }
        let nearest = self.timers.iter().map(|t| t.when_ms).min()?;
        let now = self.clock.now_ms();
        Some(Duration::from_millis(nearest.saturating_sub(now)))
    }

    fn process_time_events(&mut self, state: &mut S) -> usize {
        let now = self.clock.now_ms();
        let now_secs = now / 1000;
        if now_secs < self.last_time_secs {
            debug!(
                last = self.last_time_secs,
                now = now_secs,
                "System clock moved backwards, firing pending timers"
            );
            for timer in &mut self.timers {
                timer.when_ms = now;
            }
        }
        self.last_time_secs = now_secs;

        // Timers created by callbacks during this sweep wait for the next one.
        let max_id = self.next_timer_id;
        let mut processed = 0;
        let mut i = 0;

        while i < self.timers.len() {
            if matches!(self.timers[i].state, TimerState::Deleted) {
                let timer = self.timers.swap_remove(i);
                if let Some(finalizer) = timer.finalizer {
                    finalizer(self, state);
                }
                continue;
            }

            let id = self.timers[i].id;
            if id.0 >= max_id || self.timers[i].when_ms > now {
                i += 1;
                continue;
            }
            let Some(mut callback) = self.timers[i].callback.take() else {
                i += 1;
                continue;
            };

            let action = callback(self, state, id);
            processed += 1;

            let now = self.clock.now_ms();
            if let Some(timer) = self.timers.iter_mut().find(|t| t.id == id) {
                timer.callback = Some(callback);
                match action {
                    TimerAction::Reschedule(ms) => timer.when_ms = now.saturating_add(ms),
                    TimerAction::Remove => timer.state = TimerState::Deleted,
                }
            }
            i += 1;
        }
        processed
    }

    // ========================================================================
    // Loop control
    // ========================================================================

    pub fn set_before_sleep<F>(&mut self, hook: F)
    where
        F: FnMut(&mut EventLoop<S>, &mut S) + 'static,
    {
        self.before_sleep = Some(Box::new(hook));
    }

    pub fn set_after_sleep<F>(&mut self, hook: F)
    where
        F: FnMut(&mut EventLoop<S>, &mut S) + 'static,
    {
        self.after_sleep = Some(Box::new(hook));
    }

    /// Requests [`run`](Self::run) to return after the current iteration.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Runs iterations until [`stop`](Self::stop) is called.
    ///
    /// # Errors
    ///
    /// Returns the first failed readiness wait. Handlers registered so far
    /// stay in place.
    pub fn run(&mut self, state: &mut S) -> Result<(), ReactorError> {
        self.stopped = false;
        while !self.stopped {
            if let Some(mut hook) = self.before_sleep.take() {
                hook(self, state);
                if self.before_sleep.is_none() {
                    self.before_sleep = Some(hook);
                }
            }
            self.process_events(state, ProcessFlags::ALL_EVENTS | ProcessFlags::CALL_AFTER_SLEEP)?;
        }
        Ok(())
    }

    /// Waits for and dispatches one round of events.
    ///
    /// # Returns
    ///
    /// The number of file and timer events processed.
    ///
    /// # Errors
    ///
    /// [`ReactorError::Io`] if the readiness wait fails for any reason other
    /// than a signal. No handler or timer runs in that case.
    pub fn process_events(&mut self, state: &mut S, flags: ProcessFlags) -> Result<usize, ReactorError> {
        let file_events = flags.contains(ProcessFlags::FILE_EVENTS);
        let time_events = flags.contains(ProcessFlags::TIME_EVENTS);
        let dont_wait = flags.contains(ProcessFlags::DONT_WAIT);
        if !file_events && !time_events {
            return Ok(0);
        }

        let mut processed = 0;
        if self.max_fd.is_some() || (time_events && !dont_wait) {
            let timeout = if dont_wait {
                Some(Duration::ZERO)
            } else if time_events {
                self.time_to_nearest_timer()
            } else {
                None
            };

            let fired = self.poller.poll(self.max_fd, timeout)?.to_vec();

            if flags.contains(ProcessFlags::CALL_AFTER_SLEEP) {
                if let Some(mut hook) = self.after_sleep.take() {
                    hook(self, state);
                    if self.after_sleep.is_none() {
                        self.after_sleep = Some(hook);
                    }
                }
            }

            if file_events {
                for (fd, ready) in fired {
                    self.dispatch(state, fd, ready);
                    processed += 1;
                }
            }
        }

        if time_events {
            processed += self.process_time_events(state);
        }
        Ok(processed)
    }

    fn dispatch(&mut self, state: &mut S, fd: RawFd, ready: Interest) {
        let idx = fd as usize;
        let read = match self.events.get(idx) {
            Some(fe) if (fe.mask & ready).is_readable() => fe.read.clone(),
            _ => None,
        };

        let mut read_fired = None;
        if let Some(read) = read {
            read(self, state, fd, ready);
            read_fired = Some(read);
        }

        // Re-check: the read callback may have removed write interest.
        let write = match self.events.get(idx) {
            Some(fe) if (fe.mask & ready).is_writable() => fe.write.clone(),
            _ => None,
        };
        if let Some(write) = write {
            let same = read_fired.as_ref().is_some_and(|r| Rc::ptr_eq(r, &write));
            if !same {
                write(self, state, fd, ready);
            }
        }
    }
}
