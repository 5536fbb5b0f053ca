//! The event multiplexer (C1): one `epoll` instance fanning out to a
//! signalfd source and any number of timerfd sources, each registered
//! under a slot-arena index rather than a raw pointer so a callback can
//! cancel its own or another source's registration without dangling.
//! Grounded on the source's `mainloop.c`.

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::signal::SigSet;
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::unistd::Pid;
use std::cell::RefCell;
use std::os::fd::AsFd;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

/// A decoded `signalfd_siginfo`, reduced to the fields the supervisor's
/// callbacks actually consume.
#[derive(Debug, Clone, Copy)]
pub struct SignalEvent {
    pub signo: i32,
    /// Reporting child, meaningful only for `SIGCHLD`.
    pub pid: Option<Pid>,
    /// Raw `wait`-style status, meaningful only for `SIGCHLD`.
    pub status: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerResult {
    Continue,
    Stop,
}

pub type SignalCallback = Box<dyn FnMut(SignalEvent)>;
pub type TimerCallback = Box<dyn FnMut() -> TimerResult>;
pub type PostIterationCallback = Box<dyn FnMut()>;

/// An opaque registration token; indexes into the multiplexer's slot
/// arena and carries no meaning outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

#[derive(Debug, Error)]
pub enum EventLoopError {
    #[error("could not create epoll instance: {0}")]
    Create(#[source] nix::Error),
    #[error("could not register event source: {0}")]
    Register(#[source] nix::Error),
    #[error("epoll_wait failed: {0}")]
    Wait(#[source] nix::Error),
}

enum Source {
    Signal { fd: SignalFd, callback: SignalCallback },
    Timer { fd: TimerFd, callback: TimerCallback },
}

pub struct EventLoop {
    epoll: Epoll,
    sources: Vec<Option<Source>>,
    free_slots: Vec<usize>,
    post_iteration: Option<PostIterationCallback>,
    exit_requested: bool,
}

/// Shared ownership handle, cloned into every callback that needs to
/// register or cancel sources from inside its own dispatch.
pub type SharedEventLoop = Rc<RefCell<EventLoop>>;

impl EventLoop {
    pub fn shared() -> Result<SharedEventLoop, EventLoopError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(EventLoopError::Create)?;
        Ok(Rc::new(RefCell::new(Self {
            epoll,
            sources: Vec::new(),
            free_slots: Vec::new(),
            post_iteration: None,
            exit_requested: false,
        })))
    }

    fn allocate_slot(&mut self, source: Source) -> usize {
        if let Some(idx) = self.free_slots.pop() {
            self.sources[idx] = Some(source);
            idx
        } else {
            self.sources.push(Some(source));
            self.sources.len() - 1
        }
    }

    pub fn add_signal_source(
        &mut self,
        mask: &SigSet,
        callback: SignalCallback,
    ) -> Result<Handle, EventLoopError> {
        let fd = SignalFd::with_flags(mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(EventLoopError::Register)?;
        let idx = self.allocate_slot(Source::Signal { fd, callback });
        // `allocate_slot` just placed a `Source::Signal` at `idx`.
        #[allow(clippy::expect_used)]
        let Source::Signal { fd, .. } = self.sources[idx].as_ref().expect("just inserted") else {
            unreachable!()
        };
        self.epoll
            .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, idx as u64))
            .map_err(EventLoopError::Register)?;
        Ok(Handle(idx))
    }

    /// Registers an auto-rearming monotonic timer. `period` must be at
    /// least one millisecond.
    pub fn add_timer(
        &mut self,
        period: Duration,
        callback: TimerCallback,
    ) -> Result<Handle, EventLoopError> {
        let fd = TimerFd::new(ClockId::Monotonic, TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC)
            .map_err(EventLoopError::Register)?;
        fd.set(Expiration::Interval(TimeSpec::from_duration(period)), TimerSetTimeFlags::empty())
            .map_err(EventLoopError::Register)?;
        let idx = self.allocate_slot(Source::Timer { fd, callback });
        // `allocate_slot` just placed a `Source::Timer` at `idx`.
        #[allow(clippy::expect_used)]
        let Source::Timer { fd, .. } = self.sources[idx].as_ref().expect("just inserted") else {
            unreachable!()
        };
        self.epoll
            .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, idx as u64))
            .map_err(EventLoopError::Register)?;
        Ok(Handle(idx))
    }

    pub fn remove_timer(&mut self, handle: Handle) {
        self.remove_source(handle);
    }

    pub fn remove_signal_source(&mut self, handle: Handle) {
        self.remove_source(handle);
    }

    fn remove_source(&mut self, handle: Handle) {
        let Some(source) = self.sources.get_mut(handle.0).and_then(Option::take) else {
            return;
        };
        let deleted = match &source {
            Source::Signal { fd, .. } => self.epoll.delete(fd),
            Source::Timer { fd, .. } => self.epoll.delete(fd),
        };
        if let Err(e) = deleted {
            tracing::warn!(error = %e, "could not deregister event source from epoll");
        }
        self.free_slots.push(handle.0);
    }

    pub fn set_post_iteration_callback(&mut self, callback: Option<PostIterationCallback>) {
        self.post_iteration = callback;
    }

    /// Cooperative stop: the next return from the blocking wait inside
    /// [`start`] exits the loop.
    pub fn exit(&mut self) {
        self.exit_requested = true;
    }
}

/// Blocks dispatching events until [`EventLoop::exit`] is called. Takes
/// the shared handle rather than `&mut EventLoop` so that a callback can
/// re-enter the same handle (to add/remove sources, or to call `exit`)
/// without a borrow-checker conflict: the handle's `RefCell` is only ever
/// held across the non-reentrant bookkeeping around a dispatch, never
/// across the callback invocation itself.
pub fn start(event_loop: &SharedEventLoop) -> Result<(), EventLoopError> {
    let mut events = [EpollEvent::empty(); 16];
    loop {
        let ready = {
            let mut guard = event_loop.borrow_mut();
            if guard.exit_requested {
                break;
            }
            match guard.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(EventLoopError::Wait(e)),
            }
        };

        for ev in &events[..ready] {
            if event_loop.borrow().exit_requested {
                break;
            }
            let idx = ev.data() as usize;
            dispatch(event_loop, idx);
            run_post_iteration(event_loop);
        }
    }
    Ok(())
}

fn dispatch(event_loop: &SharedEventLoop, idx: usize) {
    let taken = event_loop
        .borrow_mut()
        .sources
        .get_mut(idx)
        .and_then(Option::take);
    let Some(mut source) = taken else {
        // Stale readiness for a slot another callback already cancelled
        // earlier in this same dispatch batch.
        return;
    };

    match &mut source {
        Source::Signal { fd, callback } => {
            match fd.read_signal() {
                Ok(Some(info)) => {
                    let event = SignalEvent {
                        signo: info.ssi_signo as i32,
                        pid: (info.ssi_pid != 0).then(|| Pid::from_raw(info.ssi_pid as i32)),
                        status: (info.ssi_signo as i32 == libc::SIGCHLD).then_some(info.ssi_status),
                    };
                    callback(event);
                }
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "short or failed read on signalfd"),
            }
            event_loop.borrow_mut().sources[idx] = Some(source);
        }
        Source::Timer { fd, callback } => match fd.wait() {
            Ok(()) => {
                let result = callback();
                if result == TimerResult::Stop {
                    let mut guard = event_loop.borrow_mut();
                    if let Err(e) = guard.epoll.delete(&*fd) {
                        tracing::warn!(error = %e, "could not deregister expired timer");
                    }
                    guard.free_slots.push(idx);
                } else {
                    event_loop.borrow_mut().sources[idx] = Some(source);
                }
            }
            Err(nix::Error::EAGAIN) => {
                event_loop.borrow_mut().sources[idx] = Some(source);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed read on timerfd");
                event_loop.borrow_mut().sources[idx] = Some(source);
            }
        },
    }
}

fn run_post_iteration(event_loop: &SharedEventLoop) {
    let hook = event_loop.borrow_mut().post_iteration.take();
    let Some(mut hook) = hook else { return };
    hook();
    // Only restore the hook if nobody detached/replaced it while it ran
    // (e.g. a stage transition that re-attaches a different hook).
    let mut guard = event_loop.borrow_mut();
    if guard.post_iteration.is_none() {
        guard.post_iteration = Some(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_freshly_created_loop_has_no_sources() {
        let el = EventLoop::shared().unwrap();
        assert!(el.borrow().sources.is_empty());
    }

    #[test]
    fn exit_is_observed_before_the_next_wait() {
        let el = EventLoop::shared().unwrap();
        el.borrow_mut().exit();
        assert!(el.borrow().exit_requested);
    }

    #[test]
    fn removing_an_unregistered_handle_is_a_harmless_no_op() {
        let el = EventLoop::shared().unwrap();
        el.borrow_mut().remove_timer(Handle(0));
    }
}
