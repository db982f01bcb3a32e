//! Wrappers around the OS readiness facilities: the `epoll` multiplexer
//! ([`Poller`]) and the `eventfd`-based self-signaling descriptor ([`Waker`])
//! used to interrupt a blocked wait call.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::unistd;

/// Number of readiness events read from the OS in a single wait call.
const EVENT_BATCH: usize = 64;

/// I/O events of interest for a registered descriptor.
#[derive(Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoType {
    /// Interest in read readiness of the descriptor.
    pub read: bool,
    /// Interest in write readiness of the descriptor.
    pub write: bool,
}

impl IoType {
    /// No I/O interest.
    pub fn none() -> Self {
        IoType {
            read: false,
            write: false,
        }
    }

    /// Interest in read readiness only.
    pub fn read_only() -> Self {
        IoType {
            read: true,
            write: false,
        }
    }

    /// Interest in write readiness only.
    pub fn write_only() -> Self {
        IoType {
            read: false,
            write: true,
        }
    }

    /// Interest in both read and write readiness.
    pub fn read_write() -> Self {
        IoType {
            read: true,
            write: true,
        }
    }

    fn epoll_flags(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (false, false) => f.write_str("none"),
            (true, false) => f.write_str("read"),
            (false, true) => f.write_str("write"),
            (true, true) => f.write_str("read-write"),
        }
    }
}

/// I/O events which have happened for a registered descriptor.
///
/// Error and hangup conditions are folded into readiness so that the
/// registered handler wakes up and observes them through its own read or
/// write call on the descriptor.
#[derive(Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoEv {
    /// The descriptor has data to read.
    pub is_readable: bool,
    /// The descriptor is ready for write operations.
    pub is_writable: bool,
}

impl IoEv {
    /// Detects whether the reported events intersect a registered interest.
    pub fn satisfies(self, interest: IoType) -> bool {
        self.is_readable && interest.read || self.is_writable && interest.write
    }
}

impl From<EpollFlags> for IoEv {
    fn from(flags: EpollFlags) -> Self {
        IoEv {
            is_readable: flags.intersects(
                EpollFlags::EPOLLIN
                    | EpollFlags::EPOLLHUP
                    | EpollFlags::EPOLLERR
                    | EpollFlags::EPOLLPRI,
            ),
            is_writable: flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLERR),
        }
    }
}

/// Owning handle to the OS readiness multiplexer.
///
/// Registration calls are safe to issue from any thread, concurrently with a
/// [`Poller::wait`] blocked on another one: newly added descriptors are
/// picked up by the in-progress wait.
pub struct Poller {
    epoll: Epoll,
}

impl Poller {
    /// Acquires a new multiplexer instance from the OS.
    pub fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?;
        Ok(Poller { epoll })
    }

    /// Adds `fd` to the interest list. If the descriptor is already present
    /// its interest is updated instead, making re-registration with a
    /// different [`IoType`] idempotent.
    pub fn register(&self, fd: RawFd, interest: IoType) -> io::Result<()> {
        let mut event = EpollEvent::new(interest.epoll_flags(), fd as u64);
        // SAFETY: callers guarantee `fd` outlives its registration; the
        // kernel rejects closed descriptors with EBADF.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.epoll.add(borrowed, event) {
            Err(Errno::EEXIST) => self.epoll.modify(borrowed, &mut event),
            other => other,
        }
        .map_err(io::Error::from)
    }

    /// Removes `fd` from the interest list. Errors if the descriptor was not
    /// registered.
    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: as in `register`.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(borrowed).map_err(io::Error::from)
    }

    /// Blocks indefinitely until at least one registered descriptor reports
    /// readiness, replacing the contents of `events` with the reported batch.
    ///
    /// A wait interrupted by a signal surfaces as [`io::ErrorKind::Interrupted`]
    /// and must be retried by the caller.
    pub fn wait(&self, events: &mut Vec<(RawFd, IoEv)>) -> io::Result<()> {
        let mut batch = [EpollEvent::empty(); EVENT_BATCH];
        let count = self
            .epoll
            .wait(&mut batch, EpollTimeout::NONE)
            .map_err(io::Error::from)?;
        events.clear();
        events.extend(
            batch[..count]
                .iter()
                .map(|ev| (ev.data() as RawFd, IoEv::from(ev.events()))),
        );
        Ok(())
    }
}

/// Self-signaling descriptor used to interrupt a blocked wait call.
///
/// Backed by a non-blocking `eventfd`. Signaling threads add to its counter
/// with [`Waker::wake`]; the dispatch thread empties the counter with
/// [`Waker::reset`] once awoken, so the descriptor stops reporting
/// read-readiness until the next wakeup.
pub struct Waker {
    event_fd: EventFd,
}

impl Waker {
    /// Acquires the self-signaling descriptor from the OS.
    pub fn new() -> io::Result<Self> {
        let event_fd =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
                .map_err(io::Error::from)?;
        Ok(Waker { event_fd })
    }

    /// Writes a wakeup token to the descriptor. Safe to call from any thread
    /// at any time, including concurrently with itself and with [`Waker::reset`].
    pub fn wake(&self) -> io::Result<()> {
        self.event_fd.arm().map(|_| ()).map_err(io::Error::from)
    }

    /// Consumes all pending wakeup tokens. An empty counter is not an error:
    /// the wakeup may have been observed by a previous reset already.
    pub fn reset(&self) -> io::Result<()> {
        let mut token = [0u8; 8];
        match unistd::read(self.as_raw_fd(), &mut token) {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.event_fd.as_fd().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn re_registration_updates_interest() {
        let poller = Poller::new().unwrap();
        let (left, _right) = UnixStream::pair().unwrap();
        poller.register(left.as_raw_fd(), IoType::read_only()).unwrap();
        poller.register(left.as_raw_fd(), IoType::read_write()).unwrap();
        poller.unregister(left.as_raw_fd()).unwrap();
    }

    #[test]
    fn unregistering_unknown_descriptor_fails() {
        let poller = Poller::new().unwrap();
        let (left, _right) = UnixStream::pair().unwrap();
        assert!(poller.unregister(left.as_raw_fd()).is_err());
    }

    #[test]
    fn waker_reports_readable_until_reset() {
        let poller = Poller::new().unwrap();
        let waker = Waker::new().unwrap();
        poller.register(waker.as_raw_fd(), IoType::read_only()).unwrap();

        waker.wake().unwrap();
        waker.wake().unwrap();

        let mut events = Vec::new();
        poller.wait(&mut events).unwrap();
        assert_eq!(events.len(), 1);
        let (fd, ev) = events[0];
        assert_eq!(fd, waker.as_raw_fd());
        assert!(ev.is_readable);

        waker.reset().unwrap();
        // Once drained a second reset is a no-op.
        waker.reset().unwrap();
    }

    #[test]
    fn event_satisfaction_ignores_unrelated_bits() {
        let ev = IoEv {
            is_readable: true,
            is_writable: false,
        };
        assert!(ev.satisfies(IoType::read_only()));
        assert!(ev.satisfies(IoType::read_write()));
        assert!(!ev.satisfies(IoType::write_only()));
        assert!(!ev.satisfies(IoType::none()));
    }
}
