//! Reactor-style event dispatch core for interprocess transport stacks.
//!
//! A [`Reactor`] runs a single background thread blocked on the OS readiness
//! multiplexer and serializes two kinds of work onto that thread: readiness
//! callbacks for registered file descriptors and arbitrary functions deferred
//! from other threads with [`Reactor::run`].
//!
//! The reactor never owns the handlers it dispatches to: registration hands
//! it only a [`std::sync::Weak`] reference, resolved to a strong one for the
//! duration of a single invocation. This lets a handler be dropped - or
//! cancel itself from inside its own callback - at any moment without the
//! dispatch thread ever calling into freed state.
//!
//! The crate addresses the same problem an async runtime reactor does, but
//! with a much simpler API and without the heap of dependencies introduced by
//! async runtimes: one dedicated thread per reactor, `epoll` syscalls and
//! plain callbacks.

#[macro_use]
extern crate amplify;
#[cfg(feature = "log")]
extern crate log_crate as log;

pub mod poller;
mod error;
mod handler;
mod reactor;

pub use error::TaskError;
pub use handler::{EventHandler, FnEventHandler};
pub use reactor::{Reactor, TaskResult, Ticket};
