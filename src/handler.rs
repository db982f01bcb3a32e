use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use crate::poller::{IoEv, IoType};
use crate::Reactor;

/// Capability object invoked by a [`Reactor`] when the descriptor it is
/// registered for reports readiness.
///
/// The reactor never owns a handler: it keeps only a [`Weak`] reference
/// obtained at registration time and resolves it to a strong one transiently,
/// for the duration of a single invocation. Whoever constructs the handler
/// must hold the sole strong reference for as long as the handler should stay
/// registered; once it is dropped the reactor skips the dead entry.
pub trait EventHandler: Send + Sync {
    /// Called on the dispatch thread with the full reported event set, which
    /// may include conditions outside the interest the handler was registered
    /// for.
    fn handle_events(&self, events: IoEv);
}

/// Event handler binding a single descriptor and interest mask to a closure.
///
/// Created detached; [`FnEventHandler::start`] registers it with the reactor
/// it was constructed for. The closure receives a reference to the handler
/// itself, so a one-shot handler may simply call
/// [`FnEventHandler::cancel`] from inside its own invocation.
pub struct FnEventHandler {
    reactor: Arc<Reactor>,
    fd: RawFd,
    interest: IoType,
    callback: Box<dyn Fn(&FnEventHandler) + Send + Sync>,
    cancelled: Mutex<bool>,
    this: Weak<FnEventHandler>,
}

impl FnEventHandler {
    /// Constructs a detached handler; no registration side effect.
    pub fn new<F>(reactor: Arc<Reactor>, fd: RawFd, interest: IoType, callback: F) -> Arc<Self>
    where
        F: Fn(&FnEventHandler) + Send + Sync + 'static,
    {
        Arc::new_cyclic(|this| FnEventHandler {
            reactor,
            fd,
            interest,
            callback: Box::new(callback),
            cancelled: Mutex::new(false),
            this: this.clone(),
        })
    }

    /// Registers the handler with its reactor, passing it a non-owning
    /// reference to `self`. The handler is dispatched to from the next
    /// readiness cycle onward. Must be called once per instance.
    pub fn start(&self) -> io::Result<()> {
        let handler: Weak<dyn EventHandler> = self.this.clone();
        self.reactor.register_descriptor(self.fd, self.interest, handler)
    }

    /// Descriptor this handler is bound to.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Interest mask this handler was constructed with.
    pub fn interest(&self) -> IoType {
        self.interest
    }

    /// Unregisters the handler from its reactor.
    ///
    /// Idempotent: however many times and from however many threads it is
    /// called, exactly one unregistration takes place. Safe to call from
    /// within the handler's own callback.
    pub fn cancel(&self) -> io::Result<()> {
        let mut cancelled = self.cancelled.lock().expect("handler lock poisoned");
        if !*cancelled {
            self.reactor.unregister_descriptor(self.fd)?;
            *cancelled = true;
        }
        Ok(())
    }
}

impl EventHandler for FnEventHandler {
    fn handle_events(&self, events: IoEv) {
        if events.satisfies(self.interest) {
            (self.callback)(self)
        }
    }
}

impl Drop for FnEventHandler {
    fn drop(&mut self) {
        if let Err(_err) = self.cancel() {
            #[cfg(feature = "log")]
            log::warn!(target: "reactor", "cancelling handler for fd {} on drop failed: {_err}", self.fd);
        }
    }
}
