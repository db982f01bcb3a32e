use std::any::Any;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel as chan;

use crate::handler::EventHandler;
use crate::poller::{IoType, Poller, Waker};
use crate::TaskError;

/// Result which a function deferred with [`Reactor::run`] must produce.
pub type TaskResult = Result<(), Box<dyn std::error::Error + Send>>;

/// A deferred function with its result-capturing wrapper already applied.
type Task = Box<dyn FnOnce() + Send>;

/// Asynchronous result handle for a function deferred with [`Reactor::run`].
///
/// Settled exactly once by the dispatch thread after the function has
/// executed. Dropping the ticket discards the outcome, including a captured
/// failure; this has no effect on the reactor or on other deferred work.
pub struct Ticket {
    result: chan::Receiver<Result<(), TaskError>>,
}

impl Ticket {
    /// Blocks the calling thread until the deferred function has executed on
    /// the dispatch thread and returns its outcome.
    ///
    /// Errors with [`TaskError::Stopped`] if the reactor went away before
    /// the function could run.
    pub fn wait(self) -> Result<(), TaskError> {
        self.result.recv().unwrap_or(Err(TaskError::Stopped))
    }
}

/// Registry of descriptor-to-handler bindings.
///
/// The slot vector grows to fit the largest registered descriptor; `live`
/// counts non-empty slots and is kept in sync under the same lock, since it
/// alone gates shutdown.
struct HandlerTable {
    slots: Vec<Option<Weak<dyn EventHandler>>>,
    live: usize,
}

impl HandlerTable {
    fn insert(&mut self, fd: RawFd, handler: Weak<dyn EventHandler>) {
        let index = fd as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        let slot = &mut self.slots[index];
        if slot.is_none() {
            self.live += 1;
        }
        *slot = Some(handler);
    }

    fn remove(&mut self, fd: RawFd) {
        if let Some(slot) = self.slots.get_mut(fd as usize) {
            if slot.take().is_some() {
                self.live -= 1;
            }
        }
    }

    fn resolve(&self, fd: RawFd) -> Option<Arc<dyn EventHandler>> {
        self.slots.get(fd as usize)?.as_ref()?.upgrade()
    }
}

/// Event-dispatch loop of an interprocess transport.
///
/// A single background thread multiplexes readiness events on registered
/// descriptors and drains functions deferred from other threads, so that all
/// callbacks and all deferred work execute sequentially on that one thread.
/// Registration, unregistration, [`Reactor::run`] and [`Reactor::wakeup`]
/// are safe to call from any thread, including from inside a dispatched
/// callback.
///
/// The handler table and the deferred-function queue are guarded by two
/// independent locks, and neither lock is ever held across a callback
/// invocation: a callback is free to re-enter the registration API or to
/// drop the last strong reference to its own handler.
pub struct Reactor {
    poller: Poller,
    waker: Waker,
    handlers: Mutex<HandlerTable>,
    tasks: Mutex<Vec<Task>>,
    stopping: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Acquires the readiness multiplexer and the self-signaling descriptor
    /// from the OS, registers the latter for read-readiness and starts the
    /// dispatch thread.
    ///
    /// Readiness of the self-signaling descriptor is consumed by the dispatch
    /// routine itself and never routed through the handler table.
    ///
    /// # Errors
    ///
    /// If any of the OS facilities can't be acquired.
    pub fn new() -> io::Result<Arc<Reactor>> {
        let poller = Poller::new()?;
        let waker = Waker::new()?;
        poller.register(waker.as_raw_fd(), IoType::read_only())?;

        let reactor = Arc::new(Reactor {
            poller,
            waker,
            handlers: Mutex::new(HandlerTable {
                slots: empty!(),
                live: 0,
            }),
            tasks: Mutex::new(empty!()),
            stopping: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        let runtime = Arc::clone(&reactor);
        let handle = thread::Builder::new()
            .name(s!("reactor"))
            .spawn(move || runtime.dispatch())?;
        *reactor.thread.lock().expect("reactor thread lock poisoned") = Some(handle);

        Ok(reactor)
    }

    /// Registers `handler` to be invoked whenever `fd` reports events
    /// matching `interest`.
    ///
    /// Only the provided non-owning reference is stored: the caller keeps
    /// the handler alive for as long as it should stay registered.
    /// Re-registering an already-registered descriptor replaces its handler
    /// and interest mask; at most one handler is bound per descriptor.
    ///
    /// # Errors
    ///
    /// If the readiness multiplexer rejects the descriptor.
    pub fn register_descriptor(
        &self,
        fd: RawFd,
        interest: IoType,
        handler: Weak<dyn EventHandler>,
    ) -> io::Result<()> {
        debug_assert!(fd >= 0, "registering negative file descriptor");
        {
            let mut handlers = self.handlers.lock().expect("handler table lock poisoned");
            handlers.insert(fd, handler);
        }
        self.poller.register(fd, interest)?;
        #[cfg(feature = "log")]
        log::trace!(target: "reactor", "registered fd {fd} for {interest} events");
        Ok(())
    }

    /// Removes the binding for `fd` from the multiplexer and the handler
    /// table.
    ///
    /// Safe to call from any thread, including from within a handler's own
    /// callback or drop code.
    ///
    /// # Errors
    ///
    /// If the descriptor was not registered, or on any other multiplexer
    /// failure.
    pub fn unregister_descriptor(&self, fd: RawFd) -> io::Result<()> {
        self.poller.unregister(fd)?;
        self.handlers
            .lock()
            .expect("handler table lock poisoned")
            .remove(fd);
        #[cfg(feature = "log")]
        log::trace!(target: "reactor", "unregistered fd {fd}");
        // A blocked wait call must re-check the shutdown gate now that the
        // table may have emptied.
        self.waker.wake()
    }

    /// Defers `work` for execution on the dispatch thread, returning
    /// immediately with a [`Ticket`] which settles once the function has run.
    ///
    /// Deferred functions execute in submission order. A failure returned -
    /// or a panic raised - by the function is captured into the ticket and
    /// never propagates into the dispatch thread. Functions submitted after
    /// [`Reactor::join`] has stopped the loop are never executed; their
    /// tickets settle with [`TaskError::Stopped`] once the reactor is
    /// dropped.
    ///
    /// # Errors
    ///
    /// If the wakeup signal can't be written.
    pub fn run<F>(&self, work: F) -> io::Result<Ticket>
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        let (done, result) = chan::bounded(1);
        let task: Task = Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(failure)) => Err(TaskError::Failed(failure)),
                Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
            };
            // The submitter may have dropped the ticket already; its outcome
            // is then discarded.
            let _ = done.send(outcome);
        });
        self.tasks
            .lock()
            .expect("task queue lock poisoned")
            .push(task);
        self.waker.wake()?;
        Ok(Ticket { result })
    }

    /// Interrupts a wait call the dispatch thread may be blocked in. Safe to
    /// call from any thread at any time.
    ///
    /// # Errors
    ///
    /// If the signal can't be written to the self-signaling descriptor.
    pub fn wakeup(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Requests the dispatch loop to stop and blocks until its thread has
    /// exited.
    ///
    /// The loop keeps running until every handler has been unregistered:
    /// with bindings still in the table the call blocks until some thread
    /// removes the last of them. Callers are responsible for tearing down
    /// all owned handlers before or as part of the teardown sequence.
    ///
    /// # Errors
    ///
    /// If the wakeup signal can't be written, or if the dispatch thread was
    /// terminated abnormally by a readiness-facility failure.
    pub fn join(&self) -> io::Result<()> {
        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "shutting down the dispatch loop");
        self.stopping.store(true, Ordering::SeqCst);
        self.waker.wake()?;
        let thread = self
            .thread
            .lock()
            .expect("reactor thread lock poisoned")
            .take();
        if let Some(thread) = thread {
            thread.join().map_err(|_| {
                io::Error::new(io::ErrorKind::Other, "reactor dispatch thread panicked")
            })?;
        }
        Ok(())
    }

    /// Body of the dispatch thread.
    fn dispatch(&self) {
        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "dispatch thread started");

        let wake_fd = self.waker.as_raw_fd();
        let mut events = Vec::new();
        loop {
            if let Err(err) = self.poller.wait(&mut events) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.die(err);
            }

            for &(fd, ev) in &events {
                if fd == wake_fd {
                    if let Err(err) = self.waker.reset() {
                        self.die(err);
                    }
                    continue;
                }
                // The strong reference resolved here is the only thing
                // keeping the handler alive during the call. It must be gone
                // before the table lock is taken again: dropping the last
                // reference runs handler drop code which may unregister and
                // take the lock itself.
                let handler = self
                    .handlers
                    .lock()
                    .expect("handler table lock poisoned")
                    .resolve(fd);
                if let Some(handler) = handler {
                    handler.handle_events(ev);
                }
            }

            self.drain_tasks();

            if self.stopping.load(Ordering::SeqCst) {
                let live = self
                    .handlers
                    .lock()
                    .expect("handler table lock poisoned")
                    .live;
                if live == 0 {
                    break;
                }
            }
        }

        // Anything enqueued between the final drain and the loop exit will
        // never run; dropping it settles the tickets with `Stopped`.
        self.tasks.lock().expect("task queue lock poisoned").clear();

        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "dispatch thread finished");
    }

    /// Executes pending deferred functions in submission order, repeating the
    /// swap-and-drain until the queue is observed empty: a function may
    /// itself submit more work, which must not be left behind in the window
    /// between a swap and a fresh submission.
    fn drain_tasks(&self) {
        loop {
            let batch = {
                let mut tasks = self.tasks.lock().expect("task queue lock poisoned");
                if tasks.is_empty() {
                    break;
                }
                mem::take(&mut *tasks)
            };
            #[cfg(feature = "log")]
            log::trace!(target: "reactor", "executing {} deferred functions", batch.len());
            for task in batch {
                // Consuming the call releases the captured state before the
                // next function runs.
                task();
            }
        }
    }

    /// A failed wait on the readiness facility is a programming or OS bug
    /// with no recovery path. Outstanding tickets are settled before the
    /// thread goes down so that submitters do not block forever; the panic
    /// is surfaced through [`Reactor::join`].
    fn die(&self, err: io::Error) -> ! {
        self.tasks.lock().expect("task queue lock poisoned").clear();
        #[cfg(feature = "log")]
        log::error!(target: "reactor", "readiness wait failed: {err}");
        panic!("reactor readiness wait failed: {err}");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        debug_assert!(
            self.thread
                .lock()
                .expect("reactor thread lock poisoned")
                .is_none(),
            "reactor dropped before join() has completed"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        s!("non-string panic payload")
    }
}
