/// Failure of a deferred function, reported through its
/// [`Ticket`](crate::Ticket).
#[derive(Debug, Display, Error, From)]
pub enum TaskError {
    /// The reactor went away before the function has completed; the function
    /// has either never run or its outcome was discarded with the queue.
    #[display("reactor was shut down before the deferred function has completed")]
    Stopped,

    /// The function has returned an error.
    #[display("deferred function has failed: {0}")]
    #[from]
    Failed(Box<dyn std::error::Error + Send>),

    /// The function has panicked; the panic message is preserved.
    #[display("deferred function has panicked: {0}")]
    Panicked(String),
}
