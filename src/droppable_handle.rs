use tokio::task::JoinHandle;
use tracing::debug;

// A background worker tied to the lifetime of the thing it serves: a session
// channel pump, or the acceptor behind a public listener. Dropping the guard
// aborts the task, so releasing a tunnel or tearing down a session also
// stops its workers and closes the sockets they own.
#[derive(Debug)]
pub(crate) struct DroppableHandle<T> {
    handle: JoinHandle<T>,
    // What the task serves, for teardown logs.
    label: String,
}

impl<T> DroppableHandle<T> {
    pub(crate) fn new(handle: JoinHandle<T>, label: impl Into<String>) -> Self {
        DroppableHandle {
            handle,
            label: label.into(),
        }
    }
}

impl<T> Drop for DroppableHandle<T> {
    fn drop(&mut self) {
        if !self.handle.is_finished() {
            debug!(task = %self.label, "Aborting background task.");
        }
        self.handle.abort();
    }
}
