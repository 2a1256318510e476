use tokio::task::JoinHandle;

// Wrapper around a join handle, which aborts the task when dropped.
#[derive(Debug)]
pub(crate) struct DroppableHandle<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for DroppableHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
