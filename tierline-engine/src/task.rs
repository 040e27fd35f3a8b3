use tokio::task::JoinHandle;

/// Aborts a background task when dropped, tying it to its owning node.
pub(crate) struct AbortOnDrop(pub(crate) JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
