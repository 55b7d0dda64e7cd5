use std::sync::Arc;

use tokio::sync::watch;

/// Receiver side of the shutdown signal.
///
/// Workers select on [`watch::Receiver::changed`] while idle and poll
/// [`watch::Receiver::has_changed`] between batches.
pub type ShutdownRx = watch::Receiver<()>;

/// Sender side of the shutdown signal, shared by everything allowed to stop the workers.
#[derive(Debug, Clone)]
pub struct ShutdownTx(Arc<watch::Sender<()>>);

impl ShutdownTx {
    /// Signals every subscribed worker to stop after its in-flight batch.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    /// Returns a new receiver that has not observed any shutdown yet.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Creates a shutdown channel.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(Arc::new(tx)), rx)
}

/// Returns whether shutdown was requested, treating a dropped sender as a request.
pub fn is_shutdown_requested(shutdown_rx: &ShutdownRx) -> bool {
    shutdown_rx.has_changed().unwrap_or(true)
}
