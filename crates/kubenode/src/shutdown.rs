//! Cooperative shutdown of reconciler tasks.
use tokio::sync::watch;

/// Creates a linked trigger and signal.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger(sender), Shutdown(receiver))
}

/// Requests every linked [`Shutdown`] to fire.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    /// Fires the signal. Firing twice is harmless.
    pub fn trigger(&self) {
        // Fails only when every signal is gone already.
        let _ = self.0.send(true);
    }
}

/// Signal observed by reconcilers. Clone it for every task.
///
/// A dropped [`ShutdownTrigger`] counts as a shutdown request.
#[derive(Clone, Debug)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    /// Whether shutdown was requested.
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is requested. Cancel safe.
    pub async fn wait(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}
