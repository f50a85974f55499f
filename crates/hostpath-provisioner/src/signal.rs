//! Stop signals shared between the supervisor, the elector and the reconciler.
use tokio::sync::watch;

/// Creates a connected trigger and signal.
pub fn stop_channel() -> (StopTrigger, StopSignal) {
    let (sender, receiver) = watch::channel(false);
    (StopTrigger(sender), StopSignal(receiver))
}

/// Fires the paired [`StopSignal`]s.
///
/// Dropping the trigger also counts as stopping.
#[derive(Debug)]
pub struct StopTrigger(watch::Sender<bool>);

impl StopTrigger {
    /// Tells everything holding a paired signal to stop.
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

/// Observes a [`StopTrigger`]. Cheap to clone.
#[derive(Clone, Debug)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// Returns true if the trigger has fired.
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once the trigger fires or is dropped.
    pub async fn stopped(&self) {
        let mut receiver = self.0.clone();
        loop {
            if *receiver.borrow() {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}
