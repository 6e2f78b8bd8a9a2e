//! Change notification streams.
//!
//! A watch delivers batches of machine ids whose relevant state changed.
//! Stream items are tagged results: an `Err` item means the watch source
//! itself failed, which is fatal to the consumer. A plainly closed
//! channel means the source shut down cleanly.

use std::collections::BTreeSet;

use convoy_id::MachineId;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure of the watch source itself (not of any watched machine).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("watch source failed: {0}")]
pub struct WatchError(pub String);

/// One notification: the set of machine ids that changed.
pub type WatchBatch = Result<BTreeSet<MachineId>, WatchError>;

/// Receiving end of a machine watch.
#[derive(Debug)]
pub struct MachineWatch {
    rx: mpsc::UnboundedReceiver<WatchBatch>,
}

impl MachineWatch {
    /// Creates a connected sender/watch pair.
    #[must_use]
    pub fn channel() -> (mpsc::UnboundedSender<WatchBatch>, MachineWatch) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, MachineWatch { rx })
    }

    /// Receives the next batch. `None` means the source closed down
    /// cleanly.
    pub async fn recv(&mut self) -> Option<WatchBatch> {
        self.rx.recv().await
    }
}
