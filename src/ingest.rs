//! Ingestion queue between connection handlers and the consumer.
//!
//! A bounded hand-off channel that decouples socket I/O from downstream
//! processing. Producers apply backpressure when the queue is full; the
//! consumer drains every available reading in one non-blocking pass, so no
//! backlog accumulates between ticks.

use crate::protocol::Reading;
use tokio::sync::mpsc;

/// The consumer half of the queue is gone; the producing connection should
/// shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ingestion queue closed")
    }
}

impl std::error::Error for QueueClosed {}

/// Producer half, cloned into each connection handler.
#[derive(Clone)]
pub struct ReadingSender(mpsc::Sender<Reading>);

impl ReadingSender {
    /// Enqueue one reading.
    ///
    /// A full queue briefly blocks the caller until the consumer makes room;
    /// readings are never silently dropped on overflow.
    pub async fn send(&self, reading: Reading) -> Result<(), QueueClosed> {
        self.0.send(reading).await.map_err(|_| QueueClosed)
    }
}

/// Consumer half, owned by the periodic drain task.
pub struct ReadingReceiver(mpsc::Receiver<Reading>);

impl ReadingReceiver {
    /// Drain every reading currently queued, in enqueue order, without
    /// blocking for more.
    pub fn drain(&mut self) -> Vec<Reading> {
        let mut batch = Vec::new();
        while let Ok(reading) = self.0.try_recv() {
            batch.push(reading);
        }
        batch
    }
}

/// Create a bounded ingestion queue.
pub fn queue(capacity: usize) -> (ReadingSender, ReadingReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (ReadingSender(tx), ReadingReceiver(rx))
}
