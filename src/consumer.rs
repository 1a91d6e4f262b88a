//! Periodic consumer that drains the ingestion queue.
//!
//! Runs on a fixed period: each tick fully drains the queue (loop until
//! empty, never pop-one), persists every reading, then refreshes the display
//! sink with the most recent rows. The interactive layer never sees errors
//! from the network path; it only observes the records this task applied.

use crate::ingest::ReadingReceiver;
use crate::protocol::Measurement;
use crate::storage::{Record, Store};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, trace};

/// Presentation-layer collaborator refreshed after every drain.
pub trait DisplaySink: Send {
    /// Called once per drain with the most recent records, oldest first.
    fn refresh(&mut self, recent: &[Record]);
}

/// Default sink: logs the newest values, standing in for the numeric
/// displays of a graphical front end.
pub struct LatestValueLog;

impl DisplaySink for LatestValueLog {
    fn refresh(&mut self, recent: &[Record]) {
        let Some(record) = recent.last() else { return };
        match record.measurement {
            Measurement::Raw {
                temperature,
                humidity,
            } => {
                info!(
                    timestamp = %record.timestamp_display(),
                    temperature,
                    humidity,
                    "Latest reading"
                );
            }
            Measurement::Aggregate(stats) => {
                info!(
                    timestamp = %record.timestamp_display(),
                    temp_avg = stats.temp_avg,
                    temp_max = stats.temp_max,
                    temp_min = stats.temp_min,
                    hum_avg = stats.hum_avg,
                    hum_max = stats.hum_max,
                    hum_min = stats.hum_min,
                    "Latest window statistics"
                );
            }
        }
    }
}

/// Drain the queue once: persist every queued reading in order, then refresh
/// the sink with the most recent rows. Returns how many readings were
/// persisted.
pub fn drain_and_apply(
    rx: &mut ReadingReceiver,
    store: &Store,
    sink: &mut dyn DisplaySink,
    recent_limit: usize,
) -> usize {
    let batch = rx.drain();
    let count = batch.len();

    for reading in batch {
        store.append(reading);
    }

    sink.refresh(&store.fetch_recent(recent_limit));
    count
}

/// Run the consumer until the shutdown signal flips.
///
/// Performs one final drain on the way out so readings accepted before the
/// stop are still persisted.
pub async fn run(
    mut rx: ReadingReceiver,
    store: Arc<Store>,
    mut sink: impl DisplaySink,
    period: Duration,
    recent_limit: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(period);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let count = drain_and_apply(&mut rx, &store, &mut sink, recent_limit);
                if count > 0 {
                    debug!(count, total = store.len(), "Readings persisted");
                }
            }
        }
    }

    let count = drain_and_apply(&mut rx, &store, &mut sink, recent_limit);
    if count > 0 {
        debug!(count, "Readings persisted during shutdown drain");
    }
    trace!("Consumer exited");
}
