use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::flow::tracker::Tracker;
use crate::flow::ConnectionKey;

/// Per-flow byte deltas produced by a supplementary event source.
#[derive(Debug, Clone, Copy)]
pub struct TraceRecord {
    pub key: ConnectionKey,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Supplementary best-effort producer of per-flow byte deltas (kernel
/// event trace, packet capture).
///
/// Session setup and raw event parsing live with the source; the core only
/// consumes `TraceRecord`s. A source that cannot start (commonly a missing
/// privilege) returns an error from `start` and the agent degrades to
/// polling-only operation.
pub trait TraceSource: Send {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Begins producing records into `tx` until `cancel` fires.
    fn start(&mut self, tx: mpsc::Sender<TraceRecord>, cancel: CancellationToken) -> Result<()>;
}

/// Statistics from a finished ingest task.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestTotals {
    pub applied: u64,
    /// Records for flows the tracker does not know; liveness is owned by
    /// the snapshot path, so these are dropped.
    pub unmatched: u64,
}

/// Spawns the task feeding trace records into the tracker.
///
/// Returns a handle resolving to ingest totals once the channel closes or
/// `cancel` fires.
pub fn spawn_ingest(
    tracker: Arc<Tracker>,
    mut rx: mpsc::Receiver<TraceRecord>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<IngestTotals> {
    tokio::spawn(async move {
        let mut totals = IngestTotals::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                record = rx.recv() => {
                    let Some(record) = record else { break };

                    if tracker.record_delta(&record.key, record.bytes_sent, record.bytes_received) {
                        totals.applied += 1;
                    } else {
                        totals.unmatched += 1;
                    }
                }
            }
        }

        if totals.unmatched > 0 {
            debug!(
                applied = totals.applied,
                unmatched = totals.unmatched,
                "trace ingest finished",
            );
        } else {
            info!(applied = totals.applied, "trace ingest finished");
        }

        totals
    })
}
