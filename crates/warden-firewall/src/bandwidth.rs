//! Bandwidth accounting
//!
//! Applies per-connection byte samples from the OS integration and
//! forwards them to the external accounting channel. Backpressure never
//! blocks packet processing: when the channel is full, the remainder of
//! the current batch is dropped with a warning.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use warden_conntrack::{BandwidthSample, ConnectionTracker};

/// Run until the sample stream closes or shutdown is signalled
pub async fn run_bandwidth_accounting(
    tracker: Arc<ConnectionTracker>,
    mut samples: mpsc::Receiver<BandwidthSample>,
    sink: mpsc::Sender<BandwidthSample>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let first = tokio::select! {
            sample = samples.recv() => match sample {
                Some(sample) => sample,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        // drain whatever arrived with the first sample into one batch
        let mut batch = vec![first];
        while let Ok(sample) = samples.try_recv() {
            batch.push(sample);
        }

        let mut forwarded = 0usize;
        let total = batch.len();
        let mut sink_full = false;
        for sample in batch {
            if let Some(conn) = tracker.get(&sample.fingerprint) {
                conn.apply_bandwidth(&sample);
            }
            if sink_full {
                continue;
            }
            match sink.try_send(sample) {
                Ok(()) => forwarded += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sink_full = true;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    sink_full = true;
                }
            }
        }
        if sink_full {
            tracing::warn!(
                forwarded,
                dropped = total - forwarded,
                "bandwidth channel full, dropping rest of batch"
            );
        }
    }
}
