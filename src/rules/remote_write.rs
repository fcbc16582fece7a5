use tracing::info;

use crate::rules::alerts_error::AlertsResult;
use crate::rules::types::{labels_to_string, RawTimeSeries};

/// RemoteWriteClient is the contract of the remote-write sink: accept one
/// time series per call. Queueing, batching and transport are the
/// implementation's concern.
pub trait RemoteWriteClient: Send + Sync {
    /// push adds the timeseries into the write queue. Returns an error if the
    /// client is stopped or the queue is full.
    fn push(&self, ts: RawTimeSeries) -> AlertsResult<()>;
}

/// DebugClient logs the series it receives instead of sending them anywhere.
#[derive(Debug, Default)]
pub struct DebugClient;

impl RemoteWriteClient for DebugClient {
    fn push(&self, ts: RawTimeSeries) -> AlertsResult<()> {
        for sample in &ts.samples {
            info!(
                "remote write: {} {} {}",
                labels_to_string(&ts.labels),
                sample.value,
                sample.timestamp
            );
        }
        Ok(())
    }
}
