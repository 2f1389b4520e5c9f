//! Continuous archiving of write-ahead-log segments.
//!
//! A [`WalArchiver`] runs per tenant, outside of any request path. It takes completed segments
//! from a [`WalSource`], gzips them, puts them to `{tenant}/wal/{segment}.gz` in object storage,
//! records them in the tenant's catalog and only then acknowledges them to the database. A segment
//! that cannot be archived is retried with exponential backoff for as long as the archiver runs.

pub mod alert;
pub mod archiver;
pub mod segment;
pub mod source;

pub use alert::{AlertSink, ArchiveAlert, LogAlertSink, RecordingAlertSink};
pub use archiver::{WalArchiver, WalArchiverArgs};
pub use segment::{
    DEFAULT_SEGMENT_SIZE, WalSegment, decompress, is_valid_segment_size, parse_segment_name,
    segment_name,
};
pub use source::{DirectoryWalSource, MemoryWalSource, WalSource};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to list completed WAL segments: {0}")]
    ListSegments(#[source] anyhow::Error),

    #[error("failed to read WAL segment {segment}: {source}")]
    ReadSegment {
        segment: Arc<str>,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to compress WAL segment {segment}: {source}")]
    Compress {
        segment: Arc<str>,
        #[source]
        source: std::io::Error,
    },

    #[error("WAL segment {segment} not archived after {attempts} attempts: {source}")]
    Archive {
        segment: Arc<str>,
        attempts: u32,
        #[source]
        source: object_store::Error,
    },

    #[error("failed to acknowledge WAL segment {segment}: {source}")]
    Acknowledge {
        segment: Arc<str>,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to switch WAL segment: {0}")]
    Switch(#[source] anyhow::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiverConfig {
    /// Force a segment switch when nothing was archived for this long
    #[serde(with = "humantime_serde")]
    pub archive_timeout: Duration,
    /// How often the source is checked for completed segments
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Failed attempts on one segment before an operator alert; repeats every this many attempts
    pub alert_after_attempts: u32,
    pub segment_size: u64,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            archive_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(60),
            alert_after_attempts: 10,
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

impl ArchiverConfig {
    /// Delay before retry number `attempt` (starting at 1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}
