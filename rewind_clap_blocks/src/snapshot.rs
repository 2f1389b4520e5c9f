//! Config for snapshot creation and retention.

use rewind_snapshot::{RetentionConfig, SnapshotConfig};

#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct SnapshotArgs {
    /// Writes touching more records than this always take a pre-operation snapshot first.
    #[clap(
        long = "bulk-threshold",
        env = "REWIND_BULK_THRESHOLD",
        default_value = "100",
        action
    )]
    pub bulk_threshold: usize,

    /// A session that took a pre-operation snapshot more recently than this does not take
    /// another one before a small write.
    #[clap(
        long = "session-snapshot-max-age",
        env = "REWIND_SESSION_SNAPSHOT_MAX_AGE",
        default_value = "1h",
        action
    )]
    pub session_snapshot_max_age: humantime::Duration,

    /// How long snapshots and archived WAL remain restorable. Tenants may override this.
    #[clap(
        long = "retention-window",
        env = "REWIND_RETENTION_WINDOW",
        default_value = "30d",
        action
    )]
    pub retention_window: humantime::Duration,

    /// The most recent ready snapshots of a tenant that are never expired, however old.
    #[clap(
        long = "min-preserved-snapshots",
        env = "REWIND_MIN_PRESERVED_SNAPSHOTS",
        default_value = "3",
        action
    )]
    pub min_preserved_snapshots: usize,

    /// How often the retention sweep runs.
    #[clap(
        long = "retention-interval",
        env = "REWIND_RETENTION_INTERVAL",
        default_value = "1h",
        action
    )]
    pub retention_interval: humantime::Duration,
}

impl SnapshotArgs {
    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            bulk_threshold: self.bulk_threshold,
            session_snapshot_max_age: self.session_snapshot_max_age.into(),
            retention_window: self.retention_window.into(),
        }
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            interval: self.retention_interval.into(),
            retention_window: self.retention_window.into(),
            min_preserved: self.min_preserved_snapshots,
        }
    }
}
