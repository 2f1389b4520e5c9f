//! Config for the WAL archivers.

use rewind_wal::{ArchiverConfig, is_valid_segment_size};

#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct ArchiverArgs {
    /// Force a WAL segment switch when nothing was archived for this long, which bounds how much
    /// committed data a lost database server can take with it.
    #[clap(
        long = "archive-timeout",
        env = "REWIND_ARCHIVE_TIMEOUT",
        default_value = "5m",
        action
    )]
    pub archive_timeout: humantime::Duration,

    /// How often each tenant's WAL is checked for completed segments.
    #[clap(
        long = "archive-poll-interval",
        env = "REWIND_ARCHIVE_POLL_INTERVAL",
        default_value = "1s",
        action
    )]
    pub archive_poll_interval: humantime::Duration,

    /// Delay before the first retry of a failed segment upload. Doubles on every further attempt.
    #[clap(
        long = "archive-initial-backoff",
        env = "REWIND_ARCHIVE_INITIAL_BACKOFF",
        default_value = "100ms",
        action
    )]
    pub archive_initial_backoff: humantime::Duration,

    #[clap(
        long = "archive-max-backoff",
        env = "REWIND_ARCHIVE_MAX_BACKOFF",
        default_value = "60s",
        action
    )]
    pub archive_max_backoff: humantime::Duration,

    /// Number of failed attempts on a single segment before an operator alert is raised. The
    /// alert repeats every this many attempts while the segment keeps failing.
    #[clap(
        long = "archive-alert-after-attempts",
        env = "REWIND_ARCHIVE_ALERT_AFTER_ATTEMPTS",
        default_value = "10",
        action
    )]
    pub archive_alert_after_attempts: u32,

    /// Size of a WAL segment in bytes, as the database was initialised with. Must be a power of
    /// two from 1 MiB to 1 GiB.
    #[clap(
        long = "wal-segment-size",
        env = "REWIND_WAL_SEGMENT_SIZE",
        default_value = "16777216",
        value_parser = parse_segment_size,
        action
    )]
    pub wal_segment_size: u64,
}

fn parse_segment_size(s: &str) -> Result<u64, String> {
    let size: u64 = s.parse().map_err(|e| format!("{e}"))?;
    if !is_valid_segment_size(size) {
        return Err(format!(
            "{size} is not a WAL segment size, expected a power of two from 1 MiB to 1 GiB"
        ));
    }
    Ok(size)
}

impl From<&ArchiverArgs> for ArchiverConfig {
    fn from(args: &ArchiverArgs) -> Self {
        Self {
            archive_timeout: args.archive_timeout.into(),
            poll_interval: args.archive_poll_interval.into(),
            initial_backoff: args.archive_initial_backoff.into(),
            max_backoff: args.archive_max_backoff.into(),
            alert_after_attempts: args.archive_alert_after_attempts,
            segment_size: args.wal_segment_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_archiver_config() {
        let args = ArchiverArgs::parse_from(["rewind"]);
        assert_eq!(ArchiverConfig::from(&args), ArchiverConfig::default());
    }

    #[test]
    fn durations_use_humantime() {
        let args = ArchiverArgs::parse_from([
            "rewind",
            "--archive-timeout",
            "90s",
            "--archive-max-backoff",
            "2m 30s",
        ]);
        let config = ArchiverConfig::from(&args);
        assert_eq!(config.archive_timeout.as_secs(), 90);
        assert_eq!(config.max_backoff.as_secs(), 150);

        assert!(ArchiverArgs::try_parse_from(["rewind", "--archive-timeout", "soon"]).is_err());
    }

    #[test]
    fn segment_size_must_be_a_power_of_two() {
        let args = ArchiverArgs::parse_from(["rewind", "--wal-segment-size", "67108864"]);
        assert_eq!(ArchiverConfig::from(&args).segment_size, 64 * 1024 * 1024);

        for size in ["0", "1000", "3145728", "-1", "big"] {
            assert!(
                ArchiverArgs::try_parse_from(["rewind", "--wal-segment-size", size]).is_err(),
                "{size}"
            );
        }
    }
}
