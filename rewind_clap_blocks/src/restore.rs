//! Config for tenant restores.

use rewind_restore::RestoreConfig;

#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct RestoreArgs {
    /// A restore still running after this long is abandoned and the tenant is left locked in
    /// the failed state for an operator to inspect.
    #[clap(
        long = "restore-max-duration",
        env = "REWIND_RESTORE_MAX_DURATION",
        default_value = "4h",
        action
    )]
    pub restore_max_duration: humantime::Duration,
}

impl From<RestoreArgs> for RestoreConfig {
    fn from(args: RestoreArgs) -> Self {
        Self {
            max_duration: args.restore_max_duration.into(),
        }
    }
}
