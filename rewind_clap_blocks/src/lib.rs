//! Building blocks for [`clap`]-driven configuration options.
//!
//! Every option has a `REWIND_*` environment variable and durations are parsed with
//! [`humantime`], so `--retention-window 30d` and `REWIND_RETENTION_WINDOW=720h` are equivalent.
//! Each block converts into the config struct of the crate it configures.

pub mod archiver;
pub mod object_store;
pub mod restore;
pub mod server;
pub mod snapshot;

/// Everything a `rewind` process can be configured with
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct RewindConfig {
    #[clap(flatten)]
    pub server: server::ServerConfig,

    #[clap(flatten)]
    pub archiver: archiver::ArchiverArgs,

    #[clap(flatten)]
    pub snapshot: snapshot::SnapshotArgs,

    #[clap(flatten)]
    pub restore: restore::RestoreArgs,
}
