//! The `serve` command: archive every tenant's WAL, run snapshot retention and serve the admin API
//! until the process is signalled to stop.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use iox_time::{SystemProvider, TimeProvider};
use object_store::ObjectStore;
use observability_deps::tracing::{info, warn};
use rewind_catalog::{Catalog, InMemoryTenantDirectory, Tenant, TenantLockManager};
use rewind_clap_blocks::{RewindConfig, object_store::ObjectStoreArgs};
use rewind_id::TenantId;
use rewind_oplog::{MemoryStore, UndoEngine};
use rewind_restore::{MemoryRestoreEngine, RestoreOrchestrator, RestoreOrchestratorArgs};
use rewind_server::{HttpApi, HttpApiArgs};
use rewind_shutdown::{ShutdownManager, wait_for_signal};
use rewind_snapshot::{
    MemorySnapshotEngine, RetentionScheduler, RetentionSchedulerArgs, SnapshotManager,
    SnapshotManagerArgs,
};
use rewind_wal::{ArchiverConfig, DirectoryWalSource, LogAlertSink, WalArchiver, WalArchiverArgs};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use trogging::cli::LoggingConfig;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("cannot configure object store: {0}")]
    ObjectStore(#[from] rewind_clap_blocks::object_store::ParseError),

    #[error("cannot read tenants file {path:?}: {source}")]
    ReadTenants {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse tenants file {path:?}: {source}")]
    ParseTenants {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("tenant {0} is listed more than once")]
    DuplicateTenant(TenantId),

    #[error("failed to load catalog checkpoint: {0}")]
    Catalog(#[from] rewind_catalog::Error),

    #[error("failed to recover interrupted snapshots: {0}")]
    Snapshot(#[from] rewind_snapshot::Error),

    #[error("admin API error: {0}")]
    Server(#[from] rewind_server::Error),

    #[error("admin API task failed: {0}")]
    ServerTask(#[from] tokio::task::JoinError),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) rewind: RewindConfig,

    /// object store options
    #[clap(flatten)]
    pub(crate) object_store: ObjectStoreArgs,

    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    /// JSON file listing the tenants to protect. Each entry has the tenant `id`, its `connection`
    /// string, the `wal_dir` the database writes its WAL to and an optional `retention_window`
    /// overriding `--retention-window`.
    #[clap(long = "tenants-file", env = "REWIND_TENANTS_FILE", action)]
    pub(crate) tenants_file: PathBuf,
}

/// One entry of the tenants file
#[derive(Debug, Deserialize)]
struct TenantEntry {
    #[serde(flatten)]
    tenant: Tenant,
    wal_dir: PathBuf,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        tenants_file = ?config.tenants_file,
        "rewind server starting"
    );

    // Cancelled by the shutdown manager once every background worker has stopped
    let frontend_shutdown = CancellationToken::new();
    let shutdown = ShutdownManager::new(frontend_shutdown.clone());
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
    let object_store = config.object_store.make_object_store()?;

    let api = start(&config, object_store, time_provider, &shutdown).await?;

    let mut server = tokio::spawn(rewind_server::serve(
        api,
        config.rewind.server,
        frontend_shutdown,
    ));
    let stopped_early = tokio::select! {
        res = &mut server => Some(res),
        _ = wait_for_signal() => None,
    };

    shutdown.shutdown();
    shutdown
        .join_with_timeout(config.rewind.server.shutdown_grace_period.into())
        .await;
    let res = match stopped_early {
        Some(res) => res,
        None => server.await,
    };
    res??;

    info!("rewind server stopped");
    Ok(())
}

/// Recover the catalog and start the background workers, returning the admin API to serve.
///
/// Snapshots left `creating` by a previous process are failed before any worker starts.
async fn start(
    config: &Config,
    object_store: Arc<dyn ObjectStore>,
    time_provider: Arc<dyn TimeProvider>,
    shutdown: &ShutdownManager,
) -> Result<Arc<HttpApi>> {
    let entries = read_tenants(&config.tenants_file)?;
    info!(tenants = entries.len(), "loaded tenants");

    let catalog = Arc::new(Catalog::new_with_checkpoints(Arc::clone(&object_store)));
    for entry in &entries {
        if catalog.load(&entry.tenant.id).await? {
            info!(tenant = %entry.tenant.id, "loaded catalog checkpoint");
        }
    }

    warn!(
        "snapshot and restore engines and the record store run in process; \
         snapshots, restores and undo only act on in-memory state"
    );
    let locks = Arc::new(TenantLockManager::new());
    let snapshots = Arc::new(SnapshotManager::new(SnapshotManagerArgs {
        catalog: Arc::clone(&catalog),
        engine: Arc::new(MemorySnapshotEngine::new()),
        locks: Arc::clone(&locks),
        time_provider: Arc::clone(&time_provider),
        config: config.rewind.snapshot.snapshot_config(),
    }));
    for entry in &entries {
        let failed = snapshots.fail_interrupted(&entry.tenant.id).await?;
        if !failed.is_empty() {
            info!(
                tenant = %entry.tenant.id,
                n = failed.len(),
                "failed snapshots interrupted by restart"
            );
        }
    }

    let archiver_config = ArchiverConfig::from(&config.rewind.archiver);
    let mut tenants = Vec::with_capacity(entries.len());
    for TenantEntry { tenant, wal_dir } in entries {
        let archiver = Arc::new(WalArchiver::new(WalArchiverArgs {
            tenant_id: tenant.id.clone(),
            source: Arc::new(DirectoryWalSource::new(
                wal_dir,
                config.rewind.archiver.wal_segment_size,
            )),
            object_store: Arc::clone(&object_store),
            catalog: Arc::clone(&catalog),
            alerts: Arc::new(LogAlertSink),
            time_provider: Arc::clone(&time_provider),
            config: archiver_config,
        }));
        archiver.spawn(shutdown.register("wal_archiver"));
        tenants.push(tenant);
    }

    let directory = Arc::new(InMemoryTenantDirectory::new(tenants));
    let retention = Arc::new(RetentionScheduler::new(RetentionSchedulerArgs {
        manager: Arc::clone(&snapshots),
        catalog: Arc::clone(&catalog),
        object_store,
        directory: Arc::clone(&directory) as _,
        time_provider: Arc::clone(&time_provider),
        config: config.rewind.snapshot.retention_config(),
    }));
    retention.spawn(shutdown.register("retention_scheduler"));

    let restores = Arc::new(RestoreOrchestrator::new(RestoreOrchestratorArgs {
        catalog,
        engine: Arc::new(MemoryRestoreEngine::new()),
        locks: Arc::clone(&locks),
        directory: Arc::clone(&directory) as _,
        time_provider: Arc::clone(&time_provider),
        config: config.rewind.restore.into(),
    }));
    let undo = Arc::new(UndoEngine::new(
        Arc::new(MemoryStore::new()),
        locks,
        time_provider,
    ));

    Ok(Arc::new(HttpApi::new(HttpApiArgs {
        snapshots,
        restores,
        undo,
        directory: directory as _,
    })))
}

fn read_tenants(path: &Path) -> Result<Vec<TenantEntry>> {
    let contents = std::fs::read(path).map_err(|source| Error::ReadTenants {
        path: path.to_path_buf(),
        source,
    })?;
    let entries: Vec<TenantEntry> =
        serde_json::from_slice(&contents).map_err(|source| Error::ParseTenants {
            path: path.to_path_buf(),
            source,
        })?;

    let mut seen = BTreeSet::new();
    for entry in &entries {
        if !seen.insert(&entry.tenant.id) {
            return Err(Error::DuplicateTenant(entry.tenant.id.clone()));
        }
    }
    Ok(entries)
}
