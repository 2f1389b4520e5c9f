//! Config for the object store holding archived WAL segments and catalog checkpoints.

use std::{fs, path::PathBuf, sync::Arc};

use object_store::{ObjectStore, local::LocalFileSystem, memory::InMemory};
use observability_deps::tracing::{info, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unable to create data directory {path:?}: {source}")]
    CreatingDataDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to use {path:?} as a file object store: {source}")]
    LocalFileSystem {
        path: PathBuf,
        source: object_store::Error,
    },

    #[error("the {object_store:?} object store requires --{missing}")]
    MissingObjectStoreConfig {
        object_store: ObjectStoreType,
        missing: &'static str,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum ObjectStoreType {
    /// In-memory. Everything archived is lost when the process exits.
    Memory,

    /// Local filesystem, rooted at `--data-dir`.
    File,
}

#[derive(Debug, Clone, clap::Parser)]
pub struct ObjectStoreArgs {
    /// Where archived WAL segments and catalog checkpoints are stored.
    ///
    /// * memory: kept in process memory, for trying things out.
    /// * file: the local filesystem. Must also set `--data-dir`.
    #[clap(
        value_enum,
        long = "object-store",
        env = "REWIND_OBJECT_STORE",
        default_value = "memory",
        ignore_case = true,
        action
    )]
    pub object_store: ObjectStoreType,

    /// Root directory of the `file` object store. Created if missing.
    #[clap(long = "data-dir", env = "REWIND_DATA_DIR", action)]
    pub data_dir: Option<PathBuf>,
}

impl ObjectStoreArgs {
    pub fn make_object_store(&self) -> Result<Arc<dyn ObjectStore>, ParseError> {
        if let Some(data_dir) = &self.data_dir {
            if self.object_store != ObjectStoreType::File {
                warn!(
                    ?data_dir,
                    object_store_type = ?self.object_store,
                    "--data-dir ignored, it only affects the file object store"
                );
            }
        }

        match self.object_store {
            ObjectStoreType::Memory => {
                info!(object_store_type = "memory", "object store");
                Ok(Arc::new(InMemory::new()))
            }
            ObjectStoreType::File => {
                let Some(path) = &self.data_dir else {
                    return Err(ParseError::MissingObjectStoreConfig {
                        object_store: ObjectStoreType::File,
                        missing: "data-dir",
                    });
                };
                fs::create_dir_all(path).map_err(|source| ParseError::CreatingDataDirectory {
                    path: path.clone(),
                    source,
                })?;
                let store = LocalFileSystem::new_with_prefix(path)
                    .map_err(|source| ParseError::LocalFileSystem {
                        path: path.clone(),
                        source,
                    })?
                    .with_automatic_cleanup(true);
                info!(object_store_type = "file", ?path, "object store");
                Ok(Arc::new(store))
            }
        }
    }
}
