use crate::deletion::PipelineSettings;
use crate::journal::FileRepository;
use crate::memory::InMemoryRepository;
use crate::sql::SqlRepository;
use burrow_core::{Repository, Result};
use burrow_generator::Generator;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use typed_builder::TypedBuilder;

/// Which backend [`open`] will build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    File,
    Database,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Memory => "memory",
            Backend::File => "file",
            Backend::Database => "database",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct StorageConfig {
    #[builder(default, setter(strip_option, into))]
    pub file_path: Option<PathBuf>,
    #[builder(default, setter(strip_option, into))]
    pub database_dsn: Option<String>,
    #[builder(default)]
    pub pipeline: PipelineSettings,
}

impl StorageConfig {
    /// A DSN wins over a file path; with neither, storage stays in memory.
    pub fn backend(&self) -> Backend {
        if self.dsn().is_some() {
            Backend::Database
        } else if self.path().is_some() {
            Backend::File
        } else {
            Backend::Memory
        }
    }

    fn dsn(&self) -> Option<&str> {
        self.database_dsn.as_deref().filter(|dsn| !dsn.trim().is_empty())
    }

    fn path(&self) -> Option<&PathBuf> {
        self.file_path
            .as_ref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

/// Builds the configured backend.
///
/// The deletion pipeline of a durable backend runs on a child of `shutdown`,
/// so cancelling it stops background work for every store opened from it.
pub async fn open(
    config: &StorageConfig,
    generator: Arc<dyn Generator>,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn Repository>> {
    let memory = InMemoryRepository::new(generator);
    let backend = config.backend();

    let repository: Arc<dyn Repository> = match (config.dsn(), config.path()) {
        (Some(dsn), _) => Arc::new(
            SqlRepository::connect(dsn, memory, config.pipeline, shutdown.child_token()).await?,
        ),
        (None, Some(path)) => Arc::new(
            FileRepository::open(path, memory, config.pipeline, shutdown.child_token()).await?,
        ),
        (None, None) => Arc::new(memory),
    };

    info!(%backend, "storage opened");
    Ok(repository)
}
