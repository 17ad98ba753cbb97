pub mod deletion;
pub mod facade;
pub mod journal;
pub mod memory;
pub mod sql;

pub use burrow_core::{
    BatchItem, ErrorKind, ReadRepository, Repository, Result, ShortCode, ShortenedItem,
    Statistics, StorageError, UrlRecord,
};
pub use deletion::{BatchDeleter, DeletionPipeline, PipelineSettings, PipelineState};
pub use facade::{open, Backend, StorageConfig};
pub use journal::{FileRepository, JournalEntry, ReplayReport};
pub use memory::InMemoryRepository;
pub use sql::SqlRepository;
