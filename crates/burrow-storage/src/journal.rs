use crate::deletion::{BatchDeleter, DeletionPipeline, PipelineSettings};
use crate::memory::InMemoryRepository;
use async_trait::async_trait;
use burrow_core::{
    BatchItem, ReadRepository, Repository, Result, ShortCode, ShortenedItem, Statistics,
    StorageError, UrlRecord,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// One line of the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    #[serde(default)]
    pub short_url: String,
    #[serde(default)]
    pub long_url: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default)]
    pub user_id: String,
}

impl JournalEntry {
    pub fn new(code: &ShortCode, record: &UrlRecord) -> Self {
        Self {
            short_url: code.to_string(),
            long_url: record.original_url.clone(),
            deleted: record.deleted,
            user_id: record.owner.clone(),
        }
    }

    fn into_record(self) -> Result<(ShortCode, UrlRecord)> {
        if self.long_url.is_empty() {
            return Err(StorageError::InvalidData("missing long_url".to_string()));
        }
        let code = ShortCode::new(self.short_url)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;
        Ok((
            code,
            UrlRecord {
                original_url: self.long_url,
                owner: self.user_id,
                deleted: self.deleted,
            },
        ))
    }
}

/// A journal line that could not be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    /// 1-based line number in the journal file.
    pub line: usize,
    pub reason: String,
}

/// Outcome of replaying a journal on open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: usize,
    pub skipped: Vec<SkippedLine>,
}

struct Journal<W = File> {
    path: PathBuf,
    tail: Mutex<Option<Tail<W>>>,
}

struct Tail<W> {
    writer: W,
    /// Length of the file up to the last acknowledged append.
    len: u64,
}

impl Journal {
    /// Opens the journal for appending, creating it if needed, and replays it.
    async fn open(path: &Path, memory: &InMemoryRepository) -> Result<(Self, ReplayReport)> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let content = tokio::fs::read(path).await?;
        let report = replay(&content, memory);
        let mut len = content.len() as u64;
        // A torn last line must not swallow the next append.
        if content.last().is_some_and(|byte| *byte != b'\n') {
            file.write_all(b"\n").await?;
            file.flush().await?;
            len += 1;
        }

        let journal = Self {
            path: path.to_path_buf(),
            tail: Mutex::new(Some(Tail { writer: file, len })),
        };
        Ok((journal, report))
    }
}

impl<W: AsyncWrite + Unpin + Send> Journal<W> {
    /// Locks the journal for one append. Writers queue on this lock.
    async fn lock(&self) -> Result<Appender<'_, W>> {
        let tail = self.tail.lock().await;
        if tail.is_none() {
            return Err(StorageError::Unavailable(format!(
                "journal {} is closed",
                self.path.display()
            )));
        }
        Ok(Appender {
            path: &self.path,
            tail,
        })
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut tail) = self.tail.lock().await.take() {
            tail.writer.flush().await?;
            tail.writer.shutdown().await?;
        }
        Ok(())
    }
}

/// Exclusive access to the end of the journal.
struct Appender<'a, W> {
    path: &'a Path,
    tail: MutexGuard<'a, Option<Tail<W>>>,
}

impl<W: AsyncWrite + Unpin + Send> Appender<'_, W> {
    /// Writes every entry or none of them.
    ///
    /// A failed write closes the journal and cuts the file back to its last
    /// acknowledged length, so a rejected batch can never be replayed.
    async fn append(&mut self, entries: &[JournalEntry]) -> Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)
                .map_err(|e| StorageError::InvalidData(e.to_string()))?;
            buf.push(b'\n');
        }

        let Some(tail) = self.tail.as_mut() else {
            return Err(StorageError::Unavailable(format!(
                "journal {} is closed",
                self.path.display()
            )));
        };
        let written = async {
            tail.writer.write_all(&buf).await?;
            tail.writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                tail.len += buf.len() as u64;
                Ok(())
            }
            Err(err) => {
                error!(
                    path = %self.path.display(),
                    error = %err,
                    "journal append failed, closing journal"
                );
                if let Some(mut failed) = self.tail.take() {
                    // Let any write still in flight settle before cutting it off.
                    let _ = failed.writer.flush().await;
                    drop(failed.writer);
                    if let Err(cut) = truncate(self.path, failed.len).await {
                        error!(
                            path = %self.path.display(),
                            error = %cut,
                            "failed to truncate journal"
                        );
                    }
                }
                Err(err.into())
            }
        }
    }
}

async fn truncate(path: &Path, len: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await
}

fn replay(content: &[u8], memory: &InMemoryRepository) -> ReplayReport {
    let mut report = ReplayReport::default();
    for (index, line) in content.split(|byte| *byte == b'\n').enumerate() {
        if line.trim_ascii().is_empty() {
            continue;
        }
        let restored = serde_json::from_slice::<JournalEntry>(line)
            .map_err(|e| StorageError::InvalidData(e.to_string()))
            .and_then(JournalEntry::into_record);
        match restored {
            Ok((code, record)) => {
                memory.restore(code, record);
                report.applied += 1;
            }
            Err(err) => {
                warn!(line = index + 1, error = %err, "skipping unreadable journal line");
                report.skipped.push(SkippedLine {
                    line: index + 1,
                    reason: err.to_string(),
                });
            }
        }
    }
    report
}

struct JournalDeleter {
    memory: Arc<InMemoryRepository>,
    journal: Arc<Journal>,
}

#[async_trait]
impl BatchDeleter for JournalDeleter {
    async fn delete_batch(&self, codes: &[ShortCode]) -> Result<()> {
        let mut appender = self.journal.lock().await?;
        let markers: Vec<JournalEntry> = codes
            .iter()
            .filter_map(|code| {
                let record = self.memory.get(code).ok()?;
                Some(JournalEntry::new(
                    code,
                    &UrlRecord {
                        deleted: true,
                        ..record
                    },
                ))
            })
            .collect();
        appender.append(&markers).await?;
        let marked = self.memory.mark_deleted(codes);
        debug!(count = marked, path = %self.journal.path.display(), "delete markers appended");
        Ok(())
    }
}

/// Durable store backed by an append-only JSON Lines journal.
///
/// Every mapping lives in memory; the journal is replayed on open and
/// appended to on every write. Deleted mappings are recorded as a second line
/// for the same code with `"deleted": true`.
pub struct FileRepository {
    memory: Arc<InMemoryRepository>,
    journal: Arc<Journal>,
    pipeline: DeletionPipeline,
    report: ReplayReport,
}

impl FileRepository {
    pub async fn open(
        path: impl AsRef<Path>,
        memory: InMemoryRepository,
        settings: PipelineSettings,
        token: CancellationToken,
    ) -> Result<Self> {
        let path = path.as_ref();
        let memory = Arc::new(memory);
        let (journal, report) = Journal::open(path, &memory).await?;
        info!(
            path = %path.display(),
            applied = report.applied,
            skipped = report.skipped.len(),
            "journal replayed"
        );

        let journal = Arc::new(journal);
        let deleter = Arc::new(JournalDeleter {
            memory: memory.clone(),
            journal: journal.clone(),
        });
        let pipeline = DeletionPipeline::spawn(deleter, settings, token);

        Ok(Self {
            memory,
            journal,
            pipeline,
            report,
        })
    }

    pub fn path(&self) -> &Path {
        &self.journal.path
    }

    pub fn replay_report(&self) -> &ReplayReport {
        &self.report
    }

    pub fn pipeline(&self) -> &DeletionPipeline {
        &self.pipeline
    }

    /// Waits until every accepted deletion has been written.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn flush_deletions(&self) {
        self.pipeline.flush().await;
    }
}

#[async_trait]
impl ReadRepository for FileRepository {
    async fn find_url(&self, code: &ShortCode) -> Result<UrlRecord> {
        trace!(code = %code, "journal store lookup");
        self.memory.get(code)
    }

    async fn urls_by_user(&self, user: &str) -> Vec<ShortCode> {
        self.memory.codes_for(user)
    }

    async fn statistics(&self) -> Statistics {
        self.memory.stats()
    }
}

#[async_trait]
impl Repository for FileRepository {
    async fn add_url(&self, original_url: &str, user: &str) -> Result<ShortCode> {
        self.add_urls(
            vec![BatchItem {
                correlation_id: String::new(),
                original_url: original_url.to_string(),
            }],
            user,
        )
        .await?
        .pop()
        .map(|item| item.code)
        .ok_or_else(|| StorageError::InvalidData("empty batch result".to_string()))
    }

    async fn add_urls(&self, batch: Vec<BatchItem>, user: &str) -> Result<Vec<ShortenedItem>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut appender = self.journal.lock().await?;
        let codes = self.memory.draft(batch.len())?;

        let mut staged = Vec::with_capacity(batch.len());
        let mut shortened = Vec::with_capacity(batch.len());
        for (code, item) in codes.into_iter().zip(batch) {
            staged.push((code.clone(), UrlRecord::new(item.original_url, user)));
            shortened.push(ShortenedItem {
                correlation_id: item.correlation_id,
                code,
            });
        }

        let entries: Vec<JournalEntry> = staged
            .iter()
            .map(|(code, record)| JournalEntry::new(code, record))
            .collect();
        appender.append(&entries).await?;
        self.memory.commit(staged)?;

        debug!(count = shortened.len(), user, "short urls appended to journal");
        Ok(shortened)
    }

    async fn delete_urls(&self, codes: &[ShortCode], user: &str) -> Vec<ShortCode> {
        let accepted = self.memory.accept_deletions(codes, user);
        debug!(count = accepted.len(), user, "deletions accepted");
        self.pipeline.submit(accepted.clone());
        accepted
    }

    async fn ping(&self) -> Result<()> {
        Err(StorageError::Unavailable(format!(
            "no database configured, using journal {}",
            self.journal.path.display()
        )))
    }

    async fn close(&self) {
        self.pipeline.shutdown().await;
        if let Err(err) = self.journal.close().await {
            warn!(path = %self.journal.path.display(), error = %err, "failed to close journal");
        }
        info!(path = %self.journal.path.display(), "journal store closed");
    }
}
