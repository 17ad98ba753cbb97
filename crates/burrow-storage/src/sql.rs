use crate::deletion::{BatchDeleter, DeletionPipeline, PipelineSettings};
use crate::memory::InMemoryRepository;
use async_trait::async_trait;
use burrow_core::{
    BatchItem, ReadRepository, Repository, Result, ShortCode, ShortenedItem, Statistics,
    StorageError, UrlRecord,
};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Connection, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const MAX_CONNECTIONS: u32 = 5;
const SCHEMA: &str = include_str!("../ddl/short_urls.sql");

const INSERT_URL: &str = "INSERT INTO short_urls (short_url, long_url, user_id) VALUES ($1, $2, $3)";
const SELECT_LIVE_BY_URL: &str =
    "SELECT short_url FROM short_urls WHERE long_url = $1 AND deleted = FALSE LIMIT 1";
const SELECT_CODE: &str = "SELECT short_url FROM short_urls WHERE short_url = $1";
const MARK_DELETED: &str = "UPDATE short_urls SET deleted = TRUE WHERE short_url = $1";
// Boolean columns decode differently per driver; read the flag as an integer.
const SELECT_ALL: &str = "SELECT short_url, long_url, user_id, \
    CAST(CASE WHEN deleted THEN 1 ELSE 0 END AS BIGINT) AS deleted_flag FROM short_urls";

/// Durable store backed by a relational database.
///
/// Works with any DSN the sqlx `Any` driver understands; PostgreSQL in
/// production and SQLite for local runs and tests. All rows are loaded into
/// memory on construction. A long URL may have at most one live row; a second
/// live insert is reported as [`StorageError::Duplicate`] carrying the code
/// that already exists.
pub struct SqlRepository {
    memory: Arc<InMemoryRepository>,
    pool: AnyPool,
    write_lock: Arc<Mutex<()>>,
    pipeline: DeletionPipeline,
}

impl SqlRepository {
    /// Connects to `dsn`, creates the schema if missing and loads every row.
    pub async fn connect(
        dsn: &str,
        memory: InMemoryRepository,
        settings: PipelineSettings,
        token: CancellationToken,
    ) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(dsn)
            .await
            .map_err(map_sqlx_error)?;
        Self::with_pool(pool, memory, settings, token).await
    }

    /// Creates a repository from an existing pool.
    pub async fn with_pool(
        pool: AnyPool,
        memory: InMemoryRepository,
        settings: PipelineSettings,
        token: CancellationToken,
    ) -> Result<Self> {
        create_schema(&pool).await?;
        let memory = Arc::new(memory);
        let loaded = load_rows(&pool, &memory).await?;
        info!(rows = loaded, "short urls loaded from database");

        let write_lock = Arc::new(Mutex::new(()));
        let deleter = Arc::new(SqlDeleter {
            memory: memory.clone(),
            pool: pool.clone(),
            write_lock: write_lock.clone(),
        });
        let pipeline = DeletionPipeline::spawn(deleter, settings, token);

        Ok(Self {
            memory,
            pool,
            write_lock,
            pipeline,
        })
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn pipeline(&self) -> &DeletionPipeline {
        &self.pipeline
    }

    /// Waits until every accepted deletion has been written.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn flush_deletions(&self) {
        self.pipeline.flush().await;
    }

    async fn live_code_for(&self, url: &str) -> Result<Option<ShortCode>> {
        let row = sqlx::query(SELECT_LIVE_BY_URL)
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|row| {
            row.try_get::<String, _>("short_url")
                .map(ShortCode::new_unchecked)
                .map_err(map_sqlx_error)
        })
        .transpose()
    }

    async fn code_taken(&self, code: &ShortCode) -> Result<bool> {
        let row = sqlx::query(SELECT_CODE)
            .bind(code.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.is_some())
    }

    /// Works out which unique key a failed insert ran into.
    ///
    /// Must run after any enclosing transaction has been rolled back, so only
    /// committed rows are considered. A violation that matches neither a live
    /// row for `url` nor a stored `code` came from inside the failed batch
    /// itself and stays unclassified.
    async fn classify_insert_error(
        &self,
        err: sqlx::Error,
        code: &ShortCode,
        url: &str,
    ) -> StorageError {
        if !is_unique_violation(&err) {
            return map_sqlx_error(err);
        }
        match self.live_code_for(url).await {
            Ok(Some(existing)) => {
                return StorageError::Duplicate {
                    url: url.to_string(),
                    existing,
                }
            }
            Ok(None) => {}
            Err(lookup) => return lookup,
        }
        match self.code_taken(code).await {
            Ok(true) => StorageError::AlreadyExists(code.to_string()),
            Ok(false) => map_sqlx_error(err),
            Err(lookup) => lookup,
        }
    }
}

async fn create_schema(pool: &AnyPool) -> Result<()> {
    for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(map_sqlx_error)?;
    }
    Ok(())
}

async fn load_rows(pool: &AnyPool, memory: &InMemoryRepository) -> Result<usize> {
    let rows = sqlx::query(SELECT_ALL)
        .fetch_all(pool)
        .await
        .map_err(map_sqlx_error)?;
    let count = rows.len();
    for row in rows {
        let code: String = row.try_get("short_url").map_err(map_sqlx_error)?;
        let code = ShortCode::new(code).map_err(|e| StorageError::InvalidData(e.to_string()))?;
        memory.restore(
            code,
            UrlRecord {
                original_url: row.try_get("long_url").map_err(map_sqlx_error)?,
                owner: row.try_get("user_id").map_err(map_sqlx_error)?,
                deleted: row.try_get::<i64, _>("deleted_flag").map_err(map_sqlx_error)? != 0,
            },
        );
    }
    Ok(count)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    let message = err.to_string();

    match err {
        sqlx::Error::PoolTimedOut => StorageError::Timeout(message),
        sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::Unavailable(message),
        sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::RowNotFound => StorageError::InvalidData(message),
        _ => StorageError::Query(message),
    }
}

struct SqlDeleter {
    memory: Arc<InMemoryRepository>,
    pool: AnyPool,
    write_lock: Arc<Mutex<()>>,
}

#[async_trait]
impl BatchDeleter for SqlDeleter {
    async fn delete_batch(&self, codes: &[ShortCode]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        for code in codes {
            sqlx::query(MARK_DELETED)
                .bind(code.as_str())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        let marked = self.memory.mark_deleted(codes);
        debug!(count = marked, "short urls marked deleted in database");
        Ok(())
    }
}

#[async_trait]
impl ReadRepository for SqlRepository {
    async fn find_url(&self, code: &ShortCode) -> Result<UrlRecord> {
        trace!(code = %code, "database store lookup");
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
impl Repository for SqlRepository {
    async fn add_url(&self, original_url: &str, user: &str) -> Result<ShortCode> {
        let _guard = self.write_lock.lock().await;
        let code = self
            .memory
            .draft(1)?
            .pop()
            .ok_or_else(|| StorageError::InvalidData("no code drafted".to_string()))?;

        let result = sqlx::query(INSERT_URL)
            .bind(code.as_str())
            .bind(original_url)
            .bind(user)
            .execute(&self.pool)
            .await;
        if let Err(err) = result {
            let err = self.classify_insert_error(err, &code, original_url).await;
            debug!(url = original_url, error = %err, "insert rejected");
            return Err(err);
        }

        self.memory
            .commit(vec![(code.clone(), UrlRecord::new(original_url, user))])?;
        debug!(code = %code, user, "short url stored in database");
        Ok(code)
    }

    async fn add_urls(&self, batch: Vec<BatchItem>, user: &str) -> Result<Vec<ShortenedItem>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.write_lock.lock().await;
        let codes = self.memory.draft(batch.len())?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        for (code, item) in codes.iter().zip(&batch) {
            let result = sqlx::query(INSERT_URL)
                .bind(code.as_str())
                .bind(item.original_url.as_str())
                .bind(user)
                .execute(&mut *tx)
                .await;
            if let Err(err) = result {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "failed to roll back batch insert");
                }
                return Err(self
                    .classify_insert_error(err, code, &item.original_url)
                    .await);
            }
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        let mut staged = Vec::with_capacity(batch.len());
        let mut shortened = Vec::with_capacity(batch.len());
        for (code, item) in codes.into_iter().zip(batch) {
            staged.push((code.clone(), UrlRecord::new(item.original_url, user)));
            shortened.push(ShortenedItem {
                correlation_id: item.correlation_id,
                code,
            });
        }
        self.memory.commit(staged)?;

        debug!(count = shortened.len(), user, "batch stored in database");
        Ok(shortened)
    }

    async fn delete_urls(&self, codes: &[ShortCode], user: &str) -> Vec<ShortCode> {
        let accepted = self.memory.accept_deletions(codes, user);
        debug!(count = accepted.len(), user, "deletions accepted");
        self.pipeline.submit(accepted.clone());
        accepted
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        conn.ping()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    async fn close(&self) {
        self.pipeline.shutdown().await;
        self.pool.close().await;
        info!("database store closed");
    }
}
