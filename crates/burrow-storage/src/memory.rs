use async_trait::async_trait;
use burrow_core::{
    BatchItem, ReadRepository, Repository, Result, ShortCode, ShortenedItem, Statistics,
    StorageError, UrlRecord,
};
use burrow_generator::{Generator, TimestampGenerator};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// How many times a taken code is regenerated before giving up.
pub const MAX_GENERATE_ATTEMPTS: usize = 3;

#[derive(Debug, Default)]
struct Table {
    records: HashMap<ShortCode, UrlRecord>,
    by_user: HashMap<String, Vec<ShortCode>>,
}

impl Table {
    fn insert(&mut self, code: ShortCode, record: UrlRecord) {
        if !self.records.contains_key(&code) {
            self.by_user
                .entry(record.owner.clone())
                .or_default()
                .push(code.clone());
        }
        self.records.insert(code, record);
    }
}

/// The authoritative in-process mapping table.
///
/// A single reader/writer lock guards both the table and the per-user index,
/// so a reader never observes one without the other. The durable stores hold
/// this by composition and use the lower-level building blocks (`draft`,
/// `commit`, `accept_deletions`, `mark_deleted`, `restore`) to keep memory in
/// step with their own writes.
pub struct InMemoryRepository {
    table: RwLock<Table>,
    generator: Arc<dyn Generator>,
}

impl InMemoryRepository {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            table: RwLock::new(Table::default()),
            generator,
        }
    }

    pub fn with_generator(generator: impl Generator) -> Self {
        Self::new(Arc::new(generator))
    }

    /// Number of records held, deleted ones included.
    pub fn len(&self) -> usize {
        self.table.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a record without going through the async contract.
    pub fn get(&self, code: &ShortCode) -> Result<UrlRecord> {
        self.table
            .read()
            .records
            .get(code)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(code.to_string()))
    }

    pub fn codes_for(&self, user: &str) -> Vec<ShortCode> {
        self.table
            .read()
            .by_user
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    /// Generates `count` distinct codes that are free at the time of the call.
    ///
    /// The codes are not reserved. Callers that write elsewhere first must
    /// serialise their writers so nobody commits a drafted code in between.
    pub fn draft(&self, count: usize) -> Result<Vec<ShortCode>> {
        let table = self.table.read();
        let mut staged = HashSet::with_capacity(count);
        let mut codes = Vec::with_capacity(count);
        for _ in 0..count {
            let code = self.generate_free(&table, &staged)?;
            staged.insert(code.clone());
            codes.push(code);
        }
        Ok(codes)
    }

    /// Inserts staged records. Nothing is applied if any code is already taken.
    pub fn commit(&self, entries: Vec<(ShortCode, UrlRecord)>) -> Result<()> {
        let mut table = self.table.write();
        let mut seen = HashSet::with_capacity(entries.len());
        for (code, _) in &entries {
            if table.records.contains_key(code) || !seen.insert(code) {
                return Err(StorageError::AlreadyExists(code.to_string()));
            }
        }
        for (code, record) in entries {
            table.insert(code, record);
        }
        Ok(())
    }

    /// Keeps the codes that exist, belong to `user` and are still live.
    pub fn accept_deletions(&self, codes: &[ShortCode], user: &str) -> Vec<ShortCode> {
        let table = self.table.read();
        let mut seen = HashSet::new();
        codes
            .iter()
            .filter(|code| {
                table
                    .records
                    .get(*code)
                    .is_some_and(|record| record.owner == user && !record.deleted)
            })
            .filter(|code| seen.insert(*code))
            .cloned()
            .collect()
    }

    /// Sets the delete marker on every known code and returns how many changed.
    pub fn mark_deleted(&self, codes: &[ShortCode]) -> usize {
        let mut table = self.table.write();
        let mut marked = 0;
        for code in codes {
            if let Some(record) = table.records.get_mut(code) {
                if !record.deleted {
                    record.deleted = true;
                    marked += 1;
                }
            }
        }
        marked
    }

    /// Applies a replayed record. Later records for a code overwrite earlier ones.
    ///
    /// Records without an owner are kept but never join the user index.
    pub fn restore(&self, code: ShortCode, record: UrlRecord) {
        let mut table = self.table.write();
        if record.owner.is_empty() {
            table.records.insert(code, record);
        } else {
            table.insert(code, record);
        }
    }

    pub fn stats(&self) -> Statistics {
        let table = self.table.read();
        Statistics {
            urls: table.records.values().filter(|r| !r.deleted).count(),
            users: table.by_user.len(),
        }
    }

    fn generate_free(&self, table: &Table, staged: &HashSet<ShortCode>) -> Result<ShortCode> {
        let mut attempt = 1;
        loop {
            let code = self.generator.generate()?;
            if !table.records.contains_key(&code) && !staged.contains(&code) {
                return Ok(code);
            }
            if attempt >= MAX_GENERATE_ATTEMPTS {
                return Err(StorageError::AlreadyExists(code.to_string()));
            }
            trace!(code = %code, attempt, "generated short code is taken, regenerating");
            attempt += 1;
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::with_generator(TimestampGenerator::default())
    }
}

#[async_trait]
impl ReadRepository for InMemoryRepository {
    async fn find_url(&self, code: &ShortCode) -> Result<UrlRecord> {
        trace!(code = %code, "memory lookup");
        self.get(code)
    }

    async fn urls_by_user(&self, user: &str) -> Vec<ShortCode> {
        self.codes_for(user)
    }

    async fn statistics(&self) -> Statistics {
        self.stats()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn add_url(&self, original_url: &str, user: &str) -> Result<ShortCode> {
        let mut table = self.table.write();
        let code = self.generate_free(&table, &HashSet::new())?;
        table.insert(code.clone(), UrlRecord::new(original_url, user));
        debug!(code = %code, user, "short url stored in memory");
        Ok(code)
    }

    async fn add_urls(&self, batch: Vec<BatchItem>, user: &str) -> Result<Vec<ShortenedItem>> {
        let mut table = self.table.write();
        let mut staged = HashSet::with_capacity(batch.len());
        let mut codes = Vec::with_capacity(batch.len());
        for _ in &batch {
            let code = self.generate_free(&table, &staged)?;
            staged.insert(code.clone());
            codes.push(code);
        }

        let mut shortened = Vec::with_capacity(batch.len());
        for (code, item) in codes.into_iter().zip(batch) {
            table.insert(code.clone(), UrlRecord::new(item.original_url, user));
            shortened.push(ShortenedItem {
                correlation_id: item.correlation_id,
                code,
            });
        }
        debug!(count = shortened.len(), user, "batch stored in memory");
        Ok(shortened)
    }

    async fn delete_urls(&self, codes: &[ShortCode], user: &str) -> Vec<ShortCode> {
        let accepted = self.accept_deletions(codes, user);
        let marked = self.mark_deleted(&accepted);
        debug!(count = marked, user, "short urls deleted from memory");
        accepted
    }

    async fn ping(&self) -> Result<()> {
        Err(StorageError::Unavailable(
            "no durable backend configured, using in-memory storage".to_string(),
        ))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::{ErrorKind, GeneratorError};
    use burrow_generator::SeqGenerator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn repo() -> InMemoryRepository {
        InMemoryRepository::with_generator(SeqGenerator::with_prefix("m"))
    }

    fn code(s: &str) -> ShortCode {
        ShortCode::new_unchecked(s)
    }

    fn item(id: &str, url: &str) -> BatchItem {
        BatchItem {
            correlation_id: id.to_string(),
            original_url: url.to_string(),
        }
    }

    /// Replays a fixed list of codes, then fails.
    struct Scripted {
        codes: Vec<&'static str>,
        next: AtomicUsize,
    }

    impl Generator for Scripted {
        fn generate(&self) -> std::result::Result<ShortCode, GeneratorError> {
            let index = self.next.fetch_add(1, Ordering::SeqCst);
            self.codes
                .get(index)
                .map(|c| ShortCode::new_unchecked(*c))
                .ok_or_else(|| GeneratorError::Exhausted("scripted".to_string()))
        }
    }

    fn scripted(codes: Vec<&'static str>) -> InMemoryRepository {
        InMemoryRepository::with_generator(Scripted {
            codes,
            next: AtomicUsize::new(0),
        })
    }

    struct Fixed(&'static str);

    impl Generator for Fixed {
        fn generate(&self) -> std::result::Result<ShortCode, GeneratorError> {
            Ok(ShortCode::new_unchecked(self.0))
        }
    }

    #[tokio::test]
    async fn add_then_find() {
        let repo = repo();

        let code = repo.add_url("https://example.com", "u1").await.unwrap();
        let record = repo.find_url(&code).await.unwrap();

        assert_eq!(record.original_url, "https://example.com");
        assert_eq!(record.owner, "u1");
        assert!(!record.deleted);
        assert_eq!(repo.urls_by_user("u1").await, vec![code]);
    }

    #[tokio::test]
    async fn missing_code_is_not_found() {
        let repo = repo();

        let err = repo.find_url(&code("nope")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(repo.urls_by_user("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn same_url_twice_gets_two_codes() {
        let repo = repo();

        let first = repo.add_url("https://example.com", "u1").await.unwrap();
        let second = repo.add_url("https://example.com", "u2").await.unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn taken_code_is_regenerated() {
        let repo = scripted(vec!["a", "a", "b"]);

        let first = repo.add_url("https://one.com", "u1").await.unwrap();
        let second = repo.add_url("https://two.com", "u1").await.unwrap();

        assert_eq!(first.as_str(), "a");
        assert_eq!(second.as_str(), "b");
    }

    #[tokio::test]
    async fn persistent_collision_is_already_exists() {
        let repo = scripted(vec!["a", "a", "a", "a"]);
        repo.add_url("https://one.com", "u1").await.unwrap();

        let err = repo.add_url("https://two.com", "u1").await.unwrap_err();

        assert_eq!(err, StorageError::AlreadyExists("a".to_string()));
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_adds_on_one_code_store_exactly_one() {
        let repo = Arc::new(InMemoryRepository::with_generator(Fixed("race")));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    repo.add_url(&format!("https://example.com/{i}"), &format!("u{i}"))
                        .await
                })
            })
            .collect();
        let mut stored = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(code) => stored.push(code),
                Err(err) => assert_eq!(err, StorageError::AlreadyExists("race".to_string())),
            }
        }

        assert_eq!(stored, vec![code("race")]);
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.statistics().await, Statistics { urls: 1, users: 1 });
    }

    #[tokio::test]
    async fn batch_keeps_correlation_ids_in_order() {
        let repo = repo();

        let shortened = repo
            .add_urls(
                vec![item("1", "https://a.com"), item("2", "https://b.com")],
                "u1",
            )
            .await
            .unwrap();

        assert_eq!(shortened.len(), 2);
        assert_eq!(shortened[0].correlation_id, "1");
        assert_eq!(shortened[1].correlation_id, "2");
        let record = repo.find_url(&shortened[1].code).await.unwrap();
        assert_eq!(record.original_url, "https://b.com");
        assert_eq!(
            repo.urls_by_user("u1").await,
            vec![shortened[0].code.clone(), shortened[1].code.clone()]
        );
    }

    #[tokio::test]
    async fn failed_batch_applies_nothing() {
        // Generator runs dry on the third row.
        let repo = scripted(vec!["a", "b"]);

        let err = repo
            .add_urls(
                vec![
                    item("1", "https://a.com"),
                    item("2", "https://b.com"),
                    item("3", "https://c.com"),
                ],
                "u1",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Generator(_)));
        assert!(repo.is_empty());
        assert!(repo.urls_by_user("u1").await.is_empty());
    }

    #[tokio::test]
    async fn delete_only_touches_own_live_codes() {
        let repo = repo();
        let mine = repo.add_url("https://a.com", "u1").await.unwrap();
        let theirs = repo.add_url("https://b.com", "u2").await.unwrap();

        let accepted = repo
            .delete_urls(&[mine.clone(), theirs.clone(), code("ghost")], "u1")
            .await;

        assert_eq!(accepted, vec![mine.clone()]);
        assert!(repo.find_url(&mine).await.unwrap().deleted);
        assert!(!repo.find_url(&theirs).await.unwrap().deleted);

        let again = repo.delete_urls(&[mine.clone()], "u1").await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn foreign_delete_returns_nothing() {
        let repo = repo();
        let code = repo.add_url("https://a.com", "u1").await.unwrap();

        let accepted = repo.delete_urls(&[code.clone()], "u2").await;

        assert!(accepted.is_empty());
        assert!(!repo.find_url(&code).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn deleted_codes_stay_in_the_user_index() {
        let repo = repo();
        let code = repo.add_url("https://a.com", "u1").await.unwrap();

        repo.delete_urls(&[code.clone()], "u1").await;

        assert_eq!(repo.urls_by_user("u1").await, vec![code]);
        assert!(repo.active_urls_by_user("u1").await.is_empty());
    }

    #[test]
    fn accept_deletions_drops_repeated_codes() {
        let repo = repo();
        repo.restore(code("a"), UrlRecord::new("https://a.com", "u1"));

        let accepted = repo.accept_deletions(&[code("a"), code("a")], "u1");

        assert_eq!(accepted, vec![code("a")]);
    }

    #[test]
    fn commit_is_all_or_nothing() {
        let repo = repo();
        repo.restore(code("taken"), UrlRecord::new("https://x.com", "u1"));

        let err = repo
            .commit(vec![
                (code("fresh"), UrlRecord::new("https://a.com", "u1")),
                (code("taken"), UrlRecord::new("https://b.com", "u1")),
            ])
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(repo.get(&code("fresh")).is_err());
    }

    #[test]
    fn draft_skips_taken_codes() {
        let repo = scripted(vec!["a", "b", "c"]);
        repo.restore(code("a"), UrlRecord::new("https://a.com", "u1"));

        let drafted = repo.draft(2).unwrap();

        assert_eq!(drafted, vec![code("b"), code("c")]);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn restore_overwrites_but_indexes_once() {
        let repo = repo();
        let record = UrlRecord::new("https://a.com", "u1");

        repo.restore(code("a"), record.clone());
        repo.restore(
            code("a"),
            UrlRecord {
                deleted: true,
                ..record
            },
        );

        assert!(repo.get(&code("a")).unwrap().deleted);
        assert_eq!(repo.codes_for("u1"), vec![code("a")]);
    }

    #[test]
    fn ownerless_records_stay_out_of_the_user_index() {
        let repo = repo();

        repo.restore(code("a"), UrlRecord::new("https://a.com", ""));
        repo.restore(code("b"), UrlRecord::new("https://b.com", "u1"));

        assert!(repo.get(&code("a")).is_ok());
        assert!(repo.codes_for("").is_empty());
        assert_eq!(repo.stats(), Statistics { urls: 2, users: 1 });
    }

    #[tokio::test]
    async fn statistics_count_live_urls_and_owners() {
        let repo = repo();
        let a = repo.add_url("https://a.com", "u1").await.unwrap();
        repo.add_url("https://b.com", "u1").await.unwrap();
        repo.add_url("https://c.com", "u2").await.unwrap();

        repo.delete_urls(&[a], "u1").await;

        assert_eq!(repo.statistics().await, Statistics { urls: 2, users: 2 });
    }

    #[tokio::test]
    async fn ping_reports_no_backend() {
        let err = repo().ping().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    }
}
