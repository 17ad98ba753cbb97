use crate::error::Result;
use crate::shortcode::ShortCode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A stored URL mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRecord {
    /// The original URL that was shortened.
    pub original_url: String,
    /// The user who created the mapping.
    pub owner: String,
    /// Soft-delete marker. Once set it is never cleared.
    pub deleted: bool,
}

impl UrlRecord {
    pub fn new(original_url: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            original_url: original_url.into(),
            owner: owner.into(),
            deleted: false,
        }
    }
}

/// One row of a batch shortening request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Caller-chosen id used to match results to requests.
    pub correlation_id: String,
    pub original_url: String,
}

/// One row of a batch shortening result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortenedItem {
    pub correlation_id: String,
    pub code: ShortCode,
}

/// Service-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Number of records not marked deleted.
    pub urls: usize,
    /// Number of distinct owners with at least one record.
    pub users: usize,
}

/// A read-only view of a repository.
#[async_trait]
pub trait ReadRepository: Send + Sync + 'static {
    /// Retrieves the record for a given short code.
    ///
    /// Returns `Err(NotFound)` if the code does not exist. Deleted records are
    /// returned as-is with `deleted == true`.
    async fn find_url(&self, code: &ShortCode) -> Result<UrlRecord>;

    /// Returns every code the user ever created, in creation order.
    ///
    /// The list may still contain codes whose deletion has been accepted or
    /// applied; check [`UrlRecord::deleted`] before trusting an entry.
    async fn urls_by_user(&self, user: &str) -> Vec<ShortCode>;

    /// Counts live URLs and distinct users.
    async fn statistics(&self) -> Statistics;

    /// Returns the user's codes together with their records, skipping deleted ones.
    async fn active_urls_by_user(&self, user: &str) -> Vec<(ShortCode, UrlRecord)> {
        let mut active = Vec::new();
        for code in self.urls_by_user(user).await {
            if let Ok(record) = self.find_url(&code).await {
                if !record.deleted {
                    active.push((code, record));
                }
            }
        }
        active
    }
}

/// The storage contract consumed by request-layer collaborators.
#[async_trait]
pub trait Repository: ReadRepository {
    /// Shortens a URL on behalf of `user`.
    ///
    /// Returns `Err(Duplicate { existing, .. })` when a backend with a
    /// uniqueness constraint already holds a live mapping for the URL; the
    /// existing code is usable.
    async fn add_url(&self, original_url: &str, user: &str) -> Result<ShortCode>;

    /// Shortens every URL of the batch. Either all rows are stored or none are.
    async fn add_urls(&self, batch: Vec<BatchItem>, user: &str) -> Result<Vec<ShortenedItem>>;

    /// Accepts the user's codes for deletion and returns the accepted subset.
    ///
    /// Codes that do not exist, belong to someone else or are already deleted
    /// are silently skipped. The returned list is what *will* be deleted;
    /// durable backends apply it asynchronously.
    async fn delete_urls(&self, codes: &[ShortCode], user: &str) -> Vec<ShortCode>;

    /// Probes the durable backend.
    async fn ping(&self) -> Result<()>;

    /// Stops background work and releases files or connections.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::collections::HashMap;

    struct Fixed {
        records: HashMap<String, UrlRecord>,
        order: Vec<ShortCode>,
    }

    #[async_trait]
    impl ReadRepository for Fixed {
        async fn find_url(&self, code: &ShortCode) -> Result<UrlRecord> {
            self.records
                .get(code.as_str())
                .cloned()
                .ok_or_else(|| StorageError::NotFound(code.to_string()))
        }

        async fn urls_by_user(&self, _user: &str) -> Vec<ShortCode> {
            self.order.clone()
        }

        async fn statistics(&self) -> Statistics {
            Statistics::default()
        }
    }

    #[tokio::test]
    async fn active_urls_by_user_skips_deleted_and_missing() {
        let mut records = HashMap::new();
        records.insert("live".to_string(), UrlRecord::new("https://a.com", "u1"));
        records.insert(
            "gone".to_string(),
            UrlRecord {
                deleted: true,
                ..UrlRecord::new("https://b.com", "u1")
            },
        );
        let repo = Fixed {
            records,
            order: vec![
                ShortCode::new_unchecked("live"),
                ShortCode::new_unchecked("gone"),
                ShortCode::new_unchecked("missing"),
            ],
        };

        let active = repo.active_urls_by_user("u1").await;

        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0.as_str(), "live");
        assert_eq!(active[0].1.original_url, "https://a.com");
    }
}
