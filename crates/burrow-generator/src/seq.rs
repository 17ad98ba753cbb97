use crate::Generator;
use burrow_core::{GeneratorError, ShortCode};
use std::sync::atomic::{AtomicU64, Ordering};

/// A deterministic generator producing sequential codes like "wh000000", "wh000001".
///
/// Codes are only unique within a single instance. Useful for tests and for
/// tooling that wants predictable output.
#[derive(Debug)]
pub struct SeqGenerator {
    counter: AtomicU64,
    prefix: String,
}

impl Clone for SeqGenerator {
    fn clone(&self) -> Self {
        Self {
            counter: AtomicU64::new(self.counter.load(Ordering::SeqCst)),
            prefix: self.prefix.clone(),
        }
    }
}

impl SeqGenerator {
    /// Creates a new sequential generator with a custom prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self::with_offset(prefix, 0)
    }

    /// Creates a new sequential generator starting from a specific counter value.
    pub fn with_offset(prefix: impl Into<String>, offset: u64) -> Self {
        Self {
            counter: AtomicU64::new(offset),
            prefix: prefix.into(),
        }
    }
}

impl Generator for SeqGenerator {
    fn generate(&self) -> Result<ShortCode, GeneratorError> {
        let count = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_add(1)
            })
            .map_err(|_| GeneratorError::Exhausted(self.prefix.clone()))?;
        Ok(ShortCode::new_unchecked(format!("{}{:06}", self.prefix, count)))
    }
}
