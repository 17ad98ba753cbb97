mod clock;
pub mod seq;
pub mod timestamp;

use burrow_core::{GeneratorError, ShortCode};
use std::sync::Arc;

pub use clock::{Clock, SystemClock};
pub use seq::SeqGenerator;
pub use timestamp::{TimestampGenerator, TimestampSettings};

/// Trait for generating short codes.
///
/// Implementations are pure generators that don't interact with storage.
/// A generated code is not guaranteed to be free; storage detects and
/// retries collisions.
pub trait Generator: Send + Sync + 'static {
    fn generate(&self) -> Result<ShortCode, GeneratorError>;
}

impl<G: Generator + ?Sized> Generator for Arc<G> {
    fn generate(&self) -> Result<ShortCode, GeneratorError> {
        (**self).generate()
    }
}

impl<G: Generator + ?Sized> Generator for Box<G> {
    fn generate(&self) -> Result<ShortCode, GeneratorError> {
        (**self).generate()
    }
}
