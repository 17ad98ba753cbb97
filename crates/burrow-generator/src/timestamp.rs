use crate::clock::{Clock, SystemClock};
use crate::Generator;
use burrow_core::{GeneratorError, ShortCode};
use rand::rngs::OsRng;
use rand::TryRngCore;
use typed_builder::TypedBuilder;

const RADIX_36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const MAX_SUFFIX_BYTES: usize = 8;

/// Configures a [`TimestampGenerator`].
#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct TimestampSettings {
    /// Number of random bytes appended (hex-encoded, two characters each).
    ///
    /// Clamped to `0..=8`.
    #[builder(default = 2)]
    pub suffix_bytes: usize,
}

impl Default for TimestampSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Generates codes from the current time plus a short random suffix.
///
/// The time is taken at microsecond resolution and written in lowercase
/// radix-36; the suffix only lowers the odds of two calls in the same
/// microsecond colliding, it does not rule it out. Callers must still detect
/// taken codes.
pub struct TimestampGenerator<C: Clock = SystemClock> {
    clock: C,
    suffix_bytes: usize,
}

impl TimestampGenerator<SystemClock> {
    /// Creates a generator backed by the real system clock.
    pub fn new(settings: TimestampSettings) -> Self {
        Self::with_clock(settings, SystemClock)
    }
}

impl Default for TimestampGenerator<SystemClock> {
    fn default() -> Self {
        Self::new(TimestampSettings::default())
    }
}

impl<C: Clock> TimestampGenerator<C> {
    pub fn with_clock(settings: TimestampSettings, clock: C) -> Self {
        Self {
            clock,
            suffix_bytes: settings.suffix_bytes.min(MAX_SUFFIX_BYTES),
        }
    }

    fn next_code(&self) -> Result<String, GeneratorError> {
        let micros = self.clock.now().as_microsecond();
        let micros = u64::try_from(micros).map_err(|_| GeneratorError::ClockBeforeEpoch(micros))?;

        let mut suffix = [0_u8; MAX_SUFFIX_BYTES];
        let suffix = &mut suffix[..self.suffix_bytes];
        OsRng
            .try_fill_bytes(suffix)
            .map_err(|e| GeneratorError::Entropy(e.to_string()))?;

        let mut code = to_radix_36(micros);
        for byte in suffix.iter() {
            code.push_str(&format!("{byte:02x}"));
        }
        Ok(code)
    }
}

impl<C: Clock + 'static> Generator for TimestampGenerator<C> {
    fn generate(&self) -> Result<ShortCode, GeneratorError> {
        self.next_code().map(ShortCode::new_unchecked)
    }
}

fn to_radix_36(mut value: u64) -> String {
    let mut digits = Vec::with_capacity(13);
    loop {
        digits.push(RADIX_36_DIGITS[(value % 36) as usize]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    digits.iter().rev().map(|&digit| digit as char).collect()
}
