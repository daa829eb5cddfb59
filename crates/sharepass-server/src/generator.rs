//! Random password generation.

use std::ops::RangeInclusive;

use rand::{rngs::OsRng, Rng};

use crate::error::ShareError;

const LETTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const DIGITS: &str = "0123456789";
const PUNCTUATION: &str = r##"!"#$%&'()*+,-./:;<=>?@[\]^_`{|}~"##;

/// Generates passwords from the OS CSPRNG within a configured length range.
#[derive(Debug, Clone)]
pub struct PasswordGenerator {
    lengths: RangeInclusive<usize>,
}

impl PasswordGenerator {
    pub fn new(lengths: RangeInclusive<usize>) -> Self {
        Self { lengths }
    }

    /// Letters are always included; digits and punctuation are added per flag.
    pub fn generate(
        &self,
        length: usize,
        include_digits: bool,
        include_symbols: bool,
    ) -> Result<String, ShareError> {
        if !self.lengths.contains(&length) {
            return Err(ShareError::validation(format!(
                "size must be between {} and {}",
                self.lengths.start(),
                self.lengths.end()
            )));
        }

        let pool = pool(include_digits, include_symbols);
        let mut rng = OsRng;
        Ok((0..length)
            .map(|_| pool[rng.gen_range(0..pool.len())])
            .collect())
    }
}

fn pool(include_digits: bool, include_symbols: bool) -> Vec<char> {
    let mut pool: Vec<char> = LETTERS.chars().collect();
    if include_digits {
        pool.extend(DIGITS.chars());
    }
    if include_symbols {
        pool.extend(PUNCTUATION.chars());
    }
    pool
}
