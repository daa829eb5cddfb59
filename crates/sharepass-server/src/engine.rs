//! Secret lifecycle: creation and view-counted redemption.
//!
//! Creation validates the request, encrypts the plaintext and persists it,
//! handing back only metadata. Redemption runs the expiry and view checks,
//! the decrypt and the decrement-or-delete inside a single store transaction.

use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    error::{GoneReason, ShareError},
    generator::PasswordGenerator,
    store::{
        audit::token_hint,
        crypto::{self, EncryptionKey},
        NewSecret, Redemption, SecretMeta, Store,
    },
};

/// Bounds applied to every creation request.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum size in bytes of a caller-supplied secret.
    pub max_secret_len: usize,
    pub generated_len: RangeInclusive<usize>,
    pub max_views: u32,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    /// How far in the past an `expire_at` may be before it is rejected.
    pub clock_skew: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_secret_len: 4096,
            generated_len: 8..=128,
            max_views: 5,
            default_ttl: Duration::hours(24),
            max_ttl: Duration::days(7),
            clock_skew: Duration::seconds(30),
        }
    }
}

/// Optional lifecycle settings shared by both creation modes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareOptions {
    pub expire_at: Option<DateTime<Utc>>,
    pub views_left: Option<u32>,
}

/// Character policy for a generated secret.
#[derive(Debug, Clone, Copy)]
pub struct GeneratePolicy {
    pub size: usize,
    pub numbers: bool,
    pub special_char: bool,
}

impl Default for GeneratePolicy {
    fn default() -> Self {
        Self {
            size: 16,
            numbers: true,
            special_char: true,
        }
    }
}

/// A successfully redeemed secret. `views_left` is what remains after this read.
#[derive(Debug, Clone, Serialize)]
pub struct Revealed {
    pub password: String,
    #[serde(flatten)]
    pub meta: SecretMeta,
}

#[derive(Clone)]
pub struct ShareService {
    store: Store,
    key: Arc<EncryptionKey>,
    limits: Arc<Limits>,
    generator: PasswordGenerator,
}

impl ShareService {
    pub fn new(store: Store, key: EncryptionKey, limits: Limits) -> Self {
        let generator = PasswordGenerator::new(limits.generated_len.clone());
        Self {
            store,
            key: Arc::new(key),
            limits: Arc::new(limits),
            generator,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Store a caller-supplied secret.
    pub fn share_password(
        &self,
        password: &str,
        options: ShareOptions,
    ) -> Result<SecretMeta, ShareError> {
        if password.is_empty() {
            return Err(ShareError::validation("password must not be empty"));
        }
        if password.len() > self.limits.max_secret_len {
            return Err(ShareError::validation(format!(
                "password exceeds {} bytes",
                self.limits.max_secret_len
            )));
        }
        self.create(password, options)
    }

    /// Generate a random secret and store it.
    pub fn share_generated(
        &self,
        policy: GeneratePolicy,
        options: ShareOptions,
    ) -> Result<SecretMeta, ShareError> {
        let password = self
            .generator
            .generate(policy.size, policy.numbers, policy.special_char)?;
        self.create(&password, options)
    }

    fn create(&self, plaintext: &str, options: ShareOptions) -> Result<SecretMeta, ShareError> {
        let now = Utc::now();
        let expire_at = self.resolve_expiry(options.expire_at, now)?;
        let views_left = self.resolve_views(options.views_left)?;

        let ciphertext = crypto::encrypt(&self.key, plaintext.as_bytes())?;
        let record = self.store.insert(NewSecret {
            ciphertext,
            created_at: now.timestamp(),
            expire_at: expire_at.timestamp(),
            views_left,
        })?;

        info!(
            token = %token_hint(&record.token),
            expire_at = %expire_at,
            views_left,
            "secret shared"
        );
        Ok(record.meta())
    }

    fn resolve_expiry(
        &self,
        requested: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ShareError> {
        let Some(expire_at) = requested else {
            return Ok(now + self.limits.default_ttl);
        };
        if expire_at <= now - self.limits.clock_skew {
            return Err(ShareError::validation("expire_at must be in the future"));
        }
        if expire_at > now + self.limits.max_ttl {
            return Err(ShareError::validation(format!(
                "expire_at must be within {} days",
                self.limits.max_ttl.num_days()
            )));
        }
        Ok(expire_at)
    }

    fn resolve_views(&self, requested: Option<u32>) -> Result<u32, ShareError> {
        let views = requested.unwrap_or(1);
        if views == 0 || views > self.limits.max_views {
            return Err(ShareError::validation(format!(
                "views_left must be between 1 and {}",
                self.limits.max_views
            )));
        }
        Ok(views)
    }

    /// Consume one view of the secret behind `token` and return its plaintext.
    ///
    /// The read that takes `views_left` to zero destroys the record; any later
    /// attempt reports [`ShareError::NotFound`].
    pub fn redeem(&self, token: &str) -> Result<Revealed, ShareError> {
        let now = Utc::now().timestamp();

        let outcome = self.store.redeem(token, now, |record| {
            let plaintext = crypto::decrypt(&self.key, &record.ciphertext)?;
            String::from_utf8(plaintext).map_err(|_| ShareError::Integrity)
        })?;

        match outcome {
            Redemption::Viewed { value, record } => {
                debug!(token = %token_hint(token), views_left = record.views_left, "secret viewed");
                Ok(Revealed {
                    password: value,
                    meta: record.meta(),
                })
            }
            Redemption::Burned { value, record } => {
                info!(token = %token_hint(token), "secret burned after final view");
                Ok(Revealed {
                    password: value,
                    meta: record.meta(),
                })
            }
            Redemption::Expired => Err(ShareError::Gone(GoneReason::Expired)),
            Redemption::Exhausted => Err(ShareError::Gone(GoneReason::Exhausted)),
            Redemption::NotFound => Err(ShareError::NotFound),
        }
    }
}
