use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// Stored in redb as bincode-encoded bytes, keyed by `token`.
/// `ciphertext` is `nonce || ChaCha20Poly1305 ciphertext || tag`.
/// All metadata is plaintext so the background sweep can evict without decrypting.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    /// Store-assigned sequence number. Internal only.
    pub id: u64,
    pub token: String,
    pub ciphertext: Vec<u8>,
    /// Unix timestamp (seconds).
    pub created_at: i64,
    /// Unix timestamp (seconds) at which the record stops being redeemable.
    pub expire_at: i64,
    /// Successful reads remaining, including the next one.
    pub views_left: u32,
}

impl SecretRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expire_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.views_left == 0
    }

    pub fn is_redeemable(&self, now: i64) -> bool {
        !self.is_expired(now) && !self.is_exhausted()
    }

    pub fn meta(&self) -> SecretMeta {
        SecretMeta {
            token: self.token.clone(),
            created_at: from_unix(self.created_at),
            expire_at: from_unix(self.expire_at),
            views_left: self.views_left,
        }
    }
}

/// Everything the store needs to persist a secret; id and token are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub ciphertext: Vec<u8>,
    pub created_at: i64,
    pub expire_at: i64,
    pub views_left: u32,
}

/// Metadata handed back to callers. Never includes the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretMeta {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub views_left: u32,
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
