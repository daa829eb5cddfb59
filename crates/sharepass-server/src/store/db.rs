use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use redb::{Database, ReadableTable, TableDefinition};
use tokio::time;
use tracing::{debug, info, warn};

use super::audit::{token_hint, AuditEvent, AuditQuery, ACTION_SHARE_PRUNE};
use super::model::{NewSecret, SecretRecord};
use crate::error::ShareError;

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
/// Every token ever handed out. Never pruned, so tokens are never reissued.
const ISSUED_TOKENS: TableDefinition<&str, i64> = TableDefinition::new("issued_tokens");
const AUDIT_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("audit_log");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const AUDIT_SEQ_KEY: &str = "audit_seq";
const SECRET_SEQ_KEY: &str = "secret_seq";

/// Leading byte of every encoded record.
const RECORD_FORMAT_V1: u8 = 0x01;

const TOKEN_BYTES: usize = 32;
const MAX_TOKEN_ATTEMPTS: usize = 8;

/// Outcome of a single atomic redemption attempt.
#[derive(Debug)]
pub enum Redemption<T> {
    /// View consumed; the record survives with `record.views_left` reads remaining.
    Viewed { value: T, record: SecretRecord },
    /// Final view consumed; the record has been removed.
    Burned { value: T, record: SecretRecord },
    /// Record was past `expire_at` and has been removed.
    Expired,
    /// Record had no views left and has been removed.
    Exhausted,
    /// No record under this token.
    NotFound,
}

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(ISSUED_TOKENS)?;
        write_txn.open_table(AUDIT_LOG)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Open a database that must already exist, e.g. for offline inspection.
    /// Fails while a server holds the file.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let db = Database::open(path)
            .with_context(|| format!("open redb database {}", path.display()))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Persist a new secret, assigning its id and a never-before-issued token.
    pub fn insert(&self, new: NewSecret) -> Result<SecretRecord> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut counters = write_txn.open_table(COUNTERS)?;
            let id = counters
                .get(SECRET_SEQ_KEY)?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            counters.insert(SECRET_SEQ_KEY, id)?;

            let mut issued = write_txn.open_table(ISSUED_TOKENS)?;
            let mut token = generate_token();
            let mut attempts = 1;
            while issued.get(token.as_str())?.is_some() {
                if attempts >= MAX_TOKEN_ATTEMPTS {
                    anyhow::bail!("could not allocate an unused token");
                }
                token = generate_token();
                attempts += 1;
            }
            issued.insert(token.as_str(), new.created_at)?;

            let record = SecretRecord {
                id,
                token,
                ciphertext: new.ciphertext,
                created_at: new.created_at,
                expire_at: new.expire_at,
                views_left: new.views_left,
            };

            let bytes = encode(&record)?;
            let mut table = write_txn.open_table(SECRETS)?;
            table.insert(record.token.as_str(), bytes.as_slice())?;
            record
        };
        write_txn.commit()?;

        debug!(id = record.id, token = %token_hint(&record.token), "stored secret");
        Ok(record)
    }

    /// Look up a record without touching it.
    pub fn find_by_token(&self, token: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let raw_bytes: Option<Vec<u8>> = table.get(token)?.map(|guard| guard.value().to_vec());
        raw_bytes.map(|bytes| decode(&bytes)).transpose()
    }

    /// Delete a record by token. Returns true if it existed.
    pub fn delete(&self, token: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SECRETS)?;
            let existed = table.remove(token)?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Consume one view. A record whose counter reaches zero is removed;
    /// the returned record then carries `views_left == 0`.
    pub fn decrement_views(&self, token: &str) -> Result<Option<SecretRecord>> {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(SECRETS)?;
            let raw_bytes: Option<Vec<u8>> =
                table.get(token)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => None,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;
                    record.views_left = record.views_left.saturating_sub(1);
                    if record.is_exhausted() {
                        table.remove(token)?;
                        debug!(token = %token_hint(token), "removed exhausted secret");
                    } else {
                        let updated = encode(&record)?;
                        table.insert(token, updated.as_slice())?;
                    }
                    Some(record)
                }
            }
        };
        write_txn.commit()?;
        Ok(result)
    }

    /// Atomically check, open and consume one view of the record under `token`.
    ///
    /// Runs entirely inside one write transaction, so concurrent redemptions of
    /// the same token are serialized. Stale records are removed on sight. If
    /// `open` fails the transaction is aborted and the view is not consumed.
    pub fn redeem<T>(
        &self,
        token: &str,
        now: i64,
        open: impl FnOnce(&SecretRecord) -> Result<T, ShareError>,
    ) -> Result<Redemption<T>, ShareError> {
        let write_txn = self
            .db
            .begin_write()
            .context("begin redeem transaction")?;
        let outcome = {
            let mut table = write_txn.open_table(SECRETS).context("open secrets")?;

            // Read the raw bytes and immediately clone them so the AccessGuard
            // (which borrows `table`) is dropped before any mutation.
            let raw_bytes: Option<Vec<u8>> = table
                .get(token)
                .context("read secret")?
                .map(|guard| guard.value().to_vec());

            let Some(bytes) = raw_bytes else {
                return Ok(Redemption::NotFound);
            };
            let mut record = decode(&bytes)?;

            if record.is_expired(now) {
                table.remove(token).context("remove expired secret")?;
                debug!(token = %token_hint(token), "lazy-evicted expired secret");
                Redemption::Expired
            } else if record.is_exhausted() {
                table.remove(token).context("remove exhausted secret")?;
                debug!(token = %token_hint(token), "lazy-evicted exhausted secret");
                Redemption::Exhausted
            } else {
                let value = open(&record)?;
                record.views_left -= 1;

                if record.is_exhausted() {
                    table.remove(token).context("burn secret")?;
                    debug!(token = %token_hint(token), "burned after final read");
                    Redemption::Burned { value, record }
                } else {
                    let updated = encode(&record)?;
                    table
                        .insert(token, updated.as_slice())
                        .context("write decremented secret")?;
                    Redemption::Viewed { value, record }
                }
            }
        };
        write_txn.commit().context("commit redeem transaction")?;
        Ok(outcome)
    }

    /// Whether `token` was ever issued by this store, even if since deleted.
    pub fn was_issued(&self, token: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ISSUED_TOKENS)?;
        let issued = table.get(token)?.is_some();
        Ok(issued)
    }

    /// Remove every record that is expired or out of views. Returns how many were removed.
    pub fn prune(&self, now: i64) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SECRETS)?;

            let mut stale = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let record = decode(v.value())?;
                if !record.is_redeemable(now) {
                    stale.push(k.value().to_owned());
                }
            }

            for token in &stale {
                table.remove(token.as_str())?;
            }
            stale.len()
        };
        write_txn.commit()?;

        if removed > 0 {
            info!(removed, "pruned stale secrets");
        }
        Ok(removed)
    }

    // ── Audit log ─────────────────────────────────────────────────────────

    /// Record an audit event. Allocates a monotonic ID via the counters table.
    pub fn record_audit(&self, mut event: AuditEvent) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut counters = write_txn.open_table(COUNTERS)?;
            let seq = counters.get(AUDIT_SEQ_KEY)?.map(|g| g.value()).unwrap_or(0) + 1;
            counters.insert(AUDIT_SEQ_KEY, seq)?;
            event.id = seq;

            let bytes = bincode::serde::encode_to_vec(&event, bincode::config::standard())
                .context("bincode encode audit event")?;
            let mut audit = write_txn.open_table(AUDIT_LOG)?;
            audit.insert(event.id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// List audit events matching the query, most recent first.
    pub fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT_LOG)?;

        let mut events = Vec::new();
        for item in table.iter()?.rev() {
            if events.len() >= query.limit {
                break;
            }
            let (_, v) = item?;
            let event = decode_audit(v.value())?;
            // Ids grow with time, so everything further back is older still.
            if query.since.is_some_and(|since| event.timestamp < since) {
                break;
            }
            if query.action.as_deref().is_some_and(|a| a != event.action) {
                continue;
            }
            events.push(event);
        }
        Ok(events)
    }

    /// Remove audit events older than `retention_seconds`. Returns count removed.
    pub fn prune_audit(&self, retention_seconds: i64) -> Result<usize> {
        let cutoff = Self::now() - retention_seconds;

        let ids_to_remove: Vec<u64> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(AUDIT_LOG)?;
            let mut ids = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                if decode_audit(v.value())?.timestamp < cutoff {
                    ids.push(k.value());
                } else {
                    break; // IDs are monotonic, remaining are newer.
                }
            }
            ids
        };

        if ids_to_remove.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(AUDIT_LOG)?;
            for id in &ids_to_remove {
                table.remove(*id)?;
            }
        }
        write_txn.commit()?;

        let removed = ids_to_remove.len();
        info!(removed, "pruned old audit events");
        Ok(removed)
    }

    /// Spawn a background task that prunes old audit events periodically.
    pub fn spawn_audit_sweep(self, interval: Duration, retention_seconds: i64) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.prune_audit(retention_seconds) {
                    warn!(error = %e, "audit sweep error");
                }
            }
        });
    }

    /// Spawn a background Tokio task that calls `prune()` every `interval`.
    /// Lookups already refuse stale records; this only reclaims space.
    pub fn spawn_sweep(self, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                match self.prune(Self::now()) {
                    Ok(0) => {}
                    Ok(removed) => {
                        let event = AuditEvent::new(
                            ACTION_SHARE_PRUNE,
                            None,
                            "sweep".into(),
                            true,
                            Some(format!("pruned={removed}")),
                        );
                        if let Err(e) = self.record_audit(event) {
                            warn!(error = %e, "failed to audit sweep");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "background sweep error");
                    }
                }
            }
        });
    }
}

/// 32 random bytes from the OS, URL-safe base64 without padding (43 chars).
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Encode a SecretRecord as `[RECORD_FORMAT_V1] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_FORMAT_V1);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_audit(bytes: &[u8]) -> Result<AuditEvent> {
    let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode audit event")?;
    Ok(event)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        Some((&RECORD_FORMAT_V1, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .context("bincode decode")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format {marker:#04x}"),
        None => anyhow::bail!("empty record"),
    }
}
