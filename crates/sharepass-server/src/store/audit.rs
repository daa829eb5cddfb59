use chrono::Utc;
use serde::{Deserialize, Serialize};

// ── Action constants ─────────────────────────────────────────────────────────

pub const ACTION_SHARE_CREATE: &str = "share.create";
pub const ACTION_SHARE_GENERATE: &str = "share.generate";
pub const ACTION_SHARE_READ: &str = "share.read";
pub const ACTION_SHARE_BURNED: &str = "share.burned";
pub const ACTION_SHARE_DENIED: &str = "share.denied";
pub const ACTION_SHARE_PRUNE: &str = "share.prune";

// ── AuditEvent ───────────────────────────────────────────────────────────────

/// `token_hint` carries only a token prefix; full tokens never reach the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    pub timestamp: i64,
    pub action: String,
    pub token_hint: Option<String>,
    pub source_ip: String,
    pub success: bool,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(
        action: &str,
        token_hint: Option<String>,
        source_ip: String,
        success: bool,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: 0, // allocated by store
            timestamp: Utc::now().timestamp(),
            action: action.to_owned(),
            token_hint,
            source_ip,
            success,
            detail,
        }
    }
}

// ── AuditQuery ───────────────────────────────────────────────────────────────

/// Filter for [`Store::list_audit`](super::Store::list_audit), newest events first.
#[derive(Debug, Clone)]
pub struct AuditQuery {
    /// Oldest timestamp (unix seconds) to include.
    pub since: Option<i64>,
    /// Only events with this action, e.g. `share.denied`.
    pub action: Option<String>,
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            since: None,
            action: None,
            limit: 50,
        }
    }
}

/// First characters of a token, enough to correlate log lines.
pub fn token_hint(token: &str) -> String {
    token.chars().take(6).collect()
}
