use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::{json, Value};
use sharepass_server::store::{AuditEvent, AuditQuery, Store};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "sharepass", about = "Share a password through a self-destructing link", version)]
struct Cli {
    /// Server URL (default: http://localhost:8080 or $SHAREPASS_SERVER)
    #[arg(long, env = "SHAREPASS_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on (default: $SHAREPASS_PORT or 8080)
        #[arg(long, env = "SHAREPASS_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $SHAREPASS_HOST or 0.0.0.0)
        #[arg(long, env = "SHAREPASS_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Print a fresh value for SECRET_KEY
    Keygen,
    /// Share a password; reads stdin when PASSWORD is omitted
    Share {
        password: Option<String>,
        #[command(flatten)]
        lifecycle: LifecycleArgs,
    },
    /// Generate a random password and share it
    Generate {
        /// Password length
        #[arg(long, default_value_t = 16)]
        size: usize,
        /// Leave digits out of the character pool
        #[arg(long)]
        no_numbers: bool,
        /// Leave punctuation out of the character pool
        #[arg(long)]
        no_special: bool,
        #[command(flatten)]
        lifecycle: LifecycleArgs,
    },
    /// Reveal a shared password, consuming one view
    Redeem {
        /// Token (or full share URL)
        token: String,
    },
    /// Print the server's audit log, newest first (server must be stopped)
    Audit {
        /// Data directory holding sharepass.db (default: $SHAREPASS_DATA_DIR or platform dir)
        #[arg(long, env = "SHAREPASS_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Only events newer than this, e.g. 1h, 7d
        #[arg(long)]
        since: Option<String>,
        /// Only events with this action, e.g. share.denied
        #[arg(long)]
        action: Option<String>,
        /// Maximum number of events
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(clap::Args)]
struct LifecycleArgs {
    /// Time until expiry, e.g. 30m, 2h, 3d (server default: 24h)
    #[arg(long)]
    ttl: Option<String>,
    /// Number of times the password can be viewed (server default: 1)
    #[arg(long)]
    views: Option<u32>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SHAREPASS_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Keygen => {
            println!("{}", sharepass_server::store::crypto::EncryptionKey::generate().encode());
            Ok(())
        }

        Commands::Share {
            password,
            lifecycle,
        } => {
            let password = match password {
                Some(p) => p,
                None => read_stdin_password()?,
            };
            let mut body = lifecycle.to_json()?;
            body["password"] = Value::String(password);
            cmd_create(&cli.server, "password", body).await
        }

        Commands::Generate {
            size,
            no_numbers,
            no_special,
            lifecycle,
        } => {
            let mut body = lifecycle.to_json()?;
            body["size"] = json!(size);
            body["numbers"] = json!(!no_numbers);
            body["special_char"] = json!(!no_special);
            cmd_create(&cli.server, "generate", body).await
        }

        Commands::Redeem { token } => cmd_redeem(&cli.server, &token).await,

        Commands::Audit {
            data_dir,
            since,
            action,
            limit,
        } => {
            let since = match since {
                Some(s) => {
                    let ago = chrono::Duration::from_std(parse_duration(&s)?)
                        .context("--since out of range")?;
                    Some((Utc::now() - ago).timestamp())
                }
                None => None,
            };
            let query = AuditQuery {
                since,
                action,
                limit,
            };
            let data_dir = sharepass_server::resolve_data_dir(data_dir.as_ref())?;
            for event in load_audit(&data_dir.join("sharepass.db"), &query)? {
                println!("{}", format_event(&event));
            }
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = sharepass_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    sharepass_server::run(cfg).await
}

async fn cmd_create(server: &str, mode: &str, body: Value) -> Result<()> {
    let base = server.trim_end_matches('/');
    let resp = Client::new()
        .post(format!("{base}/share/{mode}"))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        anyhow::bail!("server returned {status}: {}", error_message(&json));
    }

    let token = json["token"].as_str().context("response has no token")?;
    println!("{base}/share/{token}");
    println!(
        "  expires {}, {} view(s)",
        json["expire_at"].as_str().unwrap_or("?"),
        json["views_left"]
    );
    Ok(())
}

async fn cmd_redeem(server: &str, token: &str) -> Result<()> {
    let base = server.trim_end_matches('/');
    let token = token.rsplit('/').next().unwrap_or(token);
    let resp = Client::new()
        .post(format!("{base}/share/{token}"))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        anyhow::bail!("{}", error_message(&json));
    }

    println!("{}", json["password"].as_str().unwrap_or(""));
    match json["views_left"].as_u64() {
        Some(0) => eprintln!("(last view: the secret is now destroyed)"),
        Some(n) => eprintln!("({n} view(s) left)"),
        None => {}
    }
    Ok(())
}

fn load_audit(db_path: &Path, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
    let store = Store::open_existing(db_path)
        .context("open audit log (is the server still running?)")?;
    store.list_audit(query)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn format_event(event: &AuditEvent) -> String {
    let when = chrono::DateTime::from_timestamp(event.timestamp, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| event.timestamp.to_string());
    format!(
        "{when}  {:<15} {:<6} {:<15} {} {}",
        event.action,
        event.token_hint.as_deref().unwrap_or("-"),
        event.source_ip,
        if event.success { "ok  " } else { "FAIL" },
        event.detail.as_deref().unwrap_or(""),
    )
    .trim_end()
    .to_owned()
}

impl LifecycleArgs {
    fn to_json(&self) -> Result<Value> {
        let mut body = json!({});
        if let Some(ttl) = &self.ttl {
            let ttl = parse_duration(ttl)?;
            let ttl = chrono::Duration::from_std(ttl).context("ttl out of range")?;
            body["expire_at"] = json!((Utc::now() + ttl).to_rfc3339());
        }
        if let Some(views) = self.views {
            body["views_left"] = json!(views);
        }
        Ok(body)
    }
}

/// Parse human duration strings like "1h", "30m", "7d", "5s".
fn parse_duration(s: &str) -> Result<std::time::Duration> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.into())
}

fn read_stdin_password() -> Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("read password from stdin")?;
    let password = input.trim_end_matches(['\r', '\n']).to_owned();
    if password.is_empty() {
        anyhow::bail!("no password given on the command line or stdin");
    }
    Ok(password)
}

fn error_message(json: &Value) -> &str {
    json["error"].as_str().unwrap_or("unknown error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_args_build_request_fields() {
        let args = LifecycleArgs {
            ttl: Some("2h".into()),
            views: Some(3),
        };
        let body = args.to_json().unwrap();
        assert_eq!(body["views_left"], 3);
        let expire_at = chrono::DateTime::parse_from_rfc3339(body["expire_at"].as_str().unwrap())
            .unwrap()
            .with_timezone(&Utc);
        let ttl = expire_at - Utc::now();
        assert!(ttl > chrono::Duration::minutes(119) && ttl <= chrono::Duration::hours(2));
    }

    #[test]
    fn empty_lifecycle_args_leave_server_defaults() {
        let args = LifecycleArgs {
            ttl: None,
            views: None,
        };
        assert_eq!(args.to_json().unwrap(), json!({}));
    }

    #[test]
    fn audit_reads_a_stopped_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sharepass.db");
        {
            let store = Store::open(&path).unwrap();
            for action in ["share.create", "share.denied", "share.burned"] {
                store
                    .record_audit(AuditEvent::new(
                        action,
                        Some("AbCdEf".into()),
                        "192.0.2.1".into(),
                        action != "share.denied",
                        Some("secret not found".into()),
                    ))
                    .unwrap();
            }
        }

        let denied = load_audit(
            &path,
            &AuditQuery {
                action: Some("share.denied".into()),
                ..AuditQuery::default()
            },
        )
        .unwrap();
        assert_eq!(denied.len(), 1);

        let line = format_event(&denied[0]);
        assert!(line.contains("share.denied"));
        assert!(line.contains("AbCdEf"));
        assert!(line.contains("192.0.2.1"));
        assert!(line.contains("FAIL"));
    }

    #[test]
    fn audit_without_a_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_audit(&dir.path().join("missing.db"), &AuditQuery::default()).is_err());
    }

    #[test]
    fn bad_ttl_is_rejected() {
        assert!(parse_duration("soon").is_err());
        assert_eq!(parse_duration("90s").unwrap().as_secs(), 90);
    }
}
