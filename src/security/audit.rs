//! Append-only, hash-chained security audit log.
//!
//! Stored at `<state_dir>/agentbox.audit.jsonl`, outside every session
//! workspace. Each entry carries the SHA-256 of the previous line, so any
//! edit to earlier history breaks the chain.
//!
//! # Format
//!
//! One JSON object per line (JSONL):
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp |
//! | `action` | `path_traversal_blocked`, `execution_rejected`, `confirmation_approved`, ... |
//! | `session_id` | Session the event belongs to (`audit_system` for chain repairs) |
//! | `code_sha256` | SHA-256 of the submitted code, when the event concerns an execution |
//! | `prev_entry_sha256` | SHA-256 of the previous JSONL line (chain link) |
//! | `detail` | Optional free-form context |
//!
//! The first entry links to 64 zeros.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

const AUDIT_FILENAME: &str = "agentbox.audit.jsonl";

/// The hash used for the first entry in the chain (no predecessor).
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub action: AuditAction,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_sha256: Option<String>,
    pub prev_entry_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Security-relevant events recorded in the audit log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A workspace path resolved outside its root.
    PathTraversalBlocked,
    /// Code matched a forbidden pattern and was never run.
    ExecutionRejected,
    /// A session already had an execution in flight.
    ConcurrentAccessDenied,
    ConfirmationRequested,
    ConfirmationApproved,
    ConfirmationRejected,
    ConfirmationTimedOut,
    /// High-risk code handed to an executor.
    HighRiskExecution,
    /// Execution killed at its deadline.
    ExecutionTimedOut,
    /// Execution cancelled by session cleanup.
    ExecutionCancelled,
    /// Previous audit entry corrupted, new chain segment started.
    ChainRecovery,
}

/// Shared handle used by the sandbox components to write audit entries.
///
/// Appends from one process are serialized through an internal mutex.
/// Write failures are logged and swallowed: auditing never fails an
/// execution.
#[derive(Debug, Clone)]
pub struct AuditLog {
    state_dir: Option<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: Some(state_dir.into()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// A handle that records nothing.
    pub fn disabled() -> Self {
        Self {
            state_dir: None,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state_dir.is_some()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.state_dir.as_deref().map(audit_file_path)
    }

    pub fn record(&self, action: AuditAction, session_id: &str, detail: Option<&str>) {
        self.write(action, session_id, None, detail);
    }

    /// Record an event about a specific piece of submitted code.
    pub fn record_code(
        &self,
        action: AuditAction,
        session_id: &str,
        code: &str,
        detail: Option<&str>,
    ) {
        let hash = sha256_hex(code.as_bytes());
        self.write(action, session_id, Some(&hash), detail);
    }

    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        match self.state_dir {
            Some(ref dir) => read_audit_log(dir),
            None => Ok(Vec::new()),
        }
    }

    fn write(
        &self,
        action: AuditAction,
        session_id: &str,
        code_sha256: Option<&str>,
        detail: Option<&str>,
    ) {
        let Some(ref dir) = self.state_dir else {
            return;
        };
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = append_audit_entry(dir, action, session_id, code_sha256, detail) {
            warn!("Failed to write audit entry {:?}: {}", action, e);
        }
    }
}

/// Append a new entry to the audit log.
///
/// Reads the last line of the existing log (if any) to compute the chain
/// hash. If that line is not valid JSON, a `ChainRecovery` entry is
/// written first to mark the break.
pub fn append_audit_entry(
    state_dir: &Path,
    action: AuditAction,
    session_id: &str,
    code_sha256: Option<&str>,
    detail: Option<&str>,
) -> Result<()> {
    fs::create_dir_all(state_dir).context("Failed to create state directory")?;
    let path = audit_file_path(state_dir);

    let prev_hash = if path.exists() {
        let content = fs::read_to_string(&path).context("Failed to read audit log")?;
        match content.lines().last() {
            Some(last_line) if !last_line.is_empty() => {
                if serde_json::from_str::<AuditEntry>(last_line).is_ok() {
                    sha256_hex(last_line.as_bytes())
                } else {
                    let recovery = AuditEntry {
                        ts: chrono::Utc::now().to_rfc3339(),
                        action: AuditAction::ChainRecovery,
                        session_id: "audit_system".to_string(),
                        code_sha256: None,
                        prev_entry_sha256: sha256_hex(last_line.as_bytes()),
                        detail: Some(format!(
                            "Previous entry corrupted ({} bytes), new chain segment",
                            last_line.len()
                        )),
                    };
                    let recovery_json = serde_json::to_string(&recovery)
                        .context("Failed to serialize recovery entry")?;
                    append_line(&path, &recovery_json)?;
                    sha256_hex(recovery_json.as_bytes())
                }
            }
            _ => GENESIS_HASH.to_string(),
        }
    } else {
        GENESIS_HASH.to_string()
    };

    let entry = AuditEntry {
        ts: chrono::Utc::now().to_rfc3339(),
        action,
        session_id: session_id.to_string(),
        code_sha256: code_sha256.map(|s| s.to_string()),
        prev_entry_sha256: prev_hash,
        detail: detail.map(|d| d.to_string()),
    };

    let json = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
    append_line(&path, &json)
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open audit log")?;
    writeln!(file, "{}", line).context("Failed to write audit entry")?;
    Ok(())
}

/// Read and parse all entries. Corrupted lines are skipped.
pub fn read_audit_log(state_dir: &Path) -> Result<Vec<AuditEntry>> {
    let path = audit_file_path(state_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str::<AuditEntry>(l).ok())
        .collect())
}

/// Verify the hash chain, returning the indices of broken links.
///
/// Corrupted (non-JSON) lines count as broken. An empty result means the
/// chain is intact.
pub fn verify_audit_chain(state_dir: &Path) -> Result<Vec<usize>> {
    let path = audit_file_path(state_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&path).context("Failed to read audit log")?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

    let mut broken = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
            broken.push(i);
            continue;
        };
        let expected = if i == 0 {
            GENESIS_HASH.to_string()
        } else {
            sha256_hex(lines[i - 1].as_bytes())
        };
        if entry.prev_entry_sha256 != expected {
            broken.push(i);
        }
    }

    Ok(broken)
}

pub fn audit_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(AUDIT_FILENAME)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
