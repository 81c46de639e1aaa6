//! Security audit trail for sandbox events.

pub mod audit;

pub use audit::{
    AuditAction, AuditEntry, AuditLog, append_audit_entry, audit_file_path, read_audit_log,
    verify_audit_chain,
};
