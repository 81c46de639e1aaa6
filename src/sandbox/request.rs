use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ErrorCode, SandboxError};

use super::risk::RiskLevel;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_048_576;

/// Languages the sandbox knows how to run. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Shell,
    JavaScript,
}

impl Language {
    /// Interpreter and arguments that read the program from stdin.
    pub fn interpreter(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Language::Python => ("python3", &["-"]),
            Language::Shell => ("bash", &["-s"]),
            Language::JavaScript => ("node", &["-"]),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Shell => "shell",
            Language::JavaScript => "javascript",
        }
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "shell" | "bash" | "sh" => Ok(Language::Shell),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            other => Err(SandboxError::Validation(format!(
                "unsupported language '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Isolation backend. Variants are ordered by isolation strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Host child process confined to the workspace (plus kernel sandbox when available).
    Process,
    /// Long-lived pooled container reused across calls within a session.
    ManagedEnvironment,
    /// Fresh disposable container per execution.
    Container,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::Process,
        BackendKind::ManagedEnvironment,
        BackendKind::Container,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Process => "process",
            BackendKind::ManagedEnvironment => "managed-environment",
            BackendKind::Container => "container",
        }
    }
}

impl FromStr for BackendKind {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(BackendKind::Process),
            "container" | "docker" => Ok(BackendKind::Container),
            "managed" | "managed-environment" | "managed_environment" => {
                Ok(BackendKind::ManagedEnvironment)
            }
            other => Err(SandboxError::Validation(format!(
                "unknown backend '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers a session's workspace root is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionScope {
    pub organization_id: String,
    pub team_id: String,
    pub workspace_id: String,
    pub session_id: String,
}

impl SessionScope {
    pub fn new(
        organization_id: impl Into<String>,
        team_id: impl Into<String>,
        workspace_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            team_id: team_id.into(),
            workspace_id: workspace_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Scope with placeholder organization/team/workspace ids.
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self::new("default", "default", "default", session_id)
    }

    /// Check that every id is non-empty and usable as a single path segment.
    pub fn validate(&self) -> Result<(), SandboxError> {
        for (name, value) in [
            ("organization id", &self.organization_id),
            ("team id", &self.team_id),
            ("workspace id", &self.workspace_id),
            ("session id", &self.session_id),
        ] {
            if value.trim().is_empty() {
                return Err(SandboxError::Validation(format!("{} must not be empty", name)));
            }
            let safe = value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
            if !safe || value == "." || value == ".." {
                return Err(SandboxError::Validation(format!(
                    "{} '{}' contains characters not allowed in a path segment",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// A proposed execution. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub backend: Option<BackendKind>,
    pub scope: SessionScope,
    pub memory_limit_bytes: u64,
    pub output_limit_bytes: usize,
}

impl ExecutionRequest {
    pub fn new(scope: SessionScope, language: Language, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language,
            timeout: DEFAULT_TIMEOUT,
            backend: None,
            scope,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.scope.session_id
    }

    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.code.trim().is_empty() {
            return Err(SandboxError::Validation("code must not be empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(SandboxError::Validation("timeout must be positive".into()));
        }
        if self.memory_limit_bytes == 0 {
            return Err(SandboxError::Validation(
                "memory ceiling must be positive".into(),
            ));
        }
        if self.output_limit_bytes == 0 {
            return Err(SandboxError::Validation(
                "output ceiling must be positive".into(),
            ));
        }
        self.scope.validate()
    }
}

/// Normalized outcome of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    pub duration_ms: u64,
    #[serde(default)]
    pub created_files: Vec<PathBuf>,
}

impl ExecutionResult {
    /// Failed result for an error that stopped the request.
    pub fn from_error(err: &SandboxError) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: -1,
            error: Some(err.to_string()),
            error_code: Some(err.code()),
            backend: None,
            risk_level: None,
            duration_ms: 0,
            created_files: Vec::new(),
        }
    }

    /// A failed result must explain itself through `error` or a non-zero exit code.
    pub fn is_consistent(&self) -> bool {
        self.success
            || self.exit_code != 0
            || self.error.as_ref().is_some_and(|e| !e.is_empty())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> SessionScope {
        SessionScope::new("org-1", "team-1", "ws-1", "sess-1")
    }

    #[test]
    fn test_language_aliases() {
        assert_eq!("py".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("Bash".parse::<Language>().unwrap(), Language::Shell);
        assert_eq!("node".parse::<Language>().unwrap(), Language::JavaScript);
        assert!(matches!(
            "cobol".parse::<Language>(),
            Err(SandboxError::Validation(_))
        ));
    }

    #[test]
    fn test_backend_isolation_ordering() {
        assert!(BackendKind::Process < BackendKind::ManagedEnvironment);
        assert!(BackendKind::ManagedEnvironment < BackendKind::Container);
        assert_eq!(
            "managed".parse::<BackendKind>().unwrap(),
            BackendKind::ManagedEnvironment
        );
    }

    #[test]
    fn test_validate_rejects_malformed_requests() {
        let ok = ExecutionRequest::new(scope(), Language::Python, "print(1)");
        assert!(ok.validate().is_ok());

        let empty = ExecutionRequest::new(scope(), Language::Python, "   ");
        assert!(matches!(empty.validate(), Err(SandboxError::Validation(_))));

        let zero_timeout = ok.clone().with_timeout(Duration::ZERO);
        assert!(zero_timeout.validate().is_err());

        let zero_output = ok.clone().with_output_limit(0);
        assert!(zero_output.validate().is_err());

        let zero_memory = ok.clone().with_memory_limit(0);
        assert!(zero_memory.validate().is_err());
    }

    #[test]
    fn test_scope_rejects_path_segments() {
        assert!(SessionScope::new("org", "team", "ws", "").validate().is_err());
        assert!(SessionScope::new("org", "..", "ws", "s").validate().is_err());
        assert!(SessionScope::new("org", "team", "a/b", "s").validate().is_err());
        assert!(SessionScope::for_session("abc_123-x").validate().is_ok());
    }

    #[test]
    fn test_error_result_is_consistent() {
        let result = ExecutionResult::from_error(&SandboxError::ConfirmationRejected);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("confirmation rejected"));
        assert_eq!(result.error_code, Some(ErrorCode::ConfirmationRejected));
        assert!(result.is_consistent());
    }

    #[test]
    fn test_request_serializes_timeout_as_millis() {
        let req = ExecutionRequest::new(scope(), Language::Shell, "echo hi")
            .with_timeout(Duration::from_secs(5));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["timeout"], 5000);
        assert_eq!(json["language"], "shell");
    }
}
