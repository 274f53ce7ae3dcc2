use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::SandboxError;

// ── Creation options ────────────────────────────────────────────────

/// Options recognised when creating a sandbox.
///
/// `template` is a vendor image, template or snapshot reference; each
/// provider interprets it in its own namespace. Providers that cannot honour
/// an option reject it with `SandboxError::Config` before any remote call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSandboxOptions {
    pub template: Option<String>,
    pub envs: BTreeMap<String, String>,
}

impl CreateSandboxOptions {
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }
}

// ── Command execution ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCommandOptions {
    /// Return a pid immediately instead of waiting for the command.
    pub background: bool,
    pub cwd: Option<String>,
    pub envs: BTreeMap<String, String>,
    /// Foreground only. Expiry yields `SandboxError::Timeout`.
    pub timeout: Option<Duration>,
}

impl RunCommandOptions {
    pub fn background() -> Self {
        Self {
            background: true,
            ..Default::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of `Sandbox::run_command`.
///
/// A non-zero exit is a normal `Finished` result. `output` holds stdout
/// followed by stderr; when a vendor only reports one combined stream it is
/// passed through as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CommandResult {
    Finished { exit_code: i32, output: String },
    Background { pid: u32 },
}

impl CommandResult {
    /// Build a finished result from separate streams.
    pub fn finished(exit_code: i32, stdout: &str, stderr: &str) -> Self {
        let mut output = String::with_capacity(stdout.len() + stderr.len());
        output.push_str(stdout);
        output.push_str(stderr);
        CommandResult::Finished { exit_code, output }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandResult::Finished { exit_code, .. } => Some(*exit_code),
            CommandResult::Background { .. } => None,
        }
    }

    pub fn output(&self) -> Option<&str> {
        match self {
            CommandResult::Finished { output, .. } => Some(output.as_str()),
            CommandResult::Background { .. } => None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            CommandResult::Background { pid } => Some(*pid),
            CommandResult::Finished { .. } => None,
        }
    }
}

// ── Files ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
}

impl FileEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FileKind::File,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FileKind::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

// ── Terminals ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 20 }
    }
}

/// Parse a pid printed by `echo $!`.
pub(crate) fn parse_pid(raw: &str) -> Result<u32, SandboxError> {
    raw.trim()
        .lines()
        .last()
        .and_then(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0)
        .ok_or_else(|| SandboxError::Exec(format!("failed to read background pid from {raw:?}")))
}

// ── Tests ───────────────────────────────────────────────────────────
