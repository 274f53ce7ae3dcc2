//! Command channel to a remote host, backed by the system `ssh` binary.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use crate::config::SshConfig;
use crate::providers::ExecOutput;
use crate::sandbox::error::SandboxError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SSH_PROGRAM: &str = "ssh";

#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Run `command` through the remote login shell, feeding `stdin` if given.
    ///
    /// The exit status is passed through unchanged. `ssh` also uses 255 for
    /// its own failures, so only the connection check in `init` treats a
    /// non-zero status as a transport error.
    async fn exec(&self, command: &str, stdin: Option<&str>) -> Result<ExecOutput, SandboxError>;

    /// Start an interactive shell; output chunks go to `output`.
    async fn open_shell(
        &self,
        output: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Box<dyn ShellChannel>, SandboxError>;
}

#[async_trait]
pub trait ShellChannel: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), SandboxError>;
    async fn close(&mut self) -> Result<(), SandboxError>;
}

pub struct OpenSshTransport {
    config: SshConfig,
    program: String,
}

impl OpenSshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            program: SSH_PROGRAM.into(),
        }
    }

    /// Use another `ssh`-compatible binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(key) = &self.config.key_path {
            args.push("-i".into());
            args.push(key.to_string_lossy().into_owned());
        }
        args.extend([
            "-p".into(),
            self.config.port.to_string(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT.as_secs()),
            "-o".into(),
            "LogLevel=ERROR".into(),
            format!("{}@{}", self.config.user, self.config.host),
        ]);
        args
    }
}

#[async_trait]
impl SshTransport for OpenSshTransport {
    async fn exec(&self, command: &str, stdin: Option<&str>) -> Result<ExecOutput, SandboxError> {
        let mut child = Command::new(&self.program)
            .args(self.base_args())
            .arg(command)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Exec(format!("failed to spawn ssh: {e}")))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok(ExecOutput::new(
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn open_shell(
        &self,
        output: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Box<dyn ShellChannel>, SandboxError> {
        let mut child = Command::new(&self.program)
            .arg("-tt")
            .args(self.base_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Exec(format!("failed to spawn ssh: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Exec("ssh stdin unavailable".into()))?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward(stderr, output));
        }
        Ok(Box::new(SshShell {
            child,
            stdin: Some(stdin),
        }))
    }
}

async fn forward<R: AsyncRead + Unpin>(mut reader: R, output: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if output.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "ssh shell stream closed");
                break;
            }
        }
    }
}

struct SshShell {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl ShellChannel for SshShell {
    async fn write(&mut self, data: &[u8]) -> Result<(), SandboxError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or(SandboxError::InvalidState("ssh shell is closed"))?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SandboxError> {
        self.stdin.take();
        if self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
