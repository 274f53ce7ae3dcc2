//! SSH: any reachable host as a sandbox. Everything goes through the shell.
//!
//! The id is the `user@host:port` target; attaching by id opens a new
//! connection to that target. There is nothing to pause, so suspend and
//! resume are unsupported, and destroy only drops the connection.

pub mod transport;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use self::transport::{OpenSshTransport, ShellChannel, SshTransport};
use crate::config::SshConfig;
use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::{Sandbox, with_deadline};
use crate::sandbox::lifecycle::Lifecycle;
use crate::sandbox::terminal::{OutputHandler, Terminal, spawn_output_pump};
use crate::sandbox::types::*;
use crate::sandbox::{shell, types};

pub const PROVIDER: &str = "ssh";

/// Opens a transport for a resolved target.
pub type TransportFactory = Arc<dyn Fn(&SshConfig) -> Arc<dyn SshTransport> + Send + Sync>;

struct Connection {
    config: SshConfig,
    transport: Arc<dyn SshTransport>,
    /// Create-time env, applied to every command.
    envs: BTreeMap<String, String>,
}

pub struct SshSandbox {
    config: SshConfig,
    connect: TransportFactory,
    state: Lifecycle<Connection>,
}

impl SshSandbox {
    pub fn from_env() -> Result<Self, SandboxError> {
        let config = SshConfig::from_env()?;
        Ok(Self::with_transport(
            config,
            Arc::new(|target: &SshConfig| {
                Arc::new(OpenSshTransport::new(target.clone())) as Arc<dyn SshTransport>
            }),
        ))
    }

    pub fn with_transport(config: SshConfig, connect: TransportFactory) -> Self {
        Self {
            config,
            connect,
            state: Lifecycle::Disconnected,
        }
    }

    /// Run a script and return stdout, failing on non-zero exit.
    async fn remote(
        &self,
        script: &str,
        stdin: Option<&str>,
        what: &str,
    ) -> Result<String, SandboxError> {
        let conn = self.state.connected()?;
        let out = conn.transport.exec(script, stdin).await?;
        if out.exit_code != 0 {
            return Err(SandboxError::CommandFailed {
                code: Some(out.exit_code),
                stderr: format!("{what}: {}", out.stderr.trim()),
            });
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl Sandbox for SshSandbox {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn init(
        &mut self,
        id: Option<&str>,
        options: &CreateSandboxOptions,
    ) -> Result<(), SandboxError> {
        self.state.ensure_disconnected()?;
        let config = match id {
            Some(target) => self.config.with_target(target)?,
            None => self.config.clone(),
        };
        if let Some(template) = &options.template {
            tracing::warn!(provider = PROVIDER, template = %template, "ssh hosts have no templates; ignoring");
        }
        let transport = (self.connect)(&config);
        // `ssh` exits 255 on its own failures; `true` cannot fail remotely.
        let check = transport.exec("true", None).await?;
        if check.exit_code != 0 {
            return Err(SandboxError::Backend(format!(
                "ssh to {} failed: {}",
                config.target(),
                check.stderr.trim()
            )));
        }
        tracing::info!(provider = PROVIDER, sandbox_id = %config.target(), "connected");
        self.state = Lifecycle::Connected(Connection {
            config,
            transport,
            envs: options.envs.clone(),
        });
        Ok(())
    }

    fn id(&self) -> Result<String, SandboxError> {
        Ok(self.state.connected()?.config.target())
    }

    async fn suspend(&mut self) -> Result<(), SandboxError> {
        self.state.connected()?;
        Err(SandboxError::Unsupported("ssh hosts cannot be suspended"))
    }

    async fn resume(&mut self) -> Result<(), SandboxError> {
        self.state.connected()?;
        Err(SandboxError::Unsupported("ssh hosts cannot be resumed"))
    }

    async fn destroy(&mut self) -> Result<(), SandboxError> {
        if let Lifecycle::Connected(conn) = self.state.take() {
            tracing::info!(provider = PROVIDER, sandbox_id = %conn.config.target(), "disconnected");
        }
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        options: &RunCommandOptions,
    ) -> Result<CommandResult, SandboxError> {
        let conn = self.state.connected()?;
        let mut envs = conn.envs.clone();
        envs.extend(options.envs.clone());
        let merged = RunCommandOptions {
            envs,
            ..options.clone()
        };
        let script = shell::script_for(command, &merged);
        let out = with_deadline(options.timeout, conn.transport.exec(&script, None)).await?;
        if options.background {
            let pid = types::parse_pid(&out.stdout)?;
            return Ok(CommandResult::Background { pid });
        }
        Ok(out.into())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.remote(&shell::read_file(path), None, "cat").await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.remote(&format!("cat > {path}"), Some(content), "write")
            .await?;
        Ok(())
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let listing = self.remote(&shell::list_dir(path), None, "ls").await?;
        Ok(shell::parse_listing(&listing))
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        self.remote(&shell::move_path(from, to), None, "mv").await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        self.remote(&shell::remove_path(path), None, "rm").await?;
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> Result<(), SandboxError> {
        self.remote(&shell::make_dir(path), None, "mkdir").await?;
        Ok(())
    }

    async fn get_preview_url(&self, port: u16) -> Result<String, SandboxError> {
        let conn = self.state.connected()?;
        Ok(format!("http://{}:{port}", conn.config.host))
    }

    async fn create_terminal(
        &self,
        on_output: OutputHandler,
    ) -> Result<Box<dyn Terminal>, SandboxError> {
        let conn = self.state.connected()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = spawn_output_pump(rx, on_output);
        let channel = match conn.transport.open_shell(tx).await {
            Ok(channel) => channel,
            Err(e) => {
                pump.abort();
                return Err(e);
            }
        };
        tracing::debug!(provider = PROVIDER, sandbox_id = %conn.config.target(), "shell opened");
        Ok(Box::new(SshTerminal {
            channel: Some(channel),
            pump,
        }))
    }
}

pub struct SshTerminal {
    channel: Option<Box<dyn ShellChannel>>,
    pump: JoinHandle<()>,
}

impl SshTerminal {
    fn channel(&mut self) -> Result<&mut Box<dyn ShellChannel>, SandboxError> {
        self.channel
            .as_mut()
            .ok_or(SandboxError::InvalidState("terminal has been killed"))
    }
}

#[async_trait]
impl Terminal for SshTerminal {
    async fn write(&mut self, data: &str) -> Result<(), SandboxError> {
        self.channel()?.write(data.as_bytes()).await
    }

    async fn resize(&mut self, _cols: u16, _rows: u16) -> Result<(), SandboxError> {
        self.channel()?;
        Err(SandboxError::Unsupported("ssh terminals cannot be resized"))
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await?;
        }
        Ok(())
    }
}

impl Drop for SshTerminal {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

// ── Tests ───────────────────────────────────────────────────────────
