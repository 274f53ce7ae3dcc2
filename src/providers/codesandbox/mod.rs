//! CodeSandbox: hibernate/resume VMs, everything else over the agent session.
//!
//! There is no delete: `destroy` hibernates and drops the session. Env
//! injection at create time is not offered by the fork API and is rejected.

pub mod api;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use self::api::{CodeSandboxApi, HttpCodeSandboxApi};
use crate::config::CodeSandboxConfig;
use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::{Sandbox, with_deadline};
use crate::sandbox::lifecycle::Lifecycle;
use crate::sandbox::terminal::{OutputHandler, Terminal, spawn_output_pump};
use crate::sandbox::types::*;
use crate::sandbox::{shell, types};

pub const PROVIDER: &str = "codesandbox";
pub const DEFAULT_TEMPLATE: &str = "pcz35m";

pub struct CodeSandboxSandbox {
    api: Arc<dyn CodeSandboxApi>,
    state: Lifecycle<String>,
}

impl CodeSandboxSandbox {
    pub fn from_env() -> Result<Self, SandboxError> {
        let config = CodeSandboxConfig::from_env()?;
        Ok(Self::with_api(Arc::new(HttpCodeSandboxApi::new(&config)?)))
    }

    pub fn with_api(api: Arc<dyn CodeSandboxApi>) -> Self {
        Self {
            api,
            state: Lifecycle::Disconnected,
        }
    }
}

#[async_trait]
impl Sandbox for CodeSandboxSandbox {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn init(
        &mut self,
        id: Option<&str>,
        options: &CreateSandboxOptions,
    ) -> Result<(), SandboxError> {
        self.state.ensure_disconnected()?;
        let sandbox_id = match id {
            Some(id) => {
                self.api.resume_sandbox(id).await?;
                tracing::info!(provider = PROVIDER, sandbox_id = %id, "sandbox resumed on attach");
                id.to_string()
            }
            None => {
                if !options.envs.is_empty() {
                    return Err(SandboxError::Config(
                        "codesandbox does not support environment variables at create time".into(),
                    ));
                }
                let template = options.template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
                let id = self.api.create_sandbox(template).await?;
                tracing::info!(provider = PROVIDER, sandbox_id = %id, template, "sandbox forked");
                id
            }
        };
        self.state = Lifecycle::Connected(sandbox_id);
        Ok(())
    }

    fn id(&self) -> Result<String, SandboxError> {
        self.state.connected().cloned()
    }

    async fn suspend(&mut self) -> Result<(), SandboxError> {
        let id = self.state.ready_to_suspend()?.clone();
        self.api.hibernate_sandbox(&id).await?;
        tracing::info!(provider = PROVIDER, sandbox_id = %id, "sandbox hibernated");
        self.state = Lifecycle::Suspended(id);
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), SandboxError> {
        let id = self.state.suspended()?.clone();
        self.api.resume_sandbox(&id).await?;
        tracing::info!(provider = PROVIDER, sandbox_id = %id, "sandbox resumed");
        self.state = Lifecycle::Connected(id);
        Ok(())
    }

    async fn destroy(&mut self) -> Result<(), SandboxError> {
        match &self.state {
            Lifecycle::Disconnected => return Ok(()),
            Lifecycle::Connected(id) => self.api.hibernate_sandbox(id).await?,
            Lifecycle::Suspended(_) => {}
        }
        if let Lifecycle::Connected(id) | Lifecycle::Suspended(id) = self.state.take() {
            self.api.disconnect(&id).await;
            tracing::info!(provider = PROVIDER, sandbox_id = %id, "sandbox released");
        }
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        options: &RunCommandOptions,
    ) -> Result<CommandResult, SandboxError> {
        let id = self.state.connected()?;
        let script = shell::script_for(command, options);
        let out = with_deadline(options.timeout, self.api.run(id, &script)).await?;
        if options.background {
            let pid = types::parse_pid(&out.stdout)?;
            return Ok(CommandResult::Background { pid });
        }
        Ok(out.into())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.api.read_file(self.state.connected()?, path).await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.api
            .write_file(self.state.connected()?, path, content)
            .await
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        self.api.read_dir(self.state.connected()?, path).await
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        self.api.rename(self.state.connected()?, from, to).await
    }

    async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        self.api.remove(self.state.connected()?, path).await
    }

    async fn create_directory(&self, path: &str) -> Result<(), SandboxError> {
        self.api.mkdir(self.state.connected()?, path).await
    }

    async fn get_preview_url(&self, port: u16) -> Result<String, SandboxError> {
        let id = self.state.connected()?;
        Ok(format!("https://{id}-{port}.csb.app"))
    }

    async fn create_terminal(
        &self,
        on_output: OutputHandler,
    ) -> Result<Box<dyn Terminal>, SandboxError> {
        let id = self.state.connected()?.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = spawn_output_pump(rx, on_output);
        let shell_id = match self.api.open_shell(&id, tx).await {
            Ok(shell_id) => shell_id,
            Err(e) => {
                pump.abort();
                return Err(e);
            }
        };
        tracing::debug!(provider = PROVIDER, sandbox_id = %id, shell_id = %shell_id, "shell opened");
        Ok(Box::new(CodeSandboxTerminal {
            api: self.api.clone(),
            sandbox_id: id,
            shell_id: Some(shell_id),
            pump,
        }))
    }
}

pub struct CodeSandboxTerminal {
    api: Arc<dyn CodeSandboxApi>,
    sandbox_id: String,
    shell_id: Option<String>,
    pump: JoinHandle<()>,
}

impl CodeSandboxTerminal {
    fn shell_id(&self) -> Result<&str, SandboxError> {
        self.shell_id
            .as_deref()
            .ok_or(SandboxError::InvalidState("terminal has been killed"))
    }
}

#[async_trait]
impl Terminal for CodeSandboxTerminal {
    async fn write(&mut self, data: &str) -> Result<(), SandboxError> {
        let shell_id = self.shell_id()?;
        self.api.shell_input(&self.sandbox_id, shell_id, data).await
    }

    async fn resize(&mut self, _cols: u16, _rows: u16) -> Result<(), SandboxError> {
        self.shell_id()?;
        Err(SandboxError::Unsupported("codesandbox terminals cannot be resized"))
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        if let Some(shell_id) = self.shell_id.take() {
            self.api.close_shell(&self.sandbox_id, &shell_id).await?;
        }
        Ok(())
    }
}

impl Drop for CodeSandboxTerminal {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

// ── Tests ───────────────────────────────────────────────────────────
