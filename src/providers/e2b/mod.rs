//! E2B: native pause/resume, native files, native background pids and ptys.

pub mod api;
pub mod envd;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use self::api::{E2bApi, HttpE2bApi, ProcessSpec};
use crate::config::E2bConfig;
use crate::sandbox::handle::{Sandbox, with_deadline};
use crate::sandbox::lifecycle::Lifecycle;
use crate::sandbox::terminal::{OutputHandler, Terminal, spawn_output_pump};
use crate::sandbox::types::*;
use crate::sandbox::error::SandboxError;

pub const PROVIDER: &str = "e2b";
pub const DEFAULT_TEMPLATE: &str = "base";

pub struct E2bSandbox {
    api: Arc<dyn E2bApi>,
    state: Lifecycle<String>,
}

impl E2bSandbox {
    pub fn from_env() -> Result<Self, SandboxError> {
        let config = E2bConfig::from_env()?;
        Ok(Self::with_api(Arc::new(HttpE2bApi::new(&config)?)))
    }

    pub fn with_api(api: Arc<dyn E2bApi>) -> Self {
        Self {
            api,
            state: Lifecycle::Disconnected,
        }
    }
}

#[async_trait]
impl Sandbox for E2bSandbox {
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
                let info = self.api.get_sandbox(id).await?;
                if info.is_paused() {
                    tracing::info!(provider = PROVIDER, sandbox_id = %id, "resuming paused sandbox on attach");
                    self.api.resume_sandbox(id).await?;
                }
                info.sandbox_id
            }
            None => {
                let template = options.template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
                let info = self.api.create_sandbox(template, &options.envs).await?;
                tracing::info!(provider = PROVIDER, sandbox_id = %info.sandbox_id, template, "sandbox created");
                info.sandbox_id
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
        self.api.pause_sandbox(&id).await?;
        tracing::info!(provider = PROVIDER, sandbox_id = %id, "sandbox paused");
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
        let id = match &self.state {
            Lifecycle::Disconnected => return Ok(()),
            Lifecycle::Connected(id) | Lifecycle::Suspended(id) => id.clone(),
        };
        self.api.kill_sandbox(&id).await?;
        self.state.take();
        tracing::info!(provider = PROVIDER, sandbox_id = %id, "sandbox killed");
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        options: &RunCommandOptions,
    ) -> Result<CommandResult, SandboxError> {
        let id = self.state.connected()?;
        let spec = ProcessSpec {
            command,
            cwd: options.cwd.as_deref(),
            envs: &options.envs,
            timeout: options.timeout,
        };
        if options.background {
            let pid = self.api.spawn_process(id, spec).await?;
            return Ok(CommandResult::Background { pid });
        }
        let out = with_deadline(options.timeout, self.api.run_process(id, spec)).await?;
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
        self.api.list_dir(self.state.connected()?, path).await
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        self.api.rename(self.state.connected()?, from, to).await
    }

    async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        self.api.remove(self.state.connected()?, path).await
    }

    async fn create_directory(&self, path: &str) -> Result<(), SandboxError> {
        self.api.make_dir(self.state.connected()?, path).await
    }

    async fn get_preview_url(&self, port: u16) -> Result<String, SandboxError> {
        let id = self.state.connected()?;
        Ok(format!("https://{}", self.api.host(id, port)))
    }

    async fn create_terminal(
        &self,
        on_output: OutputHandler,
    ) -> Result<Box<dyn Terminal>, SandboxError> {
        let id = self.state.connected()?.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = spawn_output_pump(rx, on_output);
        let pid = match self.api.create_pty(&id, PtySize::default(), tx).await {
            Ok(pid) => pid,
            Err(e) => {
                pump.abort();
                return Err(e);
            }
        };
        tracing::debug!(provider = PROVIDER, sandbox_id = %id, pid, "pty opened");
        Ok(Box::new(E2bTerminal {
            api: self.api.clone(),
            sandbox_id: id,
            pid: Some(pid),
            pump,
        }))
    }
}

/// Pty session backed by an envd process.
pub struct E2bTerminal {
    api: Arc<dyn E2bApi>,
    sandbox_id: String,
    pid: Option<u32>,
    pump: JoinHandle<()>,
}

impl E2bTerminal {
    fn pid(&self) -> Result<u32, SandboxError> {
        self.pid
            .ok_or(SandboxError::InvalidState("terminal has been killed"))
    }
}

#[async_trait]
impl Terminal for E2bTerminal {
    async fn write(&mut self, data: &str) -> Result<(), SandboxError> {
        let pid = self.pid()?;
        self.api
            .send_pty_input(&self.sandbox_id, pid, data.as_bytes())
            .await
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SandboxError> {
        let pid = self.pid()?;
        self.api
            .resize_pty(&self.sandbox_id, pid, PtySize { cols, rows })
            .await
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        if let Some(pid) = self.pid.take() {
            self.api.kill_process(&self.sandbox_id, pid).await?;
        }
        Ok(())
    }
}

impl Drop for E2bTerminal {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

// ── Tests ───────────────────────────────────────────────────────────
