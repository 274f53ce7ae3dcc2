//! Daytona: stop/start suspension, toolbox file API, no terminal.

pub mod api;

use std::sync::Arc;

use async_trait::async_trait;

use self::api::{DaytonaApi, DaytonaState, HttpDaytonaApi};
use crate::config::DaytonaConfig;
use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::{Sandbox, with_deadline};
use crate::sandbox::lifecycle::Lifecycle;
use crate::sandbox::terminal::{OutputHandler, Terminal};
use crate::sandbox::types::*;
use crate::sandbox::{shell, types};

pub const PROVIDER: &str = "daytona";
const FOLDER_MODE: &str = "755";

pub struct DaytonaSandbox {
    api: Arc<dyn DaytonaApi>,
    state: Lifecycle<String>,
}

impl DaytonaSandbox {
    pub fn from_env() -> Result<Self, SandboxError> {
        let config = DaytonaConfig::from_env()?;
        Ok(Self::with_api(Arc::new(HttpDaytonaApi::new(&config)?)))
    }

    pub fn with_api(api: Arc<dyn DaytonaApi>) -> Self {
        Self {
            api,
            state: Lifecycle::Disconnected,
        }
    }
}

#[async_trait]
impl Sandbox for DaytonaSandbox {
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
                if info.state == DaytonaState::Stopped {
                    tracing::info!(provider = PROVIDER, sandbox_id = %id, "starting stopped sandbox on attach");
                    self.api.start_sandbox(id).await?;
                }
                info.id
            }
            None => {
                let info = self
                    .api
                    .create_sandbox(options.template.as_deref(), &options.envs)
                    .await?;
                tracing::info!(
                    provider = PROVIDER,
                    sandbox_id = %info.id,
                    snapshot = options.template.as_deref().unwrap_or("default"),
                    "sandbox created"
                );
                info.id
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
        self.api.stop_sandbox(&id).await?;
        tracing::info!(provider = PROVIDER, sandbox_id = %id, "sandbox stopped");
        self.state = Lifecycle::Suspended(id);
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), SandboxError> {
        let id = self.state.suspended()?.clone();
        self.api.start_sandbox(&id).await?;
        tracing::info!(provider = PROVIDER, sandbox_id = %id, "sandbox started");
        self.state = Lifecycle::Connected(id);
        Ok(())
    }

    async fn destroy(&mut self) -> Result<(), SandboxError> {
        let id = match &self.state {
            Lifecycle::Disconnected => return Ok(()),
            Lifecycle::Connected(id) | Lifecycle::Suspended(id) => id.clone(),
        };
        self.api.delete_sandbox(&id).await?;
        self.state.take();
        tracing::info!(provider = PROVIDER, sandbox_id = %id, "sandbox deleted");
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        options: &RunCommandOptions,
    ) -> Result<CommandResult, SandboxError> {
        let id = self.state.connected()?;
        // cwd goes to the toolbox natively; env overrides ride in the script.
        let scripted = RunCommandOptions {
            cwd: None,
            ..options.clone()
        };
        let script = shell::script_for(command, &scripted);
        let cwd = options.cwd.as_deref();
        let reply = with_deadline(
            options.timeout,
            self.api.execute(id, &script, cwd, options.timeout),
        )
        .await?;

        if options.background {
            let pid = types::parse_pid(&reply.result)?;
            return Ok(CommandResult::Background { pid });
        }
        // The toolbox reports one combined stream.
        Ok(CommandResult::Finished {
            exit_code: reply.exit_code,
            output: reply.result,
        })
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.api.download_file(self.state.connected()?, path).await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.api
            .upload_file(self.state.connected()?, path, content)
            .await
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let infos = self.api.list_files(self.state.connected()?, path).await?;
        Ok(infos.into_iter().map(FileEntry::from).collect())
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        self.api.move_file(self.state.connected()?, from, to).await
    }

    async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        let id = self.state.connected()?;
        if self.api.file_info(id, path).await?.is_dir {
            return Err(SandboxError::Unsupported(
                "daytona cannot delete directories",
            ));
        }
        self.api.delete_file(id, path).await
    }

    async fn create_directory(&self, path: &str) -> Result<(), SandboxError> {
        self.api
            .create_folder(self.state.connected()?, path, FOLDER_MODE)
            .await
    }

    async fn get_preview_url(&self, port: u16) -> Result<String, SandboxError> {
        self.api.preview_url(self.state.connected()?, port).await
    }

    async fn create_terminal(
        &self,
        _on_output: OutputHandler,
    ) -> Result<Box<dyn Terminal>, SandboxError> {
        self.state.connected()?;
        Err(SandboxError::Unsupported(
            "daytona does not provide interactive terminals",
        ))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
