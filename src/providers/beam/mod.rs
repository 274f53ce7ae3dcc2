//! Beam: snapshot-and-terminate suspension, native files and pids.

pub mod api;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use self::api::{BeamApi, HttpBeamApi};
use crate::config::BeamConfig;
use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::{Sandbox, with_deadline};
use crate::sandbox::lifecycle::Lifecycle;
use crate::sandbox::shell;
use crate::sandbox::terminal::{OutputHandler, Terminal};
use crate::sandbox::types::*;

pub const PROVIDER: &str = "beam";

pub struct BeamSandbox {
    api: Arc<dyn BeamApi>,
    /// Connected holds the sandbox id, Suspended the snapshot id.
    state: Lifecycle<String, String>,
}

impl BeamSandbox {
    pub fn from_env() -> Result<Self, SandboxError> {
        let config = BeamConfig::from_env()?;
        Ok(Self::with_api(Arc::new(HttpBeamApi::new(&config)?)))
    }

    pub fn with_api(api: Arc<dyn BeamApi>) -> Self {
        Self {
            api,
            state: Lifecycle::Disconnected,
        }
    }

    fn shell_argv(script: String) -> [String; 3] {
        ["sh".to_string(), "-c".to_string(), script]
    }

    async fn shell_op(&self, script: String, what: &str) -> Result<(), SandboxError> {
        let result = self.run_command(&script, &RunCommandOptions::default()).await?;
        shell::expect_success(result, what)?;
        Ok(())
    }
}

#[async_trait]
impl Sandbox for BeamSandbox {
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
                self.api.connect(id).await?;
                tracing::info!(provider = PROVIDER, sandbox_id = %id, "attached to sandbox");
                id.to_string()
            }
            None => {
                let name = Uuid::new_v4().to_string();
                let id = self
                    .api
                    .create_sandbox(&name, options.template.as_deref(), &options.envs)
                    .await?;
                tracing::info!(provider = PROVIDER, sandbox_id = %id, name = %name, "sandbox created");
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
        let snapshot_id = self.api.snapshot(&id).await?;
        // The snapshot is the way back; hold it even if terminate fails.
        self.state = Lifecycle::Suspended(snapshot_id.clone());
        match self.api.terminate(&id).await {
            Ok(()) => tracing::info!(
                provider = PROVIDER, sandbox_id = %id, snapshot_id = %snapshot_id,
                "sandbox snapshotted and terminated"
            ),
            Err(e) => tracing::warn!(
                provider = PROVIDER, sandbox_id = %id, snapshot_id = %snapshot_id, error = %e,
                "sandbox snapshotted but not terminated; it runs until it expires"
            ),
        }
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), SandboxError> {
        let snapshot_id = self.state.suspended()?.clone();
        let name = Uuid::new_v4().to_string();
        let id = self.api.create_from_snapshot(&name, &snapshot_id).await?;
        tracing::info!(provider = PROVIDER, sandbox_id = %id, snapshot_id = %snapshot_id, "sandbox restored from snapshot");
        self.state = Lifecycle::Connected(id);
        Ok(())
    }

    async fn destroy(&mut self) -> Result<(), SandboxError> {
        if let Lifecycle::Connected(id) = &self.state {
            self.api.terminate(id).await?;
            tracing::info!(provider = PROVIDER, sandbox_id = %id, "sandbox terminated");
        }
        self.state.take();
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        options: &RunCommandOptions,
    ) -> Result<CommandResult, SandboxError> {
        let id = self.state.connected()?;
        let argv = Self::shell_argv(shell::with_context(command, options));
        if options.background {
            let pid = self.api.spawn(id, &argv).await?;
            return Ok(CommandResult::Background { pid });
        }
        let out = with_deadline(options.timeout, self.api.exec(id, &argv)).await?;
        Ok(out.into())
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
        self.api.list_files(self.state.connected()?, path).await
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        self.shell_op(shell::move_path(from, to), "mv").await
    }

    async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        self.api.delete_file(self.state.connected()?, path).await
    }

    async fn create_directory(&self, path: &str) -> Result<(), SandboxError> {
        self.shell_op(shell::make_dir(path), "mkdir").await
    }

    async fn get_preview_url(&self, port: u16) -> Result<String, SandboxError> {
        self.api.expose_port(self.state.connected()?, port).await
    }

    async fn create_terminal(
        &self,
        _on_output: OutputHandler,
    ) -> Result<Box<dyn Terminal>, SandboxError> {
        self.state.connected()?;
        Err(SandboxError::Unsupported(
            "beam does not provide interactive terminals",
        ))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
