use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::error::SandboxError;
use super::terminal::{OutputHandler, Terminal};
use super::types::*;

/// Uniform contract over one remote sandbox.
///
/// Every provider implements every method. Operations the vendor has no
/// facility for return `SandboxError::Unsupported`. All operations except
/// `init` and `destroy` fail with `SandboxError::NotConnected` unless the
/// instance is connected.
///
/// Lifecycle transitions take `&mut self`; callers wanting to share an
/// instance across tasks must serialize them.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Registry name of the provider backing this instance.
    fn provider(&self) -> &'static str;

    // ── Lifecycle ───────────────────────────────────────────────

    /// Attach to `id` when given, otherwise create a new sandbox.
    async fn init(
        &mut self,
        id: Option<&str>,
        options: &CreateSandboxOptions,
    ) -> Result<(), SandboxError>;

    /// Vendor identifier of the connected sandbox.
    fn id(&self) -> Result<String, SandboxError>;

    async fn suspend(&mut self) -> Result<(), SandboxError>;

    async fn resume(&mut self) -> Result<(), SandboxError>;

    /// Release remote resources. A no-op on a disconnected instance.
    async fn destroy(&mut self) -> Result<(), SandboxError>;

    // ── Exec ────────────────────────────────────────────────────

    /// Run a shell command.
    ///
    /// Background commands on providers without detachable processes are
    /// wrapped as `nohup sh -c '<command>' > /dev/null 2>&1 & echo $!`, with
    /// the env and cwd prefix outside the wrapper. The inner command is not
    /// escaped, so commands containing single quotes break that wrapper.
    async fn run_command(
        &self,
        command: &str,
        options: &RunCommandOptions,
    ) -> Result<CommandResult, SandboxError>;

    /// Foreground run with default options.
    async fn run(&self, command: &str) -> Result<CommandResult, SandboxError> {
        self.run_command(command, &RunCommandOptions::default()).await
    }

    // ── Files ───────────────────────────────────────────────────
    //
    // Operations synthesized through `run_command` (`mv`, `mkdir -p`, ...)
    // pass paths to the shell unescaped.

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;
    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;
    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>, SandboxError>;
    async fn move_file(&self, from: &str, to: &str) -> Result<(), SandboxError>;
    async fn delete_file(&self, path: &str) -> Result<(), SandboxError>;
    async fn create_directory(&self, path: &str) -> Result<(), SandboxError>;

    // ── Ports ───────────────────────────────────────────────────

    async fn get_preview_url(&self, port: u16) -> Result<String, SandboxError>;

    // ── Terminal ────────────────────────────────────────────────

    async fn create_terminal(
        &self,
        on_output: OutputHandler,
    ) -> Result<Box<dyn Terminal>, SandboxError>;
}

/// Enforce a caller-supplied deadline on a foreground command.
pub(crate) async fn with_deadline<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, SandboxError>
where
    F: Future<Output = Result<T, SandboxError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| SandboxError::Timeout(limit))?,
        None => fut.await,
    }
}

// ── Tests ───────────────────────────────────────────────────────────
