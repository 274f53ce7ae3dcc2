use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::SandboxError;

/// Callback receiving raw terminal output, in arrival order.
pub type OutputHandler = Box<dyn FnMut(String) + Send + 'static>;

/// Interactive pseudo-terminal session bound to a live sandbox.
///
/// Providers without a pty facility never hand one out: their
/// `create_terminal` fails with `SandboxError::Unsupported`.
#[async_trait]
pub trait Terminal: Send {
    async fn write(&mut self, data: &str) -> Result<(), SandboxError>;

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SandboxError>;

    /// Release the vendor pty. Killing twice is a no-op.
    async fn kill(&mut self) -> Result<(), SandboxError>;
}

/// Forward output chunks from a vendor transport to the caller's handler.
///
/// A single task drains the channel, so chunks reach the handler FIFO. The
/// task ends when the sender side closes.
pub(crate) fn spawn_output_pump(
    mut chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    mut on_output: OutputHandler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = chunks.recv().await {
            on_output(String::from_utf8_lossy(&chunk).into_owned());
        }
        tracing::debug!("terminal output stream closed");
    })
}

// ── Tests ───────────────────────────────────────────────────────────
