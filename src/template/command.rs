//! Running vendor CLIs with their output streamed line by line.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

use super::LogSink;
use crate::sandbox::error::SandboxError;

/// Lines of stderr kept for the failure message.
const STDERR_TAIL: usize = 20;

/// Spawn `program args...` in `cwd`, forwarding stdout and stderr lines to
/// `logs` as they arrive. A process that cannot be started is a `Build`
/// error; one that exits non-zero is `CommandFailed`.
pub async fn run_streaming(
    program: &str,
    args: &[String],
    cwd: &Path,
    logs: LogSink<'_>,
) -> Result<(), SandboxError> {
    let command_line = format!("{program} {}", args.join(" "));
    tracing::info!(command = %command_line, cwd = %cwd.display(), "running build command");

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SandboxError::Build(format!("failed to start `{command_line}`: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Build("build command stdout unavailable".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::Build("build command stderr unavailable".into()))?;

    let out_lines = LinesStream::new(BufReader::new(stdout).lines()).map(|l| (false, l));
    let err_lines = LinesStream::new(BufReader::new(stderr).lines()).map(|l| (true, l));
    let mut lines = out_lines.merge(err_lines);

    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    while let Some((is_err, line)) = lines.next().await {
        match line {
            Ok(text) => {
                if is_err {
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(text.clone());
                }
                logs(text);
            }
            Err(e) => {
                tracing::warn!(error = %e, "error reading build output");
                break;
            }
        }
    }

    let status = child.wait().await?;
    if status.success() {
        return Ok(());
    }
    let stderr = Vec::from(tail).join("\n");
    tracing::error!(command = %command_line, code = ?status.code(), "build command failed");
    Err(SandboxError::CommandFailed {
        code: status.code(),
        stderr: format!("`{command_line}` failed: {stderr}"),
    })
}
