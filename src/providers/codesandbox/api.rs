//! CodeSandbox: REST for VM lifecycle, a per-VM agent session for the rest.
//!
//! API: POST /sandbox/{template}/fork, POST /vm/{id}/start,
//! POST /vm/{id}/hibernate. `start` returns the agent URL and token used to
//! open the session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};

use super::session::PitcherSession;
use crate::config::CodeSandboxConfig;
use crate::providers::ExecOutput;
use crate::providers::http::ApiClient;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{FileEntry, FileKind};

#[async_trait]
pub trait CodeSandboxApi: Send + Sync {
    /// Fork `template` into a new, running VM.
    async fn create_sandbox(&self, template: &str) -> Result<String, SandboxError>;
    /// Wake a (possibly hibernated) VM. `NotFound` for unknown ids.
    async fn resume_sandbox(&self, id: &str) -> Result<(), SandboxError>;
    async fn hibernate_sandbox(&self, id: &str) -> Result<(), SandboxError>;
    /// Drop the agent session, if one is open.
    async fn disconnect(&self, id: &str);

    async fn run(&self, id: &str, command: &str) -> Result<ExecOutput, SandboxError>;

    async fn read_file(&self, id: &str, path: &str) -> Result<String, SandboxError>;
    async fn write_file(&self, id: &str, path: &str, content: &str) -> Result<(), SandboxError>;
    async fn read_dir(&self, id: &str, path: &str) -> Result<Vec<FileEntry>, SandboxError>;
    async fn rename(&self, id: &str, from: &str, to: &str) -> Result<(), SandboxError>;
    async fn remove(&self, id: &str, path: &str) -> Result<(), SandboxError>;
    async fn mkdir(&self, id: &str, path: &str) -> Result<(), SandboxError>;

    /// Open an interactive shell whose output is sent to `output`.
    async fn open_shell(
        &self,
        id: &str,
        output: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<String, SandboxError>;
    async fn shell_input(&self, id: &str, shell_id: &str, data: &str) -> Result<(), SandboxError>;
    async fn close_shell(&self, id: &str, shell_id: &str) -> Result<(), SandboxError>;
}

// ── HTTP implementation ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Forked {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StartedVm {
    pitcher_url: String,
    pitcher_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunReply {
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[derive(Debug, Deserialize)]
struct FileContent {
    content: String,
}

#[derive(Debug, Deserialize)]
struct DirEntry {
    name: String,
    #[serde(rename = "type")]
    kind: FileKind,
}

#[derive(Debug, Deserialize)]
struct DirListing {
    entries: Vec<DirEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShellCreated {
    shell_id: String,
}

pub struct HttpCodeSandboxApi {
    api: ApiClient,
    sessions: Mutex<HashMap<String, Arc<PitcherSession>>>,
}

impl HttpCodeSandboxApi {
    pub fn new(config: &CodeSandboxConfig) -> Result<Self, SandboxError> {
        let bearer = format!("Bearer {}", config.api_key);
        let api = ApiClient::new("codesandbox", &config.api_url, &[("Authorization", &bearer)])?;
        Ok(Self {
            api,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    async fn start_vm(&self, id: &str) -> Result<StartedVm, SandboxError> {
        let started: Envelope<StartedVm> = self.api.post(&format!("/vm/{id}/start"), &json!({})).await?;
        Ok(started.data)
    }

    async fn open_session(&self, id: &str, vm: StartedVm) -> Result<Arc<PitcherSession>, SandboxError> {
        let session = Arc::new(PitcherSession::connect(&vm.pitcher_url, &vm.pitcher_token).await?);
        if let Some(previous) = self.sessions.lock().await.insert(id.to_string(), session.clone()) {
            previous.dispose();
        }
        tracing::debug!(sandbox_id = %id, "codesandbox session opened");
        Ok(session)
    }

    /// Session for `id`, starting the VM and connecting on first use.
    async fn session(&self, id: &str) -> Result<Arc<PitcherSession>, SandboxError> {
        if let Some(session) = self.sessions.lock().await.get(id) {
            return Ok(session.clone());
        }
        let vm = self.start_vm(id).await?;
        self.open_session(id, vm).await
    }
}

#[async_trait]
impl CodeSandboxApi for HttpCodeSandboxApi {
    async fn create_sandbox(&self, template: &str) -> Result<String, SandboxError> {
        let forked: Envelope<Forked> = self
            .api
            .post(&format!("/sandbox/{template}/fork"), &json!({}))
            .await
            .map_err(|e| match e {
                SandboxError::Backend(msg) => SandboxError::Provision(msg),
                other => other,
            })?;
        let id = forked.data.id;
        let vm = self.start_vm(&id).await?;
        self.open_session(&id, vm).await?;
        Ok(id)
    }

    async fn resume_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        let vm = self.start_vm(id).await?;
        self.open_session(id, vm).await?;
        Ok(())
    }

    async fn hibernate_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        self.api
            .post_empty(&format!("/vm/{id}/hibernate"), &json!({}))
            .await?;
        self.disconnect(id).await;
        Ok(())
    }

    async fn disconnect(&self, id: &str) {
        if let Some(session) = self.sessions.lock().await.remove(id) {
            session.dispose();
        }
    }

    async fn run(&self, id: &str, command: &str) -> Result<ExecOutput, SandboxError> {
        let reply: RunReply = self
            .session(id)
            .await?
            .call("command/run", json!({ "command": command }))
            .await
            .map_err(|e| match e {
                SandboxError::Backend(msg) => SandboxError::Exec(msg),
                other => other,
            })?;
        Ok(ExecOutput::new(reply.exit_code, reply.stdout, reply.stderr))
    }

    async fn read_file(&self, id: &str, path: &str) -> Result<String, SandboxError> {
        let file: FileContent = self
            .session(id)
            .await?
            .call("fs/readFile", json!({ "path": path }))
            .await?;
        Ok(file.content)
    }

    async fn write_file(&self, id: &str, path: &str, content: &str) -> Result<(), SandboxError> {
        let params = json!({ "path": path, "content": content, "create": true, "overwrite": true });
        let _: serde_json::Value = self.session(id).await?.call("fs/writeFile", params).await?;
        Ok(())
    }

    async fn read_dir(&self, id: &str, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let listing: DirListing = self
            .session(id)
            .await?
            .call("fs/readdir", json!({ "path": path }))
            .await?;
        Ok(listing
            .entries
            .into_iter()
            .map(|e| FileEntry {
                name: e.name,
                kind: e.kind,
            })
            .collect())
    }

    async fn rename(&self, id: &str, from: &str, to: &str) -> Result<(), SandboxError> {
        let params = json!({ "from": from, "to": to });
        let _: serde_json::Value = self.session(id).await?.call("fs/rename", params).await?;
        Ok(())
    }

    async fn remove(&self, id: &str, path: &str) -> Result<(), SandboxError> {
        let params = json!({ "path": path, "recursive": true });
        let _: serde_json::Value = self.session(id).await?.call("fs/remove", params).await?;
        Ok(())
    }

    async fn mkdir(&self, id: &str, path: &str) -> Result<(), SandboxError> {
        let params = json!({ "path": path, "recursive": true });
        let _: serde_json::Value = self.session(id).await?.call("fs/mkdir", params).await?;
        Ok(())
    }

    async fn open_shell(
        &self,
        id: &str,
        output: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<String, SandboxError> {
        let session = self.session(id).await?;
        let created: ShellCreated = session
            .call("shell/create", json!({ "command": "bash", "type": "TERMINAL" }))
            .await?;
        session.subscribe(&created.shell_id, output);
        Ok(created.shell_id)
    }

    async fn shell_input(&self, id: &str, shell_id: &str, data: &str) -> Result<(), SandboxError> {
        let params = json!({ "shellId": shell_id, "input": data });
        let _: serde_json::Value = self.session(id).await?.call("shell/in", params).await?;
        Ok(())
    }

    async fn close_shell(&self, id: &str, shell_id: &str) -> Result<(), SandboxError> {
        let session = self.session(id).await?;
        session.unsubscribe(shell_id);
        let _: serde_json::Value = session
            .call("shell/terminate", json!({ "shellId": shell_id }))
            .await?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
