use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::envd::{self, ENVD_PORT, EnvdClient};
use crate::config::E2bConfig;
use crate::providers::ExecOutput;
use crate::providers::http::ApiClient;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{FileEntry, PtySize};

/// Lifetime requested for new sandboxes before the vendor reaps them.
const SANDBOX_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Running,
    Paused,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxInfo {
    #[serde(rename = "sandboxID")]
    pub sandbox_id: String,
    // Absent on create/resume replies, which are always running.
    #[serde(default)]
    pub state: Option<SandboxState>,
    #[serde(rename = "envdAccessToken", default)]
    pub envd_access_token: Option<String>,
}

impl SandboxInfo {
    pub fn is_paused(&self) -> bool {
        self.state == Some(SandboxState::Paused)
    }
}

/// A one-off command inside a sandbox.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSpec<'a> {
    pub command: &'a str,
    pub cwd: Option<&'a str>,
    pub envs: &'a BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

/// E2B control plane plus the in-sandbox agent, keyed by sandbox id.
#[async_trait]
pub trait E2bApi: Send + Sync {
    async fn create_sandbox(
        &self,
        template: &str,
        envs: &BTreeMap<String, String>,
    ) -> Result<SandboxInfo, SandboxError>;
    async fn get_sandbox(&self, id: &str) -> Result<SandboxInfo, SandboxError>;
    async fn pause_sandbox(&self, id: &str) -> Result<(), SandboxError>;
    async fn resume_sandbox(&self, id: &str) -> Result<SandboxInfo, SandboxError>;
    async fn kill_sandbox(&self, id: &str) -> Result<(), SandboxError>;

    async fn run_process(&self, id: &str, spec: ProcessSpec<'_>) -> Result<ExecOutput, SandboxError>;
    /// Start without waiting; returns the native pid.
    async fn spawn_process(&self, id: &str, spec: ProcessSpec<'_>) -> Result<u32, SandboxError>;

    async fn read_file(&self, id: &str, path: &str) -> Result<String, SandboxError>;
    async fn write_file(&self, id: &str, path: &str, content: &str) -> Result<(), SandboxError>;
    async fn list_dir(&self, id: &str, path: &str) -> Result<Vec<FileEntry>, SandboxError>;
    async fn rename(&self, id: &str, from: &str, to: &str) -> Result<(), SandboxError>;
    async fn remove(&self, id: &str, path: &str) -> Result<(), SandboxError>;
    async fn make_dir(&self, id: &str, path: &str) -> Result<(), SandboxError>;

    /// Open a pty; decoded output is sent to `output` until the shell exits.
    async fn create_pty(
        &self,
        id: &str,
        size: PtySize,
        output: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<u32, SandboxError>;
    async fn send_pty_input(&self, id: &str, pid: u32, data: &[u8]) -> Result<(), SandboxError>;
    async fn resize_pty(&self, id: &str, pid: u32, size: PtySize) -> Result<(), SandboxError>;
    async fn kill_process(&self, id: &str, pid: u32) -> Result<(), SandboxError>;

    /// Public host for `port`, without scheme.
    fn host(&self, id: &str, port: u16) -> String;
}

// ── HTTP implementation ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewSandbox<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    timeout: u64,
    env_vars: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ResumeSandbox {
    timeout: u64,
}

pub struct HttpE2bApi {
    api: ApiClient,
    envd_http: reqwest::Client,
    domain: String,
    // Access tokens handed out at create/resume time.
    tokens: Mutex<HashMap<String, Option<String>>>,
}

impl HttpE2bApi {
    pub fn new(config: &E2bConfig) -> Result<Self, SandboxError> {
        let api = ApiClient::new("e2b", &config.api_url, &[("X-API-Key", &config.api_key)])?;
        Ok(Self {
            api,
            envd_http: reqwest::Client::new(),
            domain: config.domain.clone(),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn remember(&self, info: &SandboxInfo) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|p| p.into_inner());
        tokens.insert(info.sandbox_id.clone(), info.envd_access_token.clone());
    }

    fn envd(&self, id: &str) -> EnvdClient {
        let token = self
            .tokens
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
            .flatten();
        EnvdClient::new(
            self.envd_http.clone(),
            format!("https://{}", self.host(id, ENVD_PORT)),
            token,
        )
    }
}

#[async_trait]
impl E2bApi for HttpE2bApi {
    async fn create_sandbox(
        &self,
        template: &str,
        envs: &BTreeMap<String, String>,
    ) -> Result<SandboxInfo, SandboxError> {
        let body = NewSandbox {
            template_id: template,
            timeout: SANDBOX_TIMEOUT_SECS,
            env_vars: envs,
        };
        let info: SandboxInfo = self.api.post("/sandboxes", &body).await.map_err(|e| match e {
            SandboxError::Backend(msg) => SandboxError::Provision(msg),
            other => other,
        })?;
        self.remember(&info);
        Ok(info)
    }

    async fn get_sandbox(&self, id: &str) -> Result<SandboxInfo, SandboxError> {
        let info: SandboxInfo = self.api.get(&format!("/sandboxes/{id}")).await?;
        self.remember(&info);
        Ok(info)
    }

    async fn pause_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        self.api
            .post_empty(&format!("/sandboxes/{id}/pause"), &serde_json::json!({}))
            .await
    }

    async fn resume_sandbox(&self, id: &str) -> Result<SandboxInfo, SandboxError> {
        let info: SandboxInfo = self
            .api
            .post(
                &format!("/sandboxes/{id}/resume"),
                &ResumeSandbox {
                    timeout: SANDBOX_TIMEOUT_SECS,
                },
            )
            .await?;
        self.remember(&info);
        Ok(info)
    }

    async fn kill_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        self.api.delete(&format!("/sandboxes/{id}")).await?;
        self.tokens
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
        Ok(())
    }

    async fn run_process(&self, id: &str, spec: ProcessSpec<'_>) -> Result<ExecOutput, SandboxError> {
        let process = envd::shell_process(spec.command, spec.cwd, spec.envs);
        let (_pid, stream) = self.envd(id).start(&process, None, spec.timeout).await?;
        stream.collect().await
    }

    async fn spawn_process(&self, id: &str, spec: ProcessSpec<'_>) -> Result<u32, SandboxError> {
        let process = envd::shell_process(spec.command, spec.cwd, spec.envs);
        let (pid, stream) = self.envd(id).start(&process, None, None).await?;
        // Keep the stream open so envd does not tear the process down.
        tokio::spawn(async move {
            if let Err(e) = stream.collect().await {
                tracing::debug!(pid, error = %e, "background process stream ended");
            }
        });
        Ok(pid)
    }

    async fn read_file(&self, id: &str, path: &str) -> Result<String, SandboxError> {
        self.envd(id).read_file(path).await
    }

    async fn write_file(&self, id: &str, path: &str, content: &str) -> Result<(), SandboxError> {
        self.envd(id).write_file(path, content).await
    }

    async fn list_dir(&self, id: &str, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        self.envd(id).list_dir(path).await
    }

    async fn rename(&self, id: &str, from: &str, to: &str) -> Result<(), SandboxError> {
        self.envd(id).rename(from, to).await
    }

    async fn remove(&self, id: &str, path: &str) -> Result<(), SandboxError> {
        self.envd(id).remove(path).await
    }

    async fn make_dir(&self, id: &str, path: &str) -> Result<(), SandboxError> {
        self.envd(id).make_dir(path).await
    }

    async fn create_pty(
        &self,
        id: &str,
        size: PtySize,
        output: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<u32, SandboxError> {
        let (pid, stream) = self
            .envd(id)
            .start(&envd::pty_process(), Some(size), None)
            .await?;
        tokio::spawn(stream.forward_pty(output));
        Ok(pid)
    }

    async fn send_pty_input(&self, id: &str, pid: u32, data: &[u8]) -> Result<(), SandboxError> {
        self.envd(id).send_pty_input(pid, data).await
    }

    async fn resize_pty(&self, id: &str, pid: u32, size: PtySize) -> Result<(), SandboxError> {
        self.envd(id).resize_pty(pid, size).await
    }

    async fn kill_process(&self, id: &str, pid: u32) -> Result<(), SandboxError> {
        self.envd(id).kill(pid).await
    }

    fn host(&self, id: &str, port: u16) -> String {
        format!("{port}-{id}.{}", self.domain)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
