//! Daytona REST API: sandbox lifecycle plus the per-sandbox toolbox.
//!
//! API: POST /sandbox, GET /sandbox/{id}, POST /sandbox/{id}/start,
//! POST /sandbox/{id}/stop, DELETE /sandbox/{id},
//! /toolbox/{id}/toolbox/{process,files}/..., GET /sandbox/{id}/ports/{port}/preview-url

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::DaytonaConfig;
use crate::providers::http::{ApiClient, status_error};
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::FileEntry;

const STATE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STATE_WAIT_LIMIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaytonaState {
    Started,
    Stopped,
    Starting,
    Stopping,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxInfo {
    pub id: String,
    pub state: DaytonaState,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub exit_code: i32,
    /// Combined output as reported by the toolbox.
    #[serde(default)]
    pub result: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
}

impl From<FileInfo> for FileEntry {
    fn from(info: FileInfo) -> Self {
        if info.is_dir {
            FileEntry::directory(info.name)
        } else {
            FileEntry::file(info.name)
        }
    }
}

#[async_trait]
pub trait DaytonaApi: Send + Sync {
    async fn create_sandbox(
        &self,
        snapshot: Option<&str>,
        envs: &BTreeMap<String, String>,
    ) -> Result<SandboxInfo, SandboxError>;
    async fn get_sandbox(&self, id: &str) -> Result<SandboxInfo, SandboxError>;
    /// Start and wait until the sandbox reports `started`.
    async fn start_sandbox(&self, id: &str) -> Result<(), SandboxError>;
    /// Stop and wait until the sandbox reports `stopped`.
    async fn stop_sandbox(&self, id: &str) -> Result<(), SandboxError>;
    async fn delete_sandbox(&self, id: &str) -> Result<(), SandboxError>;

    async fn execute(
        &self,
        id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecuteResponse, SandboxError>;

    async fn download_file(&self, id: &str, path: &str) -> Result<String, SandboxError>;
    async fn upload_file(&self, id: &str, path: &str, content: &str) -> Result<(), SandboxError>;
    async fn list_files(&self, id: &str, path: &str) -> Result<Vec<FileInfo>, SandboxError>;
    async fn move_file(&self, id: &str, from: &str, to: &str) -> Result<(), SandboxError>;
    /// Files only; the toolbox refuses directories.
    async fn delete_file(&self, id: &str, path: &str) -> Result<(), SandboxError>;
    async fn create_folder(&self, id: &str, path: &str, mode: &str) -> Result<(), SandboxError>;
    async fn file_info(&self, id: &str, path: &str) -> Result<FileInfo, SandboxError>;

    async fn preview_url(&self, id: &str, port: u16) -> Result<String, SandboxError>;
}

// ── HTTP implementation ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct NewSandbox<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<&'a str>,
    env: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    command: Cow<'a, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PreviewLink {
    url: String,
}

pub struct HttpDaytonaApi {
    api: ApiClient,
    target: Option<String>,
}

impl HttpDaytonaApi {
    pub fn new(config: &DaytonaConfig) -> Result<Self, SandboxError> {
        let bearer = format!("Bearer {}", config.api_key);
        let api = ApiClient::new("daytona", &config.api_url, &[("Authorization", &bearer)])?;
        Ok(Self {
            api,
            target: config.target.clone(),
        })
    }

    fn toolbox(id: &str, path: &str) -> String {
        format!("/toolbox/{id}/toolbox{path}")
    }

    async fn wait_for(&self, id: &str, wanted: DaytonaState) -> Result<(), SandboxError> {
        let deadline = tokio::time::Instant::now() + STATE_WAIT_LIMIT;
        loop {
            let info = self.get_sandbox(id).await?;
            if info.state == wanted {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SandboxError::Backend(format!(
                    "daytona sandbox {id} did not reach {wanted:?} (last state {:?})",
                    info.state
                )));
            }
            tokio::time::sleep(STATE_POLL_INTERVAL).await;
        }
    }
}

/// The toolbox answers a command that outlives its `timeout` with 408. That
/// is the same limit `with_deadline` enforces locally.
fn execute_error(
    route: &str,
    status: StatusCode,
    body: &str,
    timeout: Option<Duration>,
) -> SandboxError {
    match timeout {
        Some(limit)
            if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT =>
        {
            SandboxError::Timeout(limit)
        }
        _ => match status_error("daytona", "POST", route, status, body) {
            SandboxError::Backend(msg) => SandboxError::Exec(msg),
            other => other,
        },
    }
}

/// The toolbox runs commands without a shell.
fn shell_command(command: &str) -> Cow<'static, str> {
    let quoted = shell_escape::unix::escape(Cow::Borrowed(command));
    Cow::Owned(format!("sh -c {quoted}"))
}

#[async_trait]
impl DaytonaApi for HttpDaytonaApi {
    async fn create_sandbox(
        &self,
        snapshot: Option<&str>,
        envs: &BTreeMap<String, String>,
    ) -> Result<SandboxInfo, SandboxError> {
        let body = NewSandbox {
            snapshot,
            env: envs,
            target: self.target.as_deref(),
        };
        let info: SandboxInfo = self.api.post("/sandbox", &body).await.map_err(|e| match e {
            SandboxError::Backend(msg) => SandboxError::Provision(msg),
            other => other,
        })?;
        if info.state != DaytonaState::Started {
            self.wait_for(&info.id, DaytonaState::Started).await?;
        }
        Ok(info)
    }

    async fn get_sandbox(&self, id: &str) -> Result<SandboxInfo, SandboxError> {
        self.api.get(&format!("/sandbox/{id}")).await
    }

    async fn start_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        self.api
            .post_empty(&format!("/sandbox/{id}/start"), &serde_json::json!({}))
            .await?;
        self.wait_for(id, DaytonaState::Started).await
    }

    async fn stop_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        self.api
            .post_empty(&format!("/sandbox/{id}/stop"), &serde_json::json!({}))
            .await?;
        self.wait_for(id, DaytonaState::Stopped).await
    }

    async fn delete_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        self.api.delete(&format!("/sandbox/{id}?force=true")).await
    }

    async fn execute(
        &self,
        id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecuteResponse, SandboxError> {
        let body = ExecuteRequest {
            command: shell_command(command),
            cwd,
            // Whole seconds, rounded up so short limits still apply.
            timeout: timeout.map(|t| t.as_millis().div_ceil(1000) as u64),
        };
        let route = Self::toolbox(id, "/process/execute");
        tracing::debug!(vendor = "daytona", method = "POST", path = %route, "api request");
        let resp = self
            .api
            .request(Method::POST, &route)
            .json(&body)
            .send()
            .await
            .map_err(|e| SandboxError::Exec(format!("daytona POST {route} failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(execute_error(&route, status, &text, timeout));
        }
        self.api.decode(resp, &route).await
    }

    async fn download_file(&self, id: &str, path: &str) -> Result<String, SandboxError> {
        let route = Self::toolbox(id, "/files/download");
        let builder = self.api.request(Method::GET, &route).query(&[("path", path)]);
        let resp = self.api.send(builder, "GET", &route).await?;
        resp.text()
            .await
            .map_err(|e| SandboxError::Backend(format!("daytona download {path} failed: {e}")))
    }

    async fn upload_file(&self, id: &str, path: &str, content: &str) -> Result<(), SandboxError> {
        let route = Self::toolbox(id, "/files/upload");
        let part = reqwest::multipart::Part::text(content.to_string()).file_name(path.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let builder = self
            .api
            .request(Method::POST, &route)
            .query(&[("path", path)])
            .multipart(form);
        self.api.send(builder, "POST", &route).await?;
        Ok(())
    }

    async fn list_files(&self, id: &str, path: &str) -> Result<Vec<FileInfo>, SandboxError> {
        let route = Self::toolbox(id, "/files");
        let builder = self.api.request(Method::GET, &route).query(&[("path", path)]);
        let resp = self.api.send(builder, "GET", &route).await?;
        self.api.decode(resp, &route).await
    }

    async fn move_file(&self, id: &str, from: &str, to: &str) -> Result<(), SandboxError> {
        let route = Self::toolbox(id, "/files/move");
        let builder = self
            .api
            .request(Method::POST, &route)
            .query(&[("source", from), ("destination", to)]);
        self.api.send(builder, "POST", &route).await?;
        Ok(())
    }

    async fn delete_file(&self, id: &str, path: &str) -> Result<(), SandboxError> {
        let route = Self::toolbox(id, "/files");
        let builder = self.api.request(Method::DELETE, &route).query(&[("path", path)]);
        self.api.send(builder, "DELETE", &route).await?;
        Ok(())
    }

    async fn create_folder(&self, id: &str, path: &str, mode: &str) -> Result<(), SandboxError> {
        let route = Self::toolbox(id, "/files/folder");
        let builder = self
            .api
            .request(Method::POST, &route)
            .query(&[("path", path), ("mode", mode)]);
        self.api.send(builder, "POST", &route).await?;
        Ok(())
    }

    async fn file_info(&self, id: &str, path: &str) -> Result<FileInfo, SandboxError> {
        let route = Self::toolbox(id, "/files/info");
        let builder = self.api.request(Method::GET, &route).query(&[("path", path)]);
        let resp = self.api.send(builder, "GET", &route).await?;
        self.api.decode(resp, &route).await
    }

    async fn preview_url(&self, id: &str, port: u16) -> Result<String, SandboxError> {
        let link: PreviewLink = self
            .api
            .get(&format!("/sandbox/{id}/ports/{port}/preview-url"))
            .await?;
        Ok(link.url)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
