//! Beam gateway API.
//!
//! API (under `{api_url}/api/v1`): POST /sandbox, GET /sandbox/{id},
//! DELETE /sandbox/{id}, POST /sandbox/{id}/exec, POST /sandbox/{id}/snapshot,
//! POST /snapshot/{id}/restore, /sandbox/{id}/files[/list],
//! POST /sandbox/{id}/ports/{port}, POST /image/build (NDJSON log stream).

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::BeamConfig;
use crate::providers::ExecOutput;
use crate::providers::http::ApiClient;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::FileEntry;

/// Resources requested for an image build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    /// e.g. `"2Gi"` or `"512Mi"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

pub type LogSink<'a> = &'a mut (dyn FnMut(String) + Send);

#[async_trait]
pub trait BeamApi: Send + Sync {
    async fn create_sandbox(
        &self,
        name: &str,
        image: Option<&str>,
        envs: &BTreeMap<String, String>,
    ) -> Result<String, SandboxError>;
    /// `NotFound` when no such sandbox is running.
    async fn connect(&self, id: &str) -> Result<(), SandboxError>;
    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput, SandboxError>;
    /// Start without waiting; returns the process id.
    async fn spawn(&self, id: &str, argv: &[String]) -> Result<u32, SandboxError>;
    async fn snapshot(&self, id: &str) -> Result<String, SandboxError>;
    async fn create_from_snapshot(&self, name: &str, snapshot_id: &str) -> Result<String, SandboxError>;
    async fn terminate(&self, id: &str) -> Result<(), SandboxError>;

    async fn upload_file(&self, id: &str, path: &str, content: &str) -> Result<(), SandboxError>;
    async fn download_file(&self, id: &str, path: &str) -> Result<String, SandboxError>;
    async fn list_files(&self, id: &str, path: &str) -> Result<Vec<FileEntry>, SandboxError>;
    async fn delete_file(&self, id: &str, path: &str) -> Result<(), SandboxError>;
    async fn expose_port(&self, id: &str, port: u16) -> Result<String, SandboxError>;

    /// Build an image from Dockerfile text, streaming log lines to `logs`.
    /// Returns the image id.
    async fn build_image(
        &self,
        name: &str,
        dockerfile: &str,
        resources: &BuildResources,
        logs: LogSink<'_>,
    ) -> Result<String, SandboxError>;
}

// ── HTTP implementation ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SandboxReply {
    sandbox_id: String,
}

#[derive(Debug, Deserialize)]
struct ExecReply {
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    pid: u32,
}

#[derive(Debug, Deserialize)]
struct SnapshotReply {
    snapshot_id: String,
}

#[derive(Debug, Deserialize)]
struct RemoteFile {
    name: String,
    #[serde(default)]
    is_dir: bool,
}

#[derive(Debug, Deserialize)]
struct FileList {
    files: Vec<RemoteFile>,
}

#[derive(Debug, Deserialize)]
struct ExposedPort {
    url: String,
}

/// One NDJSON line of a build stream.
#[derive(Debug, Deserialize)]
struct BuildEvent {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    success: bool,
    image_id: Option<String>,
}

pub struct HttpBeamApi {
    api: ApiClient,
}

impl HttpBeamApi {
    pub fn new(config: &BeamConfig) -> Result<Self, SandboxError> {
        let bearer = format!("Bearer {}", config.token);
        let base = format!("{}/api/v1", config.api_url.trim_end_matches('/'));
        let api = ApiClient::new(
            "beam",
            &base,
            &[
                ("Authorization", &bearer),
                ("X-Workspace-Id", &config.workspace_id),
            ],
        )?;
        Ok(Self { api })
    }

    async fn run(&self, id: &str, argv: &[String], background: bool) -> Result<ExecReply, SandboxError> {
        let body = json!({ "command": argv, "background": background });
        self.api
            .post(&format!("/sandbox/{id}/exec"), &body)
            .await
            .map_err(|e| match e {
                SandboxError::Backend(msg) => SandboxError::Exec(msg),
                other => other,
            })
    }

    fn files(id: &str) -> String {
        format!("/sandbox/{id}/files")
    }
}

#[async_trait]
impl BeamApi for HttpBeamApi {
    async fn create_sandbox(
        &self,
        name: &str,
        image: Option<&str>,
        envs: &BTreeMap<String, String>,
    ) -> Result<String, SandboxError> {
        let body = json!({ "name": name, "image": image, "env": envs });
        let reply: SandboxReply = self.api.post("/sandbox", &body).await.map_err(|e| match e {
            SandboxError::Backend(msg) => SandboxError::Provision(msg),
            other => other,
        })?;
        Ok(reply.sandbox_id)
    }

    async fn connect(&self, id: &str) -> Result<(), SandboxError> {
        let _: serde_json::Value = self.api.get(&format!("/sandbox/{id}")).await?;
        Ok(())
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput, SandboxError> {
        let reply = self.run(id, argv, false).await?;
        Ok(ExecOutput::new(reply.exit_code, reply.stdout, reply.stderr))
    }

    async fn spawn(&self, id: &str, argv: &[String]) -> Result<u32, SandboxError> {
        let reply = self.run(id, argv, true).await?;
        if reply.pid == 0 {
            return Err(SandboxError::Exec("beam returned no pid for background process".into()));
        }
        Ok(reply.pid)
    }

    async fn snapshot(&self, id: &str) -> Result<String, SandboxError> {
        let reply: SnapshotReply = self
            .api
            .post(&format!("/sandbox/{id}/snapshot"), &json!({}))
            .await?;
        Ok(reply.snapshot_id)
    }

    async fn create_from_snapshot(&self, name: &str, snapshot_id: &str) -> Result<String, SandboxError> {
        let reply: SandboxReply = self
            .api
            .post(&format!("/snapshot/{snapshot_id}/restore"), &json!({ "name": name }))
            .await?;
        Ok(reply.sandbox_id)
    }

    async fn terminate(&self, id: &str) -> Result<(), SandboxError> {
        self.api.delete(&format!("/sandbox/{id}")).await
    }

    async fn upload_file(&self, id: &str, path: &str, content: &str) -> Result<(), SandboxError> {
        let route = Self::files(id);
        let builder = self
            .api
            .request(Method::PUT, &route)
            .query(&[("path", path)])
            .body(content.to_string());
        self.api.send(builder, "PUT", &route).await?;
        Ok(())
    }

    async fn download_file(&self, id: &str, path: &str) -> Result<String, SandboxError> {
        let route = Self::files(id);
        let builder = self.api.request(Method::GET, &route).query(&[("path", path)]);
        let resp = self.api.send(builder, "GET", &route).await?;
        resp.text()
            .await
            .map_err(|e| SandboxError::Backend(format!("beam download {path} failed: {e}")))
    }

    async fn list_files(&self, id: &str, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let route = format!("{}/list", Self::files(id));
        let builder = self.api.request(Method::GET, &route).query(&[("path", path)]);
        let resp = self.api.send(builder, "GET", &route).await?;
        let list: FileList = self.api.decode(resp, &route).await?;
        Ok(list
            .files
            .into_iter()
            .map(|f| {
                if f.is_dir {
                    FileEntry::directory(f.name)
                } else {
                    FileEntry::file(f.name)
                }
            })
            .collect())
    }

    async fn delete_file(&self, id: &str, path: &str) -> Result<(), SandboxError> {
        let route = Self::files(id);
        let builder = self.api.request(Method::DELETE, &route).query(&[("path", path)]);
        self.api.send(builder, "DELETE", &route).await?;
        Ok(())
    }

    async fn expose_port(&self, id: &str, port: u16) -> Result<String, SandboxError> {
        let exposed: ExposedPort = self
            .api
            .post(&format!("/sandbox/{id}/ports/{port}"), &json!({}))
            .await?;
        Ok(exposed.url)
    }

    async fn build_image(
        &self,
        name: &str,
        dockerfile: &str,
        resources: &BuildResources,
        logs: LogSink<'_>,
    ) -> Result<String, SandboxError> {
        let route = "/image/build";
        let body = json!({ "name": name, "dockerfile": dockerfile, "resources": resources });
        let builder = self.api.request(Method::POST, route).json(&body);
        let resp = self.api.send(builder, "POST", route).await?;

        let mut body = resp.bytes_stream();
        let mut buffer = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|e| SandboxError::Build(format!("beam build stream failed: {e}")))?;
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(image_id) = handle_build_line(&line, logs)? {
                    return Ok(image_id);
                }
            }
        }
        if let Some(image_id) = handle_build_line(&buffer, logs)? {
            return Ok(image_id);
        }
        Err(SandboxError::Build("beam build stream ended without a result".into()))
    }
}

/// Forward one build log line; `Some(image_id)` once the build finishes.
fn handle_build_line(line: &[u8], logs: LogSink<'_>) -> Result<Option<String>, SandboxError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let event: BuildEvent = serde_json::from_str(text)
        .map_err(|e| SandboxError::Serde(format!("bad beam build event {text:?}: {e}")))?;
    if !event.msg.is_empty() {
        logs(event.msg.trim_end().to_string());
    }
    if !event.done {
        return Ok(None);
    }
    match (event.success, event.image_id) {
        (true, Some(image_id)) => Ok(Some(image_id)),
        (true, None) => Err(SandboxError::Build("beam build finished without an image id".into())),
        (false, _) => Err(SandboxError::Build("beam image build failed".into())),
    }
}

// ── Tests ───────────────────────────────────────────────────────────
