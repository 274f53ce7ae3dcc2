//! Modal control plane, spoken as JSON RPCs: `POST {api_url}/{Method}`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::ModalConfig;
use crate::providers::ExecOutput;
use crate::providers::http::ApiClient;
use crate::sandbox::error::SandboxError;

/// Where a sandbox image comes from. Secret fields are Modal secret names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Registry { tag: String, secret: Option<String> },
    AwsEcr { tag: String, secret: String },
    GcpArtifactRegistry { tag: String, secret: String },
}

impl ImageSource {
    pub fn tag(&self) -> &str {
        match self {
            ImageSource::Registry { tag, .. }
            | ImageSource::AwsEcr { tag, .. }
            | ImageSource::GcpArtifactRegistry { tag, .. } => tag,
        }
    }

    fn auth_type(&self) -> &'static str {
        match self {
            ImageSource::Registry { secret: None, .. } => "REGISTRY_AUTH_TYPE_PUBLIC",
            ImageSource::Registry { secret: Some(_), .. } => "REGISTRY_AUTH_TYPE_STATIC_CREDS",
            ImageSource::AwsEcr { .. } => "REGISTRY_AUTH_TYPE_AWS",
            ImageSource::GcpArtifactRegistry { .. } => "REGISTRY_AUTH_TYPE_GCP",
        }
    }

    fn secret(&self) -> Option<&str> {
        match self {
            ImageSource::Registry { secret, .. } => secret.as_deref(),
            ImageSource::AwsEcr { secret, .. } | ImageSource::GcpArtifactRegistry { secret, .. } => {
                Some(secret)
            }
        }
    }
}

#[async_trait]
pub trait ModalApi: Send + Sync {
    /// App id for `name`, creating the app if missing.
    async fn lookup_app(&self, name: &str) -> Result<String, SandboxError>;
    async fn resolve_image(&self, app_id: &str, source: &ImageSource) -> Result<String, SandboxError>;
    /// `NotFound` when `image_id` does not exist.
    async fn create_sandbox(
        &self,
        app_id: &str,
        image_id: &str,
        envs: &BTreeMap<String, String>,
        encrypted_ports: &[u16],
    ) -> Result<String, SandboxError>;
    async fn exec(
        &self,
        sandbox_id: &str,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, SandboxError>;
    /// Image id of the current filesystem.
    async fn snapshot_filesystem(&self, sandbox_id: &str) -> Result<String, SandboxError>;
    async fn terminate(&self, sandbox_id: &str) -> Result<(), SandboxError>;
    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError>;
    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<(), SandboxError>;
    /// Container port → public URL.
    async fn tunnels(&self, sandbox_id: &str) -> Result<BTreeMap<u16, String>, SandboxError>;
}

// ── HTTP implementation ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AppReply {
    app_id: String,
}

#[derive(Debug, Deserialize)]
struct SecretReply {
    secret_id: String,
}

#[derive(Debug, Deserialize)]
struct ImageReply {
    image_id: String,
}

#[derive(Debug, Deserialize)]
struct SandboxReply {
    sandbox_id: String,
}

#[derive(Debug, Deserialize)]
struct ExecReply {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[derive(Debug, Deserialize)]
struct FileData {
    data: String,
}

#[derive(Debug, Deserialize)]
struct Tunnel {
    container_port: u16,
    host: String,
    #[serde(default = "default_tls_port")]
    port: u16,
}

fn default_tls_port() -> u16 {
    443
}

impl Tunnel {
    fn url(&self) -> String {
        if self.port == 443 {
            format!("https://{}", self.host)
        } else {
            format!("https://{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Deserialize)]
struct TunnelsReply {
    tunnels: Vec<Tunnel>,
}

#[derive(Debug, Serialize)]
struct SandboxDefinition<'a> {
    image_id: &'a str,
    env: &'a BTreeMap<String, String>,
    encrypted_ports: &'a [u16],
    /// Keeps the container alive between execs.
    entrypoint_args: [&'a str; 2],
}

pub struct HttpModalApi {
    api: ApiClient,
}

impl HttpModalApi {
    pub fn new(config: &ModalConfig) -> Result<Self, SandboxError> {
        let api = ApiClient::new(
            "modal",
            &config.api_url,
            &[
                ("x-modal-token-id", &config.token_id),
                ("x-modal-token-secret", &config.token_secret),
            ],
        )?;
        Ok(Self { api })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T, SandboxError> {
        self.api.post(&format!("/{method}"), &body).await
    }

    async fn lookup_secret(&self, name: &str) -> Result<String, SandboxError> {
        let reply: SecretReply = self
            .call("SecretGetOrCreate", json!({ "deployment_name": name }))
            .await?;
        Ok(reply.secret_id)
    }
}

#[async_trait]
impl ModalApi for HttpModalApi {
    async fn lookup_app(&self, name: &str) -> Result<String, SandboxError> {
        let reply: AppReply = self
            .call(
                "AppGetOrCreate",
                json!({ "app_name": name, "object_creation_type": "CREATE_IF_MISSING" }),
            )
            .await?;
        Ok(reply.app_id)
    }

    async fn resolve_image(&self, app_id: &str, source: &ImageSource) -> Result<String, SandboxError> {
        let secret_id = match source.secret() {
            Some(name) => Some(self.lookup_secret(name).await?),
            None => None,
        };
        let body = json!({
            "app_id": app_id,
            "image": {
                "dockerfile_commands": [format!("FROM {}", source.tag())],
                "image_registry_config": {
                    "registry_auth_type": source.auth_type(),
                    "secret_id": secret_id,
                },
            },
        });
        let reply: ImageReply = self.call("ImageGetOrCreate", body).await?;
        Ok(reply.image_id)
    }

    async fn create_sandbox(
        &self,
        app_id: &str,
        image_id: &str,
        envs: &BTreeMap<String, String>,
        encrypted_ports: &[u16],
    ) -> Result<String, SandboxError> {
        let definition = SandboxDefinition {
            image_id,
            env: envs,
            encrypted_ports,
            entrypoint_args: ["sleep", "48h"],
        };
        let reply: SandboxReply = self
            .call("SandboxCreate", json!({ "app_id": app_id, "definition": definition }))
            .await
            .map_err(|e| match e {
                SandboxError::Backend(msg) => SandboxError::Provision(msg),
                other => other,
            })?;
        Ok(reply.sandbox_id)
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, SandboxError> {
        let body = json!({
            "sandbox_id": sandbox_id,
            "command": argv,
            "timeout_secs": timeout.map(|t| t.as_secs().max(1)),
        });
        let reply: ExecReply = self.call("SandboxExec", body).await.map_err(|e| match e {
            SandboxError::Backend(msg) => SandboxError::Exec(msg),
            other => other,
        })?;
        Ok(ExecOutput::new(reply.exit_code, reply.stdout, reply.stderr))
    }

    async fn snapshot_filesystem(&self, sandbox_id: &str) -> Result<String, SandboxError> {
        let reply: ImageReply = self
            .call("SandboxSnapshotFs", json!({ "sandbox_id": sandbox_id }))
            .await?;
        Ok(reply.image_id)
    }

    async fn terminate(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let _: Value = self
            .call("SandboxTerminate", json!({ "sandbox_id": sandbox_id }))
            .await?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError> {
        let file: FileData = self
            .call("SandboxFileRead", json!({ "sandbox_id": sandbox_id, "path": path }))
            .await?;
        let bytes = BASE64
            .decode(file.data)
            .map_err(|e| SandboxError::Serde(format!("modal file {path} is not base64: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| SandboxError::Serde(format!("modal file {path} is not utf-8: {e}")))
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<(), SandboxError> {
        let body = json!({
            "sandbox_id": sandbox_id,
            "path": path,
            "data": BASE64.encode(content),
        });
        let _: Value = self.call("SandboxFileWrite", body).await?;
        Ok(())
    }

    async fn tunnels(&self, sandbox_id: &str) -> Result<BTreeMap<u16, String>, SandboxError> {
        let reply: TunnelsReply = self
            .call("SandboxGetTunnels", json!({ "sandbox_id": sandbox_id }))
            .await?;
        Ok(reply
            .tunnels
            .into_iter()
            .map(|t| (t.container_port, t.url()))
            .collect())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_url_omits_default_port() {
        let reply: TunnelsReply = serde_json::from_str(
            r#"{"tunnels":[{"container_port":3000,"host":"abc.modal.host"},{"container_port":8080,"host":"def.modal.host","port":8443}]}"#,
        )
        .unwrap();
        assert_eq!(reply.tunnels[0].url(), "https://abc.modal.host");
        assert_eq!(reply.tunnels[1].url(), "https://def.modal.host:8443");
    }

    #[test]
    fn registry_auth_follows_source() {
        let public = ImageSource::Registry {
            tag: "python:3.13-slim".into(),
            secret: None,
        };
        let ecr = ImageSource::AwsEcr {
            tag: "1234.dkr.ecr.us-east-1.amazonaws.com/app:latest".into(),
            secret: "aws-creds".into(),
        };
        assert_eq!(public.auth_type(), "REGISTRY_AUTH_TYPE_PUBLIC");
        assert_eq!(public.secret(), None);
        assert_eq!(ecr.auth_type(), "REGISTRY_AUTH_TYPE_AWS");
        assert_eq!(ecr.secret(), Some("aws-creds"));
    }

    #[test]
    fn sandbox_definition_serializes_ports_and_env() {
        let envs = BTreeMap::from([("A".to_string(), "1".to_string())]);
        let def = SandboxDefinition {
            image_id: "im-1",
            env: &envs,
            encrypted_ports: &[3000],
            entrypoint_args: ["sleep", "48h"],
        };
        let json = serde_json::to_value(def).unwrap();
        assert_eq!(json["encrypted_ports"], json!([3000]));
        assert_eq!(json["env"]["A"], "1");
    }
}
