//! Per-provider settings loaded from environment variables.
//!
//! Each adapter reads its config when it is constructed, so missing
//! credentials fail with `SandboxError::Config` before any network call.

use std::path::PathBuf;

use crate::sandbox::error::SandboxError;

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

fn required(value: Option<&str>, name: &str) -> Result<String, SandboxError> {
    non_empty(value).ok_or_else(|| {
        SandboxError::Config(format!("{name} is not set in environment variables"))
    })
}

fn or_default(value: Option<&str>, default: &str) -> String {
    non_empty(value).unwrap_or_else(|| default.to_string())
}

// ── E2B ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct E2bConfig {
    pub api_key: String,
    pub api_url: String,
    /// Sandbox hosts live under `<port>-<id>.<domain>`.
    pub domain: String,
}

impl E2bConfig {
    pub fn from_env() -> Result<Self, SandboxError> {
        Self::from_raw_values(
            var("E2B_API_KEY").as_deref(),
            var("E2B_DOMAIN").as_deref(),
            var("E2B_API_URL").as_deref(),
        )
    }

    pub fn from_raw_values(
        api_key: Option<&str>,
        domain: Option<&str>,
        api_url: Option<&str>,
    ) -> Result<Self, SandboxError> {
        let domain = or_default(domain, "e2b.app");
        Ok(Self {
            api_key: required(api_key, "E2B_API_KEY")?,
            api_url: non_empty(api_url).unwrap_or_else(|| format!("https://api.{domain}")),
            domain,
        })
    }
}

// ── Daytona ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaytonaConfig {
    pub api_key: String,
    pub api_url: String,
    pub target: Option<String>,
}

impl DaytonaConfig {
    pub fn from_env() -> Result<Self, SandboxError> {
        Self::from_raw_values(
            var("DAYTONA_API_KEY").as_deref(),
            var("DAYTONA_API_URL").as_deref(),
            var("DAYTONA_TARGET").as_deref(),
        )
    }

    pub fn from_raw_values(
        api_key: Option<&str>,
        api_url: Option<&str>,
        target: Option<&str>,
    ) -> Result<Self, SandboxError> {
        Ok(Self {
            api_key: required(api_key, "DAYTONA_API_KEY")?,
            api_url: or_default(api_url, "https://app.daytona.io/api"),
            target: non_empty(target),
        })
    }
}

// ── CodeSandbox ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CodeSandboxConfig {
    pub api_key: String,
    pub api_url: String,
}

impl CodeSandboxConfig {
    pub fn from_env() -> Result<Self, SandboxError> {
        Self::from_raw_values(
            var("CODESANDBOX_API_KEY").as_deref(),
            var("CODESANDBOX_API_URL").as_deref(),
        )
    }

    pub fn from_raw_values(
        api_key: Option<&str>,
        api_url: Option<&str>,
    ) -> Result<Self, SandboxError> {
        Ok(Self {
            api_key: required(api_key, "CODESANDBOX_API_KEY")?,
            api_url: or_default(api_url, "https://api.codesandbox.io"),
        })
    }
}

// ── Modal ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ModalConfig {
    pub token_id: String,
    pub token_secret: String,
    pub api_url: String,
    pub app_name: String,
    /// Ports tunnelled over TLS; only these have preview URLs.
    pub encrypted_ports: Vec<u16>,
    pub aws_secret_name: Option<String>,
    pub gcp_secret_name: Option<String>,
    pub docker_secret_name: Option<String>,
}

/// Raw env values for [`ModalConfig::from_raw_values`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ModalEnv<'a> {
    pub token_id: Option<&'a str>,
    pub token_secret: Option<&'a str>,
    pub api_url: Option<&'a str>,
    pub app_name: Option<&'a str>,
    pub encrypted_ports: Option<&'a str>,
    pub aws_secret_name: Option<&'a str>,
    pub gcp_secret_name: Option<&'a str>,
    pub docker_secret_name: Option<&'a str>,
}

impl ModalConfig {
    pub fn from_env() -> Result<Self, SandboxError> {
        let token_id = var("MODAL_TOKEN_ID");
        let token_secret = var("MODAL_TOKEN_SECRET");
        let api_url = var("MODAL_API_URL");
        let app_name = var("MODAL_APP_NAME");
        let encrypted_ports = var("MODAL_ENCRYPTED_PORTS");
        let aws = var("MODAL_AWS_SECRET_NAME");
        let gcp = var("MODAL_GCP_SECRET_NAME");
        let docker = var("MODAL_DOCKER_SECRET_NAME");
        Self::from_raw_values(ModalEnv {
            token_id: token_id.as_deref(),
            token_secret: token_secret.as_deref(),
            api_url: api_url.as_deref(),
            app_name: app_name.as_deref(),
            encrypted_ports: encrypted_ports.as_deref(),
            aws_secret_name: aws.as_deref(),
            gcp_secret_name: gcp.as_deref(),
            docker_secret_name: docker.as_deref(),
        })
    }

    pub fn from_raw_values(env: ModalEnv<'_>) -> Result<Self, SandboxError> {
        let encrypted_ports = match non_empty(env.encrypted_ports) {
            Some(raw) => parse_ports(&raw)?,
            None => Vec::new(),
        };
        Ok(Self {
            token_id: required(env.token_id, "MODAL_TOKEN_ID")?,
            token_secret: required(env.token_secret, "MODAL_TOKEN_SECRET")?,
            api_url: or_default(env.api_url, "https://api.modal.com"),
            app_name: or_default(env.app_name, "sandboxjs-modal"),
            encrypted_ports,
            aws_secret_name: non_empty(env.aws_secret_name),
            gcp_secret_name: non_empty(env.gcp_secret_name),
            docker_secret_name: non_empty(env.docker_secret_name),
        })
    }
}

fn parse_ports(raw: &str) -> Result<Vec<u16>, SandboxError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>().map_err(|_| {
                SandboxError::Config(format!("MODAL_ENCRYPTED_PORTS has an invalid port: {s}"))
            })
        })
        .collect()
}

// ── Beam ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BeamConfig {
    pub token: String,
    pub workspace_id: String,
    pub api_url: String,
}

impl BeamConfig {
    pub fn from_env() -> Result<Self, SandboxError> {
        Self::from_raw_values(
            var("BEAM_TOKEN").as_deref(),
            var("BEAM_WORKSPACE_ID").as_deref(),
            var("BEAM_API_URL").as_deref(),
        )
    }

    pub fn from_raw_values(
        token: Option<&str>,
        workspace_id: Option<&str>,
        api_url: Option<&str>,
    ) -> Result<Self, SandboxError> {
        Ok(Self {
            token: required(token, "BEAM_TOKEN")?,
            workspace_id: required(workspace_id, "BEAM_WORKSPACE_ID")?,
            api_url: or_default(api_url, "https://app.beam.cloud"),
        })
    }
}

// ── SSH ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
}

impl SshConfig {
    pub fn from_env() -> Result<Self, SandboxError> {
        Self::from_raw_values(
            var("SSH_HOST").as_deref(),
            var("SSH_USER").as_deref(),
            var("SSH_PORT").as_deref(),
            var("SSH_KEY_PATH").as_deref(),
        )
    }

    pub fn from_raw_values(
        host: Option<&str>,
        user: Option<&str>,
        port: Option<&str>,
        key_path: Option<&str>,
    ) -> Result<Self, SandboxError> {
        let port = match non_empty(port) {
            Some(raw) => raw
                .parse()
                .map_err(|_| SandboxError::Config(format!("SSH_PORT is not a valid port: {raw}")))?,
            None => 22,
        };
        Ok(Self {
            host: required(host, "SSH_HOST")?,
            user: or_default(user, "root"),
            port,
            key_path: non_empty(key_path).map(PathBuf::from),
        })
    }

    /// `user@host:port`, the form accepted back by `init(Some(id))`.
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    /// Parse `[user@]host[:port]`, filling gaps from `self`.
    pub fn with_target(&self, target: &str) -> Result<Self, SandboxError> {
        let (user, rest) = match target.split_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (self.user.clone(), target),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse()
                    .map_err(|_| SandboxError::Config(format!("invalid ssh port in {target}")))?,
            ),
            None => (rest.to_string(), self.port),
        };
        if host.is_empty() || user.is_empty() {
            return Err(SandboxError::Config(format!("invalid ssh target: {target}")));
        }
        Ok(Self {
            host,
            user,
            port,
            key_path: self.key_path.clone(),
        })
    }
}
