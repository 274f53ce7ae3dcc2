//! Thin JSON client shared by the vendor REST adapters.
//!
//! Every vendor speaks "JSON over HTTPS with a bearer-ish header"; the only
//! differences are the auth header and the base URL. Status mapping is the
//! same everywhere: 404 becomes `NotFound`, any other non-2xx becomes
//! `Backend` carrying the response body.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::sandbox::error::SandboxError;

#[derive(Debug, Clone)]
pub struct ApiClient {
    vendor: &'static str,
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    /// Build a client that sends `headers` on every request.
    pub fn new(
        vendor: &'static str,
        base_url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Self, SandboxError> {
        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SandboxError::Config(format!("{vendor}: bad header name {name}: {e}")))?;
            let mut value = HeaderValue::from_str(value)
                .map_err(|e| SandboxError::Config(format!("{vendor}: bad header value for {name}: {e}")))?;
            value.set_sensitive(true);
            default_headers.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| SandboxError::Config(format!("{vendor}: failed to build http client: {e}")))?;
        Ok(Self {
            vendor,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Raw request builder for calls that need more than JSON in / JSON out.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    /// Builder against an absolute URL (per-sandbox hosts).
    pub fn request_url(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, SandboxError> {
        let resp = self.send(self.request(Method::GET, path), "GET", path).await?;
        self.decode(resp, path).await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, SandboxError> {
        let resp = self
            .send(self.request(Method::POST, path).json(body), "POST", path)
            .await?;
        self.decode(resp, path).await
    }

    /// POST where the response body is irrelevant.
    pub async fn post_empty<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), SandboxError> {
        self.send(self.request(Method::POST, path).json(body), "POST", path)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<(), SandboxError> {
        self.send(self.request(Method::DELETE, path), "DELETE", path)
            .await?;
        Ok(())
    }

    /// Send and map the status. Transport failures become `Backend`.
    pub async fn send(
        &self,
        builder: RequestBuilder,
        method: &str,
        path: &str,
    ) -> Result<Response, SandboxError> {
        tracing::debug!(vendor = self.vendor, method, path, "api request");
        let resp = builder.send().await.map_err(|e| {
            SandboxError::Backend(format!("{} {method} {path} failed: {e}", self.vendor))
        })?;
        check_status(self.vendor, method, path, resp).await
    }

    pub async fn decode<T: DeserializeOwned>(
        &self,
        resp: Response,
        path: &str,
    ) -> Result<T, SandboxError> {
        resp.json::<T>().await.map_err(|e| {
            SandboxError::Serde(format!("failed to parse {} response from {path}: {e}", self.vendor))
        })
    }
}

pub(crate) async fn check_status(
    vendor: &str,
    method: &str,
    path: &str,
    resp: Response,
) -> Result<Response, SandboxError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(vendor, method, path, status, &body))
}

pub(crate) fn status_error(
    vendor: &str,
    method: &str,
    path: &str,
    status: StatusCode,
    body: &str,
) -> SandboxError {
    if status == StatusCode::NOT_FOUND {
        return SandboxError::NotFound(format!("{vendor} {path}: {}", body.trim()));
    }
    SandboxError::Backend(format!(
        "{vendor} {method} {path} returned {status}: {}",
        body.trim()
    ))
}

// ── Tests ───────────────────────────────────────────────────────────
