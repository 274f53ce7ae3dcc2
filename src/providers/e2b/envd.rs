//! Client for `envd`, the agent running inside every E2B sandbox.
//!
//! envd speaks the Connect protocol with JSON codecs:
//!   - unary calls: `POST /<service>/<Method>`, body and reply are plain JSON
//!   - server streams: body and reply are sequences of envelopes,
//!     `[flags: u8][len: u32 BE][json]`; flag `0x02` marks the end-of-stream
//!     trailer, which may carry an error
//!
//! Files are moved over plain HTTP on `/files`.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use reqwest::Method;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::providers::ExecOutput;
use crate::providers::http::check_status;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{FileEntry, FileKind, PtySize};

pub const ENVD_PORT: u16 = 49983;

const CONNECT_JSON: &str = "application/connect+json";
const END_STREAM: u8 = 0x02;
// Commands run as the sandbox's default unprivileged user.
const ENVD_USER: &str = "user";

/// Per-sandbox envd handle.
#[derive(Debug, Clone)]
pub struct EnvdClient {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl EnvdClient {
    pub fn new(http: reqwest::Client, base_url: String, access_token: Option<String>) -> Self {
        Self {
            http,
            base_url,
            access_token,
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(ENVD_USER, Some(""));
        if let Some(token) = &self.access_token {
            builder = builder.header("X-Access-Token", token);
        }
        builder
    }

    async fn unary<B: Serialize, T: DeserializeOwned>(
        &self,
        rpc: &str,
        body: &B,
    ) -> Result<T, SandboxError> {
        let resp = self
            .request(Method::POST, rpc)
            .header("Connect-Protocol-Version", "1")
            .json(body)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("envd {rpc} failed: {e}")))?;
        let resp = check_status("envd", "POST", rpc, resp).await?;
        resp.json::<T>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse envd {rpc} reply: {e}")))
    }

    async fn open_stream(
        &self,
        rpc: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<ProcessStream, SandboxError> {
        let mut builder = self
            .request(Method::POST, rpc)
            .header("Content-Type", CONNECT_JSON)
            .header("Connect-Protocol-Version", "1")
            .body(envelope(body)?);
        if let Some(limit) = timeout {
            builder = builder.header("Connect-Timeout-Ms", limit.as_millis().to_string());
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| SandboxError::Exec(format!("envd {rpc} failed: {e}")))?;
        let resp = check_status("envd", "POST", rpc, resp).await?;
        Ok(ProcessStream {
            body: Box::pin(resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()))),
            decoder: EnvelopeDecoder::default(),
            limit: timeout,
        })
    }

    // ── Processes ───────────────────────────────────────────────

    /// Start a process and return its event stream, positioned after the
    /// `start` event.
    pub async fn start(
        &self,
        process: &Value,
        pty: Option<PtySize>,
        timeout: Option<Duration>,
    ) -> Result<(u32, ProcessStream), SandboxError> {
        let mut body = json!({ "process": process });
        if let Some(size) = pty {
            body["pty"] = json!({ "size": { "cols": size.cols, "rows": size.rows } });
        }
        let mut stream = self
            .open_stream("/process.Process/Start", &body, timeout)
            .await?;
        loop {
            match stream.next_event().await? {
                Some(ProcessEvent {
                    start: Some(start), ..
                }) => return Ok((start.pid, stream)),
                Some(_) => continue,
                None => {
                    return Err(SandboxError::Exec(
                        "envd stream closed before the process started".into(),
                    ));
                }
            }
        }
    }

    pub async fn send_pty_input(&self, pid: u32, data: &[u8]) -> Result<(), SandboxError> {
        let body = json!({
            "process": { "pid": pid },
            "input": { "pty": BASE64.encode(data) },
        });
        let _: Value = self.unary("/process.Process/SendInput", &body).await?;
        Ok(())
    }

    pub async fn resize_pty(&self, pid: u32, size: PtySize) -> Result<(), SandboxError> {
        let body = json!({
            "process": { "pid": pid },
            "pty": { "size": { "cols": size.cols, "rows": size.rows } },
        });
        let _: Value = self.unary("/process.Process/Update", &body).await?;
        Ok(())
    }

    pub async fn kill(&self, pid: u32) -> Result<(), SandboxError> {
        let body = json!({ "process": { "pid": pid }, "signal": "SIGNAL_SIGKILL" });
        let _: Value = self.unary("/process.Process/SendSignal", &body).await?;
        Ok(())
    }

    // ── Filesystem ──────────────────────────────────────────────

    pub async fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        #[derive(Deserialize)]
        struct ListDirResponse {
            #[serde(default)]
            entries: Vec<EntryInfo>,
        }
        #[derive(Deserialize)]
        struct EntryInfo {
            name: String,
            #[serde(rename = "type", default)]
            kind: String,
        }

        let resp: ListDirResponse = self
            .unary(
                "/filesystem.Filesystem/ListDir",
                &json!({ "path": path, "depth": 1 }),
            )
            .await?;
        Ok(resp
            .entries
            .into_iter()
            .map(|e| FileEntry {
                kind: if e.kind == "FILE_TYPE_DIRECTORY" {
                    FileKind::Directory
                } else {
                    FileKind::File
                },
                name: e.name,
            })
            .collect())
    }

    pub async fn make_dir(&self, path: &str) -> Result<(), SandboxError> {
        let _: Value = self
            .unary("/filesystem.Filesystem/MakeDir", &json!({ "path": path }))
            .await?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        let _: Value = self
            .unary(
                "/filesystem.Filesystem/Move",
                &json!({ "source": from, "destination": to }),
            )
            .await?;
        Ok(())
    }

    pub async fn remove(&self, path: &str) -> Result<(), SandboxError> {
        let _: Value = self
            .unary("/filesystem.Filesystem/Remove", &json!({ "path": path }))
            .await?;
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let resp = self
            .request(Method::GET, "/files")
            .query(&[("path", path), ("username", ENVD_USER)])
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("envd read {path} failed: {e}")))?;
        let resp = check_status("envd", "GET", path, resp).await?;
        resp.text()
            .await
            .map_err(|e| SandboxError::Backend(format!("envd read {path} failed: {e}")))
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let part = reqwest::multipart::Part::text(content.to_string()).file_name(path.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .request(Method::POST, "/files")
            .query(&[("path", path), ("username", ENVD_USER)])
            .multipart(form)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("envd write {path} failed: {e}")))?;
        check_status("envd", "POST", path, resp).await?;
        Ok(())
    }
}

/// Shell invocation for a one-off command.
pub fn shell_process(
    command: &str,
    cwd: Option<&str>,
    envs: &std::collections::BTreeMap<String, String>,
) -> Value {
    let mut process = json!({
        "cmd": "/bin/bash",
        "args": ["-l", "-c", command],
        "envs": envs,
    });
    if let Some(cwd) = cwd {
        process["cwd"] = json!(cwd);
    }
    process
}

/// Interactive login shell for a pty.
pub fn pty_process() -> Value {
    json!({
        "cmd": "/bin/bash",
        "args": ["-i", "-l"],
        "envs": { "TERM": "xterm-256color", "LANG": "C.UTF-8" },
    })
}

// ── Streams ─────────────────────────────────────────────────────────

type ByteStream = std::pin::Pin<Box<dyn futures::Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

/// Event stream of one envd process.
pub struct ProcessStream {
    body: ByteStream,
    decoder: EnvelopeDecoder,
    /// Deadline sent with the request; envd enforces it too.
    limit: Option<Duration>,
}

impl ProcessStream {
    /// Next process event, `None` once the server closes the stream cleanly.
    pub async fn next_event(&mut self) -> Result<Option<ProcessEvent>, SandboxError> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                if frame.flags & END_STREAM != 0 {
                    return end_of_stream(&frame.payload, self.limit).map(|()| None);
                }
                let msg: StartResponse = serde_json::from_slice(&frame.payload)?;
                return Ok(Some(msg.event));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.decoder.push(&chunk),
                Some(Err(e)) => {
                    return Err(SandboxError::Exec(format!("envd stream failed: {e}")));
                }
                None => return Ok(None),
            }
        }
    }

    /// Drain to the `end` event, collecting output.
    pub async fn collect(mut self) -> Result<ExecOutput, SandboxError> {
        let mut out = ExecOutput::default();
        while let Some(event) = self.next_event().await? {
            if let Some(data) = event.data {
                if let Some(stdout) = data.stdout {
                    out.stdout.push_str(&decode_text(&stdout)?);
                }
                if let Some(stderr) = data.stderr {
                    out.stderr.push_str(&decode_text(&stderr)?);
                }
            }
            if let Some(end) = event.end {
                out.exit_code = end.exit_code;
                if let Some(err) = end.error.filter(|e| !e.is_empty() && end.exit_code == 0) {
                    return Err(SandboxError::Exec(err));
                }
                return Ok(out);
            }
        }
        Err(SandboxError::Exec(
            "envd stream closed before the process exited".into(),
        ))
    }

    /// Forward decoded pty bytes until the process ends.
    pub async fn forward_pty(mut self, sink: tokio::sync::mpsc::UnboundedSender<Vec<u8>>) {
        loop {
            match self.next_event().await {
                Ok(Some(event)) => {
                    let chunk = event.data.and_then(|d| d.pty);
                    if let Some(encoded) = chunk {
                        match BASE64.decode(encoded.as_bytes()) {
                            Ok(bytes) => {
                                if sink.send(bytes).is_err() {
                                    return;
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "dropping undecodable pty chunk"),
                        }
                    }
                    if event.end.is_some() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "pty stream ended with error");
                    return;
                }
            }
        }
    }
}

fn decode_text(encoded: &str) -> Result<String, SandboxError> {
    let bytes = BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| SandboxError::Serde(format!("invalid base64 in process output: {e}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Map the Connect end-of-stream trailer. A `deadline_exceeded` for a
/// request that carried a deadline is the same timeout the caller enforces
/// locally, so both surface as `Timeout`.
fn end_of_stream(payload: &[u8], limit: Option<Duration>) -> Result<(), SandboxError> {
    #[derive(Deserialize)]
    struct EndStream {
        error: Option<ConnectError>,
    }
    #[derive(Deserialize)]
    struct ConnectError {
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    }

    if payload.is_empty() {
        return Ok(());
    }
    let trailer: EndStream = serde_json::from_slice(payload)?;
    match trailer.error {
        None => Ok(()),
        Some(err) if err.code == "deadline_exceeded" => match limit {
            Some(limit) => Err(SandboxError::Timeout(limit)),
            None => Err(SandboxError::Exec(format!(
                "envd deadline exceeded: {}",
                err.message
            ))),
        },
        Some(err) if err.code == "not_found" => Err(SandboxError::NotFound(err.message)),
        Some(err) => Err(SandboxError::Exec(format!("envd {}: {}", err.code, err.message))),
    }
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(default)]
    event: ProcessEvent,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProcessEvent {
    pub start: Option<StartEvent>,
    pub data: Option<DataEvent>,
    pub end: Option<EndEvent>,
}

#[derive(Debug, Deserialize)]
pub struct StartEvent {
    pub pid: u32,
}

#[derive(Debug, Deserialize)]
pub struct DataEvent {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub pty: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndEvent {
    // Zero is omitted on the wire.
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub error: Option<String>,
}

// ── Envelope framing ────────────────────────────────────────────────

fn envelope(message: &Value) -> Result<Vec<u8>, SandboxError> {
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| SandboxError::Serde("envd request too large".into()))?;
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(0);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

#[derive(Debug, PartialEq, Eq)]
struct Frame {
    flags: u8,
    payload: Vec<u8>,
}

/// Reassembles envelopes from arbitrarily split chunks.
#[derive(Debug, Default)]
struct EnvelopeDecoder {
    buf: Vec<u8>,
}

impl EnvelopeDecoder {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if self.buf.len() < 5 {
            return None;
        }
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < 5 + len {
            return None;
        }
        let flags = self.buf[0];
        let payload = self.buf[5..5 + len].to_vec();
        self.buf.drain(..5 + len);
        Some(Frame { flags, payload })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
