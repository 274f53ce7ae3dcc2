//! JSON-RPC session with a running VM's agent over a WebSocket.
//!
//! Requests carry an `id` and get exactly one reply with the same `id`:
//! `{"id": 7, "status": 0, "result": {...}}` or
//! `{"id": 7, "status": 1, "error": {"code": 404, "message": "..."}}`.
//! Messages without an `id` are notifications; the only one we consume is
//! `shell/out`, routed to the terminal that owns the shell.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::sandbox::error::SandboxError;

const NOT_FOUND: i64 = 404;

type Reply = Result<Value, SandboxError>;

#[derive(Default)]
struct Routes {
    pending: HashMap<u64, oneshot::Sender<Reply>>,
    shells: HashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct Incoming {
    id: Option<u64>,
    #[serde(default)]
    status: u8,
    #[serde(default)]
    result: Value,
    error: Option<RpcError>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShellOut {
    shell_id: String,
    out: String,
}

pub struct PitcherSession {
    outbound: mpsc::UnboundedSender<Message>,
    routes: Arc<Mutex<Routes>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PitcherSession {
    pub async fn connect(url: &str, token: &str) -> Result<Self, SandboxError> {
        let url = format!("{url}/?token={token}");
        let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SandboxError::Backend(format!("codesandbox session connect failed: {e}")))?;
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
        let routes = Arc::new(Mutex::new(Routes::default()));

        let writer = tokio::spawn(async move {
            while let Some(msg) = queue.recv().await {
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!(error = %e, "codesandbox session write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_routes = routes.clone();
        let pong = outbound.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => dispatch(&reader_routes, text.as_str()),
                    Ok(Message::Ping(data)) => {
                        let _ = pong.send(Message::Pong(data));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "codesandbox session read failed");
                        break;
                    }
                }
            }
            close_routes(&reader_routes);
        });

        Ok(Self {
            outbound,
            routes,
            next_id: AtomicU64::new(1),
            reader,
            writer,
        })
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        lock(&self.routes)
    }

    /// Send a request and wait for its reply.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, SandboxError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = self.routes();
            if routes.closed {
                return Err(SandboxError::Backend("codesandbox session is closed".into()));
            }
            routes.pending.insert(id, tx);
        }
        let frame = json!({ "id": id, "method": method, "params": params });
        tracing::debug!(method, id, "codesandbox rpc");
        if self.outbound.send(Message::Text(frame.to_string().into())).is_err() {
            self.routes().pending.remove(&id);
            return Err(SandboxError::Backend("codesandbox session is closed".into()));
        }
        let value = rx
            .await
            .map_err(|_| SandboxError::Backend(format!("codesandbox session closed during {method}")))??;
        serde_json::from_value(value)
            .map_err(|e| SandboxError::Serde(format!("bad codesandbox {method} reply: {e}")))
    }

    /// Route `shell/out` for `shell_id` to `output`.
    pub fn subscribe(&self, shell_id: &str, output: mpsc::UnboundedSender<Vec<u8>>) {
        self.routes().shells.insert(shell_id.to_string(), output);
    }

    pub fn unsubscribe(&self, shell_id: &str) {
        self.routes().shells.remove(shell_id);
    }

    /// Close the socket and fail anything still waiting.
    pub fn dispose(&self) {
        let _ = self.outbound.send(Message::Close(None));
        close_routes(&self.routes);
    }
}

impl Drop for PitcherSession {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn lock(routes: &Mutex<Routes>) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn close_routes(routes: &Mutex<Routes>) {
    let mut routes = lock(routes);
    routes.closed = true;
    routes.shells.clear();
    for (_, waiter) in routes.pending.drain() {
        let _ = waiter.send(Err(SandboxError::Backend("codesandbox session closed".into())));
    }
}

fn dispatch(routes: &Mutex<Routes>, text: &str) {
    let msg: Incoming = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed codesandbox frame");
            return;
        }
    };
    let mut routes = lock(routes);
    match msg.id {
        Some(id) => {
            let Some(waiter) = routes.pending.remove(&id) else {
                return;
            };
            let _ = waiter.send(reply(msg));
        }
        None if msg.method.as_deref() == Some("shell/out") => {
            let Ok(out) = serde_json::from_value::<ShellOut>(msg.params) else {
                return;
            };
            if let Some(sink) = routes.shells.get(&out.shell_id) {
                let _ = sink.send(out.out.into_bytes());
            }
        }
        None => {}
    }
}

fn reply(msg: Incoming) -> Reply {
    if msg.status == 0 {
        return Ok(msg.result);
    }
    let err = msg.error.unwrap_or(RpcError {
        code: 0,
        message: "request failed".into(),
    });
    if err.code == NOT_FOUND {
        Err(SandboxError::NotFound(err.message))
    } else {
        Err(SandboxError::Backend(format!(
            "codesandbox rpc error {}: {}",
            err.code, err.message
        )))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
