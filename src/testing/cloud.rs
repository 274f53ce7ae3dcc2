//! A shared, in-memory stand-in for every vendor's control plane.
//!
//! Each provider's tests implement that provider's API trait for
//! `FakeCloud`, mapping vendor calls onto these primitives. Clones share
//! state, so a second adapter instance can attach to a sandbox created by
//! the first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::machine::FakeMachine;
use crate::providers::ExecOutput;
use crate::sandbox::error::SandboxError;
use crate::sandbox::shell;

#[derive(Debug)]
struct Slot {
    machine: FakeMachine,
    paused: bool,
}

#[derive(Debug)]
struct Pty {
    sandbox_id: String,
    output: mpsc::UnboundedSender<Vec<u8>>,
    line: String,
}

#[derive(Debug, Default)]
struct CloudState {
    machines: BTreeMap<String, Slot>,
    snapshots: HashMap<String, FakeMachine>,
    ptys: HashMap<u32, Pty>,
    next_id: u64,
    calls: Vec<String>,
    /// Operations whose next call fails with `Backend`.
    failing: HashSet<&'static str>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeCloud {
    inner: Arc<Mutex<CloudState>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.inner.lock().unwrap()
    }

    pub fn record(&self, call: impl Into<String>) {
        self.state().calls.push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Make the next `op` call (`"remove"`, `"snapshot"`) fail.
    pub fn fail_next(&self, op: &'static str) {
        self.state().failing.insert(op);
    }

    fn injected(state: &mut CloudState, op: &'static str) -> Result<(), SandboxError> {
        if state.failing.remove(op) {
            return Err(SandboxError::Backend(format!("{op} failed: service unavailable")));
        }
        Ok(())
    }

    /// Ids of live (running or paused) sandboxes, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.state().machines.keys().cloned().collect()
    }

    fn next_id(state: &mut CloudState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{prefix}-{:04}", state.next_id)
    }

    // ── Lifecycle ───────────────────────────────────────────────

    pub fn provision(&self, envs: &BTreeMap<String, String>) -> String {
        self.provision_machine(FakeMachine::new().with_env(envs))
    }

    fn provision_machine(&self, machine: FakeMachine) -> String {
        let mut state = self.state();
        let id = Self::next_id(&mut state, "sbx");
        state.machines.insert(
            id.clone(),
            Slot {
                machine,
                paused: false,
            },
        );
        state.calls.push(format!("provision {id}"));
        id
    }

    pub fn exists(&self, id: &str) -> bool {
        self.state().machines.contains_key(id)
    }

    pub fn require(&self, id: &str) -> Result<(), SandboxError> {
        if self.exists(id) {
            Ok(())
        } else {
            Err(SandboxError::NotFound(format!("sandbox {id}")))
        }
    }

    pub fn is_paused(&self, id: &str) -> Result<bool, SandboxError> {
        self.state()
            .machines
            .get(id)
            .map(|slot| slot.paused)
            .ok_or_else(|| SandboxError::NotFound(format!("sandbox {id}")))
    }

    pub fn set_paused(&self, id: &str, paused: bool) -> Result<(), SandboxError> {
        let mut state = self.state();
        let slot = state
            .machines
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(format!("sandbox {id}")))?;
        slot.paused = paused;
        state
            .calls
            .push(format!("{} {id}", if paused { "pause" } else { "resume" }));
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let mut state = self.state();
        Self::injected(&mut state, "remove")?;
        state
            .machines
            .remove(id)
            .ok_or_else(|| SandboxError::NotFound(format!("sandbox {id}")))?;
        state.calls.push(format!("remove {id}"));
        Ok(())
    }

    /// Copy the filesystem into a new snapshot id.
    pub fn snapshot(&self, id: &str) -> Result<String, SandboxError> {
        let mut state = self.state();
        Self::injected(&mut state, "snapshot")?;
        let machine = state
            .machines
            .get(id)
            .map(|slot| slot.machine.clone())
            .ok_or_else(|| SandboxError::NotFound(format!("sandbox {id}")))?;
        let snapshot_id = Self::next_id(&mut state, "snap");
        state.snapshots.insert(snapshot_id.clone(), machine);
        state.calls.push(format!("snapshot {id} -> {snapshot_id}"));
        Ok(snapshot_id)
    }

    /// Boot a new sandbox from a snapshot.
    pub fn restore(&self, snapshot_id: &str) -> Result<String, SandboxError> {
        let machine = self
            .state()
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(format!("snapshot {snapshot_id}")))?;
        Ok(self.provision_machine(machine))
    }

    pub fn snapshot_count(&self) -> usize {
        self.state().snapshots.len()
    }

    // ── Machines ────────────────────────────────────────────────

    /// Run `f` against a running machine.
    pub fn with_machine<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FakeMachine) -> Result<T, SandboxError>,
    ) -> Result<T, SandboxError> {
        let mut state = self.state();
        let slot = state
            .machines
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(format!("sandbox {id}")))?;
        if slot.paused {
            return Err(SandboxError::Backend(format!("sandbox {id} is paused")));
        }
        f(&mut slot.machine)
    }

    /// Run a shell line, honouring `sleep` in real (or paused) tokio time.
    pub async fn exec(
        &self,
        id: &str,
        line: &str,
        stdin: Option<&str>,
    ) -> Result<ExecOutput, SandboxError> {
        let run = self.with_machine(id, |m| Ok(m.run(line, stdin)))?;
        if let Some(duration) = run.sleep {
            tokio::time::sleep(duration).await;
        }
        Ok(run.output)
    }

    /// `exec` for vendors that take cwd and env overrides out of band.
    pub async fn exec_with(
        &self,
        id: &str,
        command: &str,
        cwd: Option<&str>,
        envs: &BTreeMap<String, String>,
        stdin: Option<&str>,
    ) -> Result<ExecOutput, SandboxError> {
        let options = crate::sandbox::types::RunCommandOptions {
            cwd: cwd.map(String::from),
            envs: envs.clone(),
            ..Default::default()
        };
        self.exec(id, &shell::with_context(command, &options), stdin)
            .await
    }

    /// Native background start.
    pub fn spawn(&self, id: &str, command: &str) -> Result<u32, SandboxError> {
        self.with_machine(id, |m| Ok(m.spawn(command)))
    }

    // ── Ptys ────────────────────────────────────────────────────

    pub fn open_pty(
        &self,
        id: &str,
        output: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<u32, SandboxError> {
        let pid = self.spawn(id, "/bin/bash -i -l")?;
        let _ = output.send(b"$ ".to_vec());
        self.state().ptys.insert(
            pid,
            Pty {
                sandbox_id: id.to_string(),
                output,
                line: String::new(),
            },
        );
        Ok(pid)
    }

    /// Echo input and run each completed line.
    pub async fn pty_input(&self, id: &str, pid: u32, data: &[u8]) -> Result<(), SandboxError> {
        let text = String::from_utf8_lossy(data).into_owned();
        let (output, lines) = {
            let mut state = self.state();
            let pty = state
                .ptys
                .get_mut(&pid)
                .filter(|pty| pty.sandbox_id == id)
                .ok_or_else(|| SandboxError::NotFound(format!("pty {pid}")))?;
            let _ = pty.output.send(text.as_bytes().to_vec());
            pty.line.push_str(&text);
            let mut lines = Vec::new();
            while let Some((line, rest)) = pty.line.split_once('\n') {
                lines.push(line.to_string());
                pty.line = rest.to_string();
            }
            (pty.output.clone(), lines)
        };
        for line in lines {
            let out = self.exec(id, &line, None).await?;
            let _ = output.send(format!("{}{}$ ", out.stdout, out.stderr).into_bytes());
        }
        Ok(())
    }

    pub fn close_pty(&self, pid: u32) -> Result<(), SandboxError> {
        self.state()
            .ptys
            .remove(&pid)
            .map(|_| ())
            .ok_or_else(|| SandboxError::NotFound(format!("pty {pid}")))
    }

    pub fn open_pty_count(&self) -> usize {
        self.state().ptys.len()
    }
}
