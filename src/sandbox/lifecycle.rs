//! Per-instance lifecycle state shared by every adapter.
//!
//! ```text
//! Disconnected --init--> Connected --suspend--> Suspended --resume--> Connected
//!                            |                      |
//!                            +------destroy---------+------> Disconnected
//! ```
//!
//! `H` is the vendor handle, only reachable while `Connected`. `S` is what a
//! suspended instance holds to come back: the vendor id for native pause, or
//! the single outstanding snapshot id for snapshot-emulated suspend.

use super::error::SandboxError;

#[derive(Debug)]
pub enum Lifecycle<H, S = String> {
    Disconnected,
    Connected(H),
    Suspended(S),
}

impl<H, S> Default for Lifecycle<H, S> {
    fn default() -> Self {
        Lifecycle::Disconnected
    }
}

impl<H, S> Lifecycle<H, S> {
    /// The "not connected" guard every operation runs before touching the
    /// vendor handle.
    pub fn connected(&self) -> Result<&H, SandboxError> {
        match self {
            Lifecycle::Connected(handle) => Ok(handle),
            _ => Err(SandboxError::NotConnected),
        }
    }

    pub fn connected_mut(&mut self) -> Result<&mut H, SandboxError> {
        match self {
            Lifecycle::Connected(handle) => Ok(handle),
            _ => Err(SandboxError::NotConnected),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Lifecycle::Connected(_))
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Lifecycle::Suspended(_))
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Lifecycle::Disconnected)
    }

    /// Guard for `init`: only a fresh (or destroyed) instance may connect.
    pub fn ensure_disconnected(&self) -> Result<(), SandboxError> {
        match self {
            Lifecycle::Disconnected => Ok(()),
            Lifecycle::Connected(_) => Err(SandboxError::InvalidState("sandbox already initialized")),
            Lifecycle::Suspended(_) => Err(SandboxError::InvalidState(
                "sandbox is suspended; resume it instead of re-initializing",
            )),
        }
    }

    /// Guard for `suspend`: distinguishes a double suspend from "never connected".
    pub fn ready_to_suspend(&self) -> Result<&H, SandboxError> {
        match self {
            Lifecycle::Connected(handle) => Ok(handle),
            Lifecycle::Suspended(_) => Err(SandboxError::InvalidState("sandbox is already suspended")),
            Lifecycle::Disconnected => Err(SandboxError::NotConnected),
        }
    }

    /// Guard for `resume`: the held suspension token, if any.
    pub fn suspended(&self) -> Result<&S, SandboxError> {
        match self {
            Lifecycle::Suspended(token) => Ok(token),
            Lifecycle::Connected(_) => Err(SandboxError::InvalidState(
                "sandbox is not suspended; nothing to resume",
            )),
            Lifecycle::Disconnected => Err(SandboxError::InvalidState(
                "no suspended sandbox to resume",
            )),
        }
    }

    /// Drop whatever is held, returning it so the caller can release it remotely.
    pub fn take(&mut self) -> Lifecycle<H, S> {
        std::mem::replace(self, Lifecycle::Disconnected)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
