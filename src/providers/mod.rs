pub mod beam;
pub mod codesandbox;
pub mod daytona;
pub mod e2b;
pub mod http;
pub mod modal;
pub mod ssh;

use crate::sandbox::registry::ProviderRegistry;
use crate::sandbox::types::CommandResult;

pub use beam::BeamSandbox;
pub use codesandbox::CodeSandboxSandbox;
pub use daytona::DaytonaSandbox;
pub use e2b::E2bSandbox;
pub use modal::ModalSandbox;
pub use ssh::SshSandbox;

/// Register the built-in providers.
pub fn register_defaults(registry: &mut ProviderRegistry) {
    registry.register(e2b::PROVIDER, || Ok(Box::new(E2bSandbox::from_env()?)));
    registry.register(daytona::PROVIDER, || Ok(Box::new(DaytonaSandbox::from_env()?)));
    registry.register(codesandbox::PROVIDER, || {
        Ok(Box::new(CodeSandboxSandbox::from_env()?))
    });
    registry.register(modal::PROVIDER, || Ok(Box::new(ModalSandbox::from_env()?)));
    registry.register(beam::PROVIDER, || Ok(Box::new(BeamSandbox::from_env()?)));
    registry.register(ssh::PROVIDER, || Ok(Box::new(SshSandbox::from_env()?)));
}

/// Separate streams of a finished remote process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

impl From<ExecOutput> for CommandResult {
    fn from(out: ExecOutput) -> Self {
        CommandResult::finished(out.exit_code, &out.stdout, &out.stderr)
    }
}
