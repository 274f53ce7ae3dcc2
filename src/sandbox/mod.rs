pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod registry;
pub mod shell;
pub mod terminal;
pub mod types;

pub use error::SandboxError;
pub use handle::Sandbox;
pub use lifecycle::Lifecycle;
pub use registry::{ProviderRegistry, SandboxConstructor};
pub use terminal::{OutputHandler, Terminal};
pub use types::*;

/// Create a new sandbox on `provider`.
pub async fn create(
    provider: &str,
    options: &CreateSandboxOptions,
) -> Result<Box<dyn Sandbox>, SandboxError> {
    let mut sandbox = registry::get(provider)?()?;
    sandbox.init(None, options).await?;
    tracing::info!(provider, sandbox_id = %sandbox.id().unwrap_or_default(), "sandbox created");
    Ok(sandbox)
}

/// Attach to an existing sandbox by vendor id.
pub async fn connect(provider: &str, id: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
    let mut sandbox = registry::get(provider)?()?;
    sandbox
        .init(Some(id), &CreateSandboxOptions::default())
        .await?;
    tracing::info!(provider, sandbox_id = %id, "sandbox connected");
    Ok(sandbox)
}

pub fn list_providers() -> Vec<String> {
    registry::list()
}
