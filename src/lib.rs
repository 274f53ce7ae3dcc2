//! One sandbox interface over several cloud sandbox vendors.
//!
//! ```no_run
//! # async fn demo() -> Result<(), unisandbox::SandboxError> {
//! let sbx = unisandbox::create("e2b", &Default::default()).await?;
//! let result = sbx.run_command("echo hi", &Default::default()).await?;
//! println!("{result:?}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod providers;
pub mod sandbox;
pub mod template;

#[cfg(test)]
mod testing;

pub use sandbox::{
    CommandResult, CreateSandboxOptions, FileEntry, RunCommandOptions, Sandbox, SandboxError,
    Terminal, connect, create, list_providers,
};
pub use template::{BuildOptions, build_template};
