//! Building sandbox templates from a local directory.
//!
//! E2B and Daytona builds go through the vendor CLIs (`e2b`, `daytona`),
//! Beam builds through its image API. Every build starts from the directory's
//! descriptor (see [`dockerfile`]) with the start instruction lifted out.

pub mod command;
pub mod dockerfile;

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::BeamConfig;
use crate::providers::beam::api::{BeamApi, BuildResources, HttpBeamApi};
use crate::providers::{beam, daytona, e2b};
use crate::sandbox::error::SandboxError;

pub use crate::providers::beam::api::LogSink;
pub use dockerfile::PreparedDescriptor;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct E2bBuildOptions {
    pub cpu_count: Option<u32>,
    pub memory_mb: Option<u32>,
    pub team_id: Option<String>,
    pub build_args: BTreeMap<String, String>,
    pub no_cache: bool,
}

/// Sizes are in the units the Daytona CLI takes (cores, GB, GB).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaytonaBuildOptions {
    pub cpu: Option<u32>,
    pub memory: Option<u32>,
    pub disk: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeamBuildOptions {
    pub cpu: Option<u32>,
    pub memory: Option<String>,
}

/// Vendor-specific build options. Must match the provider being built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOptions {
    E2b(E2bBuildOptions),
    Daytona(DaytonaBuildOptions),
    Beam(BeamBuildOptions),
}

impl BuildOptions {
    fn provider(&self) -> &'static str {
        match self {
            BuildOptions::E2b(_) => e2b::PROVIDER,
            BuildOptions::Daytona(_) => daytona::PROVIDER,
            BuildOptions::Beam(_) => beam::PROVIDER,
        }
    }
}

/// Build template `name` for `provider` from `directory`, streaming build
/// output to `on_logs`.
pub async fn build_template(
    provider: &str,
    directory: impl AsRef<Path>,
    name: &str,
    options: Option<BuildOptions>,
    on_logs: LogSink<'_>,
) -> Result<(), SandboxError> {
    let directory = directory.as_ref();
    check_options(provider, options.as_ref())?;

    match (provider, options) {
        (e2b::PROVIDER, options) => {
            let options = match options {
                Some(BuildOptions::E2b(o)) => o,
                _ => E2bBuildOptions::default(),
            };
            build_e2b(directory, name, &options, on_logs).await
        }
        (daytona::PROVIDER, options) => {
            let options = match options {
                Some(BuildOptions::Daytona(o)) => o,
                _ => DaytonaBuildOptions::default(),
            };
            build_daytona(directory, name, &options, on_logs).await
        }
        (beam::PROVIDER, options) => {
            let options = match options {
                Some(BuildOptions::Beam(o)) => o,
                _ => BeamBuildOptions::default(),
            };
            let api = HttpBeamApi::new(&BeamConfig::from_env()?)?;
            build_beam(&api, directory, name, &options, on_logs).await?;
            Ok(())
        }
        _ => Err(SandboxError::Unsupported(
            "template building is only available for e2b, daytona and beam",
        )),
    }
}

fn check_options(provider: &str, options: Option<&BuildOptions>) -> Result<(), SandboxError> {
    match options {
        Some(options) if options.provider() != provider => Err(SandboxError::Config(format!(
            "{} build options given for provider {provider}",
            options.provider()
        ))),
        _ => Ok(()),
    }
}

pub async fn build_e2b(
    directory: &Path,
    name: &str,
    options: &E2bBuildOptions,
    logs: LogSink<'_>,
) -> Result<(), SandboxError> {
    let prepared = dockerfile::prepare(directory)?;
    let args = e2b_args(directory, name, &prepared, options);
    command::run_streaming("e2b", &args, directory, logs).await?;
    tracing::info!(provider = e2b::PROVIDER, template = %name, "template built");
    Ok(())
}

pub async fn build_daytona(
    directory: &Path,
    name: &str,
    options: &DaytonaBuildOptions,
    logs: LogSink<'_>,
) -> Result<(), SandboxError> {
    let prepared = dockerfile::prepare(directory)?;
    let args = daytona_args(directory, name, &prepared, options);
    command::run_streaming("daytona", &args, directory, logs).await?;
    tracing::info!(provider = daytona::PROVIDER, snapshot = %name, "snapshot built");
    Ok(())
}

/// Returns the id of the built image.
pub async fn build_beam(
    api: &dyn BeamApi,
    directory: &Path,
    name: &str,
    options: &BeamBuildOptions,
    logs: LogSink<'_>,
) -> Result<String, SandboxError> {
    let prepared = dockerfile::prepare(directory)?;
    if let Some(cmd) = &prepared.start_command {
        tracing::warn!(start_command = %cmd, "beam images carry no start command; ignoring it");
    }
    let resources = BuildResources {
        cpu: options.cpu,
        memory: options.memory.clone(),
    };
    let image_id = api
        .build_image(name, &prepared.content, &resources, logs)
        .await?;
    tracing::info!(provider = beam::PROVIDER, template = %name, image_id = %image_id, "image built");
    Ok(image_id)
}

fn e2b_args(
    directory: &Path,
    name: &str,
    prepared: &PreparedDescriptor,
    options: &E2bBuildOptions,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "template".into(),
        "build".into(),
        "--name".into(),
        name.into(),
        "--dockerfile".into(),
        prepared.path().to_string_lossy().into_owned(),
        "--path".into(),
        directory.to_string_lossy().into_owned(),
    ];
    if let Some(cmd) = &prepared.start_command {
        args.extend(["--cmd".into(), cmd.clone()]);
    }
    if let Some(cpu) = options.cpu_count {
        args.extend(["--cpu-count".into(), cpu.to_string()]);
    }
    if let Some(memory) = options.memory_mb {
        args.extend(["--memory-mb".into(), memory.to_string()]);
    }
    if let Some(team) = &options.team_id {
        args.extend(["--team".into(), team.clone()]);
    }
    for (key, value) in &options.build_args {
        args.extend(["--build-arg".into(), format!("{key}={value}")]);
    }
    if options.no_cache {
        args.push("--no-cache".into());
    }
    args
}

fn daytona_args(
    directory: &Path,
    name: &str,
    prepared: &PreparedDescriptor,
    options: &DaytonaBuildOptions,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "snapshot".into(),
        "create".into(),
        name.into(),
        "--dockerfile".into(),
        prepared.path().to_string_lossy().into_owned(),
        "--context".into(),
        directory.to_string_lossy().into_owned(),
    ];
    for (flag, value) in [
        ("--cpu", options.cpu),
        ("--memory", options.memory),
        ("--disk", options.disk),
    ] {
        if let Some(value) = value {
            args.extend([flag.into(), value.to_string()]);
        }
    }
    if let Some(cmd) = &prepared.start_command {
        args.extend(["--entrypoint".into(), cmd.clone()]);
    }
    args
}
