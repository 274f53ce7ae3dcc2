use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use unisandbox::template::{BeamBuildOptions, DaytonaBuildOptions, E2bBuildOptions};
use unisandbox::{BuildOptions, CommandResult, CreateSandboxOptions, RunCommandOptions};

#[derive(Parser)]
#[command(name = "unisandbox", about = "Run commands in cloud sandboxes")]
enum Cli {
    /// List registered providers
    Providers,
    /// Run a command in a new (or existing) sandbox
    Run {
        #[arg(long, short)]
        provider: String,
        /// Attach to this sandbox instead of creating one
        #[arg(long)]
        id: Option<String>,
        #[arg(long, short)]
        template: Option<String>,
        /// KEY=VALUE, repeatable
        #[arg(long = "env", short = 'e', value_parser = parse_key_value)]
        envs: Vec<(String, String)>,
        /// Seconds before the command is abandoned
        #[arg(long)]
        timeout: Option<u64>,
        /// Leave the sandbox running afterwards
        #[arg(long)]
        keep: bool,
        command: String,
    },
    /// Build a template from a directory containing a Dockerfile
    BuildTemplate {
        #[arg(long, short)]
        provider: String,
        #[arg(long, short)]
        dir: PathBuf,
        #[arg(long, short)]
        name: String,
        #[arg(long)]
        cpu: Option<u32>,
        /// Memory (MB for e2b, GB for daytona, e.g. 2Gi for beam)
        #[arg(long)]
        memory: Option<String>,
        #[arg(long)]
        disk: Option<u32>,
        #[arg(long)]
        team: Option<String>,
        #[arg(long = "build-arg", value_parser = parse_key_value)]
        build_args: Vec<(String, String)>,
        #[arg(long)]
        no_cache: bool,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("unisandbox=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .init();

    match Cli::parse() {
        Cli::Providers => {
            for name in unisandbox::list_providers() {
                println!("{name}");
            }
            Ok(())
        }
        Cli::Run {
            provider,
            id,
            template,
            envs,
            timeout,
            keep,
            command,
        } => run(provider, id, template, envs, timeout, keep, command).await,
        Cli::BuildTemplate {
            provider,
            dir,
            name,
            cpu,
            memory,
            disk,
            team,
            build_args,
            no_cache,
        } => {
            let options = match provider.as_str() {
                "e2b" => BuildOptions::E2b(E2bBuildOptions {
                    cpu_count: cpu,
                    memory_mb: memory.as_deref().map(str::parse).transpose().context("--memory must be MB")?,
                    team_id: team,
                    build_args: build_args.into_iter().collect(),
                    no_cache,
                }),
                "daytona" => BuildOptions::Daytona(DaytonaBuildOptions {
                    cpu,
                    memory: memory.as_deref().map(str::parse).transpose().context("--memory must be GB")?,
                    disk,
                }),
                "beam" => BuildOptions::Beam(BeamBuildOptions { cpu, memory }),
                other => bail!("template building is not available for {other}"),
            };
            let mut sink = |line: String| println!("{line}");
            unisandbox::build_template(&provider, &dir, &name, Some(options), &mut sink)
                .await
                .with_context(|| format!("building template {name} for {provider}"))?;
            println!("built {name}");
            Ok(())
        }
    }
}

async fn run(
    provider: String,
    id: Option<String>,
    template: Option<String>,
    envs: Vec<(String, String)>,
    timeout: Option<u64>,
    keep: bool,
    command: String,
) -> Result<()> {
    let mut sandbox = match id {
        Some(id) => unisandbox::connect(&provider, &id).await,
        None => {
            let options = CreateSandboxOptions {
                template,
                envs: envs.iter().cloned().collect::<BTreeMap<_, _>>(),
            };
            unisandbox::create(&provider, &options).await
        }
    }
    .with_context(|| format!("opening {provider} sandbox"))?;

    let mut options = RunCommandOptions::default();
    if let Some(secs) = timeout {
        options = options.with_timeout(std::time::Duration::from_secs(secs));
    }
    let result = sandbox.run_command(&command, &options).await;

    if keep {
        if let Ok(id) = sandbox.id() {
            eprintln!("sandbox kept: {id}");
        }
    } else if let Err(e) = sandbox.destroy().await {
        tracing::warn!(error = %e, "failed to destroy sandbox");
    }

    match result.context("running command")? {
        CommandResult::Finished { exit_code, output } => {
            print!("{output}");
            std::io::stdout().flush()?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }
        CommandResult::Background { pid } => println!("started pid {pid}"),
    }
    Ok(())
}
