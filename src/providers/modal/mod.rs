//! Modal: snapshot-and-terminate suspension, shell-synthesized file ops.
//!
//! Modal sandboxes cannot be looked up again by sandbox id, so the id this
//! adapter hands out is the filesystem image id taken at `suspend`. While
//! connected there is nothing to hand out and `id()` is a state error;
//! `init(Some(image_id))` boots a fresh sandbox from that image.

pub mod api;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use self::api::{HttpModalApi, ImageSource, ModalApi};
use crate::config::ModalConfig;
use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::{Sandbox, with_deadline};
use crate::sandbox::lifecycle::Lifecycle;
use crate::sandbox::terminal::{OutputHandler, Terminal};
use crate::sandbox::types::*;
use crate::sandbox::{shell, types};

pub const PROVIDER: &str = "modal";
pub const DEFAULT_IMAGE: &str = "python:3.13-slim";

/// Map a template name onto an image source.
///
/// `aws/<tag>` pulls from ECR and `gcp/<tag>` from Artifact Registry, each
/// with its configured secret. `docker/<tag>` or a bare tag pulls from a
/// registry, authenticated when a docker secret is configured.
pub fn image_source(template: &str, config: &ModalConfig) -> Result<ImageSource, SandboxError> {
    if let Some(tag) = template.strip_prefix("aws/") {
        let secret = config.aws_secret_name.clone().ok_or_else(|| {
            SandboxError::Config("MODAL_AWS_SECRET_NAME is not set in environment variables".into())
        })?;
        return Ok(ImageSource::AwsEcr {
            tag: tag.to_string(),
            secret,
        });
    }
    if let Some(tag) = template.strip_prefix("gcp/") {
        let secret = config.gcp_secret_name.clone().ok_or_else(|| {
            SandboxError::Config("MODAL_GCP_SECRET_NAME is not set in environment variables".into())
        })?;
        return Ok(ImageSource::GcpArtifactRegistry {
            tag: tag.to_string(),
            secret,
        });
    }
    let tag = template.strip_prefix("docker/").unwrap_or(template);
    Ok(ImageSource::Registry {
        tag: tag.to_string(),
        secret: config.docker_secret_name.clone(),
    })
}

pub struct ModalSandbox {
    api: Arc<dyn ModalApi>,
    config: ModalConfig,
    app_id: OnceCell<String>,
    /// Create-time env. A filesystem snapshot does not carry it, so every
    /// boot passes it again.
    envs: BTreeMap<String, String>,
    /// Connected holds the sandbox id, Suspended the snapshot image id.
    state: Lifecycle<String, String>,
}

impl ModalSandbox {
    pub fn from_env() -> Result<Self, SandboxError> {
        let config = ModalConfig::from_env()?;
        Ok(Self::with_api(Arc::new(HttpModalApi::new(&config)?), config))
    }

    pub fn with_api(api: Arc<dyn ModalApi>, config: ModalConfig) -> Self {
        Self {
            api,
            config,
            app_id: OnceCell::new(),
            envs: BTreeMap::new(),
            state: Lifecycle::Disconnected,
        }
    }

    async fn app(&self) -> Result<&str, SandboxError> {
        let id = self
            .app_id
            .get_or_try_init(|| self.api.lookup_app(&self.config.app_name))
            .await?;
        Ok(id.as_str())
    }

    async fn boot(&self, image_id: &str) -> Result<String, SandboxError> {
        let app_id = self.app().await?;
        self.api
            .create_sandbox(app_id, image_id, &self.envs, &self.config.encrypted_ports)
            .await
    }

    /// Run a synthesized file operation, failing on non-zero exit.
    async fn shell_op(&self, script: String, what: &str) -> Result<String, SandboxError> {
        let result = self.run_command(&script, &RunCommandOptions::default()).await?;
        shell::expect_success(result, what)
    }
}

#[async_trait]
impl Sandbox for ModalSandbox {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn init(
        &mut self,
        id: Option<&str>,
        options: &CreateSandboxOptions,
    ) -> Result<(), SandboxError> {
        self.state.ensure_disconnected()?;
        self.envs = options.envs.clone();
        let sandbox_id = match id {
            Some(image_id) => {
                let sandbox_id = self.boot(image_id).await?;
                tracing::info!(provider = PROVIDER, sandbox_id = %sandbox_id, image_id, "sandbox booted from image");
                sandbox_id
            }
            None => {
                let template = options.template.as_deref().unwrap_or(DEFAULT_IMAGE);
                let source = image_source(template, &self.config)?;
                let app_id = self.app().await?;
                let image_id = self.api.resolve_image(app_id, &source).await?;
                let sandbox_id = self.boot(&image_id).await?;
                tracing::info!(provider = PROVIDER, sandbox_id = %sandbox_id, template, "sandbox created");
                sandbox_id
            }
        };
        self.state = Lifecycle::Connected(sandbox_id);
        Ok(())
    }

    fn id(&self) -> Result<String, SandboxError> {
        match &self.state {
            Lifecycle::Suspended(image_id) => Ok(image_id.clone()),
            Lifecycle::Connected(_) => Err(SandboxError::InvalidState(
                "modal sandboxes expose an id only after suspend",
            )),
            Lifecycle::Disconnected => Err(SandboxError::NotConnected),
        }
    }

    async fn suspend(&mut self) -> Result<(), SandboxError> {
        let sandbox_id = self.state.ready_to_suspend()?.clone();
        let image_id = self.api.snapshot_filesystem(&sandbox_id).await?;
        // The image is the way back; hold it even if terminate fails.
        self.state = Lifecycle::Suspended(image_id.clone());
        match self.api.terminate(&sandbox_id).await {
            Ok(()) => tracing::info!(
                provider = PROVIDER, sandbox_id = %sandbox_id, image_id = %image_id,
                "sandbox snapshotted and terminated"
            ),
            Err(e) => tracing::warn!(
                provider = PROVIDER, sandbox_id = %sandbox_id, image_id = %image_id, error = %e,
                "sandbox snapshotted but not terminated; it runs until it expires"
            ),
        }
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), SandboxError> {
        let image_id = self.state.suspended()?.clone();
        let sandbox_id = self.boot(&image_id).await?;
        tracing::info!(provider = PROVIDER, sandbox_id = %sandbox_id, image_id = %image_id, "sandbox restored from snapshot");
        self.state = Lifecycle::Connected(sandbox_id);
        Ok(())
    }

    async fn destroy(&mut self) -> Result<(), SandboxError> {
        if let Lifecycle::Connected(sandbox_id) = &self.state {
            self.api.terminate(sandbox_id).await?;
            tracing::info!(provider = PROVIDER, sandbox_id = %sandbox_id, "sandbox terminated");
        }
        self.state.take();
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        options: &RunCommandOptions,
    ) -> Result<CommandResult, SandboxError> {
        let id = self.state.connected()?;
        let argv = [
            "sh".to_string(),
            "-c".to_string(),
            shell::script_for(command, options),
        ];
        let out = with_deadline(options.timeout, self.api.exec(id, &argv, options.timeout)).await?;
        if options.background {
            let pid = types::parse_pid(&out.stdout)?;
            return Ok(CommandResult::Background { pid });
        }
        Ok(out.into())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.api.read_file(self.state.connected()?, path).await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.api
            .write_file(self.state.connected()?, path, content)
            .await
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let listing = self.shell_op(shell::list_dir(path), "ls").await?;
        Ok(shell::parse_listing(&listing))
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        self.shell_op(shell::move_path(from, to), "mv").await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        self.shell_op(shell::remove_path(path), "rm").await?;
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> Result<(), SandboxError> {
        self.shell_op(shell::make_dir(path), "mkdir").await?;
        Ok(())
    }

    async fn get_preview_url(&self, port: u16) -> Result<String, SandboxError> {
        let id = self.state.connected()?;
        if !self.config.encrypted_ports.contains(&port) {
            return Err(SandboxError::Config(format!(
                "port {port} is not tunnelled; add it to MODAL_ENCRYPTED_PORTS"
            )));
        }
        self.api
            .tunnels(id)
            .await?
            .remove(&port)
            .ok_or_else(|| SandboxError::NotFound(format!("no tunnel for port {port}")))
    }

    async fn create_terminal(
        &self,
        _on_output: OutputHandler,
    ) -> Result<Box<dyn Terminal>, SandboxError> {
        self.state.connected()?;
        Err(SandboxError::Unsupported(
            "modal does not provide interactive terminals",
        ))
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ModalEnv;
    use crate::providers::ExecOutput;
    use crate::testing::{Capabilities, FakeCloud, run_contract_suite};

    #[async_trait]
    impl ModalApi for FakeCloud {
        async fn lookup_app(&self, name: &str) -> Result<String, SandboxError> {
            self.record(format!("app {name}"));
            Ok("ap-1".into())
        }

        async fn resolve_image(&self, _app_id: &str, source: &ImageSource) -> Result<String, SandboxError> {
            self.record(format!("image {}", source.tag()));
            Ok(format!("im-{}", source.tag()))
        }

        async fn create_sandbox(
            &self,
            _app_id: &str,
            image_id: &str,
            envs: &BTreeMap<String, String>,
            _encrypted_ports: &[u16],
        ) -> Result<String, SandboxError> {
            if image_id.starts_with("im-") {
                Ok(self.provision(envs))
            } else {
                // Snapshots keep files only; env comes from this call.
                let id = self.restore(image_id)?;
                self.with_machine(&id, |m| {
                    m.replace_env(envs);
                    Ok(())
                })?;
                Ok(id)
            }
        }

        async fn exec(
            &self,
            sandbox_id: &str,
            argv: &[String],
            _timeout: Option<Duration>,
        ) -> Result<ExecOutput, SandboxError> {
            let [sh, flag, script] = argv else {
                return Err(SandboxError::Exec(format!("unexpected argv {argv:?}")));
            };
            assert_eq!((sh.as_str(), flag.as_str()), ("sh", "-c"));
            self.exec(sandbox_id, script, None).await
        }

        async fn snapshot_filesystem(&self, sandbox_id: &str) -> Result<String, SandboxError> {
            self.snapshot(sandbox_id)
        }

        async fn terminate(&self, sandbox_id: &str) -> Result<(), SandboxError> {
            self.remove(sandbox_id)
        }

        async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError> {
            self.with_machine(sandbox_id, |m| m.read(path))
        }

        async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<(), SandboxError> {
            self.with_machine(sandbox_id, |m| m.write(path, content))
        }

        async fn tunnels(&self, sandbox_id: &str) -> Result<BTreeMap<u16, String>, SandboxError> {
            self.require(sandbox_id)?;
            Ok(BTreeMap::from([(
                3000,
                format!("https://{sandbox_id}-3000.modal.test"),
            )]))
        }
    }

    fn config(env: ModalEnv<'_>) -> ModalConfig {
        ModalConfig::from_raw_values(ModalEnv {
            token_id: Some("ak-test"),
            token_secret: Some("as-test"),
            ..env
        })
        .unwrap()
    }

    fn sandbox(cloud: &FakeCloud) -> Box<dyn Sandbox> {
        let config = config(ModalEnv {
            encrypted_ports: Some("3000"),
            ..Default::default()
        });
        Box::new(ModalSandbox::with_api(Arc::new(cloud.clone()), config))
    }

    #[tokio::test]
    async fn satisfies_sandbox_contract() {
        let cloud = FakeCloud::new();
        run_contract_suite(
            || sandbox(&cloud),
            Capabilities {
                suspend: true,
                terminal: false,
                delete_directory: true,
                id_while_connected: false,
                missing_id_fails: true,
            },
        )
        .await;
    }

    #[tokio::test]
    async fn default_template_is_python_slim() {
        let cloud = FakeCloud::new();
        let mut sbx = sandbox(&cloud);
        sbx.init(None, &Default::default()).await.unwrap();
        let calls = cloud.calls();
        assert!(calls.contains(&"app sandboxjs-modal".to_string()));
        assert!(calls.contains(&"image python:3.13-slim".to_string()));
    }

    #[tokio::test]
    async fn suspend_snapshots_then_resume_discards_snapshot_id() {
        let cloud = FakeCloud::new();
        let mut sbx = sandbox(&cloud);
        sbx.init(None, &Default::default()).await.unwrap();
        assert!(matches!(sbx.id(), Err(SandboxError::InvalidState(_))));

        sbx.suspend().await.unwrap();
        let image_id = sbx.id().unwrap();
        assert!(image_id.starts_with("snap-"));
        assert!(cloud.ids().is_empty(), "suspend terminates the sandbox");

        sbx.resume().await.unwrap();
        assert!(sbx.id().is_err());
        assert_eq!(cloud.ids().len(), 1);
    }

    #[tokio::test]
    async fn create_time_env_survives_resume() {
        let cloud = FakeCloud::new();
        let mut sbx = sandbox(&cloud);
        let opts = CreateSandboxOptions::default().with_env("NODE_ENV", "testing");
        sbx.init(None, &opts).await.unwrap();
        assert_eq!(sbx.run("echo $NODE_ENV").await.unwrap().output(), Some("testing\n"));

        sbx.suspend().await.unwrap();
        sbx.resume().await.unwrap();
        assert_eq!(sbx.run("echo $NODE_ENV").await.unwrap().output(), Some("testing\n"));
    }

    #[tokio::test]
    async fn failed_terminate_still_holds_the_image() {
        let cloud = FakeCloud::new();
        let mut sbx = sandbox(&cloud);
        sbx.init(None, &Default::default()).await.unwrap();
        sbx.write_file("state.txt", "kept").await.unwrap();

        cloud.fail_next("remove");
        sbx.suspend().await.unwrap();
        let image_id = sbx.id().unwrap();
        assert!(image_id.starts_with("snap-"));
        assert_eq!(cloud.ids().len(), 1, "the old sandbox is still running");
        assert!(matches!(sbx.suspend().await, Err(SandboxError::InvalidState(_))));
        assert_eq!(cloud.snapshot_count(), 1);

        sbx.resume().await.unwrap();
        assert_eq!(sbx.read_file("state.txt").await.unwrap(), "kept");
    }

    #[tokio::test]
    async fn preview_url_requires_encrypted_port() {
        let cloud = FakeCloud::new();
        let mut sbx = sandbox(&cloud);
        sbx.init(None, &Default::default()).await.unwrap();
        let url = sbx.get_preview_url(3000).await.unwrap();
        assert!(url.ends_with("-3000.modal.test"), "{url}");
        let err = sbx.get_preview_url(8080).await.unwrap_err();
        assert!(err.is_config_error(), "{err:?}");
    }

    #[tokio::test]
    async fn destroy_while_suspended_keeps_nothing_alive() {
        let cloud = FakeCloud::new();
        let mut sbx = sandbox(&cloud);
        sbx.init(None, &Default::default()).await.unwrap();
        sbx.suspend().await.unwrap();
        sbx.destroy().await.unwrap();
        assert!(matches!(sbx.id(), Err(SandboxError::NotConnected)));
        assert!(cloud.ids().is_empty());
    }

    #[test]
    fn template_prefixes_pick_registry() {
        let cfg = config(ModalEnv {
            aws_secret_name: Some("aws-creds"),
            docker_secret_name: Some("hub-creds"),
            ..Default::default()
        });
        assert_eq!(
            image_source("aws/123.dkr.ecr.us-east-1.amazonaws.com/app:1", &cfg).unwrap(),
            ImageSource::AwsEcr {
                tag: "123.dkr.ecr.us-east-1.amazonaws.com/app:1".into(),
                secret: "aws-creds".into(),
            }
        );
        assert_eq!(
            image_source("docker/node:22", &cfg).unwrap(),
            ImageSource::Registry {
                tag: "node:22".into(),
                secret: Some("hub-creds".into()),
            }
        );
        assert_eq!(
            image_source("node:22", &cfg).unwrap(),
            image_source("docker/node:22", &cfg).unwrap()
        );
    }

    #[test]
    fn cloud_registries_need_their_secret() {
        let cfg = config(ModalEnv::default());
        let err = image_source("gcp/us-docker.pkg.dev/p/r/app", &cfg).unwrap_err();
        assert!(matches!(err, SandboxError::Config(msg) if msg.contains("MODAL_GCP_SECRET_NAME")));
        assert!(image_source("aws/app", &cfg).unwrap_err().is_config_error());
        assert_eq!(
            image_source("python:3.13-slim", &cfg).unwrap(),
            ImageSource::Registry {
                tag: "python:3.13-slim".into(),
                secret: None,
            }
        );
    }
}
