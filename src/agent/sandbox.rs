//! Sandbox handles.
//!
//! A sandbox is an isolated container exposing a shell, a filesystem and a
//! published preview port. `SandboxProvider` provisions and re-attaches;
//! `Sandbox` is the handle the tools operate on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::LogOutput,
    errors::Error as BollardError,
    exec::{StartExecOptions, StartExecResults},
    models::{ContainerCreateBody, ExecConfig, HostConfig, PortBinding},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, StartContainerOptions,
    },
};
use futures_util::{StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::SandboxSettings;
use crate::errors::SandboxError;

/// Output streamed from a command. Callers own it so that partial output
/// survives a failed command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Result of a command that exited with status 0.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Run a shell command. Output chunks are appended to `capture` as they
    /// arrive. A non-zero exit is returned as `SandboxError::CommandExit`.
    async fn run_command(
        &self,
        command: &str,
        capture: &mut CapturedOutput,
    ) -> Result<CommandOutput, SandboxError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Externally reachable `host[:port]` for a port inside the sandbox.
    async fn preview_host(&self, port: u16) -> Result<String, SandboxError>;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a sandbox from a template and return its id.
    async fn create(&self, template: &str) -> Result<String, SandboxError>;

    /// Re-attach to an existing sandbox without provisioning.
    async fn resolve(&self, id: &str) -> Result<Arc<dyn Sandbox>, SandboxError>;
}

/// Quote a string for POSIX `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

// ── Docker backend ────────────────────────────────────────────────────

const MANAGED_LABEL: &str = "code-agent.managed";
const TEMPLATE_LABEL: &str = "code-agent.template";

/// Provisions sandboxes as Docker containers through the local daemon.
pub struct DockerProvider {
    docker: Docker,
    settings: SandboxSettings,
    public_host: String,
}

impl DockerProvider {
    pub fn connect(
        settings: SandboxSettings,
        public_host: impl Into<String>,
    ) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            settings,
            public_host: public_host.into(),
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let (from_image, tag) = match image.rsplit_once(':') {
            Some((img, tag)) => (img, tag),
            None => (image, "latest"),
        };
        info!(image, "pulling sandbox image");
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    #[tracing::instrument(level = "info", skip(self))]
    async fn create(&self, template: &str) -> Result<String, SandboxError> {
        let image = self.settings.image_for(template);
        self.ensure_image(&image)
            .await
            .map_err(|e| SandboxError::Provision {
                template: template.to_string(),
                message: e.to_string(),
            })?;

        let name = format!("code-agent-{}", uuid::Uuid::new_v4().simple());
        let port_key = format!("{}/tcp", self.settings.preview_port);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(String::new()),
            }]),
        );

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(TEMPLATE_LABEL.to_string(), template.to_string());

        let env: Vec<String> = self
            .settings
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let body = ContainerCreateBody {
            image: Some(image),
            labels: Some(labels),
            working_dir: Some(self.settings.workdir.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                memory: parse_memory(&self.settings.memory),
                nano_cpus: Some((self.settings.cpus * 1_000_000_000.0) as i64),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let provision = |e: BollardError| SandboxError::Provision {
            template: template.to_string(),
            message: e.to_string(),
        };
        self.docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                body,
            )
            .await
            .map_err(provision)?;
        self.docker
            .start_container(&name, None::<StartContainerOptions>)
            .await
            .map_err(provision)?;

        info!(sandbox_id = %name, "sandbox started");
        Ok(name)
    }

    async fn resolve(&self, id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        match self
            .docker
            .inspect_container(id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(Arc::new(DockerSandbox {
                docker: self.docker.clone(),
                id: id.to_string(),
                workdir: self.settings.workdir.clone(),
                public_host: self.public_host.clone(),
            })),
            Err(e) if is_not_found(&e) => Err(SandboxError::NotFound { id: id.to_string() }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Handle to one running sandbox container.
pub struct DockerSandbox {
    docker: Docker,
    id: String,
    workdir: String,
    public_host: String,
}

impl DockerSandbox {
    /// Run `cmd` via `docker exec`, optionally feeding `stdin`. Returns the
    /// exit code; output goes into `capture`.
    async fn exec(
        &self,
        cmd: Vec<String>,
        stdin: Option<&str>,
        capture: &mut CapturedOutput,
    ) -> Result<i64, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                &self.id,
                ExecConfig {
                    cmd: Some(cmd),
                    attach_stdin: Some(stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(self.workdir.clone()),
                    ..ExecConfig::default()
                },
            )
            .await
            .map_err(|e| self.map_missing(e))?;

        match self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await?
        {
            StartExecResults::Attached { mut output, mut input } => {
                if let Some(data) = stdin {
                    input.write_all(data.as_bytes()).await?;
                    input.shutdown().await?;
                }
                let mut stdout = Utf8Decoder::default();
                let mut stderr = Utf8Decoder::default();
                let streamed = async {
                    while let Some(chunk) = output.next().await {
                        match chunk? {
                            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                                stdout.push(&message, &mut capture.stdout);
                            }
                            LogOutput::StdErr { message } => {
                                stderr.push(&message, &mut capture.stderr);
                            }
                            _ => {}
                        }
                    }
                    Ok::<_, SandboxError>(())
                }
                .await;
                stdout.finish(&mut capture.stdout);
                stderr.finish(&mut capture.stderr);
                streamed?;
            }
            StartExecResults::Detached => {
                return Err(SandboxError::Io(std::io::Error::other(
                    "exec detached unexpectedly",
                )));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(inspect.exit_code.unwrap_or(0))
    }

    fn map_missing(&self, e: BollardError) -> SandboxError {
        if is_not_found(&e) {
            SandboxError::NotFound { id: self.id.clone() }
        } else {
            e.into()
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    #[tracing::instrument(level = "debug", skip(self, capture), fields(sandbox_id = %self.id))]
    async fn run_command(
        &self,
        command: &str,
        capture: &mut CapturedOutput,
    ) -> Result<CommandOutput, SandboxError> {
        let cmd = vec!["sh".to_string(), "-lc".to_string(), command.to_string()];
        let exit_code = self.exec(cmd, None, capture).await?;
        debug!(exit_code, "command finished");
        if exit_code != 0 {
            return Err(SandboxError::CommandExit {
                exit_code,
                stdout: capture.stdout.clone(),
                stderr: capture.stderr.clone(),
            });
        }
        Ok(CommandOutput {
            exit_code,
            stdout: capture.stdout.clone(),
            stderr: capture.stderr.clone(),
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let script = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
            path.to_string(),
        ];
        let mut capture = CapturedOutput::default();
        let exit_code = self.exec(cmd, Some(content), &mut capture).await?;
        if exit_code != 0 {
            return Err(SandboxError::CommandExit {
                exit_code,
                stdout: capture.stdout,
                stderr: capture.stderr,
            });
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let cmd = vec!["cat".to_string(), "--".to_string(), path.to_string()];
        let mut capture = CapturedOutput::default();
        let exit_code = self.exec(cmd, None, &mut capture).await?;
        if exit_code != 0 {
            if capture.stderr.contains("No such file") {
                return Err(SandboxError::FileNotFound {
                    path: path.to_string(),
                });
            }
            return Err(SandboxError::CommandExit {
                exit_code,
                stdout: capture.stdout,
                stderr: capture.stderr,
            });
        }
        Ok(capture.stdout)
    }

    async fn preview_host(&self, port: u16) -> Result<String, SandboxError> {
        let inspect = self
            .docker
            .inspect_container(&self.id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
            .map_err(|e| self.map_missing(e))?;
        let key = format!("{}/tcp", port);
        let host_port = inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SandboxError::PortNotPublished {
                id: self.id.clone(),
                port,
            })?;
        Ok(format!("{}:{}", self.public_host, host_port))
    }
}

/// Decodes a UTF-8 byte stream that arrives in arbitrary frames. A
/// character split across frames is held back until its remaining bytes
/// arrive.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8], out: &mut String) {
        self.pending.extend_from_slice(bytes);
        let mut rest = self.pending.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
    }

    /// Flush an incomplete trailing sequence.
    fn finish(&mut self, out: &mut String) {
        if !self.pending.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

/// Parse a Docker-style memory size ("512m", "4g") into bytes.
pub fn parse_memory(value: &str) -> Option<i64> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        c if c.is_ascii_digit() => (value.as_str(), 1),
        _ => return None,
    };
    digits.parse::<i64>().ok().map(|n| n * multiplier)
}
