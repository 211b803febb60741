/// Execution Engine - Isolated Execution Environment
///
/// **Core Responsibility:**
/// Run untrusted code under hard limits and report the raw outcome.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (Docker today)
/// - Engine does NOT compare output or assign verdicts
/// - RE and TLE are returned as values; `Err` means the sandbox itself failed
///
/// **Session model:**
/// One session is one disposable container holding one submission. The
/// Verdict Engine compiles once and then runs every test case in the same
/// session; each run gets its own scratch directory under `/sandbox`.
use crate::config::{LanguageConfig, LanguageConfigManager};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use exam_common::types::Language;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Submissions above this size are never sent to Docker
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024;

const SANDBOX_DIR: &str = "/sandbox";
const SANDBOX_TMPFS_OPTIONS: &str = "rw,exec,nosuid,size=64m";
const WRITE_SOURCE_SCRIPT: &str = r#"mkdir -p /sandbox/src && cat > "/sandbox/src/$1""#;
const RUN_SCRIPT: &str = r#"d=$(mktemp -d /sandbox/run.XXXXXX) && cd "$d" && exec "$@""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Ok,
    RuntimeError,
    TimeLimitExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub outcome: RunOutcome,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub execution_time_ms: u64,
}

impl RunOutput {
    pub fn timed_out(execution_time_ms: u64) -> Self {
        Self {
            outcome: RunOutcome::TimeLimitExceeded,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            execution_time_ms,
        }
    }

    pub fn runtime_error(stderr: String) -> Self {
        Self {
            outcome: RunOutcome::RuntimeError,
            stdout: String::new(),
            stderr,
            exit_code: None,
            execution_time_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Compiled,
    Failed { stderr: String },
    TimedOut,
}

#[async_trait]
pub trait ExecutionSession: Send {
    /// No-op for interpreted languages
    async fn compile(&mut self) -> Result<CompileOutcome>;

    async fn run(&mut self, input: &str) -> Result<RunOutput>;

    /// Tear the session down; must be called on every path
    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn open_session(&self, language: Language, source: &str) -> Result<Box<dyn ExecutionSession>>;

    /// One complete compile/run cycle in a fresh session
    async fn execute(&self, language: Language, code: &str, input: &str) -> Result<RunOutput> {
        let mut session = self.open_session(language, code).await?;
        let output = match session.compile().await {
            Ok(CompileOutcome::Compiled) => session.run(input).await,
            Ok(CompileOutcome::Failed { stderr }) => Ok(RunOutput::runtime_error(stderr)),
            Ok(CompileOutcome::TimedOut) => Ok(RunOutput::timed_out(0)),
            Err(e) => Err(e),
        };
        let closed = session.close().await;
        let output = output?;
        closed?;
        Ok(output)
    }
}

/// Removes the container when dropped unless `remove` already ran
struct ContainerGuard {
    docker: Docker,
    container_id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
            armed: true,
        }
    }

    async fn remove(&mut self) -> Result<()> {
        self.armed = false;
        self.docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("Failed to remove container {}", self.container_id))
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %self.container_id, "No runtime to remove container");
            return;
        };
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        handle.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to cleanup container");
            }
        });
    }
}

/// Keeps the first `limit` bytes and silently drops the rest
struct OutputBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

struct ExecCapture {
    stdout: String,
    stderr: String,
    exit_code: i64,
}

/// Docker-based execution engine
///
/// Every session container runs with:
/// - no network (`network_mode: none`)
/// - memory ceiling with swap disabled, so exceeding it kills the process
/// - pid limit, all capabilities dropped, `no-new-privileges`
/// - a tmpfs `/sandbox` that disappears with the container
pub struct DockerEngine {
    docker: Docker,
    languages: LanguageConfigManager,
    timeout: Duration,
    max_output_bytes: usize,
}

impl DockerEngine {
    pub fn new(languages: LanguageConfigManager, timeout: Duration, max_output_bytes: usize) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            languages,
            timeout,
            max_output_bytes,
        })
    }

    /// Every configured template must already exist locally
    pub async fn verify_templates(&self) -> Result<()> {
        let mut missing = Vec::new();
        for config in self.languages.configs() {
            match self.docker.inspect_image(&config.image).await {
                Ok(_) => debug!(language = %config.name, image = %config.image, "Template present"),
                Err(e) => {
                    warn!(language = %config.name, image = %config.image, error = %e, "Template missing");
                    missing.push(config.image.clone());
                }
            }
        }
        if !missing.is_empty() {
            bail!("Execution templates not found: {}", missing.join(", "));
        }
        info!(languages = ?self.languages.list_languages(), "Execution templates verified");
        Ok(())
    }

    fn container_config(&self, config: &LanguageConfig) -> Config<String> {
        let memory = config.memory_limit_bytes();
        Config {
            image: Some(config.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            entrypoint: Some(vec![]),
            working_dir: Some(SANDBOX_DIR.to_string()),
            network_disabled: Some(true),
            labels: Some(HashMap::from([
                ("exam.judge".to_string(), "true".to_string()),
                ("exam.language".to_string(), config.name.to_string()),
            ])),
            host_config: Some(HostConfig {
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some(config.nano_cpus()),
                pids_limit: Some(config.pids_limit),
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                tmpfs: Some(HashMap::from([(
                    SANDBOX_DIR.to_string(),
                    SANDBOX_TMPFS_OPTIONS.to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ExecutionEngine for DockerEngine {
    #[tracing::instrument(skip(self, source), fields(language = %language, source_size = source.len()))]
    async fn open_session(&self, language: Language, source: &str) -> Result<Box<dyn ExecutionSession>> {
        if source.len() > MAX_SOURCE_CODE_BYTES {
            bail!("Source code exceeds maximum size of {} bytes", MAX_SOURCE_CODE_BYTES);
        }
        let config = self.languages.get_config(language)?.clone();
        let container_name = format!("exam-judge-{}", uuid::Uuid::new_v4());

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.as_str(),
                    platform: None,
                }),
                self.container_config(&config),
            )
            .await
            .with_context(|| format!("Failed to create container from {}", config.image))?;

        let mut session = DockerSession {
            docker: self.docker.clone(),
            guard: ContainerGuard::new(self.docker.clone(), container.id.clone()),
            container_id: container.id,
            config,
            timeout: self.timeout,
            max_output_bytes: self.max_output_bytes,
            killed: false,
        };

        self.docker
            .start_container(&session.container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        session.write_source(source).await?;
        debug!(container_id = %session.container_id, "Session ready");
        Ok(Box::new(session))
    }
}

pub struct DockerSession {
    docker: Docker,
    guard: ContainerGuard,
    container_id: String,
    config: LanguageConfig,
    timeout: Duration,
    max_output_bytes: usize,
    /// Set once a timeout forced the container down
    killed: bool,
}

impl DockerSession {
    async fn write_source(&self, source: &str) -> Result<()> {
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            WRITE_SOURCE_SCRIPT.to_string(),
            "sh".to_string(),
            self.config.source_file.clone(),
        ];
        let capture = tokio::time::timeout(self.timeout, self.exec(cmd, Some(source.as_bytes().to_vec())))
            .await
            .map_err(|_| anyhow::anyhow!("Timed out writing source into container"))??;
        if capture.exit_code != 0 {
            bail!(
                "Failed to write source into container (exit {}): {}",
                capture.exit_code,
                capture.stderr
            );
        }
        Ok(())
    }

    /// Run a command to completion, feeding `stdin` and bounding output
    async fn exec(&self, cmd: Vec<String>, stdin: Option<Vec<u8>>) -> Result<ExecCapture> {
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdin: Some(stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .context("Failed to start exec")?;

        let StartExecResults::Attached { mut output, mut input } = started else {
            bail!("Exec did not attach");
        };

        let writer = stdin.map(|data| {
            tokio::spawn(async move {
                input.write_all(&data).await?;
                input.shutdown().await
            })
        });

        let mut stdout = OutputBuffer::new(self.max_output_bytes);
        let mut stderr = OutputBuffer::new(self.max_output_bytes);
        while let Some(msg) = output.next().await {
            match msg.context("Failed to read exec output")? {
                LogOutput::StdOut { message } => stdout.push(&message),
                LogOutput::StdErr { message } => stderr.push(&message),
                _ => {}
            }
        }

        if let Some(writer) = writer {
            // A program may exit without draining stdin
            if let Ok(Err(e)) = writer.await {
                debug!(error = %e, "Stdin closed early");
            }
        }
        if stdout.truncated || stderr.truncated {
            debug!(limit = self.max_output_bytes, "Output truncated");
        }

        let exit_code = self.exit_code(&exec.id).await?;
        Ok(ExecCapture {
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            exit_code,
        })
    }

    /// The output stream ends when the program closes stdout/stderr, which
    /// can be well before it exits; poll until the exec stops running.
    /// Callers bound this with their own timeout.
    async fn exit_code(&self, exec_id: &str) -> Result<i64> {
        let mut delay = Duration::from_millis(5);
        loop {
            let inspect = self
                .docker
                .inspect_exec(exec_id)
                .await
                .context("Failed to inspect exec")?;
            if inspect.running != Some(true) {
                return inspect
                    .exit_code
                    .with_context(|| format!("Exec {} finished without an exit code", exec_id));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(50));
        }
    }

    async fn kill(&mut self) {
        self.killed = true;
        if let Err(e) = self
            .docker
            .kill_container(&self.container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container_id = %self.container_id, error = %e, "Failed to kill timed-out container");
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.killed {
            bail!("Session container {} was killed after a timeout", self.container_id);
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionSession for DockerSession {
    async fn compile(&mut self) -> Result<CompileOutcome> {
        self.ensure_alive()?;
        let Some(cmd) = self.config.compile.clone() else {
            return Ok(CompileOutcome::Compiled);
        };

        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.exec(cmd, None)).await;
        let compilation_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(capture) => {
                let capture = capture?;
                if capture.exit_code == 0 {
                    debug!(language = %self.config.name, compilation_ms, "Compilation succeeded");
                    Ok(CompileOutcome::Compiled)
                } else {
                    debug!(
                        language = %self.config.name,
                        compilation_ms,
                        exit_code = capture.exit_code,
                        "Compilation failed"
                    );
                    let stderr = if capture.stderr.is_empty() { capture.stdout } else { capture.stderr };
                    Ok(CompileOutcome::Failed { stderr })
                }
            }
            Err(_) => {
                warn!(language = %self.config.name, compilation_ms, "Compilation timed out");
                self.kill().await;
                Ok(CompileOutcome::TimedOut)
            }
        }
    }

    async fn run(&mut self, input: &str) -> Result<RunOutput> {
        self.ensure_alive()?;
        let mut cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            RUN_SCRIPT.to_string(),
            "sh".to_string(),
        ];
        cmd.extend(self.config.run.iter().cloned());

        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.exec(cmd, Some(input.as_bytes().to_vec()))).await;
        let execution_time_ms = start.elapsed().as_millis() as u64;

        let capture = match result {
            Ok(capture) => capture?,
            Err(_) => {
                self.kill().await;
                return Ok(RunOutput::timed_out(execution_time_ms));
            }
        };

        let outcome = if capture.exit_code == 0 {
            RunOutcome::Ok
        } else {
            RunOutcome::RuntimeError
        };
        Ok(RunOutput {
            outcome,
            stdout: capture.stdout,
            stderr: capture.stderr,
            exit_code: Some(capture.exit_code),
            execution_time_ms,
        })
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.guard.remove().await
    }
}
