//! Isolated, time-bounded execution of candidate artifacts.
//!
//! Each run gets a fresh working directory and child process. The artifact is
//! injected into a [`Scaffold`] whose instrumented console hook prints one JSON
//! message per event on stdout:
//!
//! ```text
//! {"source":"renderer-console","run":"<run id>","level":"error","message":"..."}
//! ```
//!
//! Messages are accepted only when `run` matches the correlation id generated for
//! that invocation. The run ends at the first of stdout closing or the timeout,
//! after which the child is killed and the directory removed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::error::{Result, StudioError};

/// `source` value emitted by the console hook.
pub const RENDERER_CONSOLE: &str = "renderer-console";

/// Environment variable carrying the run's correlation id into the child.
pub const RUN_ID_ENV: &str = "STUDIO_RUN_ID";

const NODE_SCAFFOLD: &str = r#"const __runId = "{{run_id}}";
const __format = (value) => {
  if (value instanceof Error) return value.stack || value.message;
  if (typeof value === 'string') return value;
  try { return JSON.stringify(value); } catch (_) { return String(value); }
};
const __emit = (level, args) => {
  const message = args.map(__format).join(' ');
  process.stdout.write(JSON.stringify({ source: 'renderer-console', run: __runId, level, message }) + '\n');
};
for (const level of ['log', 'warn', 'error']) {
  console[level] = (...args) => __emit(level, args);
}
process.on('uncaughtException', (e) => __emit('error', [e]));
process.on('unhandledRejection', (e) => __emit('error', [e]));
try {
  new Function({{artifact_json}})();
} catch (e) {
  __emit('error', [e]);
}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
}

/// One event reported by the console hook inside the child.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleMessage {
    pub source: String,
    pub level: ConsoleLevel,
    pub message: String,
    #[serde(default)]
    pub run: Option<String>,
}

/// What the harness needs to know about the artifact's configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionTarget {
    pub config_id: String,
    /// Key into the [`ScaffoldRegistry`]; `None` means the kind has no execution scaffold.
    pub scaffold: Option<String>,
    pub renderable: bool,
    pub image_output: bool,
}

impl ExecutionTarget {
    /// Whether the harness will try to execute this target at all.
    pub fn is_executable(&self) -> bool {
        self.renderable && !self.image_output && self.scaffold.is_some()
    }
}

/// A program plus a source template that wraps the artifact.
///
/// Templates support `{{artifact}}` (raw), `{{artifact_json}}` (as a JSON string
/// literal) and `{{run_id}}`. Arguments may reference the written file as `{file}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Scaffold {
    pub program: String,
    pub args: Vec<String>,
    pub file_name: String,
    pub template: String,
}

impl Scaffold {
    /// Node.js scaffold that evaluates the artifact as a function body.
    pub fn node() -> Self {
        Self {
            program: "node".to_string(),
            args: vec!["{file}".to_string()],
            file_name: "scaffold.js".to_string(),
            template: NODE_SCAFFOLD.to_string(),
        }
    }

    /// Render the template in a single pass so injected text is never re-expanded.
    pub fn render(&self, artifact: &str, run_id: &str) -> String {
        let artifact_json =
            serde_json::to_string(artifact).unwrap_or_else(|_| "\"\"".to_string());
        let mut out = String::with_capacity(self.template.len() + artifact.len());
        let mut rest = self.template.as_str();

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };
            match &after[..end] {
                "artifact" => out.push_str(artifact),
                "artifact_json" => out.push_str(&artifact_json),
                "run_id" => out.push_str(run_id),
                other => {
                    out.push_str("{{");
                    out.push_str(other);
                    out.push_str("}}");
                }
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }

    fn command_args(&self, file: &Path) -> Vec<String> {
        let file = file.to_string_lossy();
        self.args.iter().map(|a| a.replace("{file}", &file)).collect()
    }
}

/// Scaffolds keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ScaffoldRegistry {
    scaffolds: HashMap<String, Scaffold>,
}

impl ScaffoldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in Node.js scaffold under `javascript`.
    pub fn with_defaults() -> Self {
        Self::new().register("javascript", Scaffold::node())
    }

    pub fn register(mut self, key: impl Into<String>, scaffold: Scaffold) -> Self {
        self.scaffolds.insert(key.into(), scaffold);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Scaffold> {
        self.scaffolds.get(key)
    }
}

/// Anything that can run an artifact and report its runtime errors.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Returns error messages observed during the run. Never fails; setup problems
    /// come back as a single synthetic message.
    async fn run(&self, artifact: &str, target: &ExecutionTarget) -> Vec<String>;
}

/// Harness settings.
#[derive(Clone, Debug)]
pub struct SandboxConfig {
    /// Hard bound on a single run (default: 3s)
    pub timeout: Duration,
    /// Parent directory for per-run working directories.
    pub work_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            work_dir: std::env::temp_dir().join("gemini-studio-sandbox"),
        }
    }
}

/// Runs artifacts in throwaway child processes.
#[derive(Clone, Debug, Default)]
pub struct SandboxHarness {
    scaffolds: ScaffoldRegistry,
    config: SandboxConfig,
}

impl SandboxHarness {
    pub fn new(scaffolds: ScaffoldRegistry) -> Self {
        Self {
            scaffolds,
            config: SandboxConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    #[instrument(skip_all, fields(config_id = %target.config_id))]
    pub async fn execute(&self, artifact: &str, target: &ExecutionTarget) -> Vec<String> {
        if !target.is_executable() {
            trace!("Target is not executable, skipping run");
            return Vec::new();
        }
        let key = target.scaffold.as_deref().unwrap_or_default();
        let Some(scaffold) = self.scaffolds.get(key) else {
            warn!(scaffold = key, "No scaffold registered");
            return vec![format!("No scaffold available for mode {}", target.config_id)];
        };

        let run_id = Uuid::new_v4().to_string();
        match self.run_scaffold(scaffold, artifact, &run_id).await {
            Ok(errors) => {
                debug!(run_id = %run_id, errors = errors.len(), "Sandbox run finished");
                errors
            }
            Err(err) => {
                warn!(run_id = %run_id, "Sandbox setup failed: {}", err);
                vec![format!("Failed to create execution environment: {err}")]
            }
        }
    }

    async fn run_scaffold(
        &self,
        scaffold: &Scaffold,
        artifact: &str,
        run_id: &str,
    ) -> Result<Vec<String>> {
        let dir = self.config.work_dir.join(run_id);
        tokio::fs::create_dir_all(&dir).await?;
        let _cleanup = RunDir(dir.clone());

        let file = dir.join(&scaffold.file_name);
        tokio::fs::write(&file, scaffold.render(artifact, run_id)).await?;

        let mut command = Command::new(&scaffold.program);
        command
            .args(scaffold.command_args(&file))
            .current_dir(&dir)
            .env_clear()
            .env(RUN_ID_ENV, run_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }

        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StudioError::Sandbox("child stdout was not captured".to_string()))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ConsoleMessage>();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(message) = serde_json::from_str::<ConsoleMessage>(&line) else {
                    continue;
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
        });

        let mut errors = Vec::new();
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => {
                        if message.run.as_deref() != Some(run_id) {
                            trace!("Ignoring message from another execution context");
                        } else if message.source == RENDERER_CONSOLE
                            && message.level == ConsoleLevel::Error
                        {
                            errors.push(message.message);
                        }
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    debug!(
                        timeout_ms = self.config.timeout.as_millis() as u64,
                        "Sandbox run hit its time bound"
                    );
                    break;
                }
            }
        }

        reader.abort();
        let _ = child.kill().await;
        Ok(errors)
    }
}

#[async_trait]
impl CodeExecutor for SandboxHarness {
    async fn run(&self, artifact: &str, target: &ExecutionTarget) -> Vec<String> {
        self.execute(artifact, target).await
    }
}

/// Removes a run's working directory when dropped.
struct RunDir(PathBuf);

impl Drop for RunDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}
