//! Fan-out of one request into concurrent generation tasks.
//!
//! Every task resolves its own configuration, writes a busy [`Output`] into the
//! session before any work starts, and ends with exactly one terminal patch.
//! Failures are caught at the task boundary and recorded on that task's output.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{
    ConfigSource, DispatchContext, ModeRegistry, ModelCatalog, ResolveConfig, ResolvedConfig,
};
use crate::error::Result;
use crate::gateway::ModelGateway;
use crate::refinement::RefinementLoop;
use crate::session::{Output, OutputPatch, Round, SessionHandle, Variant};
use crate::settings::StudioSettings;

/// One configuration a request should run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub config_id: String,
    pub variant: Option<Variant>,
}

impl TargetConfig {
    pub fn new(config_id: impl Into<String>) -> Self {
        Self {
            config_id: config_id.into(),
            variant: None,
        }
    }

    pub fn variant(config_id: impl Into<String>, variant: Variant) -> Self {
        Self {
            config_id: config_id.into(),
            variant: Some(variant),
        }
    }
}

/// A user submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub prompt: String,
    /// Data URI of a reference image.
    pub prompt_image: Option<String>,
    pub target_configs: Vec<TargetConfig>,
    pub batch_size: usize,
}

impl Request {
    pub fn new(prompt: impl Into<String>, config_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            prompt_image: None,
            target_configs: vec![TargetConfig::new(config_id)],
            batch_size: 1,
        }
    }

    /// Build the request the sidebar describes: the selected mode, plus the A/B
    /// profile as variant B when A/B testing is on.
    pub fn from_settings(
        prompt: impl Into<String>,
        prompt_image: Option<String>,
        settings: &StudioSettings,
    ) -> Self {
        let target_configs = match (&settings.ab_test_profile_id, settings.is_ab_test_mode) {
            (Some(profile_id), true) => vec![
                TargetConfig::variant(settings.output_mode.clone(), Variant::A),
                TargetConfig::variant(profile_id.clone(), Variant::B),
            ],
            _ => vec![TargetConfig::new(settings.output_mode.clone())],
        };
        Self {
            prompt: prompt.into(),
            prompt_image,
            target_configs,
            batch_size: settings.batch_size,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_image(mut self, data_uri: impl Into<String>) -> Self {
        self.prompt_image = Some(data_uri.into());
        self
    }

    pub fn is_ab_test(&self) -> bool {
        self.target_configs.iter().any(|t| t.variant.is_some())
    }
}

/// A unit of concurrent work. Never changed after dispatch.
#[derive(Debug, Clone)]
pub struct GenerationTask {
    pub task_id: String,
    pub round_id: String,
    pub variant: Option<Variant>,
    pub config: ResolvedConfig,
    pub prompt: String,
    pub prompt_image: Option<String>,
    /// Route through the refinement loop instead of a single call.
    pub refine: bool,
}

struct TaskResult {
    output_data: String,
    critique_notes: Option<String>,
    grounding_metadata: Option<serde_json::Value>,
    is_function_call: bool,
}

/// The dispatched round and its running tasks.
pub struct RoundHandle {
    pub round_id: String,
    pub output_ids: Vec<String>,
    handles: Vec<JoinHandle<()>>,
}

impl RoundHandle {
    /// Wait until every task has made its terminal write.
    pub async fn wait(self) {
        for result in futures::future::join_all(self.handles).await {
            if let Err(err) = result {
                error!(round_id = %self.round_id, "Generation task aborted: {}", err);
            }
        }
    }
}

/// Builds tasks from requests and runs them against the gateway.
#[derive(Clone)]
pub struct Orchestrator {
    gateway: Arc<ModelGateway>,
    refinement: Arc<RefinementLoop>,
    store: SessionHandle,
    modes: Arc<ModeRegistry>,
    models: Arc<ModelCatalog>,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<ModelGateway>,
        refinement: Arc<RefinementLoop>,
        store: SessionHandle,
        modes: Arc<ModeRegistry>,
        models: Arc<ModelCatalog>,
    ) -> Self {
        Self {
            gateway,
            refinement,
            store,
            modes,
            models,
        }
    }

    pub fn store(&self) -> &SessionHandle {
        &self.store
    }

    pub fn modes(&self) -> &ModeRegistry {
        &self.modes
    }

    pub fn models(&self) -> &ModelCatalog {
        &self.models
    }

    pub fn gateway(&self) -> &Arc<ModelGateway> {
        &self.gateway
    }

    pub fn refinement(&self) -> &RefinementLoop {
        &self.refinement
    }

    /// Resolve every `(variant, batch index)` pair into a task.
    ///
    /// Targets whose configuration fails to resolve are logged and skipped. A
    /// batch size of zero plans nothing.
    pub fn plan(
        &self,
        request: &Request,
        round_id: &str,
        ctx: &DispatchContext,
    ) -> Vec<GenerationTask> {
        let mut tasks = Vec::new();

        for target in &request.target_configs {
            let config = match self.resolve(&target.config_id, ctx) {
                Ok(config) => config,
                Err(err) => {
                    warn!(
                        config_id = %target.config_id,
                        variant = ?target.variant,
                        "Skipping configuration: {}",
                        err
                    );
                    continue;
                }
            };

            let refine =
                ctx.settings.use_supercharge && config.is_correctable() && config.renderable;
            for _ in 0..request.batch_size {
                tasks.push(GenerationTask {
                    task_id: uuid::Uuid::new_v4().to_string(),
                    round_id: round_id.to_string(),
                    variant: target.variant,
                    config: config.clone(),
                    prompt: request.prompt.clone(),
                    prompt_image: request.prompt_image.clone(),
                    refine,
                });
            }
        }
        tasks
    }

    /// Look a mode or profile up by id and resolve it against `ctx`.
    pub fn resolve(&self, config_id: &str, ctx: &DispatchContext) -> Result<ResolvedConfig> {
        ConfigSource::lookup(config_id, &self.modes, &ctx.profiles)?
            .resolve_config(ctx, &self.models)
    }

    /// Insert the round with all outputs busy, then start one task per output.
    ///
    /// The round is inserted even when nothing resolved, in which case it has no
    /// outputs. Fails only when the session store is gone.
    #[instrument(
        skip_all,
        fields(targets = request.target_configs.len(), batch = request.batch_size)
    )]
    pub fn dispatch(&self, request: Request, ctx: &DispatchContext) -> Result<RoundHandle> {
        let mut round = Round::new(request.prompt.clone(), Vec::new());
        round.prompt_image = request.prompt_image.clone();
        round.is_ab_test = request.is_ab_test();

        let tasks = self.plan(&request, &round.id, ctx);
        if tasks.is_empty() {
            warn!(round_id = %round.id, "No generation tasks for this request");
        }

        round.outputs = tasks
            .iter()
            .map(|task| {
                let mut output = Output::pending(
                    task.config.config_id.clone(),
                    task.variant,
                    task.config.model_key.clone(),
                )
                .with_mode(task.config.name.clone(), task.config.icon.clone());
                output.id = task.task_id.clone();
                output
            })
            .collect();

        let round_id = round.id.clone();
        let output_ids: Vec<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
        self.store.insert_round(round)?;
        info!(round_id = %round_id, tasks = tasks.len(), "Dispatched round");

        let handles = tasks
            .into_iter()
            .map(|task| tokio::spawn(self.clone().run_task(task)))
            .collect();

        Ok(RoundHandle {
            round_id,
            output_ids,
            handles,
        })
    }

    #[instrument(
        skip_all,
        fields(output_id = %task.task_id, config_id = %task.config.config_id, refine = task.refine)
    )]
    async fn run_task(self, task: GenerationTask) {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.execute(&task)).catch_unwind().await;
        let total_time = started.elapsed().as_millis() as i64;

        let patch = match outcome {
            Ok(Ok(result)) => {
                debug!(total_time, "Generation finished");
                OutputPatch::success(result.output_data, total_time)
                    .with_critique(result.critique_notes)
                    .with_grounding(result.grounding_metadata)
                    .with_function_call(result.is_function_call)
            }
            Ok(Err(err)) => {
                error!(total_time, "Generation failed: {}", err);
                OutputPatch::failure(err.to_string(), total_time)
            }
            Err(_) => {
                error!(total_time, "Generation task panicked");
                OutputPatch::failure("generation task panicked", total_time)
            }
        };

        if self.store.patch_output(&task.round_id, &task.task_id, patch).is_err() {
            warn!("Session store closed before the result could be recorded");
        }
    }

    async fn execute(&self, task: &GenerationTask) -> Result<TaskResult> {
        if task.refine {
            self.refine(task).await
        } else {
            self.generate_direct(task).await
        }
    }

    async fn generate_direct(&self, task: &GenerationTask) -> Result<TaskResult> {
        let config = &task.config;
        let request = config.model_request(&task.prompt, task.prompt_image.clone());
        let response = self.gateway.generate(&request).await?;
        let (output_data, is_function_call) = match &response.function_call {
            Some(call) => (
                serde_json::to_string_pretty(&json!({ "functionCall": call }))?,
                true,
            ),
            None => (config.finish_output(&response.text), false),
        };

        Ok(TaskResult {
            output_data,
            critique_notes: None,
            grounding_metadata: response.grounding_metadata,
            is_function_call,
        })
    }

    async fn refine(&self, task: &GenerationTask) -> Result<TaskResult> {
        let job = task.config.refinement_job(&task.prompt);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = self.store.clone();
        let (round_id, output_id) = (task.round_id.clone(), task.task_id.clone());
        let forwarder = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if store
                    .patch_output(&round_id, &output_id, OutputPatch::from(update))
                    .is_err()
                {
                    break;
                }
            }
        });

        let outcome = self.refinement.run(&job, Some(&tx)).await;
        drop(tx);
        // Progress must land before the terminal write.
        let _ = forwarder.await;
        let outcome = outcome?;

        Ok(TaskResult {
            output_data: outcome.artifact,
            critique_notes: Some(outcome.critique_log),
            grounding_metadata: None,
            is_function_call: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_from_settings_adds_variant_b() {
        let mut settings = StudioSettings::default();
        settings.is_ab_test_mode = true;
        settings.ab_test_profile_id = Some("p1".into());
        settings.batch_size = 2;

        let request = Request::from_settings("hello", None, &settings);
        assert!(request.is_ab_test());
        assert_eq!(
            request.target_configs,
            vec![
                TargetConfig::variant("html", Variant::A),
                TargetConfig::variant("p1", Variant::B)
            ]
        );
        assert_eq!(request.batch_size, 2);
    }

    #[test]
    fn ab_mode_without_profile_is_single_target() {
        let mut settings = StudioSettings::default();
        settings.is_ab_test_mode = true;
        let request = Request::from_settings("hello", None, &settings);
        assert!(!request.is_ab_test());
        assert_eq!(request.target_configs.len(), 1);
    }
}
