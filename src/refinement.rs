//! Bounded generate → execute → critique → decide loop for code artifacts.
//!
//! The loop is an explicit state machine over [`Phase`]. Progress is published as
//! [`ProgressUpdate`] values on an unbounded channel; every field is optional so a
//! consumer can apply them as partial patches without clobbering anything else.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::catalog::strip_code_fences;
use crate::error::Result;
use crate::gateway::{ModelGateway, ModelRequest, Sampling};
use crate::sandbox::{CodeExecutor, ExecutionTarget};

/// Critique token that, together with a clean run, ends the loop.
pub const PERFECT: &str = "perfect";

/// System instruction for the critic call.
pub const CRITIC_SYSTEM_INSTRUCTION: &str = "You are a meticulous code reviewer. Compare the code \
    with the user's original request and with the runtime errors reported for it. Point out bugs, \
    logic errors, unfinished work and style problems as a short bulleted Markdown list. If the \
    code is correct and fully satisfies the request, reply with the single word \"perfect\".";

const ITERATION_DELIMITER: &str = "\n\n---\n\n";

/// Settings for the refinement loop.
#[derive(Clone, Debug)]
pub struct RefinementConfig {
    /// Iteration budget (default: 3)
    pub max_iterations: usize,
    /// Model used for critique (default: gemini-2.5-flash)
    pub critic_model: String,
    /// Critic temperature (default: 0.2)
    pub critic_temperature: f32,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            critic_model: "gemini-2.5-flash".to_string(),
            critic_temperature: 0.2,
        }
    }
}

/// Partial update describing the loop's live state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub status: Option<String>,
    pub critique_notes: Option<String>,
    pub output_data: Option<String>,
    pub is_busy: Option<bool>,
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressUpdate>;

/// Everything the loop needs about one task.
#[derive(Debug, Clone)]
pub struct RefinementJob {
    pub prompt: String,
    pub system_instruction: String,
    pub model: String,
    pub sampling: Sampling,
    pub syntax: String,
    pub target: ExecutionTarget,
    /// Strip markdown fences from generated artifacts before running them.
    pub strip_fences: bool,
}

/// Final artifact and the accumulated critique log.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementOutcome {
    pub artifact: String,
    pub critique_log: String,
    pub iterations: usize,
    /// False when the budget ran out before a clean, "perfect" iteration.
    pub converged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Generating,
    Executing,
    Critiquing,
    Deciding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Done,
    Continue,
    Exhausted,
}

/// Working state of one loop invocation. Dropped when the loop returns.
#[derive(Debug, Clone, Default)]
struct RefinementState {
    iteration: usize,
    current_artifact: String,
    accumulated_critique: String,
    execution_errors: Vec<String>,
}

impl RefinementState {
    fn new() -> Self {
        Self {
            iteration: 1,
            ..Default::default()
        }
    }

    fn decide(&self, critique: &str, max_iterations: usize) -> Decision {
        if is_perfect(critique) && self.execution_errors.is_empty() {
            Decision::Done
        } else if self.iteration >= max_iterations {
            Decision::Exhausted
        } else {
            Decision::Continue
        }
    }

    fn error_summary(&self) -> String {
        if self.execution_errors.is_empty() {
            "The code ran without console errors.".to_string()
        } else {
            format!(
                "The code produced the following console errors:\n- {}",
                self.execution_errors.join("\n- ")
            )
        }
    }

    fn append(&mut self, entry: &str) {
        if self.accumulated_critique.is_empty() {
            self.accumulated_critique = entry.to_string();
        } else {
            self.accumulated_critique.push_str(ITERATION_DELIMITER);
            self.accumulated_critique.push_str(entry);
        }
    }

    fn record_feedback(&mut self, critique: &str) {
        let errors = if self.execution_errors.is_empty() {
            "None".to_string()
        } else {
            self.execution_errors.join(", ")
        };
        let entry = format!(
            "**Iteration {} Feedback:**\n*Critique:* {}\n*Console Errors:* {}",
            self.iteration, critique, errors
        );
        self.append(&entry);
    }
}

/// Case- and whitespace-insensitive check for the "perfect" token.
pub fn is_perfect(critique: &str) -> bool {
    critique.trim().eq_ignore_ascii_case(PERFECT)
}

/// Drives generation, sandboxed execution and critique until the artifact converges.
#[derive(Clone)]
pub struct RefinementLoop {
    gateway: Arc<ModelGateway>,
    executor: Arc<dyn CodeExecutor>,
    config: RefinementConfig,
}

impl RefinementLoop {
    pub fn new(gateway: Arc<ModelGateway>, executor: Arc<dyn CodeExecutor>) -> Self {
        Self {
            gateway,
            executor,
            config: RefinementConfig::default(),
        }
    }

    pub fn with_config(mut self, mut config: RefinementConfig) -> Self {
        config.max_iterations = config.max_iterations.max(1);
        self.config = config;
        self
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    /// Run the loop. Transport failures are returned; exhausting the budget is not an error.
    #[instrument(skip_all, fields(config_id = %job.target.config_id, model = %job.model))]
    pub async fn run(
        &self,
        job: &RefinementJob,
        progress: Option<&ProgressSender>,
    ) -> Result<RefinementOutcome> {
        let max = self.config.max_iterations;
        let mut state = RefinementState::new();
        let mut phase = Phase::Generating;
        let mut critique = String::new();

        loop {
            debug!(iteration = state.iteration, ?phase, "Refinement phase");
            match phase {
                Phase::Generating => {
                    emit(
                        progress,
                        ProgressUpdate {
                            status: Some(format!(
                                "Iteration {}/{}: Generating...",
                                state.iteration, max
                            )),
                            critique_notes: non_empty(&state.accumulated_critique),
                            is_busy: Some(true),
                            ..Default::default()
                        },
                    );
                    let request = self.generation_request(job, &state);
                    let response = self.gateway.generate(&request).await?;
                    state.current_artifact = if job.strip_fences {
                        strip_code_fences(&response.text)
                    } else {
                        response.text
                    };
                    phase = Phase::Executing;
                }
                Phase::Executing => {
                    emit(
                        progress,
                        ProgressUpdate {
                            status: Some(format!("Iteration {}: Executing...", state.iteration)),
                            output_data: Some(state.current_artifact.clone()),
                            ..Default::default()
                        },
                    );
                    state.execution_errors = self
                        .executor
                        .run(&state.current_artifact, &job.target)
                        .await;
                    phase = Phase::Critiquing;
                }
                Phase::Critiquing => {
                    emit(
                        progress,
                        ProgressUpdate {
                            status: Some(format!("Iteration {}: Critiquing...", state.iteration)),
                            ..Default::default()
                        },
                    );
                    let request = self.critique_request(job, &state);
                    let response = self.gateway.generate(&request).await?;
                    critique = response.text.trim().to_string();
                    phase = Phase::Deciding;
                }
                Phase::Deciding => {
                    let decision = state.decide(&critique, max);
                    match decision {
                        Decision::Done => {
                            state.append(&format!(
                                "**Iteration {}**: Passed with no errors or critiques.",
                                state.iteration
                            ));
                            info!(iterations = state.iteration, "Refinement converged");
                        }
                        Decision::Continue => state.record_feedback(&critique),
                        Decision::Exhausted => {
                            state.record_feedback(&critique);
                            state.accumulated_critique.push_str("\n\n**Max iterations reached.**");
                            warn!(iterations = state.iteration, "Refinement budget exhausted");
                        }
                    }
                    emit(
                        progress,
                        ProgressUpdate {
                            critique_notes: Some(state.accumulated_critique.clone()),
                            ..Default::default()
                        },
                    );

                    if decision == Decision::Continue {
                        state.iteration += 1;
                        phase = Phase::Generating;
                        continue;
                    }
                    return Ok(RefinementOutcome {
                        artifact: state.current_artifact,
                        critique_log: state.accumulated_critique,
                        iterations: state.iteration,
                        converged: decision == Decision::Done,
                    });
                }
            }
        }
    }

    fn generation_request(&self, job: &RefinementJob, state: &RefinementState) -> ModelRequest {
        let (system, prompt) = if state.iteration == 1 {
            (job.system_instruction.clone(), job.prompt.clone())
        } else {
            let system = format!(
                "{}\n\nYou are revising an earlier attempt using review feedback and runtime \
                 errors. The user's original prompt was: \"{}\".\n\n\
                 The previous code was:\n```\n{}\n```\n\n\
                 The critique and errors were:\n{}\n\n\
                 Produce the final, corrected and complete code. Respond with the raw code only: \
                 no explanations, no markdown fences, no placeholders. Finish the work.",
                job.system_instruction,
                job.prompt,
                state.current_artifact,
                state.accumulated_critique
            );
            (system, format!("Produce the final code for the prompt: \"{}\"", job.prompt))
        };

        ModelRequest::text(&job.model, prompt)
            .system(system)
            .sampling(job.sampling)
    }

    fn critique_request(&self, job: &RefinementJob, state: &RefinementState) -> ModelRequest {
        let syntax = if job.syntax.is_empty() {
            "code"
        } else {
            job.syntax.as_str()
        };
        let prompt = format!(
            "Original User Prompt: \"{}\"\n\n\
             Code to Review:\n```{}\n{}\n```\n\n\
             Runtime Analysis:\n{}",
            job.prompt,
            syntax,
            state.current_artifact,
            state.error_summary()
        );
        ModelRequest::text(&self.config.critic_model, prompt)
            .system(CRITIC_SYSTEM_INSTRUCTION)
            .sampling(Sampling::temperature(self.config.critic_temperature))
    }
}

fn emit(progress: Option<&ProgressSender>, update: ProgressUpdate) {
    if let Some(tx) = progress {
        let _ = tx.send(update);
    }
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}
