//! Output modes, models, user profiles and per-task configuration resolution.
//!
//! A task's configuration comes from either a built-in [`ModeSpec`] or a
//! [`UserProfile`]. Both implement [`ResolveConfig`], which turns them into a
//! [`ResolvedConfig`] once, when the task is constructed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, StudioError};
use crate::gateway::{ModelRequest, Sampling, ToolBinding};
use crate::refinement::RefinementJob;
use crate::sandbox::ExecutionTarget;
use crate::settings::StudioSettings;

/// Syntax kinds that are never routed through refinement.
const NON_CORRECTABLE_SYNTAX: [&str; 3] = ["text", "markdown", "image"];

/// A built-in output mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub syntax: String,
    #[serde(default)]
    pub is_renderable: bool,
    #[serde(default)]
    pub image_output: bool,
    #[serde(default)]
    pub system_instruction: String,
    /// Model this mode always uses, overriding the sidebar model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_id: Option<String>,
    #[serde(default)]
    pub scaffold: Option<String>,
    /// Strip markdown code fences from responses.
    #[serde(default)]
    pub strip_fences: bool,
}

impl ModeSpec {
    fn code(id: &str, name: &str, icon: &str, syntax: &str, tech: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            icon: icon.to_string(),
            syntax: syntax.to_string(),
            is_renderable: true,
            image_output: false,
            system_instruction: format!(
                "You are a senior engineer writing {tech}. Produce complete, self-contained, \
                 working code for the user's request. Never leave placeholders or unimplemented \
                 functions. Respond with the raw code only, without commentary or markdown fences."
            ),
            model: None,
            api_id: None,
            scaffold: None,
            strip_fences: true,
        }
    }
}

/// Built-in modes keyed by id, in display order.
#[derive(Debug, Clone, Default)]
pub struct ModeRegistry {
    modes: Vec<ModeSpec>,
}

impl ModeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut javascript = ModeSpec::code(
            "javascript",
            "JavaScript",
            "javascript",
            "javascript",
            "plain JavaScript that runs top to bottom",
        );
        javascript.scaffold = Some("javascript".to_string());

        Self::new()
            .register(ModeSpec::code(
                "html",
                "HTML/JS",
                "article",
                "html",
                "a single-file web page in vanilla HTML, CSS and JavaScript",
            ))
            .register(javascript)
            .register(ModeSpec::code(
                "react",
                "React",
                "code",
                "jsx",
                "a React function component named App",
            ))
            .register(ModeSpec::code("svg", "SVG", "shapes", "svg", "standalone SVG markup"))
            .register(ModeSpec {
                id: "markdown".to_string(),
                name: "Markdown".to_string(),
                icon: "notes".to_string(),
                syntax: "markdown".to_string(),
                is_renderable: true,
                image_output: false,
                system_instruction: "Answer in well structured Markdown.".to_string(),
                model: None,
                api_id: None,
                scaffold: None,
                strip_fences: false,
            })
            .register(ModeSpec {
                id: "text".to_string(),
                name: "Text".to_string(),
                icon: "title".to_string(),
                syntax: "text".to_string(),
                is_renderable: false,
                image_output: false,
                system_instruction: "Answer in plain text.".to_string(),
                model: None,
                api_id: None,
                scaffold: None,
                strip_fences: false,
            })
            .register(ModeSpec {
                id: "image".to_string(),
                name: "Image".to_string(),
                icon: "image".to_string(),
                syntax: "image".to_string(),
                is_renderable: true,
                image_output: true,
                system_instruction: "Create a detailed, high quality image.".to_string(),
                model: Some("imagen-3.0-generate-002".to_string()),
                api_id: None,
                scaffold: None,
                strip_fences: false,
            })
    }

    /// Load modes from a JSON array of [`ModeSpec`].
    pub fn from_json(json: &str) -> Result<Self> {
        let modes: Vec<ModeSpec> = serde_json::from_str(json)?;
        Ok(Self { modes })
    }

    /// Add a mode, replacing any existing mode with the same id.
    pub fn register(mut self, mode: ModeSpec) -> Self {
        self.modes.retain(|m| m.id != mode.id);
        self.modes.push(mode);
        self
    }

    pub fn get(&self, id: &str) -> Option<&ModeSpec> {
        self.modes.iter().find(|m| m.id == id)
    }

    pub fn first(&self) -> Option<&ModeSpec> {
        self.modes.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModeSpec> {
        self.modes.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Text,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub key: String,
    pub name: String,
    pub model_string: String,
    #[serde(rename = "type")]
    pub kind: ModelKind,
}

/// Models the studio can talk to, keyed by model key.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<ModelInfo>,
}

impl ModelCatalog {
    pub fn with_defaults() -> Self {
        Self {
            models: vec![
                ModelInfo {
                    key: "gemini-2.5-flash".to_string(),
                    name: "Gemini 2.5 Flash".to_string(),
                    model_string: "gemini-2.5-flash".to_string(),
                    kind: ModelKind::Text,
                },
                ModelInfo {
                    key: "imagen-3.0-generate-002".to_string(),
                    name: "Imagen 3".to_string(),
                    model_string: "imagen-3.0-generate-002".to_string(),
                    kind: ModelKind::Image,
                },
            ],
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self {
            models: serde_json::from_str(json)?,
        })
    }

    pub fn get(&self, key: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.key == key)
    }

    pub fn first_of_kind(&self, kind: ModelKind) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.kind == kind)
    }
}

/// A user-defined profile. Its settings always win over the sidebar defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    pub system_instruction: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default)]
    pub syntax: Option<String>,
    #[serde(default)]
    pub is_renderable: bool,
    #[serde(default)]
    pub image_output: bool,
    #[serde(default)]
    pub api_id: Option<String>,
    #[serde(default)]
    pub code_file_ids: Vec<String>,
    #[serde(default)]
    pub scaffold: Option<String>,
}

fn default_temperature() -> f32 {
    0.4
}

fn default_top_p() -> f32 {
    0.95
}

fn default_top_k() -> i32 {
    64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKind {
    Schema,
    Tools,
}

/// A user-defined response schema or tool declaration set, stored as raw JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ApiKind,
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A source file attached to profiles as extra context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeFile {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub language: String,
    pub content: String,
}

/// Everything resolution reads: sidebar settings plus the user's library.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub settings: StudioSettings,
    pub profiles: Vec<UserProfile>,
    pub apis: Vec<ApiDefinition>,
    pub code_files: Vec<CodeFile>,
}

/// Fully resolved configuration for one generation task.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub config_id: String,
    pub name: String,
    pub icon: String,
    pub model_key: String,
    pub model_string: String,
    pub image_output: bool,
    pub sampling: Sampling,
    pub system_instruction: String,
    pub binding: ToolBinding,
    pub syntax: String,
    pub renderable: bool,
    pub scaffold: Option<String>,
    pub strip_fences: bool,
}

impl ResolvedConfig {
    /// Code kinds whose output can be checked by running it.
    pub fn is_correctable(&self) -> bool {
        !self.image_output
            && !self.syntax.is_empty()
            && !NON_CORRECTABLE_SYNTAX.contains(&self.syntax.as_str())
    }

    pub fn execution_target(&self) -> ExecutionTarget {
        ExecutionTarget {
            config_id: self.config_id.clone(),
            scaffold: self.scaffold.clone(),
            renderable: self.renderable,
            image_output: self.image_output,
        }
    }

    /// Apply the mode's response modifier.
    pub fn finish_output(&self, text: &str) -> String {
        if self.strip_fences {
            strip_code_fences(text)
        } else {
            text.to_string()
        }
    }

    /// The single gateway call for this configuration.
    ///
    /// Image models get the system instruction folded into the prompt and no
    /// sampling, binding or reference image.
    pub fn model_request(&self, prompt: &str, prompt_image: Option<String>) -> ModelRequest {
        if self.image_output {
            let prompt = if self.system_instruction.is_empty() {
                prompt.to_string()
            } else {
                format!("{}\n\n{}", self.system_instruction, prompt)
            };
            return ModelRequest::image(&self.model_string, prompt);
        }

        let mut request = ModelRequest::text(&self.model_string, prompt)
            .sampling(self.sampling)
            .binding(self.binding.clone())
            .prompt_image(prompt_image);
        if !self.system_instruction.is_empty() {
            request = request.system(self.system_instruction.clone());
        }
        request
    }

    pub fn refinement_job(&self, prompt: &str) -> RefinementJob {
        RefinementJob {
            prompt: prompt.to_string(),
            system_instruction: self.system_instruction.clone(),
            model: self.model_string.clone(),
            sampling: self.sampling,
            syntax: self.syntax.clone(),
            target: self.execution_target(),
            strip_fences: self.strip_fences,
        }
    }
}

/// Common capability of anything a task can be configured from.
pub trait ResolveConfig {
    fn resolve_config(&self, ctx: &DispatchContext, models: &ModelCatalog)
        -> Result<ResolvedConfig>;
}

impl ResolveConfig for ModeSpec {
    fn resolve_config(
        &self,
        ctx: &DispatchContext,
        models: &ModelCatalog,
    ) -> Result<ResolvedConfig> {
        let model_key = self
            .model
            .clone()
            .unwrap_or_else(|| ctx.settings.model.clone());
        let model = checked_model(models, &model_key, self.image_output)?;
        let instruction = if self.system_instruction.is_empty() {
            ctx.settings.system_instruction.clone()
        } else {
            self.system_instruction.clone()
        };

        Ok(ResolvedConfig {
            config_id: self.id.clone(),
            name: self.name.clone(),
            icon: self.icon.clone(),
            model_key,
            model_string: model.model_string.clone(),
            image_output: self.image_output,
            sampling: if self.image_output {
                Sampling::default()
            } else {
                ctx.settings.sampling()
            },
            system_instruction: instruction,
            binding: resolve_binding(self.image_output, self.api_id.as_deref(), ctx)?,
            syntax: self.syntax.clone(),
            renderable: self.is_renderable,
            scaffold: self.scaffold.clone(),
            strip_fences: self.strip_fences,
        })
    }
}

impl ResolveConfig for UserProfile {
    fn resolve_config(
        &self,
        ctx: &DispatchContext,
        models: &ModelCatalog,
    ) -> Result<ResolvedConfig> {
        let model = checked_model(models, &self.model, self.image_output)?;
        let base = if self.system_instruction.is_empty() {
            ctx.settings.system_instruction.as_str()
        } else {
            self.system_instruction.as_str()
        };

        Ok(ResolvedConfig {
            config_id: self.id.clone(),
            name: self.name.clone(),
            icon: self.icon.clone().unwrap_or_else(|| "person".to_string()),
            model_key: self.model.clone(),
            model_string: model.model_string.clone(),
            image_output: self.image_output,
            sampling: if self.image_output {
                Sampling::default()
            } else {
                Sampling::new(self.temperature, self.top_p, self.top_k)
            },
            system_instruction: with_attached_files(base, &self.code_file_ids, &ctx.code_files),
            binding: resolve_binding(self.image_output, self.api_id.as_deref(), ctx)?,
            syntax: self.syntax.clone().unwrap_or_default(),
            renderable: self.is_renderable,
            scaffold: self.scaffold.clone(),
            strip_fences: self.syntax.is_some(),
        })
    }
}

/// Tagged source of a task's configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    Builtin(ModeSpec),
    Profile(UserProfile),
}

impl ConfigSource {
    /// Find a config id among built-in modes first, then user profiles.
    pub fn lookup(id: &str, modes: &ModeRegistry, profiles: &[UserProfile]) -> Result<Self> {
        if let Some(mode) = modes.get(id) {
            return Ok(Self::Builtin(mode.clone()));
        }
        profiles
            .iter()
            .find(|p| p.id == id)
            .map(|p| Self::Profile(p.clone()))
            .ok_or_else(|| StudioError::NotFound {
                kind: "mode/profile",
                id: id.to_string(),
            })
    }
}

impl ResolveConfig for ConfigSource {
    fn resolve_config(
        &self,
        ctx: &DispatchContext,
        models: &ModelCatalog,
    ) -> Result<ResolvedConfig> {
        match self {
            Self::Builtin(mode) => mode.resolve_config(ctx, models),
            Self::Profile(profile) => profile.resolve_config(ctx, models),
        }
    }
}

fn checked_model<'a>(
    models: &'a ModelCatalog,
    key: &str,
    image_output: bool,
) -> Result<&'a ModelInfo> {
    let model = models.get(key).ok_or_else(|| StudioError::NotFound {
        kind: "model",
        id: key.to_string(),
    })?;
    match (image_output, model.kind) {
        (true, ModelKind::Text) => Err(StudioError::config(format!(
            "image mode selected but text model {key} is active"
        ))),
        (false, ModelKind::Image) => Err(StudioError::config(format!(
            "text mode selected but image model {key} is active"
        ))),
        _ => Ok(model),
    }
}

fn resolve_binding(
    image_output: bool,
    api_id: Option<&str>,
    ctx: &DispatchContext,
) -> Result<ToolBinding> {
    if image_output {
        return Ok(ToolBinding::None);
    }
    if ctx.settings.use_google_search {
        return Ok(ToolBinding::WebSearch);
    }
    let Some(api_id) = api_id else {
        return Ok(ToolBinding::None);
    };
    let api = ctx
        .apis
        .iter()
        .find(|a| a.id == api_id)
        .ok_or_else(|| StudioError::NotFound {
            kind: "API definition",
            id: api_id.to_string(),
        })?;
    let definition: Value = serde_json::from_str(&api.definition).map_err(|e| {
        StudioError::config(format!("invalid JSON in API definition \"{}\": {e}", api.name))
    })?;

    match api.kind {
        ApiKind::Schema => {
            jsonschema::validator_for(&definition).map_err(|e| {
                StudioError::config(format!(
                    "API definition \"{}\" is not a valid schema: {e}",
                    api.name
                ))
            })?;
            debug!(api = %api.name, "Binding response schema");
            Ok(ToolBinding::ResponseSchema(definition))
        }
        ApiKind::Tools => {
            debug!(api = %api.name, "Binding tool declarations");
            Ok(ToolBinding::Tools(definition))
        }
    }
}

/// Prepend the attached code files as context.
fn with_attached_files(instruction: &str, file_ids: &[String], files: &[CodeFile]) -> String {
    let attached: Vec<&CodeFile> = file_ids
        .iter()
        .filter_map(|id| files.iter().find(|f| &f.id == id))
        .collect();
    if attached.is_empty() {
        return instruction.to_string();
    }

    let context = attached
        .iter()
        .map(|f| {
            format!(
                "## File: {} ({})\n```{}\n{}\n```",
                f.name, f.language, f.language, f.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("Here is some context from attached files:\n\n{context}\n\n---\n\n{instruction}")
}

/// Drop a leading ```lang line and a trailing ``` from a model response.
pub fn strip_code_fences(text: &str) -> String {
    let mut body = text.trim();
    if body.starts_with("```") {
        body = match body.find('\n') {
            Some(idx) => &body[idx + 1..],
            None => "",
        };
    }
    if let Some(stripped) = body.trim_end().strip_suffix("```") {
        body = stripped;
    }
    body.trim().to_string()
}
