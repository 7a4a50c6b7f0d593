//! Model-backed helpers for managing the library: prompt enhancement, API
//! definition drafting, code review and bulk creation of library items.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::catalog::{ApiDefinition, ApiKind, CodeFile, UserProfile};
use crate::error::{Result, StudioError};
use crate::gateway::{ModelGateway, ModelRequest, Sampling, ToolBinding};
use crate::library::Library;

/// Model every helper runs on unless overridden.
pub const ASSIST_MODEL: &str = "gemini-2.5-flash";

/// Reply the code checker gives for code with no findings.
pub const CLEAN_CODE_TOKEN: &str = "OK";

const ENHANCER_SYSTEM_INSTRUCTION: &str = "You are a prompt engineering expert. Rewrite the \
user's short prompt into a more detailed and specific one that will get a higher quality result \
from a generative model. Add concrete details about style, structure, composition and mood. \
Respond with the new prompt only.";

const PROFILES_SYSTEM_INSTRUCTION: &str = "You are a configuration generator. The user will \
provide a high-level request to create multiple AI profiles. Your task is to interpret the \
request and generate a JSON array of objects that strictly adheres to the provided schema. For \
each profile, you must infer a suitable name, a Google Material Symbols icon name, and a \
detailed, effective system instruction that captures the essence of the requested persona. Be \
creative and thorough.";

const APIS_SYSTEM_INSTRUCTION: &str = "You are a configuration generator. The user will provide \
a high-level request to create multiple API definitions (for function calling tools or response \
schemas). Your task is to interpret the request and generate a JSON array of objects that \
strictly adheres to the provided schema. The 'definition' field must be a valid JSON string. The \
'description' field should be the original natural language prompt for that specific API.";

const CODE_SYSTEM_INSTRUCTION: &str = "You are a configuration generator and expert programmer. \
The user will provide a high-level request to create multiple code files. Your task is to \
interpret the request and generate a JSON array of objects that strictly adheres to the provided \
schema. Write complete, useful, and well-documented code for the 'content' field.";

/// Outcome of [`Assistant::check_code`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeCheck {
    Clean,
    /// Markdown list of the problems found.
    Issues(String),
}

/// Which library collection a bulk request fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkKind {
    Profiles,
    Apis,
    CodeFiles,
}

impl BulkKind {
    fn system_instruction(self) -> &'static str {
        match self {
            Self::Profiles => PROFILES_SYSTEM_INSTRUCTION,
            Self::Apis => APIS_SYSTEM_INSTRUCTION,
            Self::CodeFiles => CODE_SYSTEM_INSTRUCTION,
        }
    }

    /// Gemini response schema for an array of this kind of item.
    fn response_schema(self) -> Value {
        let item = match self {
            Self::Profiles => json!({
                "type": "OBJECT",
                "properties": {
                    "name": {
                        "type": "STRING",
                        "description": "A concise, descriptive name for the profile."
                    },
                    "icon": {
                        "type": "STRING",
                        "description": "A single, valid Google Material Symbols name (e.g., \"code\", \"palette\", \"smart_toy\")."
                    },
                    "systemInstruction": {
                        "type": "STRING",
                        "description": "A detailed system instruction defining the AI's persona, expertise, and rules."
                    }
                },
                "required": ["name", "icon", "systemInstruction"]
            }),
            Self::Apis => json!({
                "type": "OBJECT",
                "properties": {
                    "name": {
                        "type": "STRING",
                        "description": "A concise, descriptive name for the API definition."
                    },
                    "type": {
                        "type": "STRING",
                        "enum": ["tools", "schema"],
                        "description": "The type of the API, either \"tools\" for function calling or \"schema\" for response validation."
                    },
                    "definition": {
                        "type": "STRING",
                        "description": "A string containing valid JSON for the API definition. This string itself must be parseable as JSON."
                    },
                    "description": {
                        "type": "STRING",
                        "description": "A natural language description of what the API does."
                    }
                },
                "required": ["name", "type", "definition", "description"]
            }),
            Self::CodeFiles => json!({
                "type": "OBJECT",
                "properties": {
                    "name": {
                        "type": "STRING",
                        "description": "A concise, descriptive name for the code file, including its extension (e.g., \"utils.js\")."
                    },
                    "language": {
                        "type": "STRING",
                        "description": "The programming language of the code (e.g., \"javascript\", \"python\")."
                    },
                    "content": {
                        "type": "STRING",
                        "description": "The full source code content for the file."
                    }
                },
                "required": ["name", "language", "content"]
            }),
        };
        json!({ "type": "ARRAY", "items": item })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedProfile {
    name: String,
    icon: String,
    system_instruction: String,
}

#[derive(Debug, Deserialize)]
struct GeneratedDefinition {
    #[serde(rename = "jsonString")]
    json_string: String,
}

/// Helpers that ask the model about library content.
#[derive(Clone)]
pub struct Assistant {
    gateway: Arc<ModelGateway>,
    model: String,
}

impl Assistant {
    pub fn new(gateway: Arc<ModelGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Rewrite a short prompt into a more detailed one.
    #[instrument(skip_all)]
    pub async fn enhance_prompt(&self, prompt: &str) -> Result<String> {
        let request = ModelRequest::text(&self.model, format!("Original prompt: \"{prompt}\""))
            .system(ENHANCER_SYSTEM_INSTRUCTION)
            .sampling(Sampling::temperature(0.7));
        let response = self.gateway.generate(&request).await?;
        Ok(response.text.trim().to_string())
    }

    /// Draft a tool declaration array or a response schema from a description.
    ///
    /// Returns the definition as pretty-printed JSON. The model's answer must
    /// itself contain valid JSON, otherwise this fails with a JSON error.
    #[instrument(skip_all, fields(kind = ?kind))]
    pub async fn generate_api_definition(
        &self,
        description: &str,
        kind: ApiKind,
    ) -> Result<String> {
        let kind_name = match kind {
            ApiKind::Tools => "tools",
            ApiKind::Schema => "schema",
        };
        let system = format!(
            "You are an expert API designer. Based on the user's description, generate a valid \
             JSON definition as a string. The type of API required is \"{kind_name}\". If the \
             type is 'tools', it should be an array of function declarations. If the type is \
             'schema', it should be a response schema object."
        );
        let schema = json!({
            "type": "OBJECT",
            "properties": {
                "jsonString": {
                    "type": "STRING",
                    "description": "A string containing the valid JSON definition for the API. The JSON must be perfectly formatted. This string itself will be parsed as JSON."
                }
            },
            "required": ["jsonString"]
        });
        let request = ModelRequest::text(&self.model, description)
            .system(system)
            .binding(ToolBinding::ResponseSchema(schema));

        let response = self.gateway.generate(&request).await?;
        let outer: GeneratedDefinition = serde_json::from_str(&response.text)?;
        let inner: Value = serde_json::from_str(&outer.json_string)?;
        Ok(serde_json::to_string_pretty(&inner)?)
    }

    /// Ask the model to lint a snippet.
    #[instrument(skip_all, fields(language = %language))]
    pub async fn check_code(&self, code: &str, language: &str) -> Result<CodeCheck> {
        let system = format!(
            "You are a world-class code linter and static analysis tool. You will be given a \
             snippet of code in {language}.\nYour tasks are:\n\
             1. Thoroughly analyze the code for any syntax errors, potential runtime bugs, \
             logical flaws, or deviations from best practices.\n\
             2. If the code is completely error-free and of high quality, your ONLY response \
             must be the exact string \"{CLEAN_CODE_TOKEN}\". Do not add any other text.\n\
             3. If you find any issues, provide a concise, professional, bulleted list of the \
             problems in Markdown format. Do not include any introductory or concluding \
             sentences, just the list.\n"
        );
        let request =
            ModelRequest::text(&self.model, format!("```{language}\n{code}\n```")).system(system);

        let response = self.gateway.generate(&request).await?;
        let text = response.text.trim();
        Ok(if text == CLEAN_CODE_TOKEN {
            CodeCheck::Clean
        } else {
            CodeCheck::Issues(text.to_string())
        })
    }

    /// Generate several library items from one request and save them.
    ///
    /// Profiles get the default model and sampling. Generated APIs whose
    /// definition is not valid JSON are skipped. Returns how many items were saved.
    #[instrument(skip_all, fields(kind = ?kind))]
    pub async fn bulk_create(
        &self,
        library: &Library,
        prompt: &str,
        kind: BulkKind,
    ) -> Result<usize> {
        let request = ModelRequest::text(&self.model, prompt)
            .system(kind.system_instruction())
            .binding(ToolBinding::ResponseSchema(kind.response_schema()));
        let response = self.gateway.generate(&request).await?;

        let items = match serde_json::from_str::<Value>(&response.text)? {
            Value::Array(items) => items,
            _ => {
                return Err(StudioError::Context(
                    "bulk creation response is not a JSON array".to_string(),
                ))
            }
        };

        let mut saved = 0;
        for item in items {
            let stored = match kind {
                BulkKind::Profiles => self.save_profile(library, item),
                BulkKind::Apis => self.save_api(library, item),
                BulkKind::CodeFiles => self.save_code_file(library, item),
            };
            match stored {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(err) if matches!(err, StudioError::Json(_)) => {
                    warn!("Skipping malformed generated item: {}", err);
                }
                Err(err) => return Err(err),
            }
        }
        info!(saved, "Bulk creation finished");
        Ok(saved)
    }

    fn save_profile(&self, library: &Library, item: Value) -> Result<bool> {
        let generated: GeneratedProfile = serde_json::from_value(item)?;
        library.save_profile(UserProfile {
            id: String::new(),
            name: generated.name,
            icon: Some(generated.icon),
            system_instruction: generated.system_instruction,
            model: ASSIST_MODEL.to_string(),
            temperature: 0.4,
            top_p: 0.95,
            top_k: 64,
            syntax: None,
            is_renderable: false,
            image_output: false,
            api_id: None,
            code_file_ids: Vec::new(),
            scaffold: None,
        })?;
        Ok(true)
    }

    fn save_api(&self, library: &Library, item: Value) -> Result<bool> {
        let api: ApiDefinition = serde_json::from_value(item)?;
        if let Err(err) = serde_json::from_str::<Value>(&api.definition) {
            warn!(name = %api.name, "Skipping API with invalid definition JSON: {}", err);
            return Ok(false);
        }
        library.save_api(api)?;
        Ok(true)
    }

    fn save_code_file(&self, library: &Library, item: Value) -> Result<bool> {
        library.save_code_file(serde_json::from_value::<CodeFile>(item)?)?;
        Ok(true)
    }
}
