//! [`ModelTransport`] backed by the Gemini API.
//!
//! Text generation goes through `gemini-rust`; image generation calls the Imagen
//! `:predict` endpoint directly since it has a different response shape.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use gemini_rust::{Content, Gemini, GenerationConfig, Message, Model, Role, SafetySetting, Tool};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::error::{Result, StudioError};
use crate::gateway::{ModelRequest, ModelResponse, ModelTransport, ToolBinding};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Harm categories sent with `BLOCK_NONE` on every text call.
pub const UNBLOCKED_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_HARASSMENT",
];

/// Real transport over the Gemini and Imagen endpoints.
pub struct GeminiTransport {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    clients: Mutex<HashMap<String, Arc<Gemini>>>,
    safety: Vec<SafetySetting>,
}

impl GeminiTransport {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            http: reqwest::Client::new(),
            clients: Mutex::new(HashMap::new()),
            safety: safety_settings()?,
        })
    }

    /// Point image requests at a different API root.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn client_for(&self, model: &str) -> Result<Arc<Gemini>> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| StudioError::transport("gemini client cache poisoned"))?;
        if let Some(client) = clients.get(model) {
            return Ok(client.clone());
        }
        let client = Arc::new(Gemini::with_model(
            &self.api_key,
            Model::Custom(format!("models/{model}")),
        )?);
        clients.insert(model.to_string(), client.clone());
        Ok(client)
    }

    async fn generate_text(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let client = self.client_for(&request.model)?;
        let mut config = GenerationConfig {
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            top_k: request.sampling.top_k,
            ..Default::default()
        };

        let mut builder = client.generate_content();
        if let Some(system) = &request.system_instruction {
            builder = builder.with_system_instruction(system);
        }
        if let Some(image) = &request.prompt_image {
            let (mime_type, data) = split_data_uri(image)?;
            builder = builder.with_inline_data(data, mime_type);
        }
        builder = builder
            .with_message(Message {
                role: Role::User,
                content: Content::text(request.prompt.clone()).with_role(Role::User),
            })
            .with_safety_settings(self.safety.clone());

        match &request.binding {
            ToolBinding::None => {}
            ToolBinding::WebSearch => builder = builder.with_tool(Tool::google_search()),
            ToolBinding::Tools(definition) => {
                for tool in parse_tools(definition)? {
                    builder = builder.with_tool(tool);
                }
            }
            ToolBinding::ResponseSchema(schema) => {
                config.response_mime_type = Some("application/json".to_string());
                config.response_schema = Some(schema.clone());
            }
        }

        let response = builder.with_generation_config(config).execute().await?;
        let function_call = response
            .function_calls()
            .first()
            .map(serde_json::to_value)
            .transpose()?;
        let grounding_metadata = serde_json::to_value(&response)
            .ok()
            .and_then(|v| v.pointer("/candidates/0/groundingMetadata").cloned())
            .filter(|v| !v.is_null());

        Ok(ModelResponse {
            text: response.text(),
            grounding_metadata,
            function_call,
        })
    }

    async fn generate_image(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let url = format!("{}/models/{}:predict", self.base_url, request.model);
        let body = json!({
            "instances": [{ "prompt": request.prompt }],
            "parameters": {
                "sampleCount": 1,
                "aspectRatio": "4:3",
                "outputMimeType": "image/png"
            }
        });

        let response: PredictResponse = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let bytes = response
            .predictions
            .into_iter()
            .find_map(|p| p.bytes_base64_encoded)
            .ok_or_else(|| StudioError::transport("image model returned no image"))?;

        Ok(ModelResponse::text(format!("data:image/png;base64,{bytes}")))
    }
}

#[async_trait]
impl ModelTransport for GeminiTransport {
    #[instrument(skip_all, fields(model = %request.model))]
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse> {
        debug!(image = request.image_output, "Sending request to Gemini");
        if request.image_output {
            self.generate_image(request).await
        } else {
            self.generate_text(request).await
        }
    }
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
}

/// `BLOCK_NONE` for every category in [`UNBLOCKED_CATEGORIES`].
pub fn safety_settings() -> Result<Vec<SafetySetting>> {
    let settings = UNBLOCKED_CATEGORIES
        .iter()
        .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
        .collect();
    Ok(serde_json::from_value(Value::Array(settings))?)
}

/// Split a `data:<mime>;base64,<payload>` URI, checking the payload decodes.
pub fn split_data_uri(uri: &str) -> Result<(String, String)> {
    let (header, data) = uri
        .split_once(',')
        .ok_or_else(|| StudioError::config("prompt image is not a data URI"))?;
    let mime_type = header
        .strip_prefix("data:")
        .and_then(|h| h.strip_suffix(";base64"))
        .filter(|m| !m.is_empty())
        .unwrap_or("image/png");
    BASE64
        .decode(data)
        .map_err(|e| StudioError::config(format!("prompt image is not valid base64: {e}")))?;
    Ok((mime_type.to_string(), data.to_string()))
}

/// Accept a single tool object or an array of them.
fn parse_tools(definition: &Value) -> Result<Vec<Tool>> {
    let list = match definition {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    list.into_iter()
        .map(|item| {
            serde_json::from_value::<Tool>(item)
                .map_err(|e| StudioError::config(format!("invalid tool declaration: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_png_data_uri() {
        let (mime, data) = split_data_uri("data:image/jpeg;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "image/jpeg");
        assert_eq!(data, "aGVsbG8=");
    }

    #[test]
    fn rejects_non_base64_payload() {
        let err = split_data_uri("data:image/png;base64,@@@").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn every_category_is_unblocked() {
        let settings = safety_settings().unwrap();
        assert_eq!(settings.len(), 4);
        let wire = serde_json::to_value(&settings).unwrap();
        for (entry, category) in wire.as_array().unwrap().iter().zip(UNBLOCKED_CATEGORIES) {
            assert_eq!(entry["category"], category);
            assert_eq!(entry["threshold"], "BLOCK_NONE");
        }
    }

    #[test]
    fn rejects_plain_text() {
        assert!(split_data_uri("just text").is_err());
    }
}
