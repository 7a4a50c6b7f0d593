//! Sidebar settings shared by every submission.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::catalog::{ConfigSource, ModeRegistry, ModelCatalog, ModelKind, UserProfile};
use crate::error::{Result, StudioError};
use crate::gateway::Sampling;

/// Global generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StudioSettings {
    /// Selected mode or profile id (default: "html")
    pub output_mode: String,
    /// Sidebar model key (default: "gemini-2.5-flash")
    pub model: String,
    /// Outputs per config per submission (default: 1)
    pub batch_size: usize,
    /// Default temperature (default: 0.4)
    pub temperature: f32,
    /// Default nucleus sampling (default: 0.95)
    pub top_p: f32,
    /// Default top-k (default: 64)
    pub top_k: i32,
    /// Fallback system instruction for modes without one
    pub system_instruction: String,
    /// Route correctable outputs through the refinement loop (default: true)
    pub use_supercharge: bool,
    /// Ground text requests with web search (default: false)
    pub use_google_search: bool,
    /// Run a second profile alongside the selected mode
    pub is_ab_test_mode: bool,
    pub ab_test_profile_id: Option<String>,
    /// Submissions go to the chat instead of the round feed (default: false)
    pub is_chat_mode: bool,
    /// Chat answers with the selected mode instead of plain markdown (default: true)
    pub use_hybrid_chat: bool,
}

impl Default for StudioSettings {
    fn default() -> Self {
        Self {
            output_mode: "html".to_string(),
            model: "gemini-2.5-flash".to_string(),
            batch_size: 1,
            temperature: 0.4,
            top_p: 0.95,
            top_k: 64,
            system_instruction: String::new(),
            use_supercharge: true,
            use_google_search: false,
            is_ab_test_mode: false,
            ab_test_profile_id: None,
            is_chat_mode: false,
            use_hybrid_chat: true,
        }
    }
}

impl StudioSettings {
    pub fn sampling(&self) -> Sampling {
        Sampling::new(self.temperature, self.top_p, self.top_k)
    }

    /// Switch the selected output mode.
    ///
    /// Selecting a profile copies its model, sampling and instruction into the
    /// sidebar. Selecting a built-in mode takes its instruction and, outside chat
    /// mode, moves the sidebar model onto the model kind the mode needs.
    pub fn select_output_mode(
        &mut self,
        id: &str,
        modes: &ModeRegistry,
        models: &ModelCatalog,
        profiles: &[UserProfile],
    ) -> Result<()> {
        match ConfigSource::lookup(id, modes, profiles)? {
            ConfigSource::Profile(profile) => {
                self.model = profile.model;
                self.temperature = profile.temperature;
                self.top_p = profile.top_p;
                self.top_k = profile.top_k;
                self.system_instruction = profile.system_instruction;
            }
            ConfigSource::Builtin(mode) => {
                let wanted = if mode.image_output {
                    ModelKind::Image
                } else {
                    ModelKind::Text
                };
                // The chat keeps whatever model the user picked.
                if !self.is_chat_mode && models.get(&self.model).map(|m| m.kind) != Some(wanted) {
                    let replacement = models.first_of_kind(wanted).ok_or_else(|| {
                        StudioError::config(format!("no {wanted:?} model available for mode {id}"))
                    })?;
                    info!(mode = id, model = %replacement.key, "Switching sidebar model");
                    self.model = replacement.key.clone();
                }
                self.system_instruction = mode.system_instruction;
            }
        }
        self.output_mode = id.to_string();
        Ok(())
    }
}
