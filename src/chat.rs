//! Conversational mode.
//!
//! A chat turn appends the user's message and a "thinking" model message to the
//! session, then asks each configured profile for an answer. Every answer, or the
//! error that replaced it, is pushed onto that one model message. The primary
//! profile is the selected output mode when hybrid chat is on and plain markdown
//! otherwise; A/B testing adds the B profile to the same message.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::catalog::{DispatchContext, ResolvedConfig};
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::session::Variant;

/// Config id answering chats when hybrid chat is off.
pub const DEFAULT_CHAT_PROFILE: &str = "markdown";

const REFINED_NOTES: &str =
    "This code was improved using the Supercharge self-correction process.";
const DIRECT_NOTES: &str = "Direct response from a single agent.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

/// Which profile produced a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRef {
    pub id: String,
    pub name: String,
    pub icon: String,
}

/// One profile's answer within a model message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub final_code: String,
    pub fixer_notes: String,
    pub review: String,
    #[serde(default)]
    pub grounding_metadata: Option<Value>,
    pub has_error: bool,
    pub profile: ProfileRef,
    #[serde(default)]
    pub variant: Option<Variant>,
}

/// What a profile produced before it is attributed and tagged.
struct Answer {
    final_code: String,
    fixer_notes: String,
    review: String,
    grounding_metadata: Option<Value>,
}

impl ChatResponse {
    fn answered(answer: Answer, profile: ProfileRef, variant: Option<Variant>) -> Self {
        Self {
            final_code: answer.final_code,
            fixer_notes: answer.fixer_notes,
            review: answer.review,
            grounding_metadata: answer.grounding_metadata,
            has_error: false,
            profile,
            variant,
        }
    }

    fn failed(profile: ProfileRef, variant: Option<Variant>, message: &str) -> Self {
        Self {
            final_code: "Sorry, I encountered an error.".to_string(),
            fixer_notes: format!("Error: {message}"),
            review: "The agent failed to respond.".to_string(),
            grounding_metadata: None,
            has_error: true,
            profile,
            variant,
        }
    }
}

/// Body of a model message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub is_thinking: bool,
    pub responses: Vec<ChatResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Reply(ChatReply),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: ChatContent,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: ChatRole::User,
            content: ChatContent::Text(text.into()),
        }
    }

    /// A model message waiting for its responses.
    pub fn thinking() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: ChatRole::Model,
            content: ChatContent::Reply(ChatReply {
                is_thinking: true,
                responses: Vec::new(),
            }),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            ChatContent::Text(text) => Some(text),
            ChatContent::Reply(_) => None,
        }
    }

    pub fn reply(&self) -> Option<&ChatReply> {
        match &self.content {
            ChatContent::Reply(reply) => Some(reply),
            ChatContent::Text(_) => None,
        }
    }
}

/// The profiles that answer a chat turn, with their A/B tags.
pub fn chat_targets(ctx: &DispatchContext) -> Vec<(String, Option<Variant>)> {
    let settings = &ctx.settings;
    let primary = if settings.use_hybrid_chat {
        settings.output_mode.clone()
    } else {
        DEFAULT_CHAT_PROFILE.to_string()
    };

    let mut targets = vec![(primary, settings.is_ab_test_mode.then_some(Variant::A))];
    if let (true, Some(profile_id)) = (settings.is_ab_test_mode, &settings.ab_test_profile_id) {
        targets.push((profile_id.clone(), Some(Variant::B)));
    }
    targets
}

impl Orchestrator {
    /// Run one chat turn and return the finished model message.
    ///
    /// Profiles that fail to resolve are logged and contribute no response. A
    /// profile whose generation fails contributes an error response.
    #[instrument(skip_all)]
    pub async fn chat(&self, prompt: &str, ctx: &DispatchContext) -> Result<ChatMessage> {
        let thinking = ChatMessage::thinking();
        let message_id = thinking.id.clone();
        self.store().append_chat(vec![ChatMessage::user(prompt), thinking])?;

        let mut answers = Vec::new();
        for (config_id, variant) in chat_targets(ctx) {
            match self.resolve(&config_id, ctx) {
                Ok(config) => {
                    answers.push(self.answer(config, variant, prompt, ctx, &message_id))
                }
                Err(err) => warn!(config_id = %config_id, "Skipping chat profile: {}", err),
            }
        }
        futures::future::join_all(answers).await;

        self.store().finish_thinking(&message_id)?;
        let message = self
            .store()
            .chat()
            .await?
            .into_iter()
            .find(|m| m.id == message_id);
        info!(message_id = %message_id, "Chat turn finished");
        Ok(message.unwrap_or_else(|| ChatMessage {
            id: message_id,
            role: ChatRole::Model,
            content: ChatContent::Reply(ChatReply::default()),
        }))
    }

    async fn answer(
        &self,
        config: ResolvedConfig,
        variant: Option<Variant>,
        prompt: &str,
        ctx: &DispatchContext,
        message_id: &str,
    ) {
        let profile = ProfileRef {
            id: config.config_id.clone(),
            name: config.name.clone(),
            icon: config.icon.clone(),
        };
        let outcome = AssertUnwindSafe(self.chat_response(&config, prompt, ctx))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(Ok(answer)) => ChatResponse::answered(answer, profile, variant),
            Ok(Err(err)) => {
                error!(config_id = %config.config_id, "Chat response failed: {}", err);
                ChatResponse::failed(profile, variant, &err.to_string())
            }
            Err(_) => {
                error!(config_id = %config.config_id, "Chat response panicked");
                ChatResponse::failed(profile, variant, "generation task panicked")
            }
        };

        if self.store().push_chat_response(message_id, response).is_err() {
            warn!("Session store closed before the chat response could be recorded");
        }
    }

    async fn chat_response(
        &self,
        config: &ResolvedConfig,
        prompt: &str,
        ctx: &DispatchContext,
    ) -> Result<Answer> {
        if ctx.settings.use_supercharge && config.is_correctable() && config.renderable {
            let outcome = self
                .refinement()
                .run(&config.refinement_job(prompt), None)
                .await?;
            return Ok(Answer {
                final_code: outcome.artifact,
                fixer_notes: REFINED_NOTES.to_string(),
                review: outcome.critique_log,
                grounding_metadata: None,
            });
        }

        let response = self
            .gateway()
            .generate(&config.model_request(prompt, None))
            .await?;
        Ok(Answer {
            final_code: response.text,
            fixer_notes: DIRECT_NOTES.to_string(),
            review: "N/A".to_string(),
            grounding_metadata: response.grounding_metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::StudioSettings;

    fn ctx(settings: StudioSettings) -> DispatchContext {
        DispatchContext {
            settings,
            ..Default::default()
        }
    }

    #[test]
    fn plain_chat_answers_in_markdown() {
        let targets = chat_targets(&ctx(StudioSettings {
            output_mode: "javascript".into(),
            use_hybrid_chat: false,
            ..Default::default()
        }));
        assert_eq!(targets, vec![("markdown".to_string(), None)]);
    }

    #[test]
    fn hybrid_ab_chat_uses_both_profiles() {
        let targets = chat_targets(&ctx(StudioSettings {
            output_mode: "javascript".into(),
            is_ab_test_mode: true,
            ab_test_profile_id: Some("p1".into()),
            ..Default::default()
        }));
        assert_eq!(
            targets,
            vec![
                ("javascript".to_string(), Some(Variant::A)),
                ("p1".to_string(), Some(Variant::B)),
            ]
        );
    }

    #[test]
    fn messages_keep_their_wire_shape() {
        let user = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(user["role"], "user");
        assert_eq!(user["content"], "hi");

        let thinking = serde_json::to_value(ChatMessage::thinking()).unwrap();
        assert_eq!(thinking["role"], "model");
        assert_eq!(thinking["content"]["isThinking"], true);

        let back: ChatMessage = serde_json::from_value(thinking).unwrap();
        assert!(back.reply().unwrap().is_thinking);
        assert!(back.text().is_none());
    }
}
