//! Top-level entry point wiring the gateway, sandbox, refinement loop,
//! orchestrator, session store and library together.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use crate::assist::{Assistant, BulkKind, CodeCheck, ASSIST_MODEL};
use crate::catalog::{ApiKind, ModeRegistry, ModelCatalog};
use crate::chat::ChatMessage;
use crate::error::{Result, StudioError};
use crate::gateway::{
    GatewayConfig, MockTransport, ModelGateway, ModelRequest, ModelResponse, ModelTransport,
};
use crate::gemini::GeminiTransport;
use crate::library::{Library, SavedSession, SessionKind};
use crate::orchestrator::{Orchestrator, Request, RoundHandle};
use crate::refinement::{RefinementConfig, RefinementLoop};
use crate::sandbox::{CodeExecutor, SandboxConfig, SandboxHarness, Scaffold, ScaffoldRegistry};
use crate::session::{Round, SessionHandle, SessionStore};
use crate::settings::StudioSettings;

pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Builder for [`Studio`].
pub struct StudioBuilder {
    api_key: Option<String>,
    transport: Option<Arc<dyn ModelTransport>>,
    gateway: GatewayConfig,
    sandbox: SandboxConfig,
    refinement: RefinementConfig,
    scaffolds: ScaffoldRegistry,
    executor: Option<Arc<dyn CodeExecutor>>,
    modes: ModeRegistry,
    models: ModelCatalog,
    library: Option<Library>,
    rounds: Vec<Round>,
}

impl Default for StudioBuilder {
    fn default() -> Self {
        Self {
            api_key: None,
            transport: None,
            gateway: GatewayConfig::default(),
            sandbox: SandboxConfig::default(),
            refinement: RefinementConfig::default(),
            scaffolds: ScaffoldRegistry::with_defaults(),
            executor: None,
            modes: ModeRegistry::with_defaults(),
            models: ModelCatalog::with_defaults(),
            library: None,
            rounds: Vec::new(),
        }
    }
}

impl StudioBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder with the API key taken from `GEMINI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var(API_KEY_ENV)
            .map_err(|_| StudioError::config(format!("{API_KEY_ENV} is not set")))?;
        Ok(Self::new().with_api_key(key))
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn ModelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Answer every model call with `handler` instead of the network.
    pub fn with_mock(
        self,
        handler: impl Fn(&ModelRequest) -> Result<ModelResponse> + Send + Sync + 'static,
    ) -> Self {
        self.with_transport(Arc::new(MockTransport::new(handler)))
    }

    pub fn with_gateway_config(mut self, config: GatewayConfig) -> Self {
        self.gateway = config;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.gateway.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.gateway.timeout = timeout;
        self
    }

    pub fn with_sandbox_config(mut self, config: SandboxConfig) -> Self {
        self.sandbox = config;
        self
    }

    pub fn with_scaffold(mut self, key: impl Into<String>, scaffold: Scaffold) -> Self {
        self.scaffolds = self.scaffolds.register(key, scaffold);
        self
    }

    /// Replace the process sandbox with another executor.
    pub fn with_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_refinement_config(mut self, config: RefinementConfig) -> Self {
        self.refinement = config;
        self
    }

    pub fn with_modes(mut self, modes: ModeRegistry) -> Self {
        self.modes = modes;
        self
    }

    pub fn with_models(mut self, models: ModelCatalog) -> Self {
        self.models = models;
        self
    }

    pub fn with_library(mut self, library: Library) -> Self {
        self.library = Some(library);
        self
    }

    /// Start with these rounds already in the session.
    pub fn with_rounds(mut self, rounds: Vec<Round>) -> Self {
        self.rounds = rounds;
        self
    }

    /// Build the studio. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Studio> {
        let transport: Arc<dyn ModelTransport> = match (self.transport, self.api_key) {
            (Some(transport), _) => transport,
            (None, Some(key)) => Arc::new(GeminiTransport::new(key)?),
            (None, None) => {
                return Err(StudioError::config(
                    "an API key or a transport is required to build a studio",
                ))
            }
        };

        let gateway = Arc::new(ModelGateway::with_config(transport, self.gateway));
        let assist_model = self
            .models
            .get(ASSIST_MODEL)
            .map(|m| m.model_string.clone())
            .unwrap_or_else(|| ASSIST_MODEL.to_string());
        let assistant = Assistant::new(gateway.clone(), assist_model);
        let executor: Arc<dyn CodeExecutor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(SandboxHarness::new(self.scaffolds).with_config(self.sandbox)),
        };
        let refinement =
            Arc::new(RefinementLoop::new(gateway.clone(), executor).with_config(self.refinement));
        let store = SessionStore::with_rounds(self.rounds).spawn();
        let orchestrator = Orchestrator::new(
            gateway,
            refinement,
            store,
            Arc::new(self.modes),
            Arc::new(self.models),
        );

        Ok(Studio {
            orchestrator,
            assistant,
            library: self.library.unwrap_or_else(Library::in_memory),
        })
    }
}

/// The generation studio.
#[derive(Clone)]
pub struct Studio {
    orchestrator: Orchestrator,
    assistant: Assistant,
    library: Library,
}

impl Studio {
    pub fn builder() -> StudioBuilder {
        StudioBuilder::new()
    }

    pub fn session(&self) -> &SessionHandle {
        self.orchestrator.store()
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn modes(&self) -> &ModeRegistry {
        self.orchestrator.modes()
    }

    pub fn models(&self) -> &ModelCatalog {
        self.orchestrator.models()
    }

    pub fn settings(&self) -> Result<StudioSettings> {
        self.library.settings()
    }

    pub fn save_settings(&self, settings: &StudioSettings) -> Result<()> {
        self.library.save_settings(settings)
    }

    /// Submit a prompt using the saved sidebar settings.
    pub fn submit(
        &self,
        prompt: impl Into<String>,
        prompt_image: Option<String>,
    ) -> Result<RoundHandle> {
        let ctx = self.library.dispatch_context()?;
        let request = Request::from_settings(prompt, prompt_image, &ctx.settings);
        self.orchestrator.dispatch(request, &ctx)
    }

    /// Submit an explicit request against the current library.
    pub fn submit_request(&self, request: Request) -> Result<RoundHandle> {
        let ctx = self.library.dispatch_context()?;
        self.orchestrator.dispatch(request, &ctx)
    }

    /// Send a chat message using the saved sidebar settings.
    ///
    /// Returns the model message once every profile has answered.
    #[instrument(skip_all)]
    pub async fn send_chat_message(&self, prompt: &str) -> Result<ChatMessage> {
        let ctx = self.library.dispatch_context()?;
        self.orchestrator.chat(prompt, &ctx).await
    }

    pub async fn chat_history(&self) -> Result<Vec<ChatMessage>> {
        self.session().chat().await
    }

    /// Switch between the studio feed and the chat, persisting the choice.
    pub fn set_chat_mode(&self, enabled: bool) -> Result<StudioSettings> {
        let mut settings = self.library.settings()?;
        settings.is_chat_mode = enabled;
        self.library.save_settings(&settings)?;
        Ok(settings)
    }

    pub fn assistant(&self) -> &Assistant {
        &self.assistant
    }

    /// Rewrite a short prompt into a more detailed one.
    pub async fn enhance_prompt(&self, prompt: &str) -> Result<String> {
        self.assistant.enhance_prompt(prompt).await
    }

    /// Draft an API definition from a description, as pretty JSON.
    pub async fn generate_api_definition(
        &self,
        description: &str,
        kind: ApiKind,
    ) -> Result<String> {
        self.assistant.generate_api_definition(description, kind).await
    }

    pub async fn check_code(&self, code: &str, language: &str) -> Result<CodeCheck> {
        self.assistant.check_code(code, language).await
    }

    /// Generate and save several library items. Returns how many were saved.
    pub async fn bulk_create(&self, prompt: &str, kind: BulkKind) -> Result<usize> {
        self.assistant.bulk_create(&self.library, prompt, kind).await
    }

    /// Delete a round. In-flight tasks keep running but their writes are dropped.
    pub async fn remove_round(&self, round_id: &str) -> Result<bool> {
        self.session().remove_round(round_id).await
    }

    /// Archive the current session into history and start an empty one.
    ///
    /// In chat mode the chat log is archived, otherwise the rounds are. Both are
    /// cleared either way. Returns the archived session, or `None` if there was
    /// nothing to archive.
    pub async fn start_new_session(&self) -> Result<Option<SavedSession>> {
        let chat_mode = self.library.settings()?.is_chat_mode;
        let rounds = self.session().take_rounds().await?;
        let chat = self.session().take_chat().await?;

        let saved = if chat_mode && !chat.is_empty() {
            SavedSession::from_chat(chat)
        } else if !chat_mode && !rounds.is_empty() {
            SavedSession::from_rounds(rounds)
        } else {
            return Ok(None);
        };
        self.library.push_history(saved.clone())?;
        info!(
            session = %saved.id,
            kind = ?saved.kind,
            rounds = saved.rounds.len(),
            messages = saved.chat.len(),
            "Archived session"
        );
        Ok(Some(saved))
    }

    /// Archive the current session and load a saved one in its place.
    ///
    /// Loading a chat session switches to chat mode and loading a studio session
    /// leaves it.
    pub async fn load_session(&self, session_id: &str) -> Result<()> {
        let saved = self
            .library
            .history()?
            .into_iter()
            .find(|s| s.id == session_id)
            .ok_or_else(|| StudioError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            })?;
        self.start_new_session().await?;

        let mut settings = self.library.settings()?;
        settings.is_chat_mode = saved.kind == SessionKind::Chat;
        self.library.save_settings(&settings)?;
        match saved.kind {
            SessionKind::Chat => {
                self.session().restore_chat(saved.chat).await?;
            }
            SessionKind::Studio => {
                self.session().restore(saved.rounds).await?;
            }
        }
        Ok(())
    }

    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.library.delete_history(session_id)
    }

    /// Select a mode or profile for the next submission and persist the change.
    pub fn select_output_mode(&self, id: &str) -> Result<StudioSettings> {
        let mut settings = self.library.settings()?;
        let profiles = self.library.profiles()?;
        settings.select_output_mode(id, self.modes(), self.models(), &profiles)?;
        self.library.save_settings(&settings)?;
        Ok(settings)
    }
}
