//! Generation orchestration and self-correction on top of `gemini-rust`.
//!
//! A submitted prompt fans out into concurrent generation tasks, one per
//! configuration and batch slot. Code-producing tasks can run through a
//! generate, execute, critique loop against a sandboxed runner until the
//! critic is satisfied or the iteration budget runs out. Results land in a
//! session store addressed by round and output id. The same profiles can also
//! answer in a chat, side by side when A/B testing.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use gemini_studio::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let studio = StudioBuilder::from_env()?.build()?;
//!     studio.select_output_mode("javascript")?;
//!
//!     let round = studio.submit("A bouncing ball on a canvas", None)?;
//!     let round_id = round.round_id.clone();
//!     round.wait().await;
//!
//!     if let Some(round) = studio.session().round(round_id).await? {
//!         for output in &round.outputs {
//!             println!("{:?}", output.output_data);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod assist;
pub mod catalog;
pub mod chat;
pub mod error;
pub mod gateway;
pub mod gemini;
pub mod library;
pub mod orchestrator;
pub mod refinement;
pub mod sandbox;
pub mod session;
pub mod settings;
pub mod studio;

pub use assist::{Assistant, BulkKind, CodeCheck};
pub use catalog::{
    strip_code_fences, ApiDefinition, ApiKind, CodeFile, ConfigSource, DispatchContext,
    ModeRegistry, ModeSpec, ModelCatalog, ModelInfo, ModelKind, ResolveConfig, ResolvedConfig,
    UserProfile,
};
pub use chat::{ChatContent, ChatMessage, ChatReply, ChatResponse, ChatRole, ProfileRef};
pub use error::{Result, ResultExt, StudioError};
pub use gateway::{
    GatewayConfig, MockHandler, MockTransport, ModelGateway, ModelRequest, ModelResponse,
    ModelTransport, Sampling, ToolBinding,
};
pub use gemini::GeminiTransport;
pub use library::{JsonFileStore, KeyValueStore, Library, MemoryStore, SavedSession, SessionKind};
pub use orchestrator::{GenerationTask, Orchestrator, Request, RoundHandle, TargetConfig};
pub use refinement::{
    Decision, Phase, ProgressSender, ProgressUpdate, RefinementConfig, RefinementJob,
    RefinementLoop, RefinementOutcome,
};
pub use sandbox::{
    CodeExecutor, ConsoleLevel, ConsoleMessage, ExecutionTarget, SandboxConfig, SandboxHarness,
    Scaffold, ScaffoldRegistry,
};
pub use session::{
    Output, OutputPatch, Round, SessionEvent, SessionHandle, SessionStore, Variant,
};
pub use settings::StudioSettings;
pub use studio::{Studio, StudioBuilder};

/// Prelude module for convenient imports.
///
/// ```rust
/// use gemini_studio::prelude::*;
/// ```
pub mod prelude {
    pub use crate::assist::{BulkKind, CodeCheck};
    pub use crate::catalog::{ApiKind, ModeRegistry, ModelCatalog, UserProfile};
    pub use crate::chat::{ChatMessage, ChatResponse};
    pub use crate::error::{Result, ResultExt, StudioError};
    pub use crate::gateway::{GatewayConfig, ModelRequest, ModelResponse, Sampling, ToolBinding};
    pub use crate::library::{JsonFileStore, Library};
    pub use crate::orchestrator::{Request, RoundHandle, TargetConfig};
    pub use crate::refinement::{ProgressUpdate, RefinementConfig};
    pub use crate::sandbox::{SandboxConfig, Scaffold};
    pub use crate::session::{Output, Round, SessionEvent, Variant};
    pub use crate::settings::StudioSettings;
    pub use crate::studio::{Studio, StudioBuilder};

    // Re-export commonly used external types
    pub use serde::{Deserialize, Serialize};
}
