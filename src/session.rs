//! Session store: the rounds of the current session and their outputs, plus the
//! chat log.
//!
//! State is owned by a single reducer task. Everything else talks to it through
//! a [`SessionHandle`], sending commands that address an output by round id and
//! output id. Patches only touch the fields they carry, so concurrent tasks never
//! overwrite each other's state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace};

use crate::chat::{ChatContent, ChatMessage, ChatResponse};
use crate::error::{Result, StudioError};
use crate::refinement::ProgressUpdate;

/// A/B tag on an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    A,
    B,
}

/// One addressable generation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    pub id: String,
    pub config_id: String,
    #[serde(default)]
    pub variant: Option<Variant>,
    pub model_key: String,
    #[serde(default)]
    pub mode_name: String,
    #[serde(default)]
    pub mode_icon: String,
    pub is_busy: bool,
    #[serde(default)]
    pub output_data: Option<String>,
    #[serde(default)]
    pub got_error: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub critique_notes: Option<String>,
    #[serde(default)]
    pub status_text: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Wall time from dispatch to the terminal write, in milliseconds.
    #[serde(default)]
    pub total_time: Option<i64>,
    #[serde(default)]
    pub grounding_metadata: Option<Value>,
    #[serde(default)]
    pub is_function_call: bool,
}

impl Output {
    /// A fresh busy output.
    pub fn pending(
        config_id: impl Into<String>,
        variant: Option<Variant>,
        model_key: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config_id: config_id.into(),
            variant,
            model_key: model_key.into(),
            mode_name: String::new(),
            mode_icon: String::new(),
            is_busy: true,
            output_data: None,
            got_error: false,
            error_message: None,
            critique_notes: None,
            status_text: None,
            start_time: Utc::now(),
            total_time: None,
            grounding_metadata: None,
            is_function_call: false,
        }
    }

    pub fn with_mode(mut self, name: impl Into<String>, icon: impl Into<String>) -> Self {
        self.mode_name = name.into();
        self.mode_icon = icon.into();
        self
    }

    /// Whether the terminal write has happened.
    pub fn is_settled(&self) -> bool {
        !self.is_busy && (self.output_data.is_some() || self.got_error)
    }
}

/// All outputs produced by one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub prompt_image: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_ab_test: bool,
    pub outputs: Vec<Output>,
}

impl Round {
    pub fn new(prompt: impl Into<String>, outputs: Vec<Output>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            prompt_image: None,
            created_at: Utc::now(),
            is_ab_test: false,
            outputs,
        }
    }

    pub fn output(&self, id: &str) -> Option<&Output> {
        self.outputs.iter().find(|o| o.id == id)
    }

    pub fn is_busy(&self) -> bool {
        self.outputs.iter().any(|o| o.is_busy)
    }
}

/// Partial update to an [`Output`]. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputPatch {
    pub is_busy: Option<bool>,
    pub output_data: Option<String>,
    pub got_error: Option<bool>,
    pub error_message: Option<String>,
    pub critique_notes: Option<String>,
    pub status_text: Option<String>,
    pub total_time: Option<i64>,
    pub grounding_metadata: Option<Value>,
    pub is_function_call: Option<bool>,
}

impl OutputPatch {
    /// Terminal write for a task that produced output.
    pub fn success(output_data: impl Into<String>, total_time: i64) -> Self {
        Self {
            is_busy: Some(false),
            output_data: Some(output_data.into()),
            got_error: Some(false),
            status_text: Some(String::new()),
            total_time: Some(total_time),
            ..Default::default()
        }
    }

    /// Terminal write for a task that failed.
    pub fn failure(message: impl Into<String>, total_time: i64) -> Self {
        Self {
            is_busy: Some(false),
            got_error: Some(true),
            error_message: Some(message.into()),
            status_text: Some(String::new()),
            total_time: Some(total_time),
            ..Default::default()
        }
    }

    pub fn with_critique(mut self, notes: Option<String>) -> Self {
        self.critique_notes = notes;
        self
    }

    pub fn with_grounding(mut self, metadata: Option<Value>) -> Self {
        self.grounding_metadata = metadata;
        self
    }

    pub fn with_function_call(mut self, is_function_call: bool) -> Self {
        self.is_function_call = Some(is_function_call);
        self
    }

    fn is_terminal(&self) -> bool {
        self.is_busy == Some(false)
    }

    pub fn apply(self, output: &mut Output) {
        if let Some(v) = self.is_busy {
            output.is_busy = v;
        }
        if let Some(v) = self.output_data {
            output.output_data = Some(v);
        }
        if let Some(v) = self.got_error {
            output.got_error = v;
            // An errored output carries no artifact, even one written by progress.
            if v {
                output.output_data = None;
            }
        }
        if let Some(v) = self.error_message {
            output.error_message = Some(v);
        }
        if let Some(v) = self.critique_notes {
            output.critique_notes = Some(v);
        }
        if let Some(v) = self.status_text {
            output.status_text = Some(v);
        }
        if let Some(v) = self.total_time {
            output.total_time = Some(v);
        }
        if let Some(v) = self.grounding_metadata {
            output.grounding_metadata = Some(v);
        }
        if let Some(v) = self.is_function_call {
            output.is_function_call = v;
        }
    }
}

impl From<ProgressUpdate> for OutputPatch {
    fn from(update: ProgressUpdate) -> Self {
        Self {
            is_busy: update.is_busy,
            output_data: update.output_data,
            critique_notes: update.critique_notes,
            status_text: update.status,
            ..Default::default()
        }
    }
}

/// Change notifications published after each applied command.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RoundInserted(String),
    OutputPatched { round_id: String, output_id: String },
    RoundRemoved(String),
    /// A chat message was added or changed.
    ChatUpdated(String),
    Cleared,
}

enum Command {
    Insert(Round),
    Patch {
        round_id: String,
        output_id: String,
        patch: OutputPatch,
    },
    Remove {
        round_id: String,
        reply: oneshot::Sender<bool>,
    },
    Snapshot(oneshot::Sender<Vec<Round>>),
    Get {
        round_id: String,
        reply: oneshot::Sender<Option<Round>>,
    },
    Take(oneshot::Sender<Vec<Round>>),
    Replace {
        rounds: Vec<Round>,
        reply: oneshot::Sender<Vec<Round>>,
    },
    AppendChat(Vec<ChatMessage>),
    PushResponse {
        message_id: String,
        response: ChatResponse,
    },
    FinishThinking(String),
    ChatSnapshot(oneshot::Sender<Vec<ChatMessage>>),
    TakeChat(oneshot::Sender<Vec<ChatMessage>>),
    ReplaceChat {
        messages: Vec<ChatMessage>,
        reply: oneshot::Sender<Vec<ChatMessage>>,
    },
}

/// The reducer's state. Rounds are kept newest first, chat messages oldest first.
#[derive(Debug, Default)]
pub struct SessionStore {
    rounds: Vec<Round>,
    chat: Vec<ChatMessage>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously saved rounds.
    pub fn with_rounds(rounds: Vec<Round>) -> Self {
        Self {
            rounds,
            chat: Vec::new(),
        }
    }

    /// Move the store onto its own reducer task.
    ///
    /// The task exits once every handle has been dropped. Must be called inside
    /// a tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let (events, _) = broadcast::channel(256);
        let notifier = events.clone();

        tokio::spawn(async move {
            let mut store = self;
            while let Some(command) = rx.recv().await {
                if let Some(event) = store.reduce(command) {
                    let _ = notifier.send(event);
                }
            }
            debug!("Session store stopped");
        });

        SessionHandle { tx, events }
    }

    pub fn insert_round(&mut self, round: Round) -> SessionEvent {
        let id = round.id.clone();
        self.rounds.insert(0, round);
        SessionEvent::RoundInserted(id)
    }

    /// Apply a patch. Returns `false` when the round or output is gone, or the
    /// output has already been settled.
    pub fn patch_output(&mut self, round_id: &str, output_id: &str, patch: OutputPatch) -> bool {
        let Some(output) = self
            .rounds
            .iter_mut()
            .find(|r| r.id == round_id)
            .and_then(|r| r.outputs.iter_mut().find(|o| o.id == output_id))
        else {
            trace!(round_id, output_id, "Dropping patch for removed round");
            return false;
        };
        if !output.is_busy {
            debug!(
                round_id,
                output_id,
                terminal = patch.is_terminal(),
                "Ignoring patch to settled output"
            );
            return false;
        }
        patch.apply(output);
        true
    }

    pub fn remove_round(&mut self, round_id: &str) -> bool {
        let before = self.rounds.len();
        self.rounds.retain(|r| r.id != round_id);
        self.rounds.len() != before
    }

    pub fn rounds(&self) -> &[Round] {
        &self.rounds
    }

    pub fn chat(&self) -> &[ChatMessage] {
        &self.chat
    }

    /// Add a response to a model message. Returns `false` if the message is gone.
    pub fn push_chat_response(&mut self, message_id: &str, response: ChatResponse) -> bool {
        match self.chat_reply(message_id) {
            Some(reply) => {
                reply.responses.push(response);
                true
            }
            None => {
                trace!(message_id, "Dropping response for cleared chat");
                false
            }
        }
    }

    pub fn finish_thinking(&mut self, message_id: &str) -> bool {
        match self.chat_reply(message_id) {
            Some(reply) => {
                reply.is_thinking = false;
                true
            }
            None => false,
        }
    }

    fn chat_reply(&mut self, message_id: &str) -> Option<&mut crate::chat::ChatReply> {
        self.chat
            .iter_mut()
            .find(|m| m.id == message_id)
            .and_then(|m| match &mut m.content {
                ChatContent::Reply(reply) => Some(reply),
                ChatContent::Text(_) => None,
            })
    }

    fn reduce(&mut self, command: Command) -> Option<SessionEvent> {
        match command {
            Command::Insert(round) => Some(self.insert_round(round)),
            Command::Patch {
                round_id,
                output_id,
                patch,
            } => self
                .patch_output(&round_id, &output_id, patch)
                .then_some(SessionEvent::OutputPatched {
                    round_id,
                    output_id,
                }),
            Command::Remove { round_id, reply } => {
                let removed = self.remove_round(&round_id);
                let _ = reply.send(removed);
                removed.then_some(SessionEvent::RoundRemoved(round_id))
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.rounds.clone());
                None
            }
            Command::Get { round_id, reply } => {
                let _ = reply.send(self.rounds.iter().find(|r| r.id == round_id).cloned());
                None
            }
            Command::Take(reply) => {
                let _ = reply.send(std::mem::take(&mut self.rounds));
                Some(SessionEvent::Cleared)
            }
            Command::Replace { rounds, reply } => {
                let _ = reply.send(std::mem::replace(&mut self.rounds, rounds));
                Some(SessionEvent::Cleared)
            }
            Command::AppendChat(messages) => {
                let last = messages.last().map(|m| m.id.clone());
                self.chat.extend(messages);
                last.map(SessionEvent::ChatUpdated)
            }
            Command::PushResponse {
                message_id,
                response,
            } => self
                .push_chat_response(&message_id, response)
                .then_some(SessionEvent::ChatUpdated(message_id)),
            Command::FinishThinking(message_id) => self
                .finish_thinking(&message_id)
                .then_some(SessionEvent::ChatUpdated(message_id)),
            Command::ChatSnapshot(reply) => {
                let _ = reply.send(self.chat.clone());
                None
            }
            Command::TakeChat(reply) => {
                let _ = reply.send(std::mem::take(&mut self.chat));
                Some(SessionEvent::Cleared)
            }
            Command::ReplaceChat { messages, reply } => {
                let _ = reply.send(std::mem::replace(&mut self.chat, messages));
                Some(SessionEvent::Cleared)
            }
        }
    }
}

/// Cloneable handle to a running [`SessionStore`].
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| StudioError::StoreClosed)
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        rx.await.map_err(|_| StudioError::StoreClosed)
    }

    /// Queue a new round at the front of the session.
    pub fn insert_round(&self, round: Round) -> Result<()> {
        self.send(Command::Insert(round))
    }

    /// Queue a partial update. Silently dropped if the round has been removed.
    pub fn patch_output(
        &self,
        round_id: impl Into<String>,
        output_id: impl Into<String>,
        patch: OutputPatch,
    ) -> Result<()> {
        self.send(Command::Patch {
            round_id: round_id.into(),
            output_id: output_id.into(),
            patch,
        })
    }

    /// Remove a whole round. Returns whether it existed.
    pub async fn remove_round(&self, round_id: impl Into<String>) -> Result<bool> {
        let round_id = round_id.into();
        self.ask(|reply| Command::Remove { round_id, reply }).await
    }

    pub async fn rounds(&self) -> Result<Vec<Round>> {
        self.ask(Command::Snapshot).await
    }

    pub async fn round(&self, round_id: impl Into<String>) -> Result<Option<Round>> {
        let round_id = round_id.into();
        self.ask(|reply| Command::Get { round_id, reply }).await
    }

    /// Empty the session, returning what it held.
    pub async fn take_rounds(&self) -> Result<Vec<Round>> {
        self.ask(Command::Take).await
    }

    /// Swap in a saved session, returning the rounds it replaced.
    pub async fn restore(&self, rounds: Vec<Round>) -> Result<Vec<Round>> {
        self.ask(|reply| Command::Replace { rounds, reply }).await
    }

    /// Append messages to the end of the chat log.
    pub fn append_chat(&self, messages: Vec<ChatMessage>) -> Result<()> {
        self.send(Command::AppendChat(messages))
    }

    /// Queue a response for a model message. Dropped if the chat was cleared.
    pub fn push_chat_response(
        &self,
        message_id: impl Into<String>,
        response: ChatResponse,
    ) -> Result<()> {
        self.send(Command::PushResponse {
            message_id: message_id.into(),
            response,
        })
    }

    pub fn finish_thinking(&self, message_id: impl Into<String>) -> Result<()> {
        self.send(Command::FinishThinking(message_id.into()))
    }

    pub async fn chat(&self) -> Result<Vec<ChatMessage>> {
        self.ask(Command::ChatSnapshot).await
    }

    /// Empty the chat log, returning what it held.
    pub async fn take_chat(&self) -> Result<Vec<ChatMessage>> {
        self.ask(Command::TakeChat).await
    }

    /// Swap in a saved chat, returning the messages it replaced.
    pub async fn restore_chat(&self, messages: Vec<ChatMessage>) -> Result<Vec<ChatMessage>> {
        self.ask(|reply| Command::ReplaceChat { messages, reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
