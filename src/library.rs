//! Persistence of the user's library: profiles, API definitions, code files,
//! saved sessions and sidebar settings.
//!
//! Everything is stored as JSON text behind a [`KeyValueStore`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::catalog::{ApiDefinition, CodeFile, DispatchContext, UserProfile};
use crate::chat::{ChatMessage, ChatRole};
use crate::error::{Result, ResultExt, StudioError};
use crate::session::Round;
use crate::settings::StudioSettings;

pub const PROFILES_KEY: &str = "gemini-studio.profiles";
pub const APIS_KEY: &str = "gemini-studio.apis";
pub const CODE_FILES_KEY: &str = "gemini-studio.code-files";
pub const HISTORY_KEY: &str = "gemini-studio.history";
pub const SETTINGS_KEY: &str = "gemini-studio.settings";

const PREVIEW_CHARS: usize = 50;

/// Load/save collaborator for persisted state.
pub trait KeyValueStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn save(&self, key: &str, value: &str) -> Result<()>;
}

/// In-process store, used for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StudioError::Context("memory store poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StudioError::Context("memory store poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One `<key>.json` file per key inside a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(format!("creating {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KeyValueStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    #[default]
    Studio,
    Chat,
}

/// An archived session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSession {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: SessionKind,
    pub timestamp: DateTime<Utc>,
    pub preview: String,
    #[serde(default)]
    pub rounds: Vec<Round>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chat: Vec<ChatMessage>,
}

impl SavedSession {
    /// Archive `rounds` (newest first), previewed by the oldest prompt.
    pub fn from_rounds(rounds: Vec<Round>) -> Self {
        let preview = rounds
            .last()
            .map(|r| r.prompt.chars().take(PREVIEW_CHARS).collect::<String>())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "Studio Session".to_string());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: SessionKind::Studio,
            timestamp: Utc::now(),
            preview,
            rounds,
            chat: Vec::new(),
        }
    }

    /// Archive a chat log, previewed by its first user message.
    pub fn from_chat(chat: Vec<ChatMessage>) -> Self {
        let preview = chat
            .iter()
            .find(|m| m.role == ChatRole::User)
            .and_then(ChatMessage::text)
            .map(|text| text.chars().take(PREVIEW_CHARS).collect::<String>())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "Chat Session".to_string());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: SessionKind::Chat,
            timestamp: Utc::now(),
            preview,
            rounds: Vec::new(),
            chat,
        }
    }
}

/// Typed access to the persisted library.
#[derive(Clone)]
pub struct Library {
    store: Arc<dyn KeyValueStore>,
}

impl Library {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Corrupt entries are logged and treated as empty.
    fn load_list<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        let Some(text) = self.store.load(key)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&text) {
            Ok(items) => Ok(items),
            Err(err) => {
                warn!(key, "Discarding unreadable library entry: {}", err);
                Ok(Vec::new())
            }
        }
    }

    fn save_list<T: Serialize>(&self, key: &str, items: &[T]) -> Result<()> {
        self.store.save(key, &serde_json::to_string(items)?)
    }

    pub fn profiles(&self) -> Result<Vec<UserProfile>> {
        self.load_list(PROFILES_KEY)
    }

    /// Insert or update a profile. A profile without an id gets a fresh one.
    pub fn save_profile(&self, mut profile: UserProfile) -> Result<UserProfile> {
        if profile.id.is_empty() {
            profile.id = uuid::Uuid::new_v4().to_string();
        }
        let mut profiles = self.profiles()?;
        upsert(&mut profiles, profile.clone(), |p| &p.id);
        self.save_list(PROFILES_KEY, &profiles)?;
        Ok(profile)
    }

    pub fn delete_profile(&self, id: &str) -> Result<bool> {
        let mut profiles = self.profiles()?;
        let removed = remove(&mut profiles, id, |p| &p.id);
        if removed {
            self.save_list(PROFILES_KEY, &profiles)?;
        }
        Ok(removed)
    }

    pub fn apis(&self) -> Result<Vec<ApiDefinition>> {
        self.load_list(APIS_KEY)
    }

    pub fn save_api(&self, mut api: ApiDefinition) -> Result<ApiDefinition> {
        if api.id.is_empty() {
            api.id = uuid::Uuid::new_v4().to_string();
        }
        let mut apis = self.apis()?;
        upsert(&mut apis, api.clone(), |a| &a.id);
        self.save_list(APIS_KEY, &apis)?;
        Ok(api)
    }

    /// Delete an API definition and unbind it from every profile.
    pub fn delete_api(&self, id: &str) -> Result<bool> {
        let mut apis = self.apis()?;
        if !remove(&mut apis, id, |a| &a.id) {
            return Ok(false);
        }
        self.save_list(APIS_KEY, &apis)?;

        let mut profiles = self.profiles()?;
        let mut unlinked = 0;
        for profile in profiles.iter_mut().filter(|p| p.api_id.as_deref() == Some(id)) {
            profile.api_id = None;
            unlinked += 1;
        }
        if unlinked > 0 {
            debug!(api_id = id, unlinked, "Unbound deleted API from profiles");
            self.save_list(PROFILES_KEY, &profiles)?;
        }
        Ok(true)
    }

    pub fn code_files(&self) -> Result<Vec<CodeFile>> {
        self.load_list(CODE_FILES_KEY)
    }

    pub fn save_code_file(&self, mut file: CodeFile) -> Result<CodeFile> {
        if file.id.is_empty() {
            file.id = uuid::Uuid::new_v4().to_string();
        }
        let mut files = self.code_files()?;
        upsert(&mut files, file.clone(), |f| &f.id);
        self.save_list(CODE_FILES_KEY, &files)?;
        Ok(file)
    }

    /// Delete a code file and detach it from every profile.
    pub fn delete_code_file(&self, id: &str) -> Result<bool> {
        let mut files = self.code_files()?;
        if !remove(&mut files, id, |f| &f.id) {
            return Ok(false);
        }
        self.save_list(CODE_FILES_KEY, &files)?;

        let mut profiles = self.profiles()?;
        let mut changed = false;
        for profile in &mut profiles {
            let before = profile.code_file_ids.len();
            profile.code_file_ids.retain(|f| f != id);
            changed |= profile.code_file_ids.len() != before;
        }
        if changed {
            self.save_list(PROFILES_KEY, &profiles)?;
        }
        Ok(true)
    }

    pub fn history(&self) -> Result<Vec<SavedSession>> {
        self.load_list(HISTORY_KEY)
    }

    /// Add a session to the front of the history.
    pub fn push_history(&self, session: SavedSession) -> Result<()> {
        let mut history = self.history()?;
        history.insert(0, session);
        self.save_list(HISTORY_KEY, &history)
    }

    pub fn delete_history(&self, id: &str) -> Result<bool> {
        let mut history = self.history()?;
        let removed = remove(&mut history, id, |s| &s.id);
        if removed {
            self.save_list(HISTORY_KEY, &history)?;
        }
        Ok(removed)
    }

    pub fn settings(&self) -> Result<StudioSettings> {
        let Some(text) = self.store.load(SETTINGS_KEY)? else {
            return Ok(StudioSettings::default());
        };
        Ok(serde_json::from_str(&text).unwrap_or_else(|err| {
            warn!("Discarding unreadable settings: {}", err);
            StudioSettings::default()
        }))
    }

    pub fn save_settings(&self, settings: &StudioSettings) -> Result<()> {
        self.store.save(SETTINGS_KEY, &serde_json::to_string(settings)?)
    }

    /// Snapshot everything config resolution needs.
    pub fn dispatch_context(&self) -> Result<DispatchContext> {
        Ok(DispatchContext {
            settings: self.settings()?,
            profiles: self.profiles()?,
            apis: self.apis()?,
            code_files: self.code_files()?,
        })
    }

    pub fn export_profiles(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.profiles()?)?)
    }

    /// Export one profile as `(file name, pretty JSON)`.
    pub fn export_profile(&self, id: &str) -> Result<(String, String)> {
        let profile = self
            .profiles()?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| StudioError::NotFound {
                kind: "profile",
                id: id.to_string(),
            })?;
        let slug = profile
            .name
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-");
        Ok((format!("{slug}.json"), serde_json::to_string_pretty(&profile)?))
    }

    /// Import one profile object or an array of them.
    ///
    /// Entries without a name, system instruction and model are skipped, as are
    /// ids already present. Returns how many profiles were added.
    pub fn import_profiles(&self, json: &str) -> Result<usize> {
        let value: Value = serde_json::from_str(json)?;
        let candidates = match value {
            Value::Array(items) => items,
            other => vec![other],
        };

        let mut profiles = self.profiles()?;
        let mut added = 0;
        for candidate in candidates {
            let mut profile: UserProfile = match serde_json::from_value(candidate) {
                Ok(p) => p,
                Err(err) => {
                    warn!("Skipping invalid profile on import: {}", err);
                    continue;
                }
            };
            if profile.name.is_empty()
                || profile.system_instruction.is_empty()
                || profile.model.is_empty()
            {
                warn!(name = %profile.name, "Skipping incomplete profile on import");
                continue;
            }
            if profile.id.is_empty() {
                profile.id = uuid::Uuid::new_v4().to_string();
            }
            if profiles.iter().any(|p| p.id == profile.id) {
                continue;
            }
            profiles.push(profile);
            added += 1;
        }

        if added > 0 {
            self.save_list(PROFILES_KEY, &profiles)?;
        }
        Ok(added)
    }
}

fn upsert<T>(items: &mut Vec<T>, item: T, id: impl Fn(&T) -> &String) {
    match items.iter().position(|existing| id(existing) == id(&item)) {
        Some(idx) => items[idx] = item,
        None => items.push(item),
    }
}

fn remove<T>(items: &mut Vec<T>, target: &str, id: impl Fn(&T) -> &String) -> bool {
    let before = items.len();
    items.retain(|item| id(item) != target);
    items.len() != before
}
