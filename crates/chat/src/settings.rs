use std::path::{Path, PathBuf};
use std::sync::Arc;

use arbor_tree::UnresolvedBranch;
use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{
    CreateDirSnafu, RenameTempFileSnafu, SerializeConfigSnafu, SettingsError, WriteFileSnafu,
};

pub const SETTINGS_DIRECTORY_NAME: &str = "arbor";
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Where the chat app is mounted; decides the message endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppSourceType {
    #[default]
    WebApp,
    InstalledApp,
}

impl AppSourceType {
    pub fn chat_messages_endpoint(self, app_id: &str) -> String {
        match self {
            Self::WebApp => "chat-messages".to_string(),
            Self::InstalledApp => format!("installed-apps/{app_id}/chat-messages"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_source: AppSourceType,
    #[serde(default)]
    pub session_token: String,
    #[serde(default)]
    pub opening_statement: String,
    #[serde(default)]
    pub suggested_questions: Vec<String>,
    #[serde(default)]
    pub suggested_questions_after_answer: bool,
    #[serde(default = "default_file_upload_enabled")]
    pub file_upload_enabled: bool,
    #[serde(default)]
    pub unresolved_branch: UnresolvedBranch,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_source: AppSourceType::default(),
            session_token: String::new(),
            opening_statement: String::new(),
            suggested_questions: Vec::new(),
            suggested_questions_after_answer: false,
            file_upload_enabled: default_file_upload_enabled(),
            unresolved_branch: UnresolvedBranch::default(),
        }
    }
}

impl ChatSettings {
    pub fn endpoint(&self) -> String {
        self.app_source.chat_messages_endpoint(&self.app_id)
    }

    pub fn has_opening_statement(&self) -> bool {
        !self.opening_statement.is_empty()
    }

    pub fn normalized(mut self) -> Self {
        self.app_id = self.app_id.trim().to_string();
        self.session_token = self.session_token.trim().to_string();
        self.suggested_questions = self
            .suggested_questions
            .into_iter()
            .map(|question| question.trim().to_string())
            .filter(|question| !question.is_empty())
            .collect();
        self
    }
}

/// Chat settings shared with readers through an `ArcSwap` and mirrored to a JSON file.
pub struct SettingsStore {
    current: Arc<ArcSwap<ChatSettings>>,
    path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".arbor"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(path: PathBuf) -> Self {
        let initial = read_settings(&path);
        Self {
            current: Arc::new(ArcSwap::from_pointee(initial)),
            path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.current.load_full()
    }

    /// Normalizes, writes to disk, then publishes. Readers keep the old snapshot when the
    /// write fails.
    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let settings = settings.normalized();
        write_settings(&self.path, &settings)?;
        self.current.store(Arc::new(settings));
        Ok(())
    }

    /// Applies `edit` to a copy of the current settings and stores the result.
    pub fn modify(
        &self,
        edit: impl FnOnce(&mut ChatSettings),
    ) -> Result<Arc<ChatSettings>, SettingsError> {
        let mut next = ChatSettings::clone(&self.current.load());
        edit(&mut next);
        self.update(next)?;
        Ok(self.settings())
    }
}

fn read_settings(path: &Path) -> ChatSettings {
    if !path.is_file() {
        tracing::info!(path = %path.display(), "no chat settings file, using defaults");
        return ChatSettings::default();
    }

    Figment::from(Serialized::defaults(ChatSettings::default()))
        .merge(Json::file(path))
        .extract::<ChatSettings>()
        .map(ChatSettings::normalized)
        .unwrap_or_else(|error| {
            tracing::warn!(
                path = %path.display(),
                %error,
                "chat settings unreadable, using defaults"
            );
            ChatSettings::default()
        })
}

// Staged in a sibling file, then renamed over the live one.
fn write_settings(path: &Path, settings: &ChatSettings) -> Result<(), SettingsError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).context(CreateDirSnafu {
            stage: "create-chat-settings-dir",
            path: dir.to_path_buf(),
        })?;
    }

    let encoded = serde_json::to_vec_pretty(settings).context(SerializeConfigSnafu {
        stage: "encode-chat-settings",
    })?;
    let staging = path.with_extension(format!("json.{}.tmp", Uuid::now_v7()));
    std::fs::write(&staging, encoded).context(WriteFileSnafu {
        stage: "write-chat-settings-staging",
        path: staging.clone(),
    })?;
    std::fs::rename(&staging, path).context(RenameTempFileSnafu {
        stage: "commit-chat-settings",
        from: staging,
        to: path.to_path_buf(),
    })?;

    tracing::info!(path = %path.display(), app_id = %settings.app_id, "chat settings saved");
    Ok(())
}

fn default_file_upload_enabled() -> bool {
    true
}
