use std::path::PathBuf;

use arbor_tree::TreeError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("conversation tree rejected `{stage}`: {source}"))]
    Tree {
        stage: &'static str,
        source: TreeError,
    },
    #[snafu(display("chat transport failed on `{stage}`: {message}"))]
    Transport {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("suggested questions for '{message_id}' failed: {message}"))]
    SuggestedQuestions {
        stage: &'static str,
        message_id: String,
        message: String,
    },
    #[snafu(display("human input form submission failed: {message}"))]
    FormSubmission {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("no human input form service is configured"))]
    FormServiceMissing { stage: &'static str },
    #[snafu(display("failed to decode conversation history on `{stage}`: {source}"))]
    DecodeHistory {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to read {path:?} on `{stage}`: {source}"))]
    ReadFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
