use std::path::Path;

use arbor_tree::{ConversationTree, HistoryMessage, PersistedNode};
use serde::Deserialize;
use snafu::ResultExt;

use super::error::{ChatResult, DecodeHistorySnafu, ReadFileSnafu, TreeSnafu};

/// Shape of a stored conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryFormat {
    /// Flat, chronologically ordered exchanges linked by `parent_message_id`.
    #[default]
    Flat,
    /// Nested nodes with `children`, as cached by a previous session.
    Nested,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlatHistory {
    Envelope { data: Vec<HistoryMessage> },
    Bare(Vec<HistoryMessage>),
}

pub fn decode_tree(raw: &str, format: HistoryFormat) -> ChatResult<ConversationTree> {
    match format {
        HistoryFormat::Nested => {
            let nodes: Vec<PersistedNode> = serde_json::from_str(raw).context(DecodeHistorySnafu {
                stage: "decode-nested-history",
            })?;
            ConversationTree::hydrate(&nodes).context(TreeSnafu {
                stage: "hydrate-nested-history",
            })
        }
        HistoryFormat::Flat => {
            let history: FlatHistory = serde_json::from_str(raw).context(DecodeHistorySnafu {
                stage: "decode-flat-history",
            })?;
            let messages = match history {
                FlatHistory::Envelope { data } => data,
                FlatHistory::Bare(messages) => messages,
            };
            ConversationTree::from_history(&messages).context(TreeSnafu {
                stage: "hydrate-flat-history",
            })
        }
    }
}

/// Reads and decodes a stored conversation from disk.
pub fn read_tree(path: &Path, format: HistoryFormat) -> ChatResult<ConversationTree> {
    let raw = std::fs::read_to_string(path).context(ReadFileSnafu {
        stage: "read-history-file",
        path: path.to_path_buf(),
    })?;
    tracing::debug!(path = %path.display(), bytes = raw.len(), ?format, "read stored conversation");
    decode_tree(&raw, format)
}
