use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Every identifier wrapper shares one shape; server ids and local placeholders interchange.
macro_rules! define_tree_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

define_tree_id!(MessageId);
define_tree_id!(ConversationId);
define_tree_id!(WorkflowRunId);

pub const QUESTION_PREFIX: &str = "question-";
pub const ANSWER_PLACEHOLDER_PREFIX: &str = "answer-placeholder-";
pub const OPENING_STATEMENT_ID: &str = "opening-statement";

impl MessageId {
    /// Local id for a question that has not been acknowledged by the server yet.
    pub fn question_placeholder() -> Self {
        Self(format!("{QUESTION_PREFIX}{}", Uuid::now_v7()))
    }

    /// Local id for an answer whose first chunk has not arrived yet.
    pub fn answer_placeholder() -> Self {
        Self(format!("{ANSWER_PLACEHOLDER_PREFIX}{}", Uuid::now_v7()))
    }

    /// Question ids are derived from the answer id the server assigns.
    pub fn question_for_answer(answer_id: &MessageId) -> Self {
        Self(format!("{QUESTION_PREFIX}{answer_id}"))
    }

    pub fn is_answer_placeholder(&self) -> bool {
        self.0.starts_with(ANSWER_PLACEHOLDER_PREFIX)
    }
}
