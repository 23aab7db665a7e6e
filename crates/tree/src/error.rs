use snafu::Snafu;

use super::ids::MessageId;
use super::message::Role;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TreeError {
    #[snafu(display("parent message '{parent_id}' is not part of the tree"))]
    InvalidParent {
        stage: &'static str,
        parent_id: MessageId,
    },
    #[snafu(display("message '{child_id}' is not a child of {parent}"))]
    UnknownSibling {
        stage: &'static str,
        parent: String,
        child_id: MessageId,
    },
    #[snafu(display("message '{id}' was not found"))]
    NotFound { stage: &'static str, id: MessageId },
    #[snafu(display("message '{id}' is a {actual:?}, expected {expected:?}"))]
    RoleMismatch {
        stage: &'static str,
        id: MessageId,
        expected: Role,
        actual: Role,
    },
    #[snafu(display("message id '{id}' already exists in the tree"))]
    DuplicateId { stage: &'static str, id: MessageId },
    #[snafu(display("question '{question_id}' already has an answer"))]
    AnswerAlreadyPresent {
        stage: &'static str,
        question_id: MessageId,
    },
}

pub type TreeResult<T> = Result<T, TreeError>;
