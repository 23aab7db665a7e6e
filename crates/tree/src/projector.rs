use serde::{Deserialize, Serialize};

use super::ids::{MessageId, OPENING_STATEMENT_ID};
use super::message::{Message, SiblingPosition};
use super::tree::{ActiveBranches, ConversationTree};

/// What to do at a branch point that has several children and no recorded choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedBranch {
    /// Follow the most recently created child.
    #[default]
    Latest,
    /// End the path at the branch point.
    Stop,
}

/// Flattens the tree into the linear sequence the active branch selection implies.
///
/// Pure: the same tree and branch map always produce the same sequence.
pub fn project(
    tree: &ConversationTree,
    branches: &ActiveBranches,
    policy: UnresolvedBranch,
) -> Vec<Message> {
    let mut path = Vec::new();
    let mut parent: Option<&MessageId> = None;

    loop {
        let level = tree.children_of(parent);
        let Some(next) = choose_child(level, branches.get(parent), policy) else {
            break;
        };
        let Some(message) = tree.get(next) else {
            break;
        };

        let mut projected = message.clone();
        if projected.is_answer() {
            projected.sibling_position = variant_position(tree, message);
        }
        path.push(projected);
        parent = Some(next);
    }

    path
}

fn choose_child<'a>(
    level: &'a [MessageId],
    chosen: Option<&MessageId>,
    policy: UnresolvedBranch,
) -> Option<&'a MessageId> {
    if let Some(chosen) = chosen
        && let Some(found) = level.iter().find(|child| *child == chosen)
    {
        return Some(found);
    }

    match level {
        [] => None,
        [only] => Some(only),
        _ => match policy {
            UnresolvedBranch::Latest => level.last(),
            UnresolvedBranch::Stop => None,
        },
    }
}

/// Position of an answer among the variants a user can page through.
///
/// Variants are either sibling answers under one question, or (when each regeneration
/// produced its own question under the same parent) the first answer of every sibling
/// question.
fn variant_position(tree: &ConversationTree, answer: &Message) -> SiblingPosition {
    if answer.sibling_position.count > 1 {
        return answer.sibling_position.clone();
    }
    let Some(question) = answer.parent_id.as_ref().and_then(|id| tree.get(id)) else {
        return answer.sibling_position.clone();
    };

    let sibling_questions = tree.children_of(question.parent_id.as_ref());
    if sibling_questions.len() <= 1 {
        return answer.sibling_position.clone();
    }

    let variants = sibling_questions
        .iter()
        .filter_map(|question_id| {
            tree.children(question_id)
                .iter()
                .find(|child| tree.get(child).is_some_and(Message::is_answer))
                .cloned()
        })
        .collect::<Vec<_>>();

    match variants.iter().position(|variant| *variant == answer.id) {
        Some(index) => SiblingPosition::within(&variants, index),
        None => answer.sibling_position.clone(),
    }
}

/// Last answer on the path that can anchor a follow-up question.
pub fn last_valid_answer(path: &[Message]) -> Option<&Message> {
    path.iter()
        .rev()
        .find(|message| message.is_valid_generated_answer())
}

/// True when the path is a lone opening statement in a conversation that does not exist
/// yet; the welcome screen already shows it, so it is rendered only once.
pub fn suppress_opening_statement(path: &[Message], is_new_conversation: bool) -> bool {
    is_new_conversation && matches!(path, [only] if only.is_opening_statement())
}

pub fn visible_messages(path: &[Message], is_new_conversation: bool) -> &[Message] {
    if suppress_opening_statement(path, is_new_conversation) {
        &[]
    } else {
        path
    }
}

/// Puts the configured opening statement on the path, replacing the content of an
/// existing opening-statement node or prepending a synthetic one.
pub fn with_opening_statement(
    mut path: Vec<Message>,
    statement: impl Into<String>,
) -> Vec<Message> {
    let statement = statement.into();
    match path.iter_mut().find(|message| message.is_opening_statement()) {
        Some(existing) => existing.content = statement,
        None => path.insert(
            0,
            Message::opening_statement(MessageId::new(OPENING_STATEMENT_ID), statement),
        ),
    }
    path
}

/// Substitutes `{{key}}` placeholders. Unknown keys are left verbatim.
pub fn fill_placeholders(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find("}}") else {
            rendered.push_str(&rest[start..]);
            return rendered;
        };

        let key = &tail[..end];
        match lookup(key.trim()) {
            Some(value) => rendered.push_str(&value),
            None => {
                rendered.push_str("{{");
                rendered.push_str(key);
                rendered.push_str("}}");
            }
        }
        rest = &tail[end + 2..];
    }

    rendered.push_str(rest);
    rendered
}
