use std::collections::HashMap;

use snafu::{OptionExt, ensure};

use super::error::{
    AnswerAlreadyPresentSnafu, DuplicateIdSnafu, InvalidParentSnafu, NotFoundSnafu,
    RoleMismatchSnafu, TreeResult, UnknownSiblingSnafu,
};
use super::ids::MessageId;
use super::message::{ContentUpdate, FileRef, Message, MessageStatus, Role, SiblingPosition};

#[derive(Debug, Clone)]
struct TreeNode {
    message: Message,
    children: Vec<MessageId>,
}

/// Arena holding every branch ever produced for one conversation.
///
/// Nodes are keyed by id and reference each other through `parent_id` and ordered child
/// id lists, so walking up or down never needs back-pointers. Nodes are never removed.
#[derive(Debug, Clone, Default)]
pub struct ConversationTree {
    nodes: HashMap<MessageId, TreeNode>,
    roots: Vec<MessageId>,
}

impl ConversationTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.nodes.get(id).map(|node| &node.message)
    }

    pub fn roots(&self) -> &[MessageId] {
        &self.roots
    }

    pub fn children(&self, id: &MessageId) -> &[MessageId] {
        self.nodes
            .get(id)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
    }

    /// Children of a parent slot, where `None` is the root level.
    pub fn children_of(&self, parent: Option<&MessageId>) -> &[MessageId] {
        match parent {
            Some(parent_id) => self.children(parent_id),
            None => &self.roots,
        }
    }

    pub fn parent_of(&self, id: &MessageId) -> Option<&MessageId> {
        self.get(id).and_then(|message| message.parent_id.as_ref())
    }

    /// Inserts a fully built message under `message.parent_id`.
    pub fn insert(&mut self, message: Message) -> TreeResult<MessageId> {
        ensure!(
            !self.nodes.contains_key(&message.id),
            DuplicateIdSnafu {
                stage: "tree-insert",
                id: message.id.clone(),
            }
        );

        let id = message.id.clone();
        let parent = message.parent_id.clone();
        match &parent {
            Some(parent_id) => {
                let parent_node = self.nodes.get_mut(parent_id).context(InvalidParentSnafu {
                    stage: "tree-insert",
                    parent_id: parent_id.clone(),
                })?;
                parent_node.children.push(id.clone());
            }
            None => self.roots.push(id.clone()),
        }

        self.nodes.insert(
            id.clone(),
            TreeNode {
                message,
                children: Vec::new(),
            },
        );
        self.refresh_sibling_positions(parent.as_ref());
        Ok(id)
    }

    pub fn append_question(
        &mut self,
        parent_id: Option<&MessageId>,
        content: impl Into<String>,
        files: Vec<FileRef>,
    ) -> TreeResult<MessageId> {
        let mut question = Message::question(MessageId::question_placeholder(), content)
            .with_files(files);
        question.parent_id = parent_id.cloned();
        self.insert(question)
    }

    /// Creates the first answer under a question.
    pub fn append_answer(
        &mut self,
        question_id: &MessageId,
        initial_content: impl Into<String>,
    ) -> TreeResult<MessageId> {
        self.expect_role(question_id, Role::Question, "append-answer")?;
        let has_answer = self.children(question_id).iter().any(|child| {
            self.get(child)
                .map(|message| message.is_answer())
                .unwrap_or(false)
        });
        ensure!(
            !has_answer,
            AnswerAlreadyPresentSnafu {
                stage: "append-answer",
                question_id: question_id.clone(),
            }
        );
        self.insert_answer(question_id, initial_content.into())
    }

    /// Adds a regenerated answer next to the existing ones.
    pub fn append_answer_variant(
        &mut self,
        question_id: &MessageId,
        content: impl Into<String>,
    ) -> TreeResult<MessageId> {
        self.expect_role(question_id, Role::Question, "append-answer-variant")?;
        self.insert_answer(question_id, content.into())
    }

    fn insert_answer(&mut self, question_id: &MessageId, content: String) -> TreeResult<MessageId> {
        let mut answer = Message::answer(MessageId::answer_placeholder(), content)
            .with_status(MessageStatus::Streaming);
        answer.parent_id = Some(question_id.clone());
        self.insert(answer)
    }

    pub fn mutate_answer_content(
        &mut self,
        id: &MessageId,
        update: ContentUpdate,
    ) -> TreeResult<()> {
        self.expect_role(id, Role::Answer, "mutate-answer-content")?;
        self.update(id, |message| message.apply_content(update))
    }

    /// Mutates node content in place. Structure fields (`id`, `parent_id`) must be left
    /// untouched; use [`ConversationTree::rename`] to change an id.
    pub fn update(&mut self, id: &MessageId, mutate: impl FnOnce(&mut Message)) -> TreeResult<()> {
        let node = self.nodes.get_mut(id).context(NotFoundSnafu {
            stage: "tree-update",
            id: id.clone(),
        })?;
        mutate(&mut node.message);
        Ok(())
    }

    /// Replaces a placeholder id with the id the server assigned, rewriting every
    /// structural reference to it.
    pub fn rename(&mut self, old_id: &MessageId, new_id: MessageId) -> TreeResult<()> {
        if *old_id == new_id {
            return Ok(());
        }
        ensure!(
            !self.nodes.contains_key(&new_id),
            DuplicateIdSnafu {
                stage: "tree-rename",
                id: new_id.clone(),
            }
        );
        let mut node = self.nodes.remove(old_id).context(NotFoundSnafu {
            stage: "tree-rename",
            id: old_id.clone(),
        })?;
        node.message.id = new_id.clone();
        let parent = node.message.parent_id.clone();
        for child_id in &node.children {
            if let Some(child) = self.nodes.get_mut(child_id) {
                child.message.parent_id = Some(new_id.clone());
            }
        }
        self.nodes.insert(new_id.clone(), node);

        let siblings = match &parent {
            Some(parent_id) => self
                .nodes
                .get_mut(parent_id)
                .map(|parent_node| &mut parent_node.children),
            None => Some(&mut self.roots),
        };
        if let Some(siblings) = siblings
            && let Some(slot) = siblings.iter_mut().find(|sibling| **sibling == *old_id)
        {
            *slot = new_id;
        }
        self.refresh_sibling_positions(parent.as_ref());
        Ok(())
    }

    /// Ids from the root down to `id`, inclusive.
    pub fn path_to(&self, id: &MessageId) -> TreeResult<Vec<MessageId>> {
        let mut path = Vec::new();
        let mut cursor = Some(id.clone());
        while let Some(current) = cursor {
            let message = self.get(&current).context(NotFoundSnafu {
                stage: "tree-path-to",
                id: current.clone(),
            })?;
            cursor = message.parent_id.clone();
            path.push(current);
        }
        path.reverse();
        Ok(path)
    }

    /// Pre-order depth-first walk: roots in order, each subtree fully before the next sibling.
    pub fn dfs_preorder(&self) -> Vec<&Message> {
        let mut visited = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&MessageId> = self.roots.iter().rev().collect();
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            visited.push(&node.message);
            stack.extend(node.children.iter().rev());
        }
        visited
    }

    pub(crate) fn ensure_child_of(
        &self,
        parent: Option<&MessageId>,
        child_id: &MessageId,
        stage: &'static str,
    ) -> TreeResult<()> {
        ensure!(
            self.children_of(parent).contains(child_id),
            UnknownSiblingSnafu {
                stage,
                parent: describe_slot(parent),
                child_id: child_id.clone(),
            }
        );
        Ok(())
    }

    fn expect_role(&self, id: &MessageId, expected: Role, stage: &'static str) -> TreeResult<()> {
        let message = self.get(id).context(NotFoundSnafu {
            stage,
            id: id.clone(),
        })?;
        ensure!(
            message.role == expected,
            RoleMismatchSnafu {
                stage,
                id: id.clone(),
                expected,
                actual: message.role,
            }
        );
        Ok(())
    }

    fn refresh_sibling_positions(&mut self, parent: Option<&MessageId>) {
        let siblings = self.children_of(parent).to_vec();
        for (index, sibling_id) in siblings.iter().enumerate() {
            if let Some(node) = self.nodes.get_mut(sibling_id) {
                node.message.sibling_position = SiblingPosition::within(&siblings, index);
            }
        }
    }
}

pub(crate) fn describe_slot(parent: Option<&MessageId>) -> String {
    match parent {
        Some(parent_id) => format!("message '{parent_id}'"),
        None => "the root level".to_string(),
    }
}

/// Sparse record of which child is the active branch below each parent slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveBranches {
    chosen: HashMap<Option<MessageId>, MessageId>,
}

impl ActiveBranches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chosen.is_empty()
    }

    pub fn get(&self, parent: Option<&MessageId>) -> Option<&MessageId> {
        self.chosen.get(&parent.cloned())
    }

    pub fn set(
        &mut self,
        tree: &ConversationTree,
        parent: Option<&MessageId>,
        child_id: &MessageId,
    ) -> TreeResult<()> {
        tree.ensure_child_of(parent, child_id, "set-active-child")?;
        self.chosen.insert(parent.cloned(), child_id.clone());
        Ok(())
    }

    pub fn clear(&mut self) {
        self.chosen.clear();
    }

    pub(crate) fn rename(&mut self, old_id: &MessageId, new_id: &MessageId) {
        if let Some(child) = self.chosen.remove(&Some(old_id.clone())) {
            self.chosen.insert(Some(new_id.clone()), child);
        }
        for child in self.chosen.values_mut() {
            if child == old_id {
                *child = new_id.clone();
            }
        }
    }
}
