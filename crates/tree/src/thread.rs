use super::error::TreeResult;
use super::ids::MessageId;
use super::message::{ContentUpdate, FileRef, Message};
use super::projector::{UnresolvedBranch, project};
use super::tree::{ActiveBranches, ConversationTree};

/// One conversation's tree together with its active branch choices.
///
/// Every append moves the active path onto the new node, so the projected path always
/// ends at the most recent interaction until the user switches siblings.
#[derive(Debug, Clone, Default)]
pub struct ConversationThread {
    tree: ConversationTree,
    branches: ActiveBranches,
    policy: UnresolvedBranch,
}

impl ConversationThread {
    pub fn new(policy: UnresolvedBranch) -> Self {
        Self {
            tree: ConversationTree::new(),
            branches: ActiveBranches::new(),
            policy,
        }
    }

    pub fn from_tree(tree: ConversationTree, policy: UnresolvedBranch) -> Self {
        Self {
            tree,
            branches: ActiveBranches::new(),
            policy,
        }
    }

    pub fn tree(&self) -> &ConversationTree {
        &self.tree
    }

    pub fn branches(&self) -> &ActiveBranches {
        &self.branches
    }

    pub fn policy(&self) -> UnresolvedBranch {
        self.policy
    }

    pub fn set_policy(&mut self, policy: UnresolvedBranch) {
        self.policy = policy;
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.tree.get(id)
    }

    pub fn append_question(
        &mut self,
        parent_id: Option<&MessageId>,
        content: impl Into<String>,
        files: Vec<FileRef>,
    ) -> TreeResult<MessageId> {
        let id = self.tree.append_question(parent_id, content, files)?;
        self.activate(&id)?;
        Ok(id)
    }

    pub fn append_answer(
        &mut self,
        question_id: &MessageId,
        initial_content: impl Into<String>,
    ) -> TreeResult<MessageId> {
        let id = self.tree.append_answer(question_id, initial_content)?;
        self.activate(&id)?;
        Ok(id)
    }

    pub fn append_answer_variant(
        &mut self,
        question_id: &MessageId,
        content: impl Into<String>,
    ) -> TreeResult<MessageId> {
        let id = self.tree.append_answer_variant(question_id, content)?;
        self.activate(&id)?;
        Ok(id)
    }

    /// Inserts a prebuilt message and makes it the active child of its parent.
    pub fn insert(&mut self, message: Message) -> TreeResult<MessageId> {
        let id = self.tree.insert(message)?;
        self.activate(&id)?;
        Ok(id)
    }

    pub fn mutate_answer_content(
        &mut self,
        id: &MessageId,
        update: ContentUpdate,
    ) -> TreeResult<()> {
        self.tree.mutate_answer_content(id, update)
    }

    pub fn update(&mut self, id: &MessageId, mutate: impl FnOnce(&mut Message)) -> TreeResult<()> {
        self.tree.update(id, mutate)
    }

    pub fn rename(&mut self, old_id: &MessageId, new_id: MessageId) -> TreeResult<()> {
        self.tree.rename(old_id, new_id.clone())?;
        self.branches.rename(old_id, &new_id);
        Ok(())
    }

    pub fn set_active_child(
        &mut self,
        parent_id: Option<&MessageId>,
        child_id: &MessageId,
    ) -> TreeResult<()> {
        self.branches.set(&self.tree, parent_id, child_id)
    }

    /// Points every ancestor's active child at the path leading to `id`.
    pub fn activate_path(&mut self, id: &MessageId) -> TreeResult<()> {
        let path = self.tree.path_to(id)?;
        let mut parent: Option<&MessageId> = None;
        for node_id in &path {
            self.branches.set(&self.tree, parent, node_id)?;
            parent = Some(node_id);
        }
        tracing::debug!(target_id = %id, depth = path.len(), "activated branch path");
        Ok(())
    }

    fn activate(&mut self, id: &MessageId) -> TreeResult<()> {
        let parent = self.tree.parent_of(id).cloned();
        self.branches.set(&self.tree, parent.as_ref(), id)
    }

    pub fn project(&self) -> Vec<Message> {
        project(&self.tree, &self.branches, self.policy)
    }

    pub fn leaf(&self) -> Option<Message> {
        self.project().pop()
    }

    /// Drops every node and branch choice; used when a new conversation starts.
    pub fn reset(&mut self) {
        self.tree = ConversationTree::new();
        self.branches.clear();
    }
}
