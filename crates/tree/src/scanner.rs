use super::ids::MessageId;
use super::tree::ConversationTree;

/// First node, in pre-order depth-first order, whose workflow run is waiting on human input.
pub fn find_paused_workflow_node(tree: &ConversationTree) -> Option<MessageId> {
    tree.dfs_preorder()
        .into_iter()
        .find(|message| message.is_paused_workflow())
        .map(|message| message.id.clone())
}

/// Ensures the resumption scan runs at most once per hydrated tree.
///
/// Every hydration bumps the epoch; re-renders of the same tree reuse it and are refused.
#[derive(Debug, Clone, Default)]
pub struct ResumptionGuard {
    epoch: u64,
    scanned_epoch: Option<u64>,
}

impl ResumptionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a fresh tree; the next [`ResumptionGuard::begin`] call is allowed again.
    pub fn hydrated(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Returns `true` exactly once per hydration epoch.
    pub fn begin(&mut self) -> bool {
        if self.scanned_epoch == Some(self.epoch) {
            return false;
        }
        self.scanned_epoch = Some(self.epoch);
        true
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}
