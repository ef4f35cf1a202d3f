//! # Stage: Reaction / Read-Receipt Reconciler
//!
//! ## Responsibility
//! Apply reaction changes to the timeline optimistically, remember how to undo
//! them, and settle them against what the server later says. Track which
//! messages the local user has seen long enough to mark as read.
//!
//! ## Guarantees
//! - Reversible: every optimistic change records the exact reaction map it
//!   replaced; a rejection or missed confirmation restores that map
//! - Server wins: a server reaction update replaces the local map wholesale
//! - One-shot reads: each message yields at most one acknowledged
//!   mark-as-read intent for the local user
//!
//! ## NOT Responsible For
//! - Sending intents (the session controller emits them)
//! - Timers (expiry runs when the controller's sweep calls [`ReactionReconciler::expire`])

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::{MessageId, ReactionMap, UserId};
use crate::timeline::TimelineStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReactionOp {
    Add,
    Remove,
}

/// An optimistic change awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReaction {
    pub token: u64,
    pub message_id: MessageId,
    pub emoji: String,
    pub op: ReactionOp,
    /// Reaction map of the message before this change was applied.
    pub snapshot: ReactionMap,
    pub issued_at: u64,
}

/// Apply `op` for `user_id` to `map`. Returns whether the map changed.
pub fn apply_op(map: &mut ReactionMap, user_id: &str, emoji: &str, op: ReactionOp) -> bool {
    match op {
        ReactionOp::Add => map.entry(emoji.to_string()).or_default().insert(user_id.to_string()),
        ReactionOp::Remove => {
            let Some(users) = map.get_mut(emoji) else {
                return false;
            };
            let removed = users.remove(user_id);
            if users.is_empty() {
                map.remove(emoji);
            }
            removed
        }
    }
}

fn reflects(map: &ReactionMap, user_id: &str, emoji: &str, op: ReactionOp) -> bool {
    let present = map.get(emoji).map(|u| u.contains(user_id)).unwrap_or(false);
    match op {
        ReactionOp::Add => present,
        ReactionOp::Remove => !present,
    }
}

// ---------------------------------------------------------------------------
// ReactionReconciler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReactionReconciler {
    user_id: UserId,
    pending: HashMap<u64, PendingReaction>,
    next_token: u64,
    reads: ReadTracker,
}

impl ReactionReconciler {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            pending: HashMap::new(),
            next_token: 1,
            reads: ReadTracker::default(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Mutate the store entry now and record how to undo it.
    ///
    /// Returns the pending token, or `None` when the change was already in
    /// effect (nothing to send).
    pub fn apply_optimistic(
        &mut self,
        store: &mut TimelineStore,
        message_id: &str,
        emoji: &str,
        op: ReactionOp,
        now_ms: u64,
    ) -> Result<Option<u64>> {
        let map = store
            .reactions_mut(message_id)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.to_string()))?;
        let snapshot = map.clone();
        if !apply_op(map, &self.user_id, emoji, op) {
            return Ok(None);
        }
        let token = self.next_token;
        self.next_token += 1;
        self.pending.insert(
            token,
            PendingReaction {
                token,
                message_id: message_id.to_string(),
                emoji: emoji.to_string(),
                op,
                snapshot,
                issued_at: now_ms,
            },
        );
        Ok(Some(token))
    }

    /// Replace the local map with the server's version.
    ///
    /// Pending changes the update reflects are retired. The rest are rebased:
    /// their snapshot becomes the server map and the change is re-applied on
    /// top, still waiting for confirmation.
    pub fn on_server_update(&mut self, store: &mut TimelineStore, message_id: &str, reactions: ReactionMap) -> bool {
        let Some(map) = store.reactions_mut(message_id) else {
            return false;
        };
        *map = reactions;

        let mut tokens: Vec<u64> = self
            .pending
            .values()
            .filter(|p| p.message_id == message_id)
            .map(|p| p.token)
            .collect();
        tokens.sort_unstable();

        for token in tokens {
            let Some(p) = self.pending.get_mut(&token) else { continue };
            if reflects(map, &self.user_id, &p.emoji, p.op) {
                debug!(target: "roomsync::reactions", message_id, emoji = %p.emoji, "reaction confirmed");
                self.pending.remove(&token);
            } else {
                p.snapshot = map.clone();
                apply_op(map, &self.user_id, &p.emoji, p.op);
            }
        }
        true
    }

    /// Undo the pending change for `(message_id, emoji)` after a rejection.
    pub fn on_rejection(&mut self, store: &mut TimelineStore, message_id: &str, emoji: &str) -> Option<SyncError> {
        let token = self
            .pending
            .values()
            .filter(|p| p.message_id == message_id && p.emoji == emoji)
            .map(|p| p.token)
            .max()?;
        self.rollback(store, token)
    }

    /// Undo a pending change by token. Used for rejections, emit failures and
    /// expired confirmation windows.
    pub fn rollback(&mut self, store: &mut TimelineStore, token: u64) -> Option<SyncError> {
        let p = self.pending.remove(&token)?;
        if let Some(map) = store.reactions_mut(&p.message_id) {
            *map = p.snapshot;
        }
        // Later changes on the same message were recorded on top of this one.
        self.pending.retain(|_, other| other.message_id != p.message_id || other.token < p.token);
        debug!(
            target: "roomsync::reactions",
            message_id = %p.message_id,
            emoji = %p.emoji,
            "optimistic reaction rolled back"
        );
        Some(SyncError::ReactionConflict { message_id: p.message_id, emoji: p.emoji })
    }

    /// Roll back every change whose confirmation window has passed.
    pub fn expire(&mut self, store: &mut TimelineStore, now_ms: u64, window: Duration) -> Vec<SyncError> {
        let limit = window.as_millis() as u64;
        let mut expired: Vec<u64> = self
            .pending
            .values()
            .filter(|p| now_ms.saturating_sub(p.issued_at) >= limit)
            .map(|p| p.token)
            .collect();
        expired.sort_unstable();
        expired
            .into_iter()
            .filter_map(|token| self.rollback(store, token))
            .collect()
    }

    pub fn pending(&self, token: u64) -> Option<&PendingReaction> {
        self.pending.get(&token)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn reads(&self) -> &ReadTracker {
        &self.reads
    }

    pub fn reads_mut(&mut self) -> &mut ReadTracker {
        &mut self.reads
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.reads = ReadTracker::default();
    }
}

// ---------------------------------------------------------------------------
// ReadTracker
// ---------------------------------------------------------------------------

/// Visibility dwell bookkeeping for the local user's read receipts.
#[derive(Debug, Clone, Default)]
pub struct ReadTracker {
    visible_since: HashMap<MessageId, u64>,
    requested: HashSet<MessageId>,
    acknowledged: HashSet<MessageId>,
}

impl ReadTracker {
    pub fn mark_visible(&mut self, message_id: &str, now_ms: u64) {
        if self.is_settled(message_id) {
            return;
        }
        self.visible_since.entry(message_id.to_string()).or_insert(now_ms);
    }

    pub fn mark_hidden(&mut self, message_id: &str) {
        self.visible_since.remove(message_id);
    }

    /// Messages visible for at least `dwell` that still need a mark-as-read
    /// intent. Returned ids move to the requested set and are not returned again.
    pub fn take_due(&mut self, store: &TimelineStore, user_id: &str, now_ms: u64, dwell: Duration) -> Vec<MessageId> {
        let limit = dwell.as_millis() as u64;
        let mut due: BTreeSet<MessageId> = BTreeSet::new();
        self.visible_since.retain(|id, _| store.contains(id));
        for (id, since) in &self.visible_since {
            if now_ms.saturating_sub(*since) < limit {
                continue;
            }
            let Some(message) = store.get(id) else { continue };
            if message.sender_id == user_id || message.is_read_by(user_id) {
                self.acknowledged.insert(id.clone());
                continue;
            }
            due.insert(id.clone());
        }
        self.visible_since.retain(|id, _| !due.contains(id) && !self.acknowledged.contains(id));
        self.requested.extend(due.iter().cloned());
        due.into_iter().collect()
    }

    /// The intent could not be sent; let the ids become due again.
    pub fn release(&mut self, ids: &[MessageId]) {
        for id in ids {
            self.requested.remove(id);
        }
    }

    pub fn acknowledge(&mut self, ids: &[MessageId]) {
        for id in ids {
            self.requested.remove(id);
            self.visible_since.remove(id);
            self.acknowledged.insert(id.clone());
        }
    }

    pub fn is_settled(&self, message_id: &str) -> bool {
        self.requested.contains(message_id) || self.acknowledged.contains(message_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
