//! # Stage: Streaming Response Assembler
//!
//! ## Responsibility
//! Track AI responses that the server is still generating and turn each one
//! into exactly one committed [`Message`] when it completes.
//!
//! Four events per response, keyed by the server's message id:
//! `start` → `chunk`* → (`complete` | `error`). Chunks carry the cumulative
//! content so far, so each chunk replaces the working text.
//!
//! ## Guarantees
//! - Independent: any number of ids may be in flight; each is tracked alone
//! - Lossless on success: `complete` hands back the server's final message
//! - Nothing partial is ever committed: `error` and staleness discard the entry
//!
//! ## NOT Responsible For
//! - Inserting into the timeline (the session controller does that with what
//!   [`StreamAssembler::complete`] returns)
//! - Reconstructing chunks that arrived before a late `start`

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::SyncError;
use crate::model::{Message, MessageId, StreamMetadata, StreamingMessage};

/// What happened to a `start` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Same id already streaming; the existing entry is kept.
    AlreadyStreaming,
}

/// What happened to a `chunk` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Applied,
    /// No working entry for the id (its `start` was lost or is late).
    Dropped,
}

/// Working set of in-flight AI responses.
#[derive(Debug, Default, Clone)]
pub struct StreamAssembler {
    working: BTreeMap<MessageId, StreamingMessage>,
    dropped_chunks: u64,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new response with empty content.
    pub fn start(&mut self, id: MessageId, room_id: String, metadata: StreamMetadata, now_ms: u64) -> StartOutcome {
        if self.working.contains_key(&id) {
            debug!(target: "roomsync::streaming", id = %id, "duplicate start ignored");
            return StartOutcome::AlreadyStreaming;
        }
        self.working.insert(
            id.clone(),
            StreamingMessage {
                id,
                room_id,
                partial_content: String::new(),
                started_at: now_ms,
                updated_at: now_ms,
                metadata,
            },
        );
        StartOutcome::Started
    }

    /// Replace the working content with the cumulative text so far.
    pub fn chunk(&mut self, id: &str, full_content_so_far: String, now_ms: u64) -> ChunkOutcome {
        match self.working.get_mut(id) {
            Some(entry) => {
                entry.partial_content = full_content_so_far;
                entry.updated_at = now_ms;
                ChunkOutcome::Applied
            }
            None => {
                self.dropped_chunks += 1;
                warn!(
                    target: "roomsync::streaming",
                    id = %id,
                    dropped_chunks = self.dropped_chunks,
                    "chunk for unknown stream dropped"
                );
                ChunkOutcome::Dropped
            }
        }
    }

    /// Retire the working entry and return the message to commit.
    ///
    /// A `complete` whose `start` never arrived still yields the final message;
    /// the timeline's dedup makes committing it safe.
    pub fn complete(&mut self, id: &str, final_message: Message) -> Message {
        if self.working.remove(id).is_none() {
            debug!(target: "roomsync::streaming", id = %id, "complete without a working entry");
        }
        final_message
    }

    /// Discard the working entry. Returns the error to surface to the user.
    pub fn fail(&mut self, id: &str, error_info: &str) -> SyncError {
        let partial_len = self.working.remove(id).map(|e| e.partial_content.len()).unwrap_or(0);
        warn!(
            target: "roomsync::streaming",
            id = %id,
            partial_len,
            error = %error_info,
            "streaming response failed, partial content discarded"
        );
        SyncError::Streaming { id: id.to_string(), message: error_info.to_string() }
    }

    /// Discard entries idle for longer than `stale_after`.
    pub fn expire_stale(&mut self, now_ms: u64, stale_after: Duration) -> Vec<SyncError> {
        let limit = stale_after.as_millis() as u64;
        let stale: Vec<MessageId> = self
            .working
            .values()
            .filter(|e| now_ms.saturating_sub(e.updated_at) > limit)
            .map(|e| e.id.clone())
            .collect();
        stale
            .into_iter()
            .map(|id| self.fail(&id, "response timed out"))
            .collect()
    }

    /// Drop a working entry without surfacing anything (the id was committed
    /// through another path).
    pub fn forget(&mut self, id: &str) -> bool {
        self.working.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&StreamingMessage> {
        self.working.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.working.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.working.len()
    }

    pub fn is_empty(&self) -> bool {
        self.working.is_empty()
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks
    }

    pub fn snapshot(&self) -> BTreeMap<MessageId, StreamingMessage> {
        self.working.clone()
    }

    pub fn clear(&mut self) {
        self.working.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageKind;
    use crate::timeline::TimelineStore;

    fn final_msg(id: &str, text: &str) -> Message {
        Message {
            kind: MessageKind::Ai { text: text.into(), model: None },
            ..Message::text(id, "R1", "bot", 1_000, "")
        }
    }

    fn started(id: &str) -> StreamAssembler {
        let mut a = StreamAssembler::new();
        a.start(id.into(), "R1".into(), StreamMetadata::default(), 0);
        a
    }

    #[test]
    fn test_start_registers_empty_entry() {
        let a = started("m1");
        assert_eq!(a.get("m1").unwrap().partial_content, "");
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_duplicate_start_keeps_existing_content() {
        let mut a = started("m1");
        a.chunk("m1", "Hello".into(), 1);
        assert_eq!(
            a.start("m1".into(), "R1".into(), StreamMetadata::default(), 2),
            StartOutcome::AlreadyStreaming
        );
        assert_eq!(a.get("m1").unwrap().partial_content, "Hello");
    }

    #[test]
    fn test_chunk_replaces_not_appends() {
        let mut a = started("m1");
        a.chunk("m1", "Hel".into(), 1);
        a.chunk("m1", "Hello wor".into(), 2);
        assert_eq!(a.get("m1").unwrap().partial_content, "Hello wor");
    }

    #[test]
    fn test_chunk_unknown_id_is_dropped() {
        let mut a = StreamAssembler::new();
        assert_eq!(a.chunk("ghost", "x".into(), 1), ChunkOutcome::Dropped);
        assert!(a.is_empty());
        assert_eq!(a.dropped_chunks(), 1);
    }

    #[test]
    fn test_late_start_does_not_resurrect_dropped_chunks() {
        let mut a = StreamAssembler::new();
        a.chunk("m1", "lost text".into(), 1);
        a.start("m1".into(), "R1".into(), StreamMetadata::default(), 2);
        assert_eq!(a.get("m1").unwrap().partial_content, "");
    }

    #[test]
    fn test_start_chunk_chunk_complete_commits_once() {
        let mut a = started("m1");
        let mut store = TimelineStore::default();
        a.chunk("m1", "Hi".into(), 1);
        a.chunk("m1", "Hi there".into(), 2);
        let committed = a.complete("m1", final_msg("m1", "Hi there"));
        store.append_live(committed, None);
        assert!(a.is_empty());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("m1").unwrap().kind.body(), "Hi there");
    }

    #[test]
    fn test_start_chunk_error_commits_nothing() {
        let mut a = started("m1");
        a.chunk("m1", "partial".into(), 1);
        let err = a.fail("m1", "model overloaded");
        assert!(a.is_empty());
        assert!(matches!(err, SyncError::Streaming { ref id, .. } if id == "m1"));
    }

    #[test]
    fn test_complete_without_start_still_returns_message() {
        let mut a = StreamAssembler::new();
        let m = a.complete("m1", final_msg("m1", "done"));
        assert_eq!(m.id, "m1");
    }

    #[test]
    fn test_concurrent_streams_are_independent() {
        let mut a = started("m1");
        a.start("m2".into(), "R1".into(), StreamMetadata::default(), 0);
        a.chunk("m2", "two".into(), 1);
        a.chunk("m1", "one".into(), 1);
        a.fail("m2", "boom");
        assert_eq!(a.get("m1").unwrap().partial_content, "one");
        assert!(!a.contains("m2"));
    }

    #[test]
    fn test_expire_stale_discards_idle_entries() {
        let mut a = started("old");
        a.start("fresh".into(), "R1".into(), StreamMetadata::default(), 9_000);
        let errors = a.expire_stale(10_000, Duration::from_secs(5));
        assert_eq!(errors.len(), 1);
        assert!(!a.contains("old"));
        assert!(a.contains("fresh"));
    }

    #[test]
    fn test_chunk_refreshes_staleness_clock() {
        let mut a = started("m1");
        a.chunk("m1", "still going".into(), 8_000);
        assert!(a.expire_stale(10_000, Duration::from_secs(5)).is_empty());
    }
}
