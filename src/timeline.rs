//! # Stage: Message Timeline Store
//!
//! ## Responsibility
//! Hold the committed messages of one room in display order, merge live
//! arrivals and history pages into that order, and do the scroll bookkeeping
//! the view needs to keep its position stable.
//!
//! ## Guarantees
//! - Unique: no two entries share a message id; re-delivery is a silent no-op
//! - Ordered: entries are sorted by `(timestamp, arrival sequence)`
//! - Append-only: entries leave the store only through [`TimelineStore::reset`]
//! - Only `reactions` and `readers` of an entry can be mutated after insertion
//!
//! ## NOT Responsible For
//! - Talking to the server (the session controller fetches pages)
//! - Rendering or measuring the viewport (the view reports [`ViewportMetrics`])

use std::collections::HashSet;

use crate::model::{Message, MessageId, ReactionMap, ReadReceipt, ViewportMetrics};

/// Default bottom-edge threshold in pixels.
pub const DEFAULT_BOTTOM_THRESHOLD_PX: f64 = 100.0;

// ---------------------------------------------------------------------------
// Scroll anchor
// ---------------------------------------------------------------------------

/// Viewport position captured before an older page is requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    pub scroll_height: f64,
    pub scroll_top: f64,
}

impl ScrollAnchor {
    pub fn capture(viewport: &ViewportMetrics) -> Self {
        Self { scroll_height: viewport.scroll_height, scroll_top: viewport.scroll_top }
    }

    /// New `scrollTop` that keeps the previously visible content in place once
    /// the prepended page has rendered at `new_scroll_height`.
    pub fn restore(&self, new_scroll_height: f64) -> f64 {
        let height_diff = new_scroll_height - self.scroll_height;
        self.scroll_top + height_diff
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of [`TimelineStore::append_live`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted { scroll_to_bottom: bool },
    Duplicate,
}

impl AppendOutcome {
    pub fn inserted(&self) -> bool {
        matches!(self, AppendOutcome::Inserted { .. })
    }
}

/// Result of [`TimelineStore::merge_history_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Entries actually added (duplicates excluded).
    pub added: usize,
    pub has_more: bool,
}

// ---------------------------------------------------------------------------
// TimelineStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    message: Message,
}

impl Entry {
    fn key(&self) -> (u64, u64) {
        (self.message.timestamp, self.seq)
    }
}

/// Ordered, deduplicated messages of one room.
#[derive(Debug, Clone)]
pub struct TimelineStore {
    entries: Vec<Entry>,
    seen: HashSet<MessageId>,
    next_seq: u64,
    has_more: bool,
    bottom_threshold_px: f64,
}

impl Default for TimelineStore {
    fn default() -> Self {
        Self::new(DEFAULT_BOTTOM_THRESHOLD_PX)
    }
}

impl TimelineStore {
    pub fn new(bottom_threshold_px: f64) -> Self {
        Self {
            entries: Vec::new(),
            seen: HashSet::new(),
            next_seq: 0,
            has_more: true,
            bottom_threshold_px,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Insert one newly-arrived message.
    ///
    /// `viewport` is the last position the view reported; when it was within the
    /// bottom threshold the outcome asks the view to follow the new message.
    pub fn append_live(&mut self, message: Message, viewport: Option<&ViewportMetrics>) -> AppendOutcome {
        if !self.seen.insert(message.id.clone()) {
            return AppendOutcome::Duplicate;
        }
        let entry = Entry { seq: self.next_seq(), message };
        let key = entry.key();
        let pos = self.entries.partition_point(|e| e.key() <= key);
        self.entries.insert(pos, entry);

        let scroll_to_bottom = viewport
            .map(|v| v.is_near_bottom(self.bottom_threshold_px))
            .unwrap_or(true);
        AppendOutcome::Inserted { scroll_to_bottom }
    }

    /// Merge a page of history into the store.
    ///
    /// Already-seen ids (and repeats inside the page) are dropped, the union is
    /// re-sorted, and `has_more` is recorded and returned. `is_initial_page`
    /// marks the newest page of a (re)load; any live messages that arrived
    /// before it are kept.
    pub fn merge_history_page(&mut self, messages: Vec<Message>, has_more: bool, is_initial_page: bool) -> MergeOutcome {
        let page_len = messages.len();
        let mut added = 0;
        for message in messages {
            if !self.seen.insert(message.id.clone()) {
                continue;
            }
            let seq = self.next_seq();
            self.entries.push(Entry { seq, message });
            added += 1;
        }
        if added > 0 {
            self.entries.sort_by_key(Entry::key);
        }
        // An older page with no messages at all means the start was reached.
        // A page of duplicates only means it overlapped what is loaded.
        self.has_more = if !is_initial_page && page_len == 0 { false } else { has_more };
        MergeOutcome { added, has_more: self.has_more }
    }

    /// Timestamp boundary for the next older page, `None` when nothing is loaded.
    pub fn pagination_cursor(&self) -> Option<u64> {
        self.entries.first().map(|e| e.message.timestamp)
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.entries.iter().find(|e| e.message.id == id).map(|e| &e.message)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> + '_ {
        self.entries.iter().map(|e| &e.message)
    }

    /// Owned copy in display order, for publishing to observers.
    pub fn snapshot(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    /// Mutable access to the reaction map of an entry.
    pub fn reactions_mut(&mut self, id: &str) -> Option<&mut ReactionMap> {
        self.entries
            .iter_mut()
            .find(|e| e.message.id == id)
            .map(|e| &mut e.message.reactions)
    }

    /// Record that `receipt.user_id` has read message `id`. Returns false when
    /// the message is unknown or the user had already read it.
    pub fn add_reader(&mut self, id: &str, receipt: ReadReceipt) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.message.id == id) else {
            return false;
        };
        if entry.message.is_read_by(&receipt.user_id) {
            return false;
        }
        entry.message.readers.push(receipt);
        true
    }

    /// Drop everything. Used by manual cleanup and forced logout.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.seen.clear();
        self.next_seq = 0;
        self.has_more = true;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn msg(id: &str, ts: u64) -> Message {
        Message::text(id, "R1", "u2", ts, format!("body {id}"))
    }

    fn ids(store: &TimelineStore) -> Vec<String> {
        store.iter().map(|m| m.id.clone()).collect()
    }

    fn bottom() -> ViewportMetrics {
        ViewportMetrics { scroll_top: 900.0, scroll_height: 1_000.0, client_height: 100.0 }
    }

    fn scrolled_up() -> ViewportMetrics {
        ViewportMetrics { scroll_top: 100.0, scroll_height: 1_000.0, client_height: 100.0 }
    }

    // -- append_live ----------------------------------------------------------

    #[test]
    fn test_append_live_inserts_in_timestamp_order() {
        let mut store = TimelineStore::default();
        store.append_live(msg("b", 200), None);
        store.append_live(msg("a", 100), None);
        store.append_live(msg("c", 300), None);
        assert_eq!(ids(&store), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_append_live_duplicate_is_noop() {
        let mut store = TimelineStore::default();
        assert!(store.append_live(msg("a", 100), None).inserted());
        assert_eq!(store.append_live(msg("a", 100), None), AppendOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_append_live_ties_keep_arrival_order() {
        let mut store = TimelineStore::default();
        store.append_live(msg("first", 100), None);
        store.append_live(msg("second", 100), None);
        store.append_live(msg("third", 100), None);
        assert_eq!(ids(&store), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_append_live_near_bottom_requests_scroll() {
        let mut store = TimelineStore::new(50.0);
        let out = store.append_live(msg("a", 1), Some(&bottom()));
        assert_eq!(out, AppendOutcome::Inserted { scroll_to_bottom: true });
    }

    #[test]
    fn test_append_live_scrolled_up_keeps_position() {
        let mut store = TimelineStore::new(50.0);
        let out = store.append_live(msg("a", 1), Some(&scrolled_up()));
        assert_eq!(out, AppendOutcome::Inserted { scroll_to_bottom: false });
    }

    // -- merge_history_page ---------------------------------------------------

    #[test]
    fn test_history_merge_example_scenario() {
        let mut store = TimelineStore::default();
        store.merge_history_page(vec![msg("1", 100), msg("3", 300)], true, true);
        let out = store.merge_history_page(vec![msg("2", 200)], true, false);
        assert_eq!(out.added, 1);
        assert_eq!(ids(&store), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_history_merge_filters_seen_ids() {
        let mut store = TimelineStore::default();
        store.append_live(msg("a", 100), None);
        let out = store.merge_history_page(vec![msg("a", 100), msg("b", 50)], true, false);
        assert_eq!(out.added, 1);
        assert_eq!(ids(&store), vec!["b", "a"]);
    }

    #[test]
    fn test_history_merge_filters_repeats_within_page() {
        let mut store = TimelineStore::default();
        let out = store.merge_history_page(vec![msg("a", 1), msg("a", 1)], false, true);
        assert_eq!(out.added, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_history_merge_returns_has_more() {
        let mut store = TimelineStore::default();
        assert!(store.merge_history_page(vec![msg("a", 1)], true, true).has_more);
        assert!(!store.merge_history_page(vec![msg("b", 0)], false, false).has_more);
        assert!(!store.has_more());
    }

    #[test]
    fn test_empty_older_page_ends_pagination() {
        let mut store = TimelineStore::default();
        store.merge_history_page(vec![msg("a", 1)], true, true);
        let out = store.merge_history_page(vec![], true, false);
        assert!(!out.has_more);
    }

    #[test]
    fn test_page_of_duplicates_keeps_server_has_more() {
        let mut store = TimelineStore::default();
        store.merge_history_page(vec![msg("a", 10), msg("b", 20)], true, true);
        let out = store.merge_history_page(vec![msg("a", 10)], true, false);
        assert_eq!(out.added, 0);
        assert!(out.has_more);
        assert!(store.has_more());
    }

    #[test]
    fn test_initial_page_keeps_live_messages() {
        let mut store = TimelineStore::default();
        store.append_live(msg("live", 500), None);
        store.merge_history_page(vec![msg("old", 100)], false, true);
        assert_eq!(ids(&store), vec!["old", "live"]);
    }

    // -- cursor ---------------------------------------------------------------

    #[test]
    fn test_cursor_none_when_empty() {
        assert_eq!(TimelineStore::default().pagination_cursor(), None);
    }

    #[test]
    fn test_cursor_is_oldest_timestamp() {
        let mut store = TimelineStore::default();
        store.append_live(msg("b", 200), None);
        store.append_live(msg("a", 150), None);
        assert_eq!(store.pagination_cursor(), Some(150));
    }

    // -- mutation / reset -----------------------------------------------------

    #[test]
    fn test_reactions_mut_only_for_known_ids() {
        let mut store = TimelineStore::default();
        store.append_live(msg("a", 1), None);
        store.reactions_mut("a").unwrap().entry("👍".into()).or_default().insert("u1".into());
        assert!(store.reactions_mut("zzz").is_none());
        assert_eq!(store.get("a").unwrap().reactions["👍"].len(), 1);
    }

    #[test]
    fn test_add_reader_once_per_user() {
        let mut store = TimelineStore::default();
        store.append_live(msg("a", 1), None);
        assert!(store.add_reader("a", ReadReceipt { user_id: "u1".into(), read_at: 5 }));
        assert!(!store.add_reader("a", ReadReceipt { user_id: "u1".into(), read_at: 6 }));
        assert_eq!(store.get("a").unwrap().readers.len(), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut store = TimelineStore::default();
        store.append_live(msg("a", 1), None);
        store.merge_history_page(vec![], false, true);
        store.reset();
        assert!(store.is_empty());
        assert!(!store.contains("a"));
        assert!(store.has_more());
        assert!(store.append_live(msg("a", 1), None).inserted());
    }

    // -- scroll anchor --------------------------------------------------------

    #[test]
    fn test_scroll_anchor_adds_height_delta() {
        let anchor = ScrollAnchor::capture(&ViewportMetrics {
            scroll_top: 40.0,
            scroll_height: 2_000.0,
            client_height: 600.0,
        });
        assert_eq!(anchor.restore(2_750.0), 790.0);
    }

    #[test]
    fn test_scroll_anchor_empty_page_is_identity() {
        let anchor = ScrollAnchor { scroll_height: 1_200.0, scroll_top: 0.0 };
        assert_eq!(anchor.restore(1_200.0), 0.0);
    }

    // -- properties -----------------------------------------------------------

    #[derive(Debug, Clone)]
    enum Op {
        Live(u8),
        Page(Vec<u8>),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..40).prop_map(Op::Live),
            proptest::collection::vec(0u8..40, 0..8).prop_map(Op::Page),
        ]
    }

    // The server gives each id exactly one timestamp; several ids share one.
    fn canonical(id: u8) -> Message {
        msg(&format!("m{id}"), u64::from(id) * 7 % 23)
    }

    proptest! {
        #[test]
        fn prop_timeline_unique_and_sorted(ops in proptest::collection::vec(op_strategy(), 0..40)) {
            let mut store = TimelineStore::default();
            for op in ops {
                match op {
                    Op::Live(id) => { store.append_live(canonical(id), None); }
                    Op::Page(items) => {
                        let page = items.into_iter().map(canonical).collect();
                        store.merge_history_page(page, true, false);
                    }
                }
            }
            let all: Vec<&Message> = store.iter().collect();
            let unique: HashSet<&str> = all.iter().map(|m| m.id.as_str()).collect();
            prop_assert_eq!(unique.len(), all.len());
            prop_assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }

        #[test]
        fn prop_same_id_twice_yields_one_entry(id in 0u8..40, live_first in any::<bool>()) {
            let mut store = TimelineStore::default();
            let m = canonical(id);
            if live_first {
                store.append_live(m.clone(), None);
                store.merge_history_page(vec![m.clone()], true, false);
            } else {
                store.merge_history_page(vec![m.clone()], true, true);
                store.append_live(m.clone(), None);
            }
            prop_assert_eq!(store.iter().filter(|x| x.id == m.id).count(), 1);
        }

        #[test]
        fn prop_scroll_anchor_preserves_offset(
            top in 0.0f64..5_000.0,
            height in 0.0f64..20_000.0,
            page in 0usize..200,
            row in 1.0f64..120.0,
        ) {
            let anchor = ScrollAnchor { scroll_height: height, scroll_top: top };
            let added = page as f64 * row;
            let new_top = anchor.restore(height + added);
            prop_assert!((new_top - (top + added)).abs() < 1e-6);
        }
    }
}
