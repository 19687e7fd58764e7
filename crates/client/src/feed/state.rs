use std::cmp::Ordering;

use inbox_shared::{FeedPage, FeedType, Message};

/// Point-in-time copy of one feed, as handed to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSnapshot {
    pub feed: FeedType,
    pub messages: Vec<Message>,
    pub unread_count: u64,
    pub has_more: bool,
    pub is_loaded: bool,
    pub is_stale: bool,
}

/// Local view of one feed partition.
///
/// Messages are kept in feed order (newest first, ties by id) with no
/// duplicate ids. Once a page has been loaded, the window covers everything
/// from the newest message down to the oldest loaded one; pushes older than
/// that are left for pagination to pick up.
#[derive(Debug, Clone, Default)]
pub struct FeedState {
    messages: Vec<Message>,
    cursor: Option<String>,
    loaded: bool,
    stale: bool,
    /// Server snapshot received after a resync. Authoritative until the
    /// next first-page load, kept in step with local read changes.
    unread_override: Option<u64>,
    total_count: Option<u64>,
    generation: u64,
    loading_next: bool,
}

impl FeedState {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn has_more(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn total_count(&self) -> Option<u64> {
        self.total_count
    }

    pub fn unread_count(&self) -> u64 {
        self.unread_override
            .unwrap_or_else(|| self.messages.iter().filter(|m| !m.is_read()).count() as u64)
    }

    pub fn snapshot(&self, feed: &FeedType) -> FeedSnapshot {
        FeedSnapshot {
            feed: feed.clone(),
            messages: self.messages.clone(),
            unread_count: self.unread_count(),
            has_more: self.has_more(),
            is_loaded: self.loaded,
            is_stale: self.stale,
        }
    }

    /// Start a first-page load tagged with `generation`, which the caller
    /// keeps increasing. Earlier in-flight loads become stale.
    pub(crate) fn begin_reload(&mut self, generation: u64) -> u64 {
        self.generation = generation;
        self.loading_next = false;
        generation
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Claim the next-page slot. `None` when at the end, not loaded, or a
    /// next-page load is already running.
    pub(crate) fn begin_next_page(&mut self) -> Option<(u64, String)> {
        if !self.loaded || self.loading_next {
            return None;
        }
        let cursor = self.cursor.clone()?;
        self.loading_next = true;
        Some((self.generation, cursor))
    }

    pub(crate) fn finish_next_page(&mut self) {
        self.loading_next = false;
    }

    /// Replace the feed with a freshly loaded first page.
    pub fn replace_page(&mut self, page: FeedPage) {
        self.messages.clear();
        for message in page.messages {
            self.insert_sorted(message);
        }
        self.cursor = page.next_cursor;
        self.unread_override = None;
        self.total_count = page.total_count;
        self.loaded = true;
        self.stale = false;
    }

    /// Merge a following page. Ids already present are kept as they are,
    /// since pushes may have updated them after the page was produced.
    /// Returns how many messages were added.
    pub fn append_page(&mut self, page: FeedPage) -> usize {
        let mut added = 0;
        for message in page.messages {
            if !self.contains(&message.id) {
                self.insert_sorted(message);
                added += 1;
            }
        }
        self.cursor = page.next_cursor;
        if page.total_count.is_some() {
            self.total_count = page.total_count;
        }
        added
    }

    /// Whether a message not yet present falls inside the loaded window.
    pub fn in_window(&self, message: &Message) -> bool {
        if !self.loaded {
            return false;
        }
        if !self.has_more() {
            return true;
        }
        match self.messages.last() {
            Some(oldest) => Message::feed_order(message, oldest) != Ordering::Greater,
            None => false,
        }
    }

    /// Insert or replace. New messages are only taken when they fall inside
    /// the loaded window. Returns whether the feed changed.
    pub fn upsert(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            self.replace_existing(message)
        } else if self.in_window(&message) {
            self.adjust_unread(None, Some(&message));
            self.insert_sorted(message);
            true
        } else {
            false
        }
    }

    /// Replace a message only if it is already present and different.
    pub fn replace_existing(&mut self, message: Message) -> bool {
        match self.get(&message.id) {
            Some(existing) if *existing != message => {}
            _ => return false,
        }
        if let Some(before) = self.take(&message.id) {
            self.adjust_unread(Some(&before), Some(&message));
        }
        self.insert_sorted(message);
        true
    }

    /// Put back a message this feed held before, ignoring the window.
    pub(crate) fn reinsert(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return self.replace_existing(message);
        }
        self.adjust_unread(None, Some(&message));
        self.insert_sorted(message);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let removed = self.take(id)?;
        self.adjust_unread(Some(&removed), None);
        Some(removed)
    }

    pub fn set_unread_override(&mut self, count: u64) {
        self.unread_override = Some(count);
    }

    pub(crate) fn unread_override(&self) -> Option<u64> {
        self.unread_override
    }

    pub(crate) fn restore_unread_override(&mut self, count: Option<u64>) {
        self.unread_override = count;
    }

    pub fn mark_stale(&mut self) {
        if self.loaded {
            self.stale = true;
        }
    }

    /// Check ordering and uniqueness. Used by tests.
    pub fn check_invariants(&self) -> Result<(), String> {
        for pair in self.messages.windows(2) {
            if Message::feed_order(&pair[0], &pair[1]) != Ordering::Less {
                return Err(format!("{} is not before {}", pair[0].id, pair[1].id));
            }
        }
        let mut ids: Vec<&str> = self.messages.iter().map(|m| m.id.as_str()).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err("duplicate message id".to_string());
        }
        Ok(())
    }

    fn take(&mut self, id: &str) -> Option<Message> {
        let index = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(index))
    }

    fn insert_sorted(&mut self, message: Message) {
        if let Some(index) = self.messages.iter().position(|m| m.id == message.id) {
            self.messages.remove(index);
        }
        let index = match self
            .messages
            .binary_search_by(|probe| Message::feed_order(probe, &message))
        {
            Ok(index) | Err(index) => index,
        };
        self.messages.insert(index, message);
    }

    fn adjust_unread(&mut self, before: Option<&Message>, after: Option<&Message>) {
        let Some(count) = self.unread_override else {
            return;
        };
        let was_unread = before.is_some_and(|m| !m.is_read());
        let is_unread = after.is_some_and(|m| !m.is_read());
        self.unread_override = Some(match (was_unread, is_unread) {
            (false, true) => count + 1,
            (true, false) => count.saturating_sub(1),
            _ => count,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            feed_type: FeedType::Inbox,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            read_at: None,
            archived_at: None,
            payload: serde_json::Value::Null,
        }
    }

    fn page(messages: Vec<Message>, cursor: Option<&str>, unread: u64) -> FeedPage {
        FeedPage {
            messages,
            next_cursor: cursor.map(str::to_string),
            unread_count: unread,
            total_count: None,
        }
    }

    fn ids(state: &FeedState) -> Vec<&str> {
        state.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn replace_sorts_and_dedups() {
        let mut state = FeedState::default();
        state.replace_page(page(
            vec![message("a", 1), message("c", 3), message("b", 2), message("c", 3)],
            Some("next"),
            3,
        ));
        assert_eq!(ids(&state), vec!["c", "b", "a"]);
        assert!(state.has_more());
        assert_eq!(state.unread_count(), 3);
        state.check_invariants().unwrap();
    }

    #[test]
    fn append_skips_known_ids() {
        let mut state = FeedState::default();
        state.replace_page(page(vec![message("c", 3), message("b", 2)], Some("p2"), 2));
        let added = state.append_page(page(vec![message("b", 2), message("a", 1)], None, 2));
        assert_eq!(added, 1);
        assert_eq!(ids(&state), vec!["c", "b", "a"]);
        assert!(!state.has_more());
    }

    #[test]
    fn pushes_outside_window_are_ignored() {
        let mut state = FeedState::default();
        assert!(!state.upsert(message("x", 5)), "unloaded feed takes nothing");

        state.replace_page(page(vec![message("c", 30), message("b", 20)], Some("p2"), 2));
        assert!(!state.upsert(message("old", 10)));
        assert!(state.upsert(message("new", 40)));
        assert_eq!(ids(&state), vec!["new", "c", "b"]);
        assert_eq!(state.unread_count(), 3);
    }

    #[test]
    fn unread_count_matches_loaded_entries_across_pages() {
        let mut state = FeedState::default();
        state.replace_page(page(vec![message("d", 40), message("c", 30)], Some("p2"), 2));
        assert_eq!(state.unread_count(), 2);

        state.append_page(page(vec![message("b", 20), message("a", 10)], None, 2));
        assert_eq!(state.len(), 4);
        assert_eq!(state.unread_count(), 4);
    }

    #[test]
    fn server_page_count_is_not_trusted() {
        let mut state = FeedState::default();
        state.replace_page(page(vec![message("a", 1)], Some("p2"), 10));
        assert_eq!(state.unread_count(), 1);
    }

    #[test]
    fn unread_override_follows_read_changes_until_reload() {
        let mut state = FeedState::default();
        state.replace_page(page(vec![message("a", 1)], Some("p2"), 1));
        state.set_unread_override(10);

        let mut read = message("a", 1);
        read.read_at = Some(Utc.timestamp_opt(2, 0).unwrap());
        assert!(state.upsert(read));
        assert_eq!(state.unread_count(), 9);

        state.remove("a");
        assert_eq!(state.unread_count(), 9, "removing a read message keeps the count");

        state.replace_page(page(vec![message("b", 3)], None, 0));
        assert_eq!(state.unread_count(), 1, "a reload drops the snapshot");
    }

    #[test]
    fn reinsert_ignores_the_window() {
        let mut state = FeedState::default();
        state.replace_page(page(vec![message("c", 30), message("b", 20)], Some("p2"), 2));
        assert!(!state.upsert(message("a", 10)));
        assert!(state.reinsert(message("a", 10)));
        assert_eq!(ids(&state), vec!["c", "b", "a"]);
        assert_eq!(state.unread_count(), 3);
    }

    #[test]
    fn next_page_slot_is_exclusive() {
        let mut state = FeedState::default();
        assert!(state.begin_next_page().is_none());
        state.replace_page(page(vec![message("a", 1)], Some("p2"), 1));
        let (generation, cursor) = state.begin_next_page().unwrap();
        assert_eq!(cursor, "p2");
        assert!(state.begin_next_page().is_none());
        assert!(state.begin_reload(generation + 1) > generation);
        assert!(state.begin_next_page().is_some(), "reload frees the slot");
    }

    #[test]
    fn stale_only_applies_to_loaded_feeds() {
        let mut state = FeedState::default();
        state.mark_stale();
        assert!(!state.is_stale());
        state.replace_page(page(vec![], None, 0));
        state.mark_stale();
        assert!(state.is_stale());
        state.replace_page(page(vec![], None, 0));
        assert!(!state.is_stale());
    }
}
