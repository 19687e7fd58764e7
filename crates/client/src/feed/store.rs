use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use inbox_shared::{ApiError, FeedPage, FeedType, InboxError, Message, PageRequest, ServerEvent};

use super::state::{FeedSnapshot, FeedState};
use crate::api_client::InboxBackend;
use crate::config::ClientConfig;
use crate::listeners::{InboxEvent, ListenerRegistry};
use crate::lock;
use crate::session::{SessionGate, SessionObserver, SessionTicket};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

struct Feeds {
    current: FeedType,
    feeds: HashMap<FeedType, FeedState>,
    /// Last first-page generation handed out. Survives resets.
    generation: u64,
}

impl Default for Feeds {
    fn default() -> Self {
        Self {
            current: FeedType::Inbox,
            feeds: HashMap::new(),
            generation: 0,
        }
    }
}

fn is_refile_pair(a: &FeedType, b: &FeedType) -> bool {
    matches!(
        (a, b),
        (FeedType::Inbox, FeedType::Archive) | (FeedType::Archive, FeedType::Inbox)
    )
}

impl Feeds {
    fn reset(&mut self) {
        *self = Feeds {
            generation: self.generation,
            ..Feeds::default()
        };
    }

    fn begin_reload(&mut self, feed: &FeedType) -> u64 {
        self.generation += 1;
        let generation = self.generation;
        self.feeds.entry(feed.clone()).or_default().begin_reload(generation)
    }

    /// Feeds currently holding a message.
    fn holders(&self, id: &str) -> Vec<FeedType> {
        self.feeds
            .iter()
            .filter(|(_, state)| state.contains(id))
            .map(|(feed, _)| feed.clone())
            .collect()
    }

    /// Look in the current feed first, then anywhere else.
    fn find(&self, id: &str) -> Option<&Message> {
        self.feeds
            .get(&self.current)
            .and_then(|state| state.get(id))
            .or_else(|| self.feeds.values().find_map(|state| state.get(id)))
    }

    /// Put the latest version of a message where it belongs: upserted into
    /// its home feed, moved out of the other side of the inbox/archive pair,
    /// refreshed anywhere else it already appears.
    fn place(&mut self, message: Message) -> Vec<FeedType> {
        let home = message.feed_type.refile(&message);
        let mut changed = Vec::new();
        for (feed, state) in self.feeds.iter_mut() {
            let touched = if *feed == home {
                state.upsert(message.clone())
            } else if is_refile_pair(feed, &home) {
                state.remove(&message.id).is_some()
            } else {
                state.replace_existing(message.clone())
            };
            if touched {
                changed.push(feed.clone());
            }
        }
        changed
    }

    /// Like `place`, but a message missing from a feed in `held_in` that it
    /// still belongs to is put back there even outside the loaded window.
    fn put_back(&mut self, message: Message, held_in: &[FeedType]) -> Vec<FeedType> {
        let home = message.feed_type.refile(&message);
        let mut changed = self.place(message.clone());
        for feed in held_in {
            if *feed != home && is_refile_pair(feed, &home) {
                continue;
            }
            let Some(state) = self.feeds.get_mut(feed) else {
                continue;
            };
            if state.is_loaded() && !state.contains(&message.id) && state.reinsert(message.clone()) {
                changed.push(feed.clone());
            }
        }
        changed
    }

    fn remove_everywhere(&mut self, id: &str) -> Vec<FeedType> {
        self.feeds
            .iter_mut()
            .filter_map(|(feed, state)| state.remove(id).map(|_| feed.clone()))
            .collect()
    }

    fn unread_counts(&self) -> HashMap<FeedType, u64> {
        self.feeds
            .iter()
            .map(|(feed, state)| (feed.clone(), state.unread_count()))
            .collect()
    }

    fn events_for(
        &self,
        mut changed: Vec<FeedType>,
        before: &HashMap<FeedType, u64>,
    ) -> Vec<InboxEvent> {
        changed.sort();
        changed.dedup();
        let mut events = Vec::new();
        for feed in changed {
            let Some(state) = self.feeds.get(&feed) else {
                continue;
            };
            let count = state.unread_count();
            events.push(InboxEvent::FeedChanged(state.snapshot(&feed)));
            if before.get(&feed) != Some(&count) {
                events.push(InboxEvent::UnreadCountChanged { feed, count });
            }
        }
        events
    }
}

/// What `mark_all_read` changed locally, for rollback.
#[derive(Default)]
pub(crate) struct MarkAllRead {
    pub priors: Vec<Message>,
    previous_override: Option<u64>,
}

/// A message as it was before a local edit, and the feeds that held it.
pub(crate) struct LocalEdit {
    pub prior: Message,
    pub held_in: Vec<FeedType>,
}

/// All feed partitions of the current session.
///
/// Every change publishes `FeedChanged` for each touched feed, plus
/// `UnreadCountChanged` when the count moved. Responses are applied only if
/// the session that requested them is still current.
pub struct FeedStore {
    backend: Arc<dyn InboxBackend>,
    listeners: ListenerRegistry,
    gate: SessionGate,
    page_size: u32,
    request_timeout: Duration,
    page_load_retries: u32,
    feeds: Mutex<Feeds>,
}

impl FeedStore {
    pub fn new(
        config: &ClientConfig,
        backend: Arc<dyn InboxBackend>,
        listeners: ListenerRegistry,
        gate: SessionGate,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            listeners,
            gate,
            page_size: config.page_size,
            request_timeout: config.request_timeout,
            page_load_retries: config.page_load_retries,
            feeds: Mutex::new(Feeds::default()),
        })
    }

    pub fn current_feed(&self) -> FeedType {
        lock(&self.feeds).current.clone()
    }

    pub fn snapshot(&self, feed: &FeedType) -> FeedSnapshot {
        lock(&self.feeds)
            .feeds
            .get(feed)
            .map(|state| state.snapshot(feed))
            .unwrap_or_else(|| FeedState::default().snapshot(feed))
    }

    pub fn unread_count(&self, feed: &FeedType) -> u64 {
        lock(&self.feeds)
            .feeds
            .get(feed)
            .map(FeedState::unread_count)
            .unwrap_or(0)
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        lock(&self.feeds).find(id).cloned()
    }

    /// Mutate under the lock and queue the resulting events in order, then
    /// deliver them once the lock is released.
    fn update<R>(&self, f: impl FnOnce(&mut Feeds) -> (R, Vec<FeedType>)) -> R {
        let result = {
            let mut feeds = lock(&self.feeds);
            let before = feeds.unread_counts();
            let (result, changed) = f(&mut feeds);
            for event in feeds.events_for(changed, &before) {
                self.listeners.enqueue(event);
            }
            result
        };
        self.listeners.dispatch();
        result
    }

    fn report(&self, outcome: Result<(), InboxError>) -> Result<(), InboxError> {
        if let Err(err @ InboxError::PageLoadFailed { .. }) = &outcome {
            crate::log_warn!("{}", err);
            self.listeners.emit(InboxEvent::Error(err.clone()));
        }
        outcome
    }

    async fn fetch_page(
        &self,
        ticket: &SessionTicket,
        request: &PageRequest,
    ) -> Result<FeedPage, ApiError> {
        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(
                self.request_timeout,
                self.backend.fetch_page(&ticket.identity, request),
            )
            .await
            .unwrap_or(Err(ApiError::Timeout));

            match result {
                Err(e)
                    if e.is_retryable()
                        && attempt < self.page_load_retries
                        && self.gate.is_current(ticket) =>
                {
                    attempt += 1;
                    crate::log_warn!(
                        "Page load for {} failed ({}), retry {}/{}",
                        request.feed,
                        e,
                        attempt,
                        self.page_load_retries
                    );
                    tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                }
                other => return other,
            }
        }
    }

    /// Load the newest page of `feed`, replacing whatever is held for it.
    ///
    /// A later first-page load of the same feed, or a session change, makes
    /// this one stale: its result is dropped and `StaleResponse` returned.
    /// On failure the feed is left as it was.
    pub async fn load_first_page(
        &self,
        ticket: &SessionTicket,
        feed: FeedType,
    ) -> Result<(), InboxError> {
        let generation = {
            let mut feeds = lock(&self.feeds);
            if !self.gate.is_current(ticket) {
                return Err(InboxError::StaleResponse);
            }
            feeds.begin_reload(&feed)
        };

        let request = PageRequest {
            feed: feed.clone(),
            cursor: None,
            limit: self.page_size,
        };
        let result = self.fetch_page(ticket, &request).await;

        if !self.gate.is_current(ticket) {
            crate::log_debug!("Discarding {} page for superseded session", feed);
            return Err(InboxError::StaleResponse);
        }

        let outcome = self.update(|feeds| {
            if !self.gate.is_current(ticket) {
                return (Err(InboxError::StaleResponse), Vec::new());
            }
            let Some(state) = feeds.feeds.get_mut(&feed) else {
                return (Err(InboxError::StaleResponse), Vec::new());
            };
            if state.generation() != generation {
                return (Err(InboxError::StaleResponse), Vec::new());
            }
            match result {
                Ok(page) => {
                    state.replace_page(page);
                    (Ok(()), vec![feed.clone()])
                }
                Err(source) => (
                    Err(InboxError::PageLoadFailed {
                        feed: feed.clone(),
                        source,
                    }),
                    Vec::new(),
                ),
            }
        });
        self.report(outcome)
    }

    /// Load the page after the current cursor and merge it.
    ///
    /// No-op at the end of the feed or while another next-page load for the
    /// feed is running. A feed that was never loaded gets its first page.
    pub async fn load_next_page(
        &self,
        ticket: &SessionTicket,
        feed: FeedType,
    ) -> Result<(), InboxError> {
        enum Plan {
            FirstPage,
            Next(u64, String),
            Nothing,
        }

        let plan = {
            let mut feeds = lock(&self.feeds);
            if !self.gate.is_current(ticket) {
                return Err(InboxError::StaleResponse);
            }
            let state = feeds.feeds.entry(feed.clone()).or_default();
            if !state.is_loaded() {
                Plan::FirstPage
            } else {
                match state.begin_next_page() {
                    Some((generation, cursor)) => Plan::Next(generation, cursor),
                    None => Plan::Nothing,
                }
            }
        };

        let (generation, cursor) = match plan {
            Plan::FirstPage => return self.load_first_page(ticket, feed).await,
            Plan::Nothing => return Ok(()),
            Plan::Next(generation, cursor) => (generation, cursor),
        };

        let request = PageRequest {
            feed: feed.clone(),
            cursor: Some(cursor.clone()),
            limit: self.page_size,
        };
        let result = self.fetch_page(ticket, &request).await;

        if !self.gate.is_current(ticket) {
            return Err(InboxError::StaleResponse);
        }

        let outcome = self.update(|feeds| {
            if !self.gate.is_current(ticket) {
                return (Err(InboxError::StaleResponse), Vec::new());
            }
            let Some(state) = feeds.feeds.get_mut(&feed) else {
                return (Err(InboxError::StaleResponse), Vec::new());
            };
            if state.generation() != generation || state.cursor() != Some(cursor.as_str()) {
                return (Err(InboxError::StaleResponse), Vec::new());
            }
            state.finish_next_page();
            match result {
                Ok(page) => {
                    let added = state.append_page(page);
                    crate::log_debug!("Merged {} messages into {}", added, feed);
                    (Ok(()), vec![feed.clone()])
                }
                Err(source) => (
                    Err(InboxError::PageLoadFailed {
                        feed: feed.clone(),
                        source,
                    }),
                    Vec::new(),
                ),
            }
        });
        self.report(outcome)
    }

    /// Switch the viewed feed. Loads it when it was never loaded or went
    /// stale; otherwise the cached state is republished as is.
    pub async fn set_feed_type(
        &self,
        ticket: &SessionTicket,
        feed: FeedType,
    ) -> Result<(), InboxError> {
        let needs_load = self.update(|feeds| {
            feeds.current = feed.clone();
            let state = feeds.feeds.entry(feed.clone()).or_default();
            (!state.is_loaded() || state.is_stale(), vec![feed.clone()])
        });
        if needs_load {
            self.load_first_page(ticket, feed).await
        } else {
            Ok(())
        }
    }

    /// Apply a server push to every feed it concerns.
    pub fn apply_push(&self, ticket: &SessionTicket, event: &ServerEvent) {
        self.update(|feeds| {
            if !self.gate.is_current(ticket) {
                return ((), Vec::new());
            }
            let changed = match event {
                ServerEvent::MessageCreated { message } => feeds.place(message.clone()),
                ServerEvent::MessageUpdated { id, patch } => match feeds.find(id).cloned() {
                    Some(mut message) => {
                        message.apply_patch(patch);
                        feeds.place(message)
                    }
                    None => Vec::new(),
                },
                ServerEvent::MessageRemoved { id } => feeds.remove_everywhere(id),
                ServerEvent::UnreadCountSnapshot { feed, count } => {
                    feeds
                        .feeds
                        .entry(feed.clone())
                        .or_default()
                        .set_unread_override(*count);
                    vec![feed.clone()]
                }
                ServerEvent::Error { .. } => Vec::new(),
            };
            ((), changed)
        })
    }

    /// Apply a local edit to a message.
    pub(crate) fn apply_local(
        &self,
        ticket: &SessionTicket,
        id: &str,
        edit: impl FnOnce(&mut Message),
    ) -> Result<LocalEdit, InboxError> {
        self.update(|feeds| {
            if !self.gate.is_current(ticket) {
                return (Err(InboxError::StaleResponse), Vec::new());
            }
            let Some(prior) = feeds.find(id).cloned() else {
                return (Err(InboxError::MessageNotFound(id.to_string())), Vec::new());
            };
            let held_in = feeds.holders(id);
            let mut next = prior.clone();
            edit(&mut next);
            let changed = feeds.place(next);
            (Ok(LocalEdit { prior, held_in }), changed)
        })
    }

    /// Undo a local edit. `revert` copies fields back from `snapshot` onto the
    /// current version, or onto the snapshot itself if the message has left
    /// every loaded feed. Feeds in `held_in` get the message back even when it
    /// is older than what they have loaded.
    pub(crate) fn restore(
        &self,
        ticket: &SessionTicket,
        snapshot: &Message,
        held_in: &[FeedType],
        revert: impl FnOnce(&mut Message, &Message),
    ) {
        self.update(|feeds| {
            if !self.gate.is_current(ticket) {
                return ((), Vec::new());
            }
            let mut next = feeds
                .find(&snapshot.id)
                .cloned()
                .unwrap_or_else(|| snapshot.clone());
            revert(&mut next, snapshot);
            ((), feeds.put_back(next, held_in))
        })
    }

    pub(crate) fn mark_all_read_local(
        &self,
        ticket: &SessionTicket,
        feed: &FeedType,
        now: DateTime<Utc>,
    ) -> MarkAllRead {
        self.update(|feeds| {
            if !self.gate.is_current(ticket) {
                return (MarkAllRead::default(), Vec::new());
            }
            let Some(state) = feeds.feeds.get(feed) else {
                return (MarkAllRead::default(), Vec::new());
            };
            let previous_override = state.unread_override();
            let priors: Vec<Message> = state
                .messages()
                .iter()
                .filter(|m| !m.is_read())
                .cloned()
                .collect();

            let mut changed = vec![feed.clone()];
            for prior in &priors {
                let mut next = prior.clone();
                next.read_at = Some(now);
                changed.extend(feeds.place(next));
            }
            if let Some(state) = feeds.feeds.get_mut(feed) {
                if previous_override.is_some() {
                    state.set_unread_override(0);
                }
            }
            (
                MarkAllRead {
                    priors,
                    previous_override,
                },
                changed,
            )
        })
    }

    pub(crate) fn restore_all_read(&self, ticket: &SessionTicket, feed: &FeedType, undo: MarkAllRead) {
        self.update(|feeds| {
            if !self.gate.is_current(ticket) {
                return ((), Vec::new());
            }
            let mut changed = vec![feed.clone()];
            for prior in undo.priors {
                let mut next = feeds.find(&prior.id).cloned().unwrap_or_else(|| prior.clone());
                next.read_at = prior.read_at;
                changed.extend(feeds.place(next));
            }
            if let Some(state) = feeds.feeds.get_mut(feed) {
                state.restore_unread_override(undo.previous_override);
            }
            ((), changed)
        })
    }

    /// Forget every feed. Nothing is published. Generations keep counting
    /// up so loads started before the reset never match a later one.
    pub fn reset(&self) {
        lock(&self.feeds).reset();
    }

    /// Mark every loaded feed stale and return the current feed if it needs
    /// reloading.
    fn mark_all_stale(&self) -> Option<FeedType> {
        self.update(|feeds| {
            for state in feeds.feeds.values_mut() {
                state.mark_stale();
            }
            let current = feeds.current.clone();
            let reload = feeds
                .feeds
                .get(&current)
                .is_some_and(FeedState::is_loaded)
                .then_some(current);
            let changed = feeds
                .feeds
                .iter()
                .filter(|(_, state)| state.is_stale())
                .map(|(feed, _)| feed.clone())
                .collect();
            (reload, changed)
        })
    }
}

impl SessionObserver for FeedStore {
    fn session_reset(&self) {
        self.reset();
    }

    fn push_event(self: Arc<Self>, ticket: &SessionTicket, event: &ServerEvent) {
        self.apply_push(ticket, event);
    }

    fn channel_opened(self: Arc<Self>, ticket: &SessionTicket, resumed: bool) {
        if !resumed || !self.gate.is_current(ticket) {
            return;
        }
        let Some(feed) = self.mark_all_stale() else {
            return;
        };
        let ticket = ticket.clone();
        tokio::spawn(async move {
            match self.load_first_page(&ticket, feed.clone()).await {
                Ok(()) => crate::log_info!("Resynchronized {} after reconnect", feed),
                Err(e) => crate::log_debug!("Resync of {} did not apply: {}", feed, e),
            }
        });
    }
}
