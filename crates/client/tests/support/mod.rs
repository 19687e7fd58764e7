//! In-memory backend and realtime connector shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::SinkExt;
use inbox_client::shared::{
    ApiError, FeedPage, FeedType, Identity, Message, MutationKind, PageRequest, ServerEvent,
    UserToken, WsEnvelope,
};
use inbox_client::{
    ChannelError, ClientConfig, Connector, FrameSink, FrameStream, InboxBackend, InboxClient,
    InboxEvent, ReconnectConfig, Subscription, Topic,
};

pub fn message(id: &str, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        feed_type: FeedType::Inbox,
        created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        read_at: None,
        archived_at: None,
        payload: serde_json::json!({ "title": format!("message {id}") }),
    }
}

pub fn page(messages: Vec<Message>, next_cursor: Option<&str>) -> FeedPage {
    FeedPage {
        unread_count: messages.iter().filter(|m| !m.is_read()).count() as u64,
        messages,
        next_cursor: next_cursor.map(str::to_string),
        total_count: None,
    }
}

pub fn identity(user: &str) -> Identity {
    Identity::new(user, format!("token-{user}"))
}

pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_api_url("http://localhost:9")
        .with_connect_timeout(Duration::from_secs(1))
        .with_request_timeout(Duration::from_secs(2))
        .with_load_on_sign_in(false)
        .with_page_load_retries(0)
        .with_reconnect(ReconnectConfig {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            max_jitter_ms: 0,
            ..ReconnectConfig::default()
        })
}

pub fn client(backend: &Arc<FakeBackend>, connector: &Arc<FakeConnector>) -> InboxClient {
    client_with(test_config(), backend, connector)
}

pub fn client_with(
    config: ClientConfig,
    backend: &Arc<FakeBackend>,
    connector: &Arc<FakeConnector>,
) -> InboxClient {
    inbox_client::logging::init_tracing("inbox_client=debug");
    InboxClient::with_parts(config, backend.clone(), connector.clone())
}

/// Poll `condition` until it holds or a second has passed.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Collects every event published on a topic.
pub struct Recorder {
    pub events: Arc<Mutex<Vec<InboxEvent>>>,
    _subscription: Subscription,
}

impl Recorder {
    pub fn new(client: &InboxClient, topic: Topic) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscription = client.subscribe(topic, move |event| {
            sink.lock().unwrap().push(event.clone());
        });
        Self {
            events,
            _subscription: subscription,
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<InboxEvent> {
        self.events.lock().unwrap().clone()
    }
}

/// Backend serving canned pages and recording every call.
#[derive(Default)]
pub struct FakeBackend {
    pages: Mutex<HashMap<(FeedType, Option<String>), FeedPage>>,
    page_failures: Mutex<VecDeque<ApiError>>,
    page_delays: Mutex<HashMap<String, Duration>>,
    pub fetches: Mutex<Vec<(String, PageRequest)>>,
    pub mutations: Mutex<Vec<(String, MutationKind)>>,
    failing_kinds: Mutex<Vec<MutationKind>>,
    mutation_delay: Mutex<Duration>,
    pub mark_all_calls: AtomicUsize,
    mark_all_fails: Mutex<bool>,
    pub clicks: Mutex<Vec<String>>,
    pub tokens: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_page(&self, feed: FeedType, cursor: Option<&str>, page: FeedPage) {
        self.pages
            .lock()
            .unwrap()
            .insert((feed, cursor.map(str::to_string)), page);
    }

    pub fn fail_next_pages(&self, errors: Vec<ApiError>) {
        self.page_failures.lock().unwrap().extend(errors);
    }

    pub fn delay_pages_for(&self, user: &str, delay: Duration) {
        self.page_delays
            .lock()
            .unwrap()
            .insert(user.to_string(), delay);
    }

    pub fn fail_mutations(&self, kind: MutationKind) {
        self.failing_kinds.lock().unwrap().push(kind);
    }

    pub fn delay_mutations(&self, delay: Duration) {
        *self.mutation_delay.lock().unwrap() = delay;
    }

    pub fn fail_mark_all_read(&self) {
        *self.mark_all_fails.lock().unwrap() = true;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn fetches_for(&self, feed: &FeedType) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, request)| request.feed == *feed)
            .count()
    }

    pub fn mutation_calls(&self) -> Vec<(String, MutationKind)> {
        self.mutations.lock().unwrap().clone()
    }
}

#[async_trait]
impl InboxBackend for FakeBackend {
    async fn fetch_page(
        &self,
        session: &Identity,
        request: &PageRequest,
    ) -> Result<FeedPage, ApiError> {
        self.fetches
            .lock()
            .unwrap()
            .push((session.user_id.clone(), request.clone()));
        let delay = self.page_delays.lock().unwrap().get(&session.user_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.page_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&(request.feed.clone(), request.cursor.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn mutate(
        &self,
        _session: &Identity,
        message_id: &str,
        kind: MutationKind,
    ) -> Result<(), ApiError> {
        self.mutations
            .lock()
            .unwrap()
            .push((message_id.to_string(), kind));
        let delay = *self.mutation_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_kinds.lock().unwrap().contains(&kind) {
            return Err(ApiError::Http {
                status: 500,
                body: "boom".to_string(),
            });
        }
        Ok(())
    }

    async fn mark_all_read(&self, _session: &Identity, _feed: &FeedType) -> Result<(), ApiError> {
        self.mark_all_calls.fetch_add(1, Ordering::SeqCst);
        if *self.mark_all_fails.lock().unwrap() {
            return Err(ApiError::Network("connection reset".to_string()));
        }
        Ok(())
    }

    async fn track_click(&self, _session: &Identity, message_id: &str) -> Result<(), ApiError> {
        self.clicks.lock().unwrap().push(message_id.to_string());
        Ok(())
    }

    async fn put_user_token(&self, _session: &Identity, token: &UserToken) -> Result<(), ApiError> {
        self.tokens.lock().unwrap().push(token.token.clone());
        Ok(())
    }

    async fn delete_user_token(&self, _session: &Identity, token: &str) -> Result<(), ApiError> {
        self.tokens.lock().unwrap().retain(|t| t != token);
        Ok(())
    }
}

type Link = (
    UnboundedSender<Result<String, ChannelError>>,
    UnboundedReceiver<String>,
);

/// Connector handing out in-memory links.
#[derive(Default)]
pub struct FakeConnector {
    pub attempts: AtomicUsize,
    pub urls: Mutex<Vec<String>>,
    connect_delay: Mutex<Duration>,
    links: Mutex<Vec<Link>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_connect_delay(delay: Duration) -> Arc<Self> {
        let connector = Self::default();
        *connector.connect_delay.lock().unwrap() = delay;
        Arc::new(connector)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Deliver a server event on the newest link.
    pub fn push(&self, event: ServerEvent) {
        let frame = serde_json::to_string(&WsEnvelope::new(event)).unwrap();
        let links = self.links.lock().unwrap();
        let (inbound, _) = links.last().expect("no open link");
        inbound.unbounded_send(Ok(frame)).unwrap();
    }

    /// Hang up every open link.
    pub fn drop_links(&self) {
        self.links.lock().unwrap().clear();
    }

    /// Frames the client wrote on the newest link so far.
    pub fn written(&self) -> Vec<String> {
        let mut links = self.links.lock().unwrap();
        let Some((_, outbound)) = links.last_mut() else {
            return Vec::new();
        };
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = outbound.try_next() {
            frames.push(frame);
        }
        frames
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let (out_tx, out_rx) = unbounded::<String>();
        let (in_tx, in_rx) = unbounded::<Result<String, ChannelError>>();
        self.links.lock().unwrap().push((in_tx, out_rx));
        let sink = out_tx.sink_map_err(|_| ChannelError::Closed);
        Ok((Box::pin(sink), Box::pin(in_rx)))
    }
}
