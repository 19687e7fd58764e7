//! The public engine handle.

use std::sync::Arc;
use std::time::Duration;

use inbox_shared::{
    ApiError, AuthEvent, AuthToken, FeedType, Identity, InboxError, Message, MutationKind,
    ServerEvent, UserToken,
};

use crate::api_client::{ApiClient, InboxBackend};
use crate::config::ClientConfig;
use crate::feed::{FeedSnapshot, FeedStore};
use crate::listeners::{InboxEvent, ListenerRegistry, Subscription, Topic};
use crate::mutations::{MutationQueue, PendingMutation};
use crate::session::{SessionManager, SessionObserver, SignInOutcome};
use crate::storage::SessionStorage;
use crate::transport::{ConnectionState, Connector, WebSocketConnector};

struct ClientInner {
    config: ClientConfig,
    backend: Arc<dyn InboxBackend>,
    listeners: ListenerRegistry,
    session: SessionManager,
    feeds: Arc<FeedStore>,
    mutations: Arc<MutationQueue>,
    storage: Option<SessionStorage>,
}

/// Session, feeds and realtime updates for one inbox user at a time.
///
/// Cloning is cheap and shares the same engine.
#[derive(Clone)]
pub struct InboxClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for InboxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboxClient")
            .field("session", &self.inner.session)
            .field("listeners", &self.inner.listeners)
            .finish()
    }
}

impl InboxClient {
    /// Client talking HTTP to `config.api_url` and WebSocket to the realtime
    /// endpoint.
    pub fn new(config: ClientConfig) -> Self {
        let backend = Arc::new(ApiClient::from_config(&config));
        Self::with_parts(config, backend, Arc::new(WebSocketConnector))
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(ClientConfig::from_env()?))
    }

    /// Client over a custom backend and realtime connector.
    pub fn with_parts(
        config: ClientConfig,
        backend: Arc<dyn InboxBackend>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let listeners = ListenerRegistry::new();
        let session = SessionManager::new(config.clone(), connector, listeners.clone());
        let feeds = FeedStore::new(&config, backend.clone(), listeners.clone(), session.gate());
        let mutations = MutationQueue::new(
            backend.clone(),
            listeners.clone(),
            feeds.clone(),
            session.gate(),
            config.request_timeout,
        );

        // Mutations first: they must see a push before the feeds apply it.
        let observer: Arc<dyn SessionObserver> = mutations.clone();
        session.add_observer(Arc::downgrade(&observer));
        let observer: Arc<dyn SessionObserver> = feeds.clone();
        session.add_observer(Arc::downgrade(&observer));

        let storage = if config.persist_session {
            config
                .storage_dir
                .clone()
                .map(SessionStorage::in_dir)
                .or_else(SessionStorage::default_location)
        } else {
            None
        };

        Self {
            inner: Arc::new(ClientInner {
                config,
                backend,
                listeners,
                session,
                feeds,
                mutations,
                storage,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    // --- Session ---

    /// Sign in, replacing any other identity. See [`SessionManager::sign_in`].
    ///
    /// When this call establishes the session, the identity is persisted (if
    /// enabled) and the current feed's first page is requested.
    pub async fn sign_in(&self, identity: Identity) -> Result<SignInOutcome, InboxError> {
        let outcome = self.inner.session.sign_in(identity).await?;
        match outcome {
            SignInOutcome::SignedIn => {
                self.persist_identity();
                if self.inner.config.load_on_sign_in {
                    let feed = self.inner.feeds.current_feed();
                    if let Err(e) = self.load_first_page(feed).await {
                        crate::log_debug!("Initial page load did not apply: {}", e);
                    }
                }
            }
            SignInOutcome::TokenRefreshed => self.persist_identity(),
            _ => {}
        }
        Ok(outcome)
    }

    /// Sign out. Returns `false` when nobody was signed in.
    pub fn sign_out(&self) -> bool {
        if let Some(storage) = &self.inner.storage {
            storage.clear_identity();
        }
        self.inner.session.sign_out()
    }

    pub fn refresh_token(&self, token: impl Into<AuthToken>) -> Result<(), InboxError> {
        self.inner.session.refresh_token(token.into())?;
        self.persist_identity();
        Ok(())
    }

    /// Sign in with the identity saved by an earlier run, if any.
    ///
    /// A saved identity that is no longer valid is discarded.
    pub async fn restore_session(&self) -> Result<Option<SignInOutcome>, InboxError> {
        let Some(storage) = &self.inner.storage else {
            return Ok(None);
        };
        let Some(identity) = storage.load_identity() else {
            return Ok(None);
        };
        match self.sign_in(identity).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(InboxError::InvalidIdentity(reason)) => {
                crate::log_info!("Discarding saved session: {}", reason);
                storage.clear_identity();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn add_authentication_listener(
        &self,
        callback: impl Fn(&AuthEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.session.add_authentication_listener(callback)
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.inner.session.current_identity()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.session.connection_state()
    }

    fn persist_identity(&self) {
        let (Some(storage), Some(identity)) = (&self.inner.storage, self.current_identity()) else {
            return;
        };
        if !storage.save_identity(&identity) {
            crate::log_warn!("Could not persist session to {}", storage.dir().display());
        }
    }

    // --- Listeners ---

    pub fn subscribe(
        &self,
        topic: Topic,
        callback: impl Fn(&InboxEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.subscribe(topic, callback)
    }

    pub fn on_feed_changed(
        &self,
        feed: FeedType,
        callback: impl Fn(&FeedSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(Topic::Feed(feed), move |event| {
            if let InboxEvent::FeedChanged(snapshot) = event {
                callback(snapshot);
            }
        })
    }

    pub fn on_unread_count_changed(
        &self,
        callback: impl Fn(&FeedType, u64) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(Topic::UnreadCount, move |event| {
            if let InboxEvent::UnreadCountChanged { feed, count } = event {
                callback(feed, *count);
            }
        })
    }

    pub fn on_error(&self, callback: impl Fn(&InboxError) + Send + Sync + 'static) -> Subscription {
        self.subscribe(Topic::Errors, move |event| {
            if let InboxEvent::Error(err) = event {
                callback(err);
            }
        })
    }

    pub fn on_message_click(
        &self,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(Topic::MessageClick, move |event| {
            if let InboxEvent::MessageClicked(message) = event {
                callback(message);
            }
        })
    }

    // --- Feeds ---

    pub fn current_feed(&self) -> FeedType {
        self.inner.feeds.current_feed()
    }

    pub fn feed(&self, feed: &FeedType) -> FeedSnapshot {
        self.inner.feeds.snapshot(feed)
    }

    pub fn unread_count(&self, feed: &FeedType) -> u64 {
        self.inner.feeds.unread_count(feed)
    }

    pub async fn load_first_page(&self, feed: FeedType) -> Result<(), InboxError> {
        let ticket = self.inner.session.ticket()?;
        self.inner.feeds.load_first_page(&ticket, feed).await
    }

    pub async fn load_next_page(&self, feed: FeedType) -> Result<(), InboxError> {
        let ticket = self.inner.session.ticket()?;
        self.inner.feeds.load_next_page(&ticket, feed).await
    }

    pub async fn set_feed_type(&self, feed: FeedType) -> Result<(), InboxError> {
        let ticket = self.inner.session.ticket()?;
        self.inner.feeds.set_feed_type(&ticket, feed).await
    }

    /// Apply a push event as if it had arrived on the realtime channel.
    pub fn apply_push_event(&self, event: ServerEvent) -> Result<(), InboxError> {
        let ticket = self.inner.session.ticket()?;
        self.inner.mutations.clone().push_event(&ticket, &event);
        self.inner.feeds.apply_push(&ticket, &event);
        Ok(())
    }

    // --- Mutations ---

    /// Locally applied mutations the server has not confirmed yet.
    pub fn pending_mutations(&self) -> Vec<PendingMutation> {
        self.inner.mutations.pending()
    }

    pub async fn mark_read(&self, message_id: &str) -> Result<(), InboxError> {
        self.mutate(message_id, MutationKind::MarkRead).await
    }

    pub async fn mark_unread(&self, message_id: &str) -> Result<(), InboxError> {
        self.mutate(message_id, MutationKind::MarkUnread).await
    }

    pub async fn archive(&self, message_id: &str) -> Result<(), InboxError> {
        self.mutate(message_id, MutationKind::Archive).await
    }

    pub async fn unarchive(&self, message_id: &str) -> Result<(), InboxError> {
        self.mutate(message_id, MutationKind::Unarchive).await
    }

    async fn mutate(&self, message_id: &str, kind: MutationKind) -> Result<(), InboxError> {
        let ticket = self.inner.session.ticket()?;
        self.inner.mutations.submit(&ticket, message_id, kind).await
    }

    pub async fn mark_all_read(&self, feed: FeedType) -> Result<(), InboxError> {
        let ticket = self.inner.session.ticket()?;
        self.inner.mutations.mark_all_read(&ticket, feed).await
    }

    /// Publish a click to `MessageClick` listeners and record it.
    pub async fn click(&self, message_id: &str) -> Result<(), InboxError> {
        let ticket = self.inner.session.ticket()?;
        self.inner.mutations.click(&ticket, message_id).await
    }

    // --- Device tokens ---

    pub async fn put_user_token(&self, token: UserToken) -> Result<(), InboxError> {
        let ticket = self.inner.session.ticket()?;
        let call = self.inner.backend.put_user_token(&ticket.identity, &token);
        Ok(self.bounded(call).await?)
    }

    pub async fn delete_user_token(&self, token: &str) -> Result<(), InboxError> {
        let ticket = self.inner.session.ticket()?;
        let call = self.inner.backend.delete_user_token(&ticket.identity, token);
        Ok(self.bounded(call).await?)
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        let timeout: Duration = self.inner.config.request_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or(Err(ApiError::Timeout))
    }
}
