//! Session management: identity lifecycle, auth events and the realtime channel.
//!
//! Every session attempt gets a new epoch. Work started on behalf of a session
//! carries its [`SessionTicket`]; when that work completes it checks the
//! [`SessionGate`] and drops its result if a sign-out or a newer sign-in has
//! happened since.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use inbox_shared::{
    realtime_connect_url, validate_token, AuthCause, AuthEvent, AuthToken, ClientCommand,
    Identity, InboxError, ServerEvent,
};

use crate::config::ClientConfig;
use crate::listeners::{InboxEvent, ListenerRegistry, Subscription, Topic};
use crate::lock;
use crate::transport::{ChannelEvent, ConnectionState, Connector, RealtimeChannel};

/// Proof that work was started for a particular session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub epoch: u64,
    pub identity: Identity,
}

/// Shared view of the current session epoch.
#[derive(Debug, Clone, Default)]
pub struct SessionGate(Arc<AtomicU64>);

impl SessionGate {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, ticket: &SessionTicket) -> bool {
        self.current() == ticket.epoch
    }

    fn advance(&self, epoch: u64) {
        self.0.store(epoch, Ordering::SeqCst);
    }
}

/// Components whose state is scoped to a session.
///
/// Observers are held weakly and called without any session lock held.
pub trait SessionObserver: Send + Sync {
    /// The previous session is gone; drop everything derived from it.
    fn session_reset(&self);

    /// A push event arrived on the session's channel.
    fn push_event(self: Arc<Self>, _ticket: &SessionTicket, _event: &ServerEvent) {}

    /// The session's channel (re)connected. `resumed` means pushes may have
    /// been missed while it was down.
    fn channel_opened(self: Arc<Self>, _ticket: &SessionTicket, _resumed: bool) {}
}

/// How a `sign_in` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInOutcome {
    /// This call established the session.
    SignedIn,
    /// The same identity was already active.
    AlreadyActive,
    /// An identical sign-in was already in progress.
    Coalesced,
    /// Same principal with a new token; swapped in place.
    TokenRefreshed,
    /// A later sign-in or sign-out won; nothing from this call was applied.
    Superseded,
}

struct SessionSlot {
    ticket: SessionTicket,
    channel: Arc<RealtimeChannel>,
}

#[derive(Default)]
struct SessionState {
    epoch: u64,
    active: Option<SessionSlot>,
    /// Channel opened, waiting for the first connection before activation.
    pending: Option<SessionSlot>,
}

impl SessionState {
    fn slot_for(&self, epoch: u64) -> Option<&SessionSlot> {
        [self.active.as_ref(), self.pending.as_ref()]
            .into_iter()
            .flatten()
            .find(|slot| slot.ticket.epoch == epoch)
    }
}

enum Plan {
    Done(SignInOutcome),
    Refresh,
    Start {
        ticket: SessionTicket,
        channel: Arc<RealtimeChannel>,
        previous: Vec<SessionSlot>,
    },
}

struct SessionInner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    listeners: ListenerRegistry,
    gate: SessionGate,
    observers: Mutex<Vec<Weak<dyn SessionObserver>>>,
    state: Mutex<SessionState>,
}

/// Owns the active identity and its realtime channel.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("SessionManager")
            .field("epoch", &state.epoch)
            .field("active", &state.active.as_ref().map(|s| &s.ticket.identity.user_id))
            .field("pending", &state.pending.as_ref().map(|s| &s.ticket.identity.user_id))
            .finish()
    }
}

impl SessionManager {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        listeners: ListenerRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                connector,
                listeners,
                gate: SessionGate::default(),
                observers: Mutex::new(Vec::new()),
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    pub fn gate(&self) -> SessionGate {
        self.inner.gate.clone()
    }

    /// Register a session-scoped component. Held weakly.
    pub fn add_observer(&self, observer: Weak<dyn SessionObserver>) {
        lock(&self.inner.observers).push(observer);
    }

    /// Ticket of the active session.
    pub fn ticket(&self) -> Result<SessionTicket, InboxError> {
        lock(&self.inner.state)
            .active
            .as_ref()
            .map(|slot| slot.ticket.clone())
            .ok_or(InboxError::NotSignedIn)
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.ticket().ok().map(|ticket| ticket.identity)
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inner.state)
            .active
            .as_ref()
            .map(|slot| slot.channel.state())
            .unwrap_or_default()
    }

    pub fn add_authentication_listener(
        &self,
        callback: impl Fn(&AuthEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.subscribe(Topic::Auth, move |event| {
            if let InboxEvent::Auth(auth) = event {
                callback(auth);
            }
        })
    }

    /// Establish a session for `identity`.
    ///
    /// Rejects malformed identities before touching any state. An identical
    /// sign-in that is active or in progress is coalesced; a different one
    /// supersedes it, closing its channel and resetting session-scoped state
    /// before the new session can deliver anything. `SignedIn` is published
    /// only if this call is still the latest once its channel is up or the
    /// connect timeout has passed.
    pub async fn sign_in(&self, identity: Identity) -> Result<SignInOutcome, InboxError> {
        identity.validate(Utc::now())?;

        match self.plan_sign_in(identity.clone()) {
            Plan::Done(outcome) => {
                crate::log_debug!("sign_in for {} coalesced: {:?}", identity.user_id, outcome);
                Ok(outcome)
            }
            Plan::Refresh => {
                self.refresh_token(identity.token)?;
                Ok(SignInOutcome::TokenRefreshed)
            }
            Plan::Start {
                ticket,
                channel,
                previous,
            } => {
                if !previous.is_empty() {
                    crate::log_info!("Superseding previous session for {}", ticket.identity.user_id);
                    for slot in previous {
                        slot.channel.close();
                    }
                    self.reset_observers();
                }

                if !channel.wait_connected(self.inner.config.connect_timeout).await {
                    crate::log_warn!(
                        "Realtime channel not up after {:?}; continuing while it retries",
                        self.inner.config.connect_timeout
                    );
                }

                {
                    let mut state = lock(&self.inner.state);
                    if state.epoch != ticket.epoch {
                        return Ok(SignInOutcome::Superseded);
                    }
                    state.active = state.pending.take();
                    self.inner.listeners.enqueue(InboxEvent::Auth(AuthEvent {
                        identity: Some(ticket.identity.clone()),
                        cause: AuthCause::SignedIn,
                    }));
                }
                self.inner.listeners.dispatch();
                crate::log_info!("Signed in as {}", ticket.identity.user_id);
                Ok(SignInOutcome::SignedIn)
            }
        }
    }

    fn plan_sign_in(&self, identity: Identity) -> Plan {
        let mut state = lock(&self.inner.state);

        if let Some(pending) = &state.pending {
            if pending.ticket.identity == identity {
                return Plan::Done(SignInOutcome::Coalesced);
            }
        } else if let Some(active) = &state.active {
            if active.ticket.identity == identity {
                return Plan::Done(SignInOutcome::AlreadyActive);
            }
            if active.ticket.identity.same_principal(&identity) {
                return Plan::Refresh;
            }
        }

        state.epoch += 1;
        self.inner.gate.advance(state.epoch);
        let previous: Vec<SessionSlot> = [state.active.take(), state.pending.take()]
            .into_iter()
            .flatten()
            .collect();

        let ticket = SessionTicket {
            epoch: state.epoch,
            identity,
        };
        let channel = Arc::new(self.open_channel(ticket.epoch));
        state.pending = Some(SessionSlot {
            ticket: ticket.clone(),
            channel: channel.clone(),
        });

        Plan::Start {
            ticket,
            channel,
            previous,
        }
    }

    /// End the session. Returns `false` (and publishes nothing) when no
    /// session was active.
    pub fn sign_out(&self) -> bool {
        let previous = {
            let mut state = lock(&self.inner.state);
            if state.active.is_none() && state.pending.is_none() {
                return false;
            }
            state.epoch += 1;
            self.inner.gate.advance(state.epoch);
            let was_active = state.active.is_some();
            let previous: Vec<SessionSlot> = [state.active.take(), state.pending.take()]
                .into_iter()
                .flatten()
                .collect();
            if was_active {
                self.inner.listeners.enqueue(InboxEvent::Auth(AuthEvent {
                    identity: None,
                    cause: AuthCause::SignedOut,
                }));
            }
            previous
        };

        for slot in &previous {
            slot.channel.close();
        }
        self.reset_observers();
        self.inner.listeners.dispatch();
        crate::log_info!("Signed out");
        true
    }

    /// Swap the token of the current session without a sign-out/sign-in cycle.
    ///
    /// The channel re-authenticates in band when connected; otherwise the next
    /// reconnect uses the new token.
    pub fn refresh_token(&self, token: AuthToken) -> Result<(), InboxError> {
        validate_token(&token, Utc::now())?;
        {
            let mut state = lock(&self.inner.state);
            let state = &mut *state;
            let slot = state
                .active
                .as_mut()
                .or(state.pending.as_mut())
                .ok_or(InboxError::NotSignedIn)?;
            slot.ticket.identity.token = token.clone();

            if slot.channel.state().is_connected() {
                if let Err(e) = slot.channel.send(ClientCommand::Reauthenticate { token }) {
                    crate::log_warn!("In-band re-auth failed, next reconnect uses new token: {}", e);
                }
            }
            if state.active.is_some() {
                let identity = state.active.as_ref().map(|slot| slot.ticket.identity.clone());
                self.inner.listeners.enqueue(InboxEvent::Auth(AuthEvent {
                    identity,
                    cause: AuthCause::TokenRefreshed,
                }));
            }
        }
        self.inner.listeners.dispatch();
        Ok(())
    }

    fn observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        let mut observers = lock(&self.inner.observers);
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    fn reset_observers(&self) {
        for observer in self.observers() {
            observer.session_reset();
        }
    }

    fn open_channel(&self, epoch: u64) -> RealtimeChannel {
        let weak = Arc::downgrade(&self.inner);

        let url_builder = {
            let weak = weak.clone();
            move || {
                let inner = weak.upgrade()?;
                let identity = inner.identity_for(epoch)?;
                let base = inner.config.realtime_url_for(&identity);
                match realtime_connect_url(&base, &identity) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        crate::log_error!("Invalid realtime url {}: {}", base, e);
                        None
                    }
                }
            }
        };

        let handshake = {
            let weak = weak.clone();
            move || {
                weak.upgrade()
                    .and_then(|inner| inner.identity_for(epoch))
                    .map(|identity| {
                        vec![ClientCommand::Subscribe {
                            user_id: identity.user_id,
                            tenant_id: identity.tenant_id,
                        }]
                    })
                    .unwrap_or_default()
            }
        };

        let manager = weak;
        let on_event = move |event: ChannelEvent| {
            if let Some(inner) = manager.upgrade() {
                SessionManager { inner }.handle_channel_event(epoch, event);
            }
        };

        RealtimeChannel::open(
            self.inner.connector.clone(),
            self.inner.config.reconnect.clone(),
            url_builder,
            handshake,
            on_event,
        )
    }

    fn handle_channel_event(&self, epoch: u64, event: ChannelEvent) {
        let Some(ticket) = self.inner.ticket_for(epoch) else {
            crate::log_debug!("Dropping channel event from superseded session {}", epoch);
            return;
        };

        match event {
            ChannelEvent::State(state) => {
                // Closing a live session's channel only happens when it gave up.
                let gave_up = state == ConnectionState::Closed;
                self.inner.listeners.emit(InboxEvent::Connection(state));
                if gave_up {
                    let err = InboxError::ChannelDisconnected(
                        "reconnect attempts exhausted".to_string(),
                    );
                    crate::log_error!("{} for {}", err, ticket.identity.user_id);
                    self.inner.listeners.emit(InboxEvent::Error(err));
                }
            }
            ChannelEvent::Opened { resumed } => {
                if resumed {
                    crate::log_info!("Realtime channel resumed; resynchronizing feeds");
                }
                for observer in self.observers() {
                    observer.channel_opened(&ticket, resumed);
                }
            }
            ChannelEvent::Frame(ServerEvent::Error { code, message, .. }) => {
                crate::log_warn!("Realtime error {}: {}", code, message);
            }
            ChannelEvent::Frame(event) => {
                for observer in self.observers() {
                    observer.push_event(&ticket, &event);
                }
            }
        }
    }
}

impl SessionInner {
    fn ticket_for(&self, epoch: u64) -> Option<SessionTicket> {
        lock(&self.state).slot_for(epoch).map(|slot| slot.ticket.clone())
    }

    fn identity_for(&self, epoch: u64) -> Option<Identity> {
        self.ticket_for(epoch).map(|ticket| ticket.identity)
    }
}
