//! Optimistic mutations with per-message serialization and rollback.
//!
//! A mutation is applied to the local feeds immediately and sent in the
//! background. Calls touching the same field of the same message are
//! serialized: while one is in flight, the latest further intent waits in a
//! single slot and replaces any older waiting one, which is never sent.
//!
//! When a call fails, the field it changed reverts to its value before the
//! call, unless a server push has written that field since or a newer intent
//! is queued. Exactly one error event is published per failed call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use inbox_shared::{ApiError, FeedType, InboxError, Message, MutationKind, ServerEvent};
use uuid::Uuid;

use crate::api_client::InboxBackend;
use crate::feed::FeedStore;
use crate::listeners::{InboxEvent, ListenerRegistry};
use crate::lock;
use crate::session::{SessionGate, SessionObserver, SessionTicket};

/// The message field a mutation writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationField {
    ReadAt,
    ArchivedAt,
}

impl MutationField {
    pub fn of(kind: MutationKind) -> Self {
        match kind {
            MutationKind::MarkRead | MutationKind::MarkUnread => MutationField::ReadAt,
            MutationKind::Archive | MutationKind::Unarchive => MutationField::ArchivedAt,
        }
    }

    fn copy(self, target: &mut Message, source: &Message) {
        match self {
            MutationField::ReadAt => target.read_at = source.read_at,
            MutationField::ArchivedAt => target.archived_at = source.archived_at,
        }
    }
}

/// A locally applied mutation that has not been confirmed yet.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub id: Uuid,
    pub message_id: String,
    pub kind: MutationKind,
    pub local_applied_at: DateTime<Utc>,
    /// The message before this mutation (or the one it replaced) was applied.
    pub snapshot: Message,
    /// Feeds that held the message when `snapshot` was taken.
    pub held_in: Vec<FeedType>,
    /// A push wrote the field after this mutation was applied.
    pub overridden: bool,
    ticket: SessionTicket,
}

#[derive(Debug, Default)]
struct Slot {
    in_flight: Option<PendingMutation>,
    queued: Option<PendingMutation>,
}

type SlotKey = (String, MutationField);

pub struct MutationQueue {
    backend: Arc<dyn InboxBackend>,
    listeners: ListenerRegistry,
    feeds: Arc<FeedStore>,
    gate: SessionGate,
    request_timeout: Duration,
    slots: Mutex<HashMap<SlotKey, Slot>>,
}

impl MutationQueue {
    pub fn new(
        backend: Arc<dyn InboxBackend>,
        listeners: ListenerRegistry,
        feeds: Arc<FeedStore>,
        gate: SessionGate,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            listeners,
            feeds,
            gate,
            request_timeout,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Mutations not yet confirmed, in no particular order.
    pub fn pending(&self) -> Vec<PendingMutation> {
        lock(&self.slots)
            .values()
            .flat_map(|slot| slot.in_flight.iter().chain(slot.queued.iter()))
            .cloned()
            .collect()
    }

    /// Apply `kind` to a message locally and send it.
    ///
    /// A call that starts sending resolves once its slot has drained and
    /// returns the outcome of its own request; a call that only queued an
    /// intent returns right away. A message that already reflects `kind` is
    /// left alone and nothing is sent.
    pub async fn submit(
        self: &Arc<Self>,
        ticket: &SessionTicket,
        message_id: &str,
        kind: MutationKind,
    ) -> Result<(), InboxError> {
        let current = self
            .feeds
            .message(message_id)
            .ok_or_else(|| InboxError::MessageNotFound(message_id.to_string()))?;
        if kind.is_satisfied_by(&current) {
            crate::log_debug!("{} on {} already applied; not sending", kind, message_id);
            return Ok(());
        }

        let now = Utc::now();
        let edit = self
            .feeds
            .apply_local(ticket, message_id, |m| kind.apply(m, now))?;

        let field = MutationField::of(kind);
        let key = (message_id.to_string(), field);
        let mut mutation = PendingMutation {
            id: Uuid::new_v4(),
            message_id: message_id.to_string(),
            kind,
            local_applied_at: now,
            snapshot: edit.prior,
            held_in: edit.held_in,
            overridden: false,
            ticket: ticket.clone(),
        };

        let start = {
            let mut slots = lock(&self.slots);
            let slot = slots.entry(key.clone()).or_default();
            if slot.in_flight.is_none() {
                slot.in_flight = Some(mutation);
                true
            } else {
                if let Some(replaced) = slot.queued.take() {
                    crate::log_debug!("{} on {} replaces unsent {}", kind, message_id, replaced.kind);
                    mutation.snapshot = replaced.snapshot;
                    mutation.held_in = replaced.held_in;
                    mutation.overridden = replaced.overridden;
                }
                slot.queued = Some(mutation);
                false
            }
        };

        if !start {
            return Ok(());
        }
        let queue = Arc::clone(self);
        match tokio::spawn(async move { queue.drain(key).await }).await {
            Ok(result) => result,
            Err(e) => {
                crate::log_error!("Mutation task for {} failed: {}", message_id, e);
                Ok(())
            }
        }
    }

    /// Send the in-flight mutation of a slot, then whatever got queued behind
    /// it, until the slot is empty. Returns the outcome of the first request.
    ///
    /// Stops as soon as the slot holds a mutation of another session, which
    /// a drain of its own is sending.
    async fn drain(&self, key: SlotKey) -> Result<(), InboxError> {
        let mut first: Option<Result<(), InboxError>> = None;
        let mut epoch = None;
        loop {
            let Some(mutation) = lock(&self.slots)
                .get(&key)
                .and_then(|slot| slot.in_flight.clone())
            else {
                return first.unwrap_or(Ok(()));
            };
            if *epoch.get_or_insert(mutation.ticket.epoch) != mutation.ticket.epoch {
                return first.unwrap_or(Err(InboxError::StaleResponse));
            }

            let result = tokio::time::timeout(
                self.request_timeout,
                self.backend.mutate(&mutation.ticket.identity, &mutation.message_id, mutation.kind),
            )
            .await
            .unwrap_or(Err(ApiError::Timeout));

            let (revert, error) = {
                let mut slots = lock(&self.slots);
                let sent = mutation.id;
                let slot = match slots.get_mut(&key) {
                    Some(slot)
                        if self.gate.is_current(&mutation.ticket)
                            && slot.in_flight.as_ref().is_some_and(|m| m.id == sent) =>
                    {
                        slot
                    }
                    _ => {
                        crate::log_debug!(
                            "Dropping result of {} for superseded session",
                            mutation.kind
                        );
                        return first.unwrap_or(Err(InboxError::StaleResponse));
                    }
                };
                let done = slot.in_flight.take();
                let mut revert = None;
                let mut error = None;

                if let (Some(done), Err(source)) = (done, result) {
                    error = Some(InboxError::MutationFailed {
                        message_id: done.message_id.clone(),
                        kind: done.kind,
                        source,
                    });
                    if let Some(next) = slot.queued.as_mut() {
                        next.snapshot = done.snapshot;
                        next.held_in = done.held_in;
                        next.overridden |= done.overridden;
                    } else if !done.overridden {
                        revert = Some((done.snapshot, done.held_in));
                    }
                }

                slot.in_flight = slot.queued.take();
                if slot.in_flight.is_none() {
                    slots.remove(&key);
                }
                (revert, error)
            };

            if let Some((snapshot, held_in)) = revert {
                let field = key.1;
                self.feeds.restore(&mutation.ticket, &snapshot, &held_in, |target, source| {
                    field.copy(target, source)
                });
            }
            if first.is_none() {
                first = Some(error.clone().map_or(Ok(()), Err));
            }
            if let Some(err) = error {
                crate::log_warn!("{}", err);
                self.listeners.emit(InboxEvent::Error(err));
            }
        }
    }

    /// Mark every message of `feed` read, locally and on the server. The
    /// local change is undone if the call fails.
    pub async fn mark_all_read(
        &self,
        ticket: &SessionTicket,
        feed: FeedType,
    ) -> Result<(), InboxError> {
        let undo = self.feeds.mark_all_read_local(ticket, &feed, Utc::now());

        let result = tokio::time::timeout(
            self.request_timeout,
            self.backend.mark_all_read(&ticket.identity, &feed),
        )
        .await
        .unwrap_or(Err(ApiError::Timeout));

        if !self.gate.is_current(ticket) {
            return Err(InboxError::StaleResponse);
        }
        match result {
            Ok(()) => Ok(()),
            Err(source) => {
                self.feeds.restore_all_read(ticket, &feed, undo);
                let err = InboxError::MarkAllReadFailed { feed, source };
                crate::log_warn!("{}", err);
                self.listeners.emit(InboxEvent::Error(err.clone()));
                Err(err)
            }
        }
    }

    /// Publish a click and record it on the server.
    pub async fn click(&self, ticket: &SessionTicket, message_id: &str) -> Result<(), InboxError> {
        let message = self
            .feeds
            .message(message_id)
            .ok_or_else(|| InboxError::MessageNotFound(message_id.to_string()))?;
        self.listeners.emit(InboxEvent::MessageClicked(message));

        let result = tokio::time::timeout(
            self.request_timeout,
            self.backend.track_click(&ticket.identity, message_id),
        )
        .await
        .unwrap_or(Err(ApiError::Timeout));

        match result {
            Ok(()) => Ok(()),
            Err(_) if !self.gate.is_current(ticket) => Err(InboxError::StaleResponse),
            Err(source) => {
                let err = InboxError::Api(source);
                crate::log_warn!("Click tracking for {} failed: {}", message_id, err);
                self.listeners.emit(InboxEvent::Error(err.clone()));
                Err(err)
            }
        }
    }

    fn mark_overridden(&self, message_id: &str, fields: &[MutationField]) {
        let mut slots = lock(&self.slots);
        for field in fields {
            if let Some(slot) = slots.get_mut(&(message_id.to_string(), *field)) {
                for pending in slot.in_flight.iter_mut().chain(slot.queued.iter_mut()) {
                    pending.overridden = true;
                }
            }
        }
    }
}

impl SessionObserver for MutationQueue {
    fn session_reset(&self) {
        let dropped = std::mem::take(&mut *lock(&self.slots));
        if !dropped.is_empty() {
            crate::log_debug!("Discarding {} pending mutation slots", dropped.len());
        }
    }

    fn push_event(self: Arc<Self>, ticket: &SessionTicket, event: &ServerEvent) {
        if !self.gate.is_current(ticket) {
            return;
        }
        match event {
            ServerEvent::MessageUpdated { id, patch } => {
                let mut fields = Vec::new();
                if patch.read_at.is_some() {
                    fields.push(MutationField::ReadAt);
                }
                if patch.archived_at.is_some() {
                    fields.push(MutationField::ArchivedAt);
                }
                self.mark_overridden(id, &fields);
            }
            ServerEvent::MessageCreated { message } => {
                self.mark_overridden(&message.id, &[MutationField::ReadAt, MutationField::ArchivedAt]);
            }
            ServerEvent::MessageRemoved { id } => {
                self.mark_overridden(id, &[MutationField::ReadAt, MutationField::ArchivedAt]);
            }
            _ => {}
        }
    }
}
