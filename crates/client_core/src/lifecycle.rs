//! Optimistic record lifecycle: provisional sends, edits, deletes and reactions, with exact
//! rollback when the backend refuses them.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use shared::{
    domain::{CorrelationKey, MessageId, SurfaceId, UserId},
    protocol::{
        AttachmentPayload, CreateMessageRequest, DeleteMessageRequest, EditMessageRequest,
    },
};
use tracing::{debug, info, warn};

use crate::{
    error::{BackendError, FailureReason, LifecycleError},
    reactions::{normalize_emoji, ReactionAggregator, ReactionOp, ReactionSummary},
    store::{LifecycleStatus, MessageRecord, SurfaceRegistry, SurfaceState},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DraftMessage {
    pub body: Option<String>,
    pub attachments: Vec<AttachmentPayload>,
    pub reply_to: Option<MessageId>,
}

impl DraftMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    pub fn with_attachment(mut self, attachment: AttachmentPayload) -> Self {
        self.attachments.push(attachment);
        self
    }

    fn is_empty(&self) -> bool {
        self.body.as_deref().map_or(true, |body| body.trim().is_empty())
            && self.attachments.is_empty()
    }

    fn to_request(&self, key: &CorrelationKey) -> CreateMessageRequest {
        CreateMessageRequest {
            correlation_key: key.clone(),
            body: self.body.clone(),
            attachments: self.attachments.clone(),
            reply_to: self.reply_to,
        }
    }
}

/// A request the caller must issue after a local mutation was staged.
#[derive(Debug, Clone)]
pub enum OutboundRequest {
    Create {
        surface: SurfaceId,
        key: CorrelationKey,
        request: CreateMessageRequest,
    },
    Edit {
        surface: SurfaceId,
        message_id: MessageId,
        request: EditMessageRequest,
    },
    Delete {
        surface: SurfaceId,
        message_id: MessageId,
        request: DeleteMessageRequest,
    },
    Reactions {
        surface: SurfaceId,
        message_id: MessageId,
        key: CorrelationKey,
        ops: Vec<ReactionOp>,
    },
}

impl OutboundRequest {
    pub fn key(&self) -> &CorrelationKey {
        match self {
            Self::Create { key, .. } | Self::Reactions { key, .. } => key,
            Self::Edit { request, .. } => &request.correlation_key,
            Self::Delete { request, .. } => &request.correlation_key,
        }
    }

    pub fn surface(&self) -> SurfaceId {
        match self {
            Self::Create { surface, .. }
            | Self::Edit { surface, .. }
            | Self::Delete { surface, .. }
            | Self::Reactions { surface, .. } => *surface,
        }
    }
}

/// Exact pre-edit values, captured before the optimistic mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSnapshot {
    pub body: Option<String>,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
struct DeleteSnapshot {
    body: Option<String>,
    edited_at: Option<DateTime<Utc>>,
    attachments: Vec<AttachmentPayload>,
    reactions: ReactionSummary,
}

#[derive(Debug, Clone)]
struct OutboundSend {
    surface: SurfaceId,
    draft: DraftMessage,
    attempts: u32,
}

#[derive(Debug, Clone)]
struct EditTicket {
    surface: SurfaceId,
    message_id: MessageId,
    prior: EditSnapshot,
}

#[derive(Debug, Clone)]
struct DeleteTicket {
    surface: SurfaceId,
    message_id: MessageId,
    prior: DeleteSnapshot,
}

#[derive(Debug, Clone)]
struct ReactionTicket {
    surface: SurfaceId,
    message_id: MessageId,
}

pub struct OptimisticLifecycleManager {
    current_user: UserId,
    aggregator: ReactionAggregator,
    sends: HashMap<CorrelationKey, OutboundSend>,
    edits: HashMap<CorrelationKey, EditTicket>,
    // Pending edit keys per message, oldest first.
    edit_order: HashMap<MessageId, Vec<CorrelationKey>>,
    deletes: HashMap<CorrelationKey, DeleteTicket>,
    reactions: HashMap<CorrelationKey, ReactionTicket>,
}

impl OptimisticLifecycleManager {
    pub fn new(current_user: UserId) -> Self {
        Self {
            current_user,
            aggregator: ReactionAggregator::new(current_user),
            sends: HashMap::new(),
            edits: HashMap::new(),
            edit_order: HashMap::new(),
            deletes: HashMap::new(),
            reactions: HashMap::new(),
        }
    }

    pub fn current_user(&self) -> UserId {
        self.current_user
    }

    /// Inserts a pending record under a freshly minted key.
    pub fn stage_submit(
        &mut self,
        registry: &mut SurfaceRegistry,
        surface: SurfaceId,
        draft: DraftMessage,
        now: DateTime<Utc>,
    ) -> Result<OutboundRequest, LifecycleError> {
        self.stage_submit_with_key(registry, surface, draft, CorrelationKey::mint(), now)
    }

    pub fn stage_submit_with_key(
        &mut self,
        registry: &mut SurfaceRegistry,
        surface: SurfaceId,
        draft: DraftMessage,
        key: CorrelationKey,
        now: DateTime<Utc>,
    ) -> Result<OutboundRequest, LifecycleError> {
        if draft.is_empty() {
            return Err(LifecycleError::EmptyMessage);
        }
        let state = surface_mut(registry, surface)?;

        let record = MessageRecord {
            id: None,
            correlation_key: Some(key.clone()),
            surface,
            sender_id: self.current_user,
            body: draft.body.clone(),
            attachments: draft.attachments.clone(),
            created_at: now,
            edited_at: None,
            deleted_at: None,
            reply_to: draft.reply_to,
            reactions: ReactionSummary::default(),
            read_by: BTreeSet::new(),
            status: LifecycleStatus::Pending,
        };
        if !state.store.push(record) {
            return Err(LifecycleError::DuplicateCorrelationKey(key));
        }

        let request = draft.to_request(&key);
        self.sends.insert(
            key.clone(),
            OutboundSend {
                surface,
                draft,
                attempts: 1,
            },
        );
        debug!(surface = %surface, key = %key, "lifecycle: staged pending message");
        Ok(OutboundRequest::Create {
            surface,
            key,
            request,
        })
    }

    /// Marks a pending send as failed in place. A record already confirmed through an echo is
    /// left alone.
    pub fn send_failed(
        &mut self,
        registry: &mut SurfaceRegistry,
        key: &CorrelationKey,
        error: BackendError,
    ) -> Option<LifecycleStatus> {
        let Some(send) = self.sends.get(key) else {
            debug!(key = %key, "lifecycle: failure for a send that already resolved");
            return None;
        };
        let record = registry
            .get_mut(send.surface)
            .and_then(|state| state.store.get_by_key_mut(key))?;
        if !record.is_pending() {
            return None;
        }
        warn!(
            surface = %send.surface,
            key = %key,
            attempts = send.attempts,
            error = %error,
            "lifecycle: message send failed"
        );
        record.status = LifecycleStatus::Failed {
            reason: FailureReason::from(error),
        };
        Some(record.status.clone())
    }

    /// Drops bookkeeping for a send whose record was confirmed.
    pub fn resolve_send(&mut self, key: &CorrelationKey) -> bool {
        self.sends.remove(key).is_some()
    }

    pub fn has_pending_send(&self, key: &CorrelationKey) -> bool {
        self.sends.contains_key(key)
    }

    pub fn pending_send_count(&self) -> usize {
        self.sends.len()
    }

    /// Re-issues a failed record's original payload under the same key.
    pub fn stage_retry(
        &mut self,
        registry: &mut SurfaceRegistry,
        key: &CorrelationKey,
    ) -> Result<OutboundRequest, LifecycleError> {
        let send = self
            .sends
            .get_mut(key)
            .ok_or_else(|| LifecycleError::UnknownCorrelationKey(key.clone()))?;
        let record = registry
            .get_mut(send.surface)
            .and_then(|state| state.store.get_by_key_mut(key))
            .ok_or_else(|| LifecycleError::UnknownCorrelationKey(key.clone()))?;
        if !record.is_failed() {
            return Err(LifecycleError::NotFailed(key.clone()));
        }
        record.status = LifecycleStatus::Pending;
        send.attempts += 1;
        info!(surface = %send.surface, key = %key, attempt = send.attempts, "lifecycle: retrying send");
        Ok(OutboundRequest::Create {
            surface: send.surface,
            key: key.clone(),
            request: send.draft.to_request(key),
        })
    }

    /// Removes a failed record. Pending records cannot be cancelled.
    pub fn cancel(
        &mut self,
        registry: &mut SurfaceRegistry,
        key: &CorrelationKey,
    ) -> Result<MessageRecord, LifecycleError> {
        let send = self
            .sends
            .get(key)
            .ok_or_else(|| LifecycleError::UnknownCorrelationKey(key.clone()))?;
        let state = surface_mut(registry, send.surface)?;
        let is_failed = state
            .store
            .get_by_key(key)
            .is_some_and(MessageRecord::is_failed);
        if !is_failed {
            return Err(LifecycleError::NotFailed(key.clone()));
        }
        let removed = state
            .store
            .remove_by_key(key)
            .ok_or_else(|| LifecycleError::UnknownCorrelationKey(key.clone()))?;
        self.sends.remove(key);
        info!(surface = %removed.surface, key = %key, "lifecycle: cancelled failed send");
        Ok(removed)
    }

    pub fn stage_edit(
        &mut self,
        registry: &mut SurfaceRegistry,
        surface: SurfaceId,
        message_id: MessageId,
        body: String,
        now: DateTime<Utc>,
    ) -> Result<OutboundRequest, LifecycleError> {
        if body.trim().is_empty() {
            return Err(LifecycleError::EmptyEdit);
        }
        let record = modifiable_record(registry, surface, message_id)?;
        let prior = EditSnapshot {
            body: record.body.clone(),
            edited_at: record.edited_at,
        };
        record.body = Some(body.clone());
        record.edited_at = Some(now);

        let key = CorrelationKey::mint();
        self.edits.insert(
            key.clone(),
            EditTicket {
                surface,
                message_id,
                prior,
            },
        );
        self.edit_order
            .entry(message_id)
            .or_default()
            .push(key.clone());
        Ok(OutboundRequest::Edit {
            surface,
            message_id,
            request: EditMessageRequest {
                correlation_key: key,
                body,
            },
        })
    }

    /// Rolls back a failed edit. Only the newest pending edit touches the record; an older
    /// failure hands its snapshot to the next edit in line instead.
    pub fn edit_failed(
        &mut self,
        registry: &mut SurfaceRegistry,
        key: &CorrelationKey,
        error: BackendError,
    ) -> bool {
        let Some(ticket) = self.edits.remove(key) else {
            return false;
        };
        warn!(
            surface = %ticket.surface,
            message_id = ticket.message_id.0,
            error = %error,
            "lifecycle: edit failed; rolling back"
        );

        let order = self.edit_order.entry(ticket.message_id).or_default();
        let position = order.iter().position(|pending| pending == key);
        if let Some(position) = position {
            order.remove(position);
        }
        let next_key = position.and_then(|position| order.get(position).cloned());
        if order.is_empty() {
            self.edit_order.remove(&ticket.message_id);
        }

        if let Some(next_key) = next_key {
            if let Some(next) = self.edits.get_mut(&next_key) {
                next.prior = ticket.prior;
            }
            return false;
        }

        let Some(record) = registry
            .get_mut(ticket.surface)
            .and_then(|state| state.store.get_by_id_mut(ticket.message_id))
        else {
            return false;
        };
        if record.is_deleted() {
            // A pending delete captured the refused edit; its restore must use the pre-edit value.
            self.retarget_delete_restore(ticket.message_id, &ticket.prior);
            return false;
        }
        record.body = ticket.prior.body;
        record.edited_at = ticket.prior.edited_at;
        true
    }

    fn retarget_delete_restore(&mut self, message_id: MessageId, snapshot: &EditSnapshot) {
        for ticket in self.deletes.values_mut() {
            if ticket.message_id == message_id {
                ticket.prior.body = snapshot.body.clone();
                ticket.prior.edited_at = snapshot.edited_at;
            }
        }
    }

    pub fn resolve_edit(&mut self, key: &CorrelationKey) -> bool {
        let Some(ticket) = self.edits.remove(key) else {
            return false;
        };
        if let Some(order) = self.edit_order.get_mut(&ticket.message_id) {
            order.retain(|pending| pending != key);
            if order.is_empty() {
                self.edit_order.remove(&ticket.message_id);
            }
        }
        true
    }

    /// An authoritative value arrived from the server; it becomes the rollback target of every
    /// edit still pending on that message.
    pub fn observe_authoritative_edit(&mut self, message_id: MessageId, snapshot: &EditSnapshot) {
        if let Some(order) = self.edit_order.get(&message_id) {
            for key in order {
                if let Some(ticket) = self.edits.get_mut(key) {
                    ticket.prior = snapshot.clone();
                }
            }
        }
        self.retarget_delete_restore(message_id, snapshot);
    }

    pub fn pending_edit_count(&self, message_id: MessageId) -> usize {
        self.edit_order.get(&message_id).map_or(0, Vec::len)
    }

    pub fn stage_delete(
        &mut self,
        registry: &mut SurfaceRegistry,
        surface: SurfaceId,
        message_id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<OutboundRequest, LifecycleError> {
        let record = modifiable_record(registry, surface, message_id)?;
        let prior = DeleteSnapshot {
            body: record.body.clone(),
            edited_at: record.edited_at,
            attachments: record.attachments.clone(),
            reactions: record.reactions.clone(),
        };
        record.soft_delete(now);

        let key = CorrelationKey::mint();
        self.deletes.insert(
            key.clone(),
            DeleteTicket {
                surface,
                message_id,
                prior,
            },
        );
        Ok(OutboundRequest::Delete {
            surface,
            message_id,
            request: DeleteMessageRequest {
                correlation_key: key,
            },
        })
    }

    /// Restores a record whose delete was refused, unless the server has since deleted it.
    pub fn delete_failed(
        &mut self,
        registry: &mut SurfaceRegistry,
        key: &CorrelationKey,
        error: BackendError,
    ) -> bool {
        let Some(ticket) = self.deletes.remove(key) else {
            return false;
        };
        warn!(
            surface = %ticket.surface,
            message_id = ticket.message_id.0,
            error = %error,
            "lifecycle: delete failed; restoring message"
        );
        let Some(record) = registry
            .get_mut(ticket.surface)
            .and_then(|state| state.store.get_by_id_mut(ticket.message_id))
        else {
            return false;
        };
        record.deleted_at = None;
        record.body = ticket.prior.body;
        record.edited_at = ticket.prior.edited_at;
        record.attachments = ticket.prior.attachments;
        record.reactions = ticket.prior.reactions;
        true
    }

    pub fn resolve_delete(&mut self, key: &CorrelationKey) -> bool {
        self.deletes.remove(key).is_some()
    }

    /// The server confirmed a deletion; no pending delete of that message may restore it.
    pub fn observe_authoritative_delete(&mut self, message_id: MessageId) {
        self.deletes
            .retain(|_, ticket| ticket.message_id != message_id);
    }

    /// Applies the toggle locally and returns the ordered server ops under one key.
    pub fn stage_toggle_reaction(
        &mut self,
        registry: &mut SurfaceRegistry,
        surface: SurfaceId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<OutboundRequest, LifecycleError> {
        let emoji =
            normalize_emoji(emoji).ok_or_else(|| LifecycleError::InvalidEmoji(emoji.to_string()))?;
        let record = modifiable_record(registry, surface, message_id)?;
        let ops = self
            .aggregator
            .toggle(&mut record.reactions, &emoji, self.current_user);

        let key = CorrelationKey::mint();
        self.reactions.insert(
            key.clone(),
            ReactionTicket {
                surface,
                message_id,
            },
        );
        Ok(OutboundRequest::Reactions {
            surface,
            message_id,
            key,
            ops,
        })
    }

    /// Reverts exactly one refused reaction op. A refused remove is only re-credited when the
    /// user holds no other reaction on the message.
    pub fn reaction_op_failed(
        &mut self,
        registry: &mut SurfaceRegistry,
        key: &CorrelationKey,
        op: &ReactionOp,
        error: &BackendError,
    ) -> bool {
        let Some(ticket) = self.reactions.get(key) else {
            return false;
        };
        warn!(
            surface = %ticket.surface,
            message_id = ticket.message_id.0,
            emoji = op.emoji(),
            error = %error,
            "lifecycle: reaction change failed; reverting"
        );
        let Some(record) = registry
            .get_mut(ticket.surface)
            .and_then(|state| state.store.get_by_id_mut(ticket.message_id))
        else {
            return false;
        };
        if record.is_deleted() {
            return false;
        }
        match op {
            ReactionOp::Add(emoji) => {
                self.aggregator
                    .apply_remove(&mut record.reactions, emoji, self.current_user)
            }
            ReactionOp::Remove(emoji) => {
                if record.reactions.reaction_of(self.current_user).is_some() {
                    return false;
                }
                self.aggregator
                    .apply_add(&mut record.reactions, emoji, self.current_user)
                    .changed
            }
        }
    }

    pub fn resolve_reactions(&mut self, key: &CorrelationKey) -> bool {
        self.reactions.remove(key).is_some()
    }
}

fn surface_mut(
    registry: &mut SurfaceRegistry,
    surface: SurfaceId,
) -> Result<&mut SurfaceState, LifecycleError> {
    registry
        .get_mut(surface)
        .ok_or(LifecycleError::UnknownSurface(surface))
}

fn modifiable_record(
    registry: &mut SurfaceRegistry,
    surface: SurfaceId,
    message_id: MessageId,
) -> Result<&mut MessageRecord, LifecycleError> {
    let record = surface_mut(registry, surface)?
        .store
        .get_by_id_mut(message_id)
        .ok_or(LifecycleError::UnknownMessage {
            surface,
            message_id,
        })?;
    if !record.is_modifiable() {
        return Err(LifecycleError::NotModifiable(message_id));
    }
    Ok(record)
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
