//! Applies authoritative server events and fetched history pages to the local stores.
//!
//! Every operation here is idempotent: the same event or page applied twice leaves the stores
//! as if it had been applied once. Events for surfaces that are not open are dropped.

use shared::{
    domain::{CorrelationKey, MessageId, SurfaceId, UserId},
    protocol::{HistoryPage, MessagePayload, ServerEvent},
};
use tracing::{debug, warn};

use crate::{
    lifecycle::{EditSnapshot, OptimisticLifecycleManager},
    reactions::{normalize_emoji, ReactionAggregator},
    store::{MessageRecord, SurfaceRegistry, SurfaceState},
};

/// What an applied event did to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// A message nobody had seen locally was appended.
    Inserted {
        surface: SurfaceId,
        message_id: MessageId,
    },
    /// An optimistic record was confirmed in place.
    Promoted {
        surface: SurfaceId,
        key: CorrelationKey,
        message_id: MessageId,
    },
    Updated { surface: SurfaceId },
    /// Already reflected locally.
    Unchanged { surface: SurfaceId },
    Dropped { reason: &'static str },
}

impl Applied {
    /// The surface whose read model changed, if any.
    pub fn changed_surface(&self) -> Option<SurfaceId> {
        match self {
            Self::Inserted { surface, .. }
            | Self::Promoted { surface, .. }
            | Self::Updated { surface } => Some(*surface),
            Self::Unchanged { .. } | Self::Dropped { .. } => None,
        }
    }
}

/// Where a fetched page lands relative to what is already loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePlacement {
    /// Strictly older than the loaded window; prepended.
    Older,
    /// The newest page, fetched on open or after a reconnect; merged by timestamp.
    Latest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageMerge {
    pub inserted: usize,
    pub refreshed: usize,
    /// Optimistic records confirmed by a page copy carrying their key.
    pub promoted: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct EventReconciler {
    aggregator: ReactionAggregator,
}

impl EventReconciler {
    pub fn new(current_user: UserId) -> Self {
        Self {
            aggregator: ReactionAggregator::new(current_user),
        }
    }

    fn current_user(&self) -> UserId {
        self.aggregator.current_user()
    }

    pub fn apply(
        &self,
        registry: &mut SurfaceRegistry,
        lifecycle: &mut OptimisticLifecycleManager,
        event: ServerEvent,
    ) -> Applied {
        let name = event.name();
        if let Some(surface) = event.surface() {
            if !registry.contains(surface) {
                warn!(surface = %surface, event = name, "reconciler: event for a surface that is not open; dropping");
                return Applied::Dropped {
                    reason: "surface not open",
                };
            }
        }

        match event {
            ServerEvent::MessageCreated {
                message,
                correlation_key,
            } => {
                let correlation_key = correlation_key.or_else(|| message.correlation_key.clone());
                self.message_created(registry, lifecycle, message, correlation_key)
            }
            ServerEvent::MessageEdited {
                surface,
                message_id,
                body,
                edited_at,
                correlation_key,
            } => {
                if let Some(key) = &correlation_key {
                    lifecycle.resolve_edit(key);
                }
                let Some(state) = registry.get_mut(surface) else {
                    return Applied::Dropped {
                        reason: "surface not open",
                    };
                };
                let snapshot = EditSnapshot {
                    body: Some(body),
                    edited_at: Some(edited_at),
                };
                apply_edit(state, lifecycle, message_id, snapshot)
            }
            ServerEvent::MessageDeleted {
                surface,
                message_id,
                deleted_at,
                correlation_key,
            } => {
                if let Some(key) = &correlation_key {
                    lifecycle.resolve_delete(key);
                }
                lifecycle.observe_authoritative_delete(message_id);
                let Some(record) = registry
                    .get_mut(surface)
                    .and_then(|state| state.store.get_by_id_mut(message_id))
                else {
                    debug!(surface = %surface, message_id = message_id.0, "reconciler: delete for a message that is not loaded");
                    return Applied::Dropped {
                        reason: "message not loaded",
                    };
                };
                if record.deleted_at == Some(deleted_at) && record.body.is_none() {
                    return Applied::Unchanged { surface };
                }
                record.soft_delete(deleted_at);
                Applied::Updated { surface }
            }
            ServerEvent::ReactionAdded {
                surface,
                message_id,
                user_id,
                emoji,
            } => self.reaction_changed(registry, surface, message_id, user_id, &emoji, true),
            ServerEvent::ReactionRemoved {
                surface,
                message_id,
                user_id,
                emoji,
            } => self.reaction_changed(registry, surface, message_id, user_id, &emoji, false),
            ServerEvent::MessagesRead {
                surface,
                user_id,
                message_ids,
            } => {
                let current_user = self.current_user();
                let Some(state) = registry.get_mut(surface) else {
                    return Applied::Dropped {
                        reason: "surface not open",
                    };
                };
                let mut changed = false;
                for message_id in message_ids {
                    if let Some(record) = state.store.get_by_id_mut(message_id) {
                        changed |= record.read_by.insert(user_id);
                    }
                }
                // Read elsewhere by this user.
                if user_id == current_user && state.unread > 0 {
                    state.unread = 0;
                    changed = true;
                }
                changed_or_unchanged(changed, surface)
            }
            ServerEvent::UserTyping {
                surface,
                user_id,
                typing,
            } => {
                if user_id == self.current_user() {
                    return Applied::Dropped {
                        reason: "own typing echo",
                    };
                }
                let Some(state) = registry.get_mut(surface) else {
                    return Applied::Dropped {
                        reason: "surface not open",
                    };
                };
                let changed = if typing {
                    state.typing.insert(user_id)
                } else {
                    state.typing.remove(&user_id)
                };
                changed_or_unchanged(changed, surface)
            }
            ServerEvent::MembershipChanged {
                surface,
                user_id,
                joined,
            } => {
                let Some(state) = registry.get_mut(surface) else {
                    return Applied::Dropped {
                        reason: "surface not open",
                    };
                };
                let changed = if joined {
                    state.members.insert(user_id)
                } else {
                    let removed = state.members.remove(&user_id);
                    state.typing.remove(&user_id) || removed
                };
                changed_or_unchanged(changed, surface)
            }
            ServerEvent::Error(error) => {
                warn!(code = ?error.code, message = %error.message, "reconciler: server reported an error");
                Applied::Dropped {
                    reason: "server error",
                }
            }
        }
    }

    fn message_created(
        &self,
        registry: &mut SurfaceRegistry,
        lifecycle: &mut OptimisticLifecycleManager,
        message: MessagePayload,
        correlation_key: Option<CorrelationKey>,
    ) -> Applied {
        let surface = message.surface;
        let message_id = message.message_id;
        let viewing = registry.is_viewing(surface);
        let Some(state) = registry.get_mut(surface) else {
            return Applied::Dropped {
                reason: "surface not open",
            };
        };

        if let Some(key) = correlation_key {
            if let Some(existing) = state.store.get_by_key(&key) {
                if existing.is_confirmed() {
                    lifecycle.resolve_send(&key);
                    return Applied::Unchanged { surface };
                }
                let record = MessageRecord::from_payload(message, &self.aggregator);
                let created_at = record.created_at;
                state.store.promote(&key, record);
                lifecycle.resolve_send(&key);
                state.touch(created_at);
                state.refresh_cursor();
                debug!(surface = %surface, key = %key, message_id = message_id.0, "reconciler: confirmed optimistic message");
                return Applied::Promoted {
                    surface,
                    key,
                    message_id,
                };
            }
            if state.store.get_by_id(message_id).is_some() {
                return Applied::Unchanged { surface };
            }
            let mut record = MessageRecord::from_payload(message, &self.aggregator);
            record.correlation_key = Some(key);
            return self.append(state, record, viewing);
        }

        if state.store.get_by_id(message_id).is_some() {
            return Applied::Unchanged { surface };
        }
        let record = MessageRecord::from_payload(message, &self.aggregator);
        self.append(state, record, viewing)
    }

    fn append(&self, state: &mut SurfaceState, record: MessageRecord, viewing: bool) -> Applied {
        let surface = state.surface;
        let Some(message_id) = record.id else {
            return Applied::Dropped {
                reason: "record without server id",
            };
        };
        let counts_as_unread =
            !viewing && record.sender_id != self.current_user() && !record.is_deleted();
        let created_at = record.created_at;
        if !state.store.push(record) {
            return Applied::Unchanged { surface };
        }
        if counts_as_unread {
            state.unread = state.unread.saturating_add(1);
        }
        state.touch(created_at);
        state.refresh_cursor();
        Applied::Inserted {
            surface,
            message_id,
        }
    }

    fn reaction_changed(
        &self,
        registry: &mut SurfaceRegistry,
        surface: SurfaceId,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
        added: bool,
    ) -> Applied {
        let Some(emoji) = normalize_emoji(emoji) else {
            debug!(surface = %surface, message_id = message_id.0, "reconciler: ignoring blank reaction");
            return Applied::Dropped {
                reason: "invalid reaction",
            };
        };
        let Some(record) = registry
            .get_mut(surface)
            .and_then(|state| state.store.get_by_id_mut(message_id))
        else {
            return Applied::Dropped {
                reason: "message not loaded",
            };
        };
        if !record.is_modifiable() {
            return Applied::Dropped {
                reason: "message not modifiable",
            };
        }
        let changed = if added {
            self.aggregator
                .apply_add(&mut record.reactions, &emoji, user_id)
                .changed
        } else {
            self.aggregator
                .apply_remove(&mut record.reactions, &emoji, user_id)
        };
        changed_or_unchanged(changed, surface)
    }

    /// Merges a fetched page into an open surface. Records already loaded are refreshed from
    /// the authoritative copy rather than duplicated. Returns `None` when the surface is closed.
    pub fn merge_page(
        &self,
        registry: &mut SurfaceRegistry,
        lifecycle: &mut OptimisticLifecycleManager,
        surface: SurfaceId,
        page: HistoryPage,
        placement: PagePlacement,
    ) -> Option<PageMerge> {
        let viewing = registry.is_viewing(surface);
        let current_user = self.current_user();
        let state = registry.get_mut(surface)?;
        let resync = !state.store.is_empty();
        let mut merge = PageMerge::default();
        let mut fresh = Vec::new();

        for payload in page.messages {
            if payload.surface != surface {
                warn!(surface = %surface, other = %payload.surface, "reconciler: page contained a foreign message; skipping");
                continue;
            }
            let incoming = MessageRecord::from_payload(payload, &self.aggregator);
            let Some(message_id) = incoming.id else {
                continue;
            };
            if let Some(key) = incoming.correlation_key.clone() {
                let precursor = state
                    .store
                    .get_by_key(&key)
                    .is_some_and(|existing| !existing.is_confirmed());
                if precursor {
                    state.store.promote(&key, incoming);
                    lifecycle.resolve_send(&key);
                    merge.promoted += 1;
                    debug!(surface = %surface, key = %key, message_id = message_id.0, "reconciler: history confirmed optimistic message");
                    continue;
                }
            }
            if state.store.get_by_id(message_id).is_some() {
                if refresh(state, lifecycle, message_id, incoming) {
                    merge.refreshed += 1;
                }
            } else {
                fresh.push(incoming);
            }
        }

        match placement {
            PagePlacement::Older => {
                merge.inserted = state.store.prepend_page(fresh);
                state.pagination.has_more = page.has_more;
            }
            PagePlacement::Latest => {
                for record in fresh {
                    let counts_as_unread = resync
                        && !viewing
                        && record.sender_id != current_user
                        && !record.is_deleted();
                    let created_at = record.created_at;
                    if state.store.insert_by_timestamp(record) {
                        merge.inserted += 1;
                        state.touch(created_at);
                        if counts_as_unread {
                            state.unread = state.unread.saturating_add(1);
                        }
                    }
                }
                if !resync {
                    state.pagination.has_more = page.has_more;
                }
            }
        }
        state.pagination.loading = false;
        state.refresh_cursor();
        debug!(
            surface = %surface,
            inserted = merge.inserted,
            refreshed = merge.refreshed,
            promoted = merge.promoted,
            has_more = state.pagination.has_more,
            "reconciler: merged history page"
        );
        Some(merge)
    }
}

fn changed_or_unchanged(changed: bool, surface: SurfaceId) -> Applied {
    if changed {
        Applied::Updated { surface }
    } else {
        Applied::Unchanged { surface }
    }
}

fn apply_edit(
    state: &mut SurfaceState,
    lifecycle: &mut OptimisticLifecycleManager,
    message_id: MessageId,
    snapshot: EditSnapshot,
) -> Applied {
    let surface = state.surface;
    let Some(record) = state.store.get_by_id_mut(message_id) else {
        debug!(surface = %surface, message_id = message_id.0, "reconciler: edit for a message that is not loaded");
        return Applied::Dropped {
            reason: "message not loaded",
        };
    };
    lifecycle.observe_authoritative_edit(message_id, &snapshot);
    if record.is_deleted() {
        return Applied::Dropped {
            reason: "message deleted",
        };
    }
    if record.body == snapshot.body && record.edited_at == snapshot.edited_at {
        return Applied::Unchanged { surface };
    }
    record.body = snapshot.body;
    record.edited_at = snapshot.edited_at;
    Applied::Updated { surface }
}

/// Brings a loaded record in line with a fetched copy. Returns whether anything changed.
fn refresh(
    state: &mut SurfaceState,
    lifecycle: &mut OptimisticLifecycleManager,
    message_id: MessageId,
    incoming: MessageRecord,
) -> bool {
    let Some(record) = state.store.get_by_id_mut(message_id) else {
        return false;
    };
    if !record.is_confirmed() {
        return false;
    }
    if let Some(deleted_at) = incoming.deleted_at {
        lifecycle.observe_authoritative_delete(message_id);
        if record.deleted_at == Some(deleted_at) && record.body.is_none() {
            return false;
        }
        record.soft_delete(deleted_at);
        return true;
    }
    if record.is_deleted() {
        return false;
    }

    let mut changed = false;
    if incoming.edited_at.is_some()
        && (record.body != incoming.body || record.edited_at != incoming.edited_at)
    {
        let snapshot = EditSnapshot {
            body: incoming.body,
            edited_at: incoming.edited_at,
        };
        lifecycle.observe_authoritative_edit(message_id, &snapshot);
        record.body = snapshot.body;
        record.edited_at = snapshot.edited_at;
        changed = true;
    }
    if record.reactions != incoming.reactions {
        record.reactions = incoming.reactions;
        changed = true;
    }
    let before = record.read_by.len();
    record.read_by.extend(incoming.read_by);
    changed | (record.read_by.len() != before)
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
