//! Per-surface message stores and the registry that isolates them.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::{CorrelationKey, MessageId, SurfaceId, UserId},
    protocol::{AttachmentPayload, MessagePayload},
};

use crate::{
    error::FailureReason,
    reactions::{ReactionAggregator, ReactionSummary},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LifecycleStatus {
    Pending,
    Confirmed,
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    /// Server id, present once confirmed.
    pub id: Option<MessageId>,
    /// Present on records that started as local optimistic sends. Kept after confirmation so
    /// late duplicate echoes are still recognised.
    pub correlation_key: Option<CorrelationKey>,
    pub surface: SurfaceId,
    pub sender_id: UserId,
    pub body: Option<String>,
    pub attachments: Vec<AttachmentPayload>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub reply_to: Option<MessageId>,
    pub reactions: ReactionSummary,
    pub read_by: BTreeSet<UserId>,
    pub status: LifecycleStatus,
}

impl MessageRecord {
    pub fn from_payload(payload: MessagePayload, aggregator: &ReactionAggregator) -> Self {
        let mut record = Self {
            id: Some(payload.message_id),
            correlation_key: payload.correlation_key,
            surface: payload.surface,
            sender_id: payload.sender_id,
            body: payload.body,
            attachments: payload.attachments,
            created_at: payload.created_at,
            edited_at: payload.edited_at,
            deleted_at: None,
            reply_to: payload.reply_to,
            reactions: aggregator.normalize(payload.reactions),
            read_by: payload.read_by.into_iter().collect(),
            status: LifecycleStatus::Confirmed,
        };
        if let Some(deleted_at) = payload.deleted_at {
            record.soft_delete(deleted_at);
        }
        record
    }

    pub fn is_pending(&self) -> bool {
        self.status == LifecycleStatus::Pending
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == LifecycleStatus::Confirmed
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, LifecycleStatus::Failed { .. })
    }

    pub fn is_edited(&self) -> bool {
        self.edited_at.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Confirmed and not deleted: the only state edits, deletes and reactions may target.
    pub fn is_modifiable(&self) -> bool {
        self.id.is_some() && self.is_confirmed() && !self.is_deleted()
    }

    /// Clears displayable content while keeping the record addressable.
    pub fn soft_delete(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
        self.body = None;
        self.attachments.clear();
        self.reactions.clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    records: Vec<MessageRecord>,
}

impl MessageStore {
    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn position_by_id(&self, id: MessageId) -> Option<usize> {
        self.records.iter().position(|record| record.id == Some(id))
    }

    pub fn position_by_key(&self, key: &CorrelationKey) -> Option<usize> {
        self.records
            .iter()
            .position(|record| record.correlation_key.as_ref() == Some(key))
    }

    pub fn get_by_id(&self, id: MessageId) -> Option<&MessageRecord> {
        self.records.iter().find(|record| record.id == Some(id))
    }

    pub fn get_by_id_mut(&mut self, id: MessageId) -> Option<&mut MessageRecord> {
        self.records.iter_mut().find(|record| record.id == Some(id))
    }

    pub fn get_by_key(&self, key: &CorrelationKey) -> Option<&MessageRecord> {
        self.records
            .iter()
            .find(|record| record.correlation_key.as_ref() == Some(key))
    }

    pub fn get_by_key_mut(&mut self, key: &CorrelationKey) -> Option<&mut MessageRecord> {
        self.records
            .iter_mut()
            .find(|record| record.correlation_key.as_ref() == Some(key))
    }

    fn collides(&self, record: &MessageRecord) -> bool {
        record.id.is_some_and(|id| self.position_by_id(id).is_some())
            || record
                .correlation_key
                .as_ref()
                .is_some_and(|key| self.position_by_key(key).is_some())
    }

    /// Appends in arrival order. Refuses records whose id or correlation key is already stored.
    pub fn push(&mut self, record: MessageRecord) -> bool {
        if self.collides(&record) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Replaces the optimistic record for `key` in place, keeping its render position. A copy
    /// of the same server id that arrived earlier without the key is dropped.
    pub fn promote(&mut self, key: &CorrelationKey, mut confirmed: MessageRecord) -> bool {
        let Some(position) = self.position_by_key(key) else {
            return false;
        };
        confirmed.correlation_key = Some(key.clone());
        let duplicate = confirmed.id.and_then(|id| {
            self.records
                .iter()
                .enumerate()
                .find(|(index, record)| *index != position && record.id == Some(id))
                .map(|(index, _)| index)
        });
        let position = match duplicate {
            Some(index) => {
                self.records.remove(index);
                if index < position {
                    position - 1
                } else {
                    position
                }
            }
            None => position,
        };
        self.records[position] = confirmed;
        true
    }

    pub fn remove_by_key(&mut self, key: &CorrelationKey) -> Option<MessageRecord> {
        let position = self.position_by_key(key)?;
        Some(self.records.remove(position))
    }

    /// Oldest server id currently loaded; the cursor for the next older page.
    pub fn oldest_loaded_id(&self) -> Option<MessageId> {
        self.records.iter().find_map(|record| record.id)
    }

    /// Prepends an older page (given oldest first), skipping records already present.
    pub fn prepend_page(&mut self, page: Vec<MessageRecord>) -> usize {
        let fresh: Vec<MessageRecord> = page
            .into_iter()
            .filter(|record| !self.collides(record))
            .collect();
        let inserted = fresh.len();
        self.records.splice(0..0, fresh);
        inserted
    }

    /// Places a fetched record right after the newest confirmed record not newer than it.
    /// Optimistic records are skipped over and keep their relative position.
    pub fn insert_by_timestamp(&mut self, record: MessageRecord) -> bool {
        if self.collides(&record) {
            return false;
        }
        let position = match self.records.iter().rposition(|existing| {
            existing.is_confirmed() && existing.created_at <= record.created_at
        }) {
            Some(index) => index + 1,
            None => self
                .records
                .iter()
                .position(MessageRecord::is_confirmed)
                .unwrap_or(0),
        };
        self.records.insert(position, record);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub oldest_loaded: Option<MessageId>,
    pub has_more: bool,
    pub loading: bool,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            oldest_loaded: None,
            has_more: true,
            loading: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SurfaceState {
    pub surface: SurfaceId,
    pub store: MessageStore,
    pub pagination: Pagination,
    pub typing: BTreeSet<UserId>,
    pub members: BTreeSet<UserId>,
    pub unread: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

impl SurfaceState {
    pub fn new(surface: SurfaceId) -> Self {
        Self {
            surface,
            store: MessageStore::default(),
            pagination: Pagination::default(),
            typing: BTreeSet::new(),
            members: BTreeSet::new(),
            unread: 0,
            last_activity: None,
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        if self.last_activity.map_or(true, |current| at > current) {
            self.last_activity = Some(at);
        }
    }

    pub fn refresh_cursor(&mut self) {
        self.pagination.oldest_loaded = self.store.oldest_loaded_id();
    }

    pub fn snapshot(&self) -> SurfaceSnapshot {
        SurfaceSnapshot {
            surface: self.surface,
            messages: self.store.records().to_vec(),
            pagination: self.pagination.clone(),
            typing: self.typing.clone(),
            members: self.members.clone(),
            unread: self.unread,
            last_activity: self.last_activity,
        }
    }
}

/// Read model handed to the UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct SurfaceSnapshot {
    pub surface: SurfaceId,
    pub messages: Vec<MessageRecord>,
    pub pagination: Pagination,
    pub typing: BTreeSet<UserId>,
    pub members: BTreeSet<UserId>,
    pub unread: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct SurfaceRegistry {
    surfaces: HashMap<SurfaceId, SurfaceState>,
    viewing: Option<SurfaceId>,
}

impl SurfaceRegistry {
    /// Returns false when the surface was already open.
    pub fn open(&mut self, surface: SurfaceId) -> bool {
        if self.surfaces.contains_key(&surface) {
            return false;
        }
        self.surfaces.insert(surface, SurfaceState::new(surface));
        true
    }

    pub fn close(&mut self, surface: SurfaceId) -> Option<SurfaceState> {
        if self.viewing == Some(surface) {
            self.viewing = None;
        }
        self.surfaces.remove(&surface)
    }

    pub fn contains(&self, surface: SurfaceId) -> bool {
        self.surfaces.contains_key(&surface)
    }

    pub fn get(&self, surface: SurfaceId) -> Option<&SurfaceState> {
        self.surfaces.get(&surface)
    }

    pub fn get_mut(&mut self, surface: SurfaceId) -> Option<&mut SurfaceState> {
        self.surfaces.get_mut(&surface)
    }

    pub fn ids(&self) -> Vec<SurfaceId> {
        let mut ids: Vec<SurfaceId> = self.surfaces.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Marks `surface` as the one on screen and clears its unread counter.
    pub fn view(&mut self, surface: Option<SurfaceId>) {
        self.viewing = surface;
        if let Some(state) = surface.and_then(|surface| self.surfaces.get_mut(&surface)) {
            state.unread = 0;
        }
    }

    pub fn viewing(&self) -> Option<SurfaceId> {
        self.viewing
    }

    pub fn is_viewing(&self, surface: SurfaceId) -> bool {
        self.viewing == Some(surface)
    }

    pub fn total_unread(&self) -> u32 {
        self.surfaces.values().map(|state| state.unread).sum()
    }

    pub fn snapshot(&self, surface: SurfaceId) -> Option<SurfaceSnapshot> {
        self.surfaces.get(&surface).map(SurfaceState::snapshot)
    }

    /// Finds the surface holding an optimistic record for `key`.
    pub fn surface_for_key(&self, key: &CorrelationKey) -> Option<SurfaceId> {
        self.surfaces
            .values()
            .find(|state| state.store.position_by_key(key).is_some())
            .map(|state| state.surface)
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
