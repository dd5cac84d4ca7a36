use super::*;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{RoomId, TopicId},
    protocol::{GroupedReaction, ReactionsWire},
};

use crate::lifecycle::DraftMessage;

const ME: UserId = UserId(1);
const ALICE: UserId = UserId(2);
const BOB: UserId = UserId(3);

fn topic() -> SurfaceId {
    SurfaceId::Topic(TopicId(8))
}

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

fn payload(id: i64, sender: UserId, body: &str, seconds: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        surface: topic(),
        sender_id: sender,
        body: Some(body.into()),
        attachments: Vec::new(),
        created_at: at(seconds),
        edited_at: None,
        deleted_at: None,
        reply_to: None,
        reactions: ReactionsWire::default(),
        read_by: Vec::new(),
        correlation_key: None,
    }
}

fn created(message: MessagePayload, key: Option<&str>) -> ServerEvent {
    ServerEvent::MessageCreated {
        message,
        correlation_key: key.map(CorrelationKey::from),
    }
}

struct Harness {
    registry: SurfaceRegistry,
    lifecycle: OptimisticLifecycleManager,
    reconciler: EventReconciler,
}

impl Harness {
    fn new() -> Self {
        let mut registry = SurfaceRegistry::default();
        registry.open(topic());
        Self {
            registry,
            lifecycle: OptimisticLifecycleManager::new(ME),
            reconciler: EventReconciler::new(ME),
        }
    }

    fn apply(&mut self, event: ServerEvent) -> Applied {
        self.reconciler
            .apply(&mut self.registry, &mut self.lifecycle, event)
    }

    fn merge(&mut self, page: HistoryPage, placement: PagePlacement) -> PageMerge {
        self.reconciler
            .merge_page(&mut self.registry, &mut self.lifecycle, topic(), page, placement)
            .expect("surface open")
    }

    fn state(&self) -> &SurfaceState {
        self.registry.get(topic()).expect("topic")
    }

    fn record(&self, id: i64) -> &MessageRecord {
        self.state()
            .store
            .get_by_id(MessageId(id))
            .expect("record")
    }
}

#[test]
fn echo_with_correlation_key_promotes_pending_record() {
    let mut harness = Harness::new();
    let key = CorrelationKey::from("tmp-1");
    harness
        .lifecycle
        .stage_submit_with_key(
            &mut harness.registry,
            topic(),
            DraftMessage::text("hello"),
            key.clone(),
            at(0),
        )
        .expect("staged");

    let applied = harness.apply(created(payload(42, ME, "hello", 1), Some("tmp-1")));
    assert_eq!(
        applied,
        Applied::Promoted {
            surface: topic(),
            key: key.clone(),
            message_id: MessageId(42)
        }
    );

    let records = harness.state().store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, Some(MessageId(42)));
    assert!(records[0].is_confirmed());
    assert_eq!(records[0].body.as_deref(), Some("hello"));
    assert_eq!(records[0].created_at, at(1));
    assert!(!harness.lifecycle.has_pending_send(&key));
}

#[test]
fn duplicate_deliveries_store_exactly_one_record() {
    let mut harness = Harness::new();
    let key = CorrelationKey::from("tmp-1");
    harness
        .lifecycle
        .stage_submit_with_key(
            &mut harness.registry,
            topic(),
            DraftMessage::text("hello"),
            key,
            at(0),
        )
        .expect("staged");

    // Response, broadcast without key, then a re-delivered echo.
    harness.apply(created(payload(42, ME, "hello", 1), Some("tmp-1")));
    assert!(matches!(
        harness.apply(created(payload(42, ME, "hello", 1), None)),
        Applied::Unchanged { .. }
    ));
    assert!(matches!(
        harness.apply(created(payload(42, ME, "hello", 1), Some("tmp-1"))),
        Applied::Unchanged { .. }
    ));
    assert_eq!(harness.state().store.len(), 1);
}

#[test]
fn broadcast_before_echo_still_yields_one_record() {
    let mut harness = Harness::new();
    let key = CorrelationKey::from("tmp-7");
    harness
        .lifecycle
        .stage_submit_with_key(
            &mut harness.registry,
            topic(),
            DraftMessage::text("race"),
            key,
            at(0),
        )
        .expect("staged");

    harness.apply(created(payload(50, ME, "race", 1), None));
    assert_eq!(harness.state().store.len(), 2);
    harness.apply(created(payload(50, ME, "race", 1), Some("tmp-7")));

    let records = harness.state().store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, Some(MessageId(50)));
    assert!(records[0].is_confirmed());
}

#[test]
fn failed_then_retried_send_confirms_once() {
    let mut harness = Harness::new();
    let key = CorrelationKey::from("tmp-9");
    harness
        .lifecycle
        .stage_submit_with_key(
            &mut harness.registry,
            topic(),
            DraftMessage::text("again"),
            key.clone(),
            at(0),
        )
        .expect("staged");
    harness.lifecycle.send_failed(
        &mut harness.registry,
        &key,
        crate::error::BackendError::Transport("timeout".into()),
    );
    harness
        .lifecycle
        .stage_retry(&mut harness.registry, &key)
        .expect("retry");

    harness.apply(created(payload(60, ME, "again", 2), Some("tmp-9")));
    let records = harness.state().store.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_confirmed());
}

#[test]
fn messages_from_others_append_and_count_unread_when_not_viewed() {
    let mut harness = Harness::new();
    harness.apply(created(payload(1, ALICE, "hi", 10), None));
    harness.apply(created(payload(2, ME, "mine", 11), None));
    assert_eq!(harness.state().unread, 1);
    assert_eq!(harness.state().last_activity, Some(at(11)));

    harness.registry.view(Some(topic()));
    harness.apply(created(payload(3, ALICE, "seen", 12), None));
    assert_eq!(harness.state().unread, 0);

    let ids: Vec<Option<MessageId>> = harness
        .state()
        .store
        .records()
        .iter()
        .map(|record| record.id)
        .collect();
    assert_eq!(ids, vec![Some(MessageId(1)), Some(MessageId(2)), Some(MessageId(3))]);
}

#[test]
fn events_for_closed_surfaces_are_dropped() {
    let mut harness = Harness::new();
    let mut foreign = payload(5, ALICE, "elsewhere", 0);
    foreign.surface = SurfaceId::Room(RoomId(404));
    assert!(matches!(
        harness.apply(created(foreign, None)),
        Applied::Dropped { .. }
    ));
    assert!(harness.state().store.is_empty());
}

#[test]
fn edits_are_last_write_wins_and_idempotent() {
    let mut harness = Harness::new();
    harness.apply(created(payload(7, ME, "v0", 0), None));

    let first = ServerEvent::MessageEdited {
        surface: topic(),
        message_id: MessageId(7),
        body: "v1".into(),
        edited_at: at(5),
        correlation_key: None,
    };
    let second = ServerEvent::MessageEdited {
        surface: topic(),
        message_id: MessageId(7),
        body: "v2".into(),
        edited_at: at(4),
        correlation_key: None,
    };
    harness.apply(first.clone());
    harness.apply(second);
    assert_eq!(harness.record(7).body.as_deref(), Some("v2"));
    assert_eq!(harness.record(7).edited_at, Some(at(4)));

    harness.apply(first.clone());
    assert_eq!(harness.record(7).body.as_deref(), Some("v1"));
    assert!(matches!(harness.apply(first), Applied::Unchanged { .. }));
}

#[test]
fn rapid_edits_resolve_deterministically_by_processing_order() {
    let mut harness = Harness::new();
    harness.apply(created(payload(7, ME, "v0", 0), None));

    let first = harness
        .lifecycle
        .stage_edit(&mut harness.registry, topic(), MessageId(7), "one".into(), at(1))
        .expect("first");
    let second = harness
        .lifecycle
        .stage_edit(&mut harness.registry, topic(), MessageId(7), "two".into(), at(2))
        .expect("second");

    // Second response lands before the first edit's echo.
    harness.apply(ServerEvent::MessageEdited {
        surface: topic(),
        message_id: MessageId(7),
        body: "two".into(),
        edited_at: at(12),
        correlation_key: Some(second.key().clone()),
    });
    harness.apply(ServerEvent::MessageEdited {
        surface: topic(),
        message_id: MessageId(7),
        body: "one".into(),
        edited_at: at(11),
        correlation_key: Some(first.key().clone()),
    });

    assert_eq!(harness.record(7).body.as_deref(), Some("one"));
    assert_eq!(harness.record(7).edited_at, Some(at(11)));
    assert_eq!(harness.lifecycle.pending_edit_count(MessageId(7)), 0);
}

#[test]
fn edit_for_unloaded_message_is_dropped() {
    let mut harness = Harness::new();
    let applied = harness.apply(ServerEvent::MessageEdited {
        surface: topic(),
        message_id: MessageId(999),
        body: "ghost".into(),
        edited_at: at(1),
        correlation_key: None,
    });
    assert!(matches!(applied, Applied::Dropped { .. }));
}

#[test]
fn delete_keeps_message_addressable_as_reply_target() {
    let mut harness = Harness::new();
    harness.apply(created(payload(1, ALICE, "parent", 0), None));
    let mut reply = payload(2, BOB, "child", 1);
    reply.reply_to = Some(MessageId(1));
    harness.apply(created(reply, None));

    let delete = ServerEvent::MessageDeleted {
        surface: topic(),
        message_id: MessageId(1),
        deleted_at: at(5),
        correlation_key: None,
    };
    assert!(matches!(
        harness.apply(delete.clone()),
        Applied::Updated { .. }
    ));
    assert!(matches!(harness.apply(delete), Applied::Unchanged { .. }));

    let parent = harness.record(1);
    assert!(parent.is_deleted());
    assert!(parent.body.is_none());
    assert_eq!(harness.record(2).reply_to, Some(MessageId(1)));
    assert_eq!(harness.state().store.len(), 2);
}

#[test]
fn reaction_events_are_idempotent_and_enforce_one_emoji_per_user() {
    let mut harness = Harness::new();
    harness.apply(created(payload(3, ALICE, "react to me", 0), None));

    let add = |user: UserId, emoji: &str| ServerEvent::ReactionAdded {
        surface: topic(),
        message_id: MessageId(3),
        user_id: user,
        emoji: emoji.into(),
    };
    harness.apply(add(BOB, "👍"));
    harness.apply(add(BOB, "👍"));
    harness.apply(add(ME, "👍"));
    assert_eq!(harness.record(3).reactions.count("👍"), 2);
    assert!(harness.record(3).reactions.get("👍").expect("bucket").reacted);

    harness.apply(add(BOB, "🔥"));
    assert_eq!(harness.record(3).reactions.count("👍"), 1);
    assert_eq!(harness.record(3).reactions.reaction_of(BOB), Some("🔥"));

    let remove = ServerEvent::ReactionRemoved {
        surface: topic(),
        message_id: MessageId(3),
        user_id: BOB,
        emoji: "🔥".into(),
    };
    harness.apply(remove.clone());
    assert!(matches!(harness.apply(remove), Applied::Unchanged { .. }));
    assert!(harness.record(3).reactions.get("🔥").is_none());

    let unknown = ServerEvent::ReactionAdded {
        surface: topic(),
        message_id: MessageId(404),
        user_id: BOB,
        emoji: "👍".into(),
    };
    assert!(matches!(harness.apply(unknown), Applied::Dropped { .. }));
}

#[test]
fn read_receipts_add_each_reader_once() {
    let mut harness = Harness::new();
    harness.apply(created(payload(1, ME, "a", 0), None));
    harness.apply(created(payload(2, ME, "b", 1), None));

    let read = ServerEvent::MessagesRead {
        surface: topic(),
        user_id: ALICE,
        message_ids: vec![MessageId(1), MessageId(2), MessageId(404)],
    };
    assert!(matches!(harness.apply(read.clone()), Applied::Updated { .. }));
    assert!(matches!(harness.apply(read), Applied::Unchanged { .. }));
    assert_eq!(harness.record(1).read_by.len(), 1);
    assert!(harness.record(2).read_by.contains(&ALICE));
}

#[test]
fn own_read_receipt_clears_unread() {
    let mut harness = Harness::new();
    harness.apply(created(payload(1, ALICE, "a", 0), None));
    assert_eq!(harness.state().unread, 1);
    harness.apply(ServerEvent::MessagesRead {
        surface: topic(),
        user_id: ME,
        message_ids: vec![MessageId(1)],
    });
    assert_eq!(harness.state().unread, 0);
}

#[test]
fn typing_and_membership_update_surface_sets() {
    let mut harness = Harness::new();
    let typing = |user: UserId, typing: bool| ServerEvent::UserTyping {
        surface: topic(),
        user_id: user,
        typing,
    };
    harness.apply(typing(ALICE, true));
    harness.apply(typing(ALICE, true));
    harness.apply(typing(ME, true));
    assert_eq!(harness.state().typing.len(), 1);

    harness.apply(ServerEvent::MembershipChanged {
        surface: topic(),
        user_id: ALICE,
        joined: true,
    });
    assert!(harness.state().members.contains(&ALICE));

    harness.apply(ServerEvent::MembershipChanged {
        surface: topic(),
        user_id: ALICE,
        joined: false,
    });
    assert!(harness.state().members.is_empty());
    assert!(harness.state().typing.is_empty());
}

#[test]
fn server_error_events_leave_state_untouched() {
    let mut harness = Harness::new();
    let applied = harness.apply(ServerEvent::Error(shared::error::ApiError::new(
        shared::error::ErrorCode::Internal,
        "boom",
    )));
    assert!(matches!(applied, Applied::Dropped { .. }));
}

#[test]
fn loading_the_same_older_page_twice_adds_nothing() {
    let mut harness = Harness::new();
    harness.merge(
        HistoryPage {
            messages: vec![payload(10, ALICE, "ten", 100), payload(11, ALICE, "eleven", 110)],
            has_more: true,
        },
        PagePlacement::Latest,
    );
    assert_eq!(
        harness.state().pagination.oldest_loaded,
        Some(MessageId(10))
    );

    let older = HistoryPage {
        messages: vec![payload(8, BOB, "eight", 80), payload(9, BOB, "nine", 90)],
        has_more: false,
    };
    let first = harness.merge(older.clone(), PagePlacement::Older);
    let second = harness.merge(older, PagePlacement::Older);

    assert_eq!(first.inserted, 2);
    assert_eq!(second.inserted, 0);
    assert_eq!(harness.state().store.len(), 4);
    assert_eq!(harness.state().pagination.oldest_loaded, Some(MessageId(8)));
    assert!(!harness.state().pagination.has_more);
    assert_eq!(harness.state().unread, 0);
}

#[test]
fn latest_page_refreshes_loaded_records_and_counts_missed_messages() {
    let mut harness = Harness::new();
    harness.apply(created(payload(1, ALICE, "before", 0), None));
    harness.registry.get_mut(topic()).expect("topic").unread = 0;

    let mut edited = payload(1, ALICE, "after", 0);
    edited.edited_at = Some(at(30));
    edited.reactions = ReactionsWire::Grouped(vec![GroupedReaction {
        emoji: "👍".into(),
        count: 1,
        users: vec![BOB],
        reacted: false,
    }]);
    let page = HistoryPage {
        messages: vec![edited, payload(2, BOB, "missed", 20)],
        has_more: true,
    };
    let merge = harness.merge(page.clone(), PagePlacement::Latest);
    assert_eq!(merge, PageMerge {
            inserted: 1,
            refreshed: 1,
            promoted: 0
        });
    assert_eq!(harness.record(1).body.as_deref(), Some("after"));
    assert_eq!(harness.record(1).reactions.count("👍"), 1);
    assert_eq!(harness.state().unread, 1);

    let again = harness.merge(page, PagePlacement::Latest);
    assert_eq!(again, PageMerge::default());
    assert_eq!(harness.state().store.len(), 2);
}

#[test]
fn latest_page_keeps_pending_records_after_confirmed_history() {
    let mut harness = Harness::new();
    let key = CorrelationKey::from("tmp-3");
    harness
        .lifecycle
        .stage_submit_with_key(
            &mut harness.registry,
            topic(),
            DraftMessage::text("in flight"),
            key.clone(),
            at(0),
        )
        .expect("staged");

    harness.merge(
        HistoryPage {
            messages: vec![payload(1, ALICE, "old", 100)],
            has_more: false,
        },
        PagePlacement::Latest,
    );
    let records = harness.state().store.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, Some(MessageId(1)));
    assert_eq!(records[1].correlation_key.as_ref(), Some(&key));
}

#[test]
fn latest_page_promotes_failed_send_the_server_actually_stored() {
    let mut harness = Harness::new();
    let key = CorrelationKey::from("tmp-4");
    harness
        .lifecycle
        .stage_submit_with_key(
            &mut harness.registry,
            topic(),
            DraftMessage::text("hello"),
            key.clone(),
            at(10),
        )
        .expect("staged");
    harness.lifecycle.send_failed(
        &mut harness.registry,
        &key,
        crate::error::BackendError::Transport("timeout".into()),
    );
    assert!(harness.state().store.records()[0].is_failed());

    let mut stored = payload(42, ME, "hello", 10);
    stored.correlation_key = Some(key.clone());
    let page = HistoryPage {
        messages: vec![stored],
        has_more: false,
    };
    let merge = harness.merge(page.clone(), PagePlacement::Latest);
    assert_eq!(merge.promoted, 1);
    assert_eq!(merge.inserted, 0);

    let records = harness.state().store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, Some(MessageId(42)));
    assert_eq!(records[0].correlation_key.as_ref(), Some(&key));
    assert!(records[0].is_confirmed());
    assert!(!harness.lifecycle.has_pending_send(&key));

    let again = harness.merge(page, PagePlacement::Latest);
    assert_eq!(again, PageMerge::default());
    assert_eq!(harness.state().store.len(), 1);
}
