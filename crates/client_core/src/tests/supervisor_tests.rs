use super::*;
use shared::domain::{ConversationId, RoomId, TopicId};
use tokio::time::timeout;

use crate::test_support::{fast_policy, next_session, wait_for_state, FakeConnector, WAIT};

fn room() -> SurfaceId {
    SurfaceId::Room(RoomId(1))
}

fn topic() -> SurfaceId {
    SurfaceId::Topic(TopicId(2))
}

#[tokio::test]
async fn concurrent_connects_share_one_attempt() {
    let (connector, mut sessions) = FakeConnector::new();
    let (supervisor, _frames) = ConnectionSupervisor::new(connector.clone(), fast_policy(3));

    let (first, second) = tokio::join!(supervisor.connect("token"), supervisor.connect("token"));
    first.expect("first connect");
    second.expect("second connect");
    supervisor.connect("token").await.expect("already connected");

    assert_eq!(connector.opens(), 1);
    assert_eq!(connector.credentials().await, vec!["token".to_string()]);
    assert_eq!(supervisor.state(), ConnectionState::Connected);
    let _server = next_session(&mut sessions).await;
}

#[tokio::test]
async fn failed_initial_connect_reports_error_and_stays_disconnected() {
    let (connector, _sessions) = FakeConnector::new();
    connector.refuse(true);
    let (supervisor, _frames) = ConnectionSupervisor::new(connector.clone(), fast_policy(3));

    let err = supervisor.connect("token").await.expect_err("refused");
    assert!(matches!(err, ConnectionError::ConnectFailed(ref detail) if detail.contains("refused")));
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert_eq!(connector.opens(), 1);
}

#[tokio::test]
async fn dropped_connection_rejoins_every_active_surface() {
    let (connector, mut sessions) = FakeConnector::new();
    let (supervisor, _frames) = ConnectionSupervisor::new(connector.clone(), fast_policy(3));
    supervisor.join_surface(room()).await;
    supervisor.join_surface(topic()).await;

    supervisor.connect("token").await.expect("connect");
    let mut server = next_session(&mut sessions).await;
    let mut joined = vec![server.next_frame().await, server.next_frame().await];

    drop(server);
    let mut server = next_session(&mut sessions).await;
    let mut rejoined = vec![server.next_frame().await, server.next_frame().await];
    joined.sort_by_key(|frame| format!("{frame:?}"));
    rejoined.sort_by_key(|frame| format!("{frame:?}"));
    assert_eq!(joined, rejoined);
    assert!(rejoined.contains(&ControlFrame::JoinSurface { surface: room() }));
    assert!(rejoined.contains(&ControlFrame::JoinSurface { surface: topic() }));
    assert_eq!(connector.opens(), 2);
}

#[tokio::test]
async fn reconnect_gives_up_after_bounded_attempts() {
    let (connector, mut sessions) = FakeConnector::new();
    let (supervisor, _frames) = ConnectionSupervisor::new(connector.clone(), fast_policy(3));
    supervisor.connect("token").await.expect("connect");
    let server = next_session(&mut sessions).await;

    let mut state_rx = supervisor.subscribe_state();
    connector.refuse(true);
    drop(server);
    wait_for_state(&mut state_rx, |state| state == ConnectionState::Disconnected).await;

    assert_eq!(connector.opens(), 1 + 3);
    assert_eq!(
        supervisor.send_frame(ControlFrame::Typing {
            surface: room(),
            typing: true
        })
        .await,
        Delivery::Dropped
    );
}

#[tokio::test]
async fn disconnect_releases_memberships_without_notifying_server() {
    let (connector, mut sessions) = FakeConnector::new();
    let (supervisor, _frames) = ConnectionSupervisor::new(connector.clone(), fast_policy(3));
    supervisor.join_surface(room()).await;
    supervisor.connect("token").await.expect("connect");
    let mut server = next_session(&mut sessions).await;
    assert_eq!(
        server.next_frame().await,
        ControlFrame::JoinSurface { surface: room() }
    );

    supervisor.disconnect().await;
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert!(supervisor.active_surfaces().await.is_empty());
    // The session task was torn down; no leave frame was written.
    assert!(timeout(WAIT, server.frames.recv())
        .await
        .expect("outbound closes")
        .is_none());

    supervisor.connect("token").await.expect("reconnect");
    let mut server = next_session(&mut sessions).await;
    assert!(timeout(std::time::Duration::from_millis(50), server.frames.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn membership_changes_while_connected_are_sent_immediately() {
    let (connector, mut sessions) = FakeConnector::new();
    let (supervisor, _frames) = ConnectionSupervisor::new(connector, fast_policy(3));
    supervisor.connect("token").await.expect("connect");
    let mut server = next_session(&mut sessions).await;

    let dm = SurfaceId::Conversation(ConversationId(4));
    supervisor.join_surface(dm).await;
    supervisor.join_surface(dm).await;
    assert_eq!(server.next_frame().await, ControlFrame::JoinSurface { surface: dm });

    supervisor.leave_surface(dm).await;
    assert_eq!(server.next_frame().await, ControlFrame::LeaveSurface { surface: dm });
    assert!(supervisor.active_surfaces().await.is_empty());

    let delivery = supervisor
        .send_frame(ControlFrame::Typing {
            surface: dm,
            typing: true,
        })
        .await;
    assert_eq!(delivery, Delivery::Sent);
    assert_eq!(
        server.next_frame().await,
        ControlFrame::Typing {
            surface: dm,
            typing: true
        }
    );
}

#[tokio::test]
async fn inbound_frames_are_forwarded_across_reconnects() {
    let (connector, mut sessions) = FakeConnector::new();
    let (supervisor, mut frames) = ConnectionSupervisor::new(connector, fast_policy(3));
    supervisor.connect("token").await.expect("connect");

    let server = next_session(&mut sessions).await;
    server.events.send("first".into()).await.expect("send");
    let received = timeout(WAIT, frames.recv()).await.expect("frame").expect("open");
    assert_eq!(received, "first");

    drop(server);
    let server = next_session(&mut sessions).await;
    server.events.send("second".into()).await.expect("send");
    let received = timeout(WAIT, frames.recv()).await.expect("frame").expect("open");
    assert_eq!(received, "second");
}
