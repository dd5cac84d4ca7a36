use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::protocol::ControlFrame;
use tokio::{
    sync::{mpsc, watch, Mutex},
    time::timeout,
};

use crate::{
    config::ReconnectPolicy,
    supervisor::{ConnectionState, EventConnector, EventLink},
};

pub(crate) const WAIT: Duration = Duration::from_secs(3);

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

pub(crate) fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    }
}

/// Server end of one fake connection. Dropping it drops the connection.
pub(crate) struct ServerSide {
    pub frames: mpsc::Receiver<ControlFrame>,
    pub events: mpsc::Sender<String>,
}

impl ServerSide {
    pub async fn next_frame(&mut self) -> ControlFrame {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for control frame")
            .expect("connection closed")
    }
}

pub(crate) struct FakeConnector {
    opens: AtomicUsize,
    refuse: AtomicBool,
    credentials: Mutex<Vec<String>>,
    sessions: mpsc::UnboundedSender<ServerSide>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (sessions, sessions_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            opens: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            credentials: Mutex::new(Vec::new()),
            sessions,
        });
        (connector, sessions_rx)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub async fn credentials(&self) -> Vec<String> {
        self.credentials.lock().await.clone()
    }
}

#[async_trait]
impl EventConnector for FakeConnector {
    async fn open(&self, credential: &str) -> Result<EventLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.credentials.lock().await.push(credential.to_string());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        let (outbound, frames) = mpsc::channel(32);
        let (events, inbound) = mpsc::channel(32);
        let _ = self.sessions.send(ServerSide { frames, events });
        Ok(EventLink { outbound, inbound })
    }
}

pub(crate) async fn next_session(sessions: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    timeout(WAIT, sessions.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

pub(crate) async fn wait_for_state(
    state_rx: &mut watch::Receiver<ConnectionState>,
    matches: impl Fn(ConnectionState) -> bool,
) {
    timeout(WAIT, async {
        loop {
            if matches(*state_rx.borrow_and_update()) {
                return;
            }
            state_rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("timed out waiting for connection state");
}
