//! Owns the persistent event connection: connect, reconnect with backoff, and surface
//! membership that survives reconnects.

use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use shared::{domain::SurfaceId, protocol::ControlFrame};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{config::ReconnectPolicy, error::ConnectionError};

const INBOUND_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Whether a fire-and-forget frame reached the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped,
}

/// One established, authenticated connection. The link is considered dropped once `inbound`
/// closes.
pub struct EventLink {
    pub outbound: mpsc::Sender<ControlFrame>,
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait EventConnector: Send + Sync {
    async fn open(&self, credential: &str) -> Result<EventLink>;
}

struct SupervisorState {
    credential: Option<String>,
    surfaces: BTreeSet<SurfaceId>,
    outbound: Option<mpsc::Sender<ControlFrame>>,
    session: Option<JoinHandle<()>>,
    // Bumped on every connect/disconnect so a stale session task cannot publish.
    generation: u64,
    last_error: Option<String>,
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn EventConnector>,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    frames: mpsc::Sender<String>,
    inner: Mutex<SupervisorState>,
}

impl ConnectionSupervisor {
    /// Returns the supervisor and the receiver on which every inbound frame is delivered, across
    /// reconnects.
    pub fn new(
        connector: Arc<dyn EventConnector>,
        policy: ReconnectPolicy,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (frames, frames_rx) = mpsc::channel(INBOUND_BUFFER);
        let supervisor = Arc::new(Self {
            connector,
            policy,
            state_tx,
            frames,
            inner: Mutex::new(SupervisorState {
                credential: None,
                surfaces: BTreeSet::new(),
                outbound: None,
                session: None,
                generation: 0,
                last_error: None,
            }),
        });
        (supervisor, frames_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Starts a connection unless one is live or in progress, then waits for the attempt to
    /// settle.
    pub async fn connect(self: &Arc<Self>, credential: &str) -> Result<(), ConnectionError> {
        let mut state_rx = self.state_tx.subscribe();
        {
            let mut inner = self.inner.lock().await;
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                    debug!("supervisor: connect while an attempt is in flight; waiting");
                }
                ConnectionState::Disconnected => {
                    inner.generation += 1;
                    inner.credential = Some(credential.to_string());
                    inner.last_error = None;
                    let generation = inner.generation;
                    self.state_tx.send_replace(ConnectionState::Connecting);
                    let supervisor = Arc::clone(self);
                    inner.session = Some(tokio::spawn(async move {
                        supervisor.run_session(generation).await;
                    }));
                }
            }
        }

        loop {
            let current = *state_rx.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    let inner = self.inner.lock().await;
                    return Err(match &inner.last_error {
                        Some(detail) => ConnectionError::ConnectFailed(detail.clone()),
                        None => ConnectionError::Aborted,
                    });
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {}
            }
            state_rx
                .changed()
                .await
                .map_err(|_| ConnectionError::Aborted)?;
        }
    }

    /// Tears the connection down and forgets every membership without telling the server.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        if let Some(session) = inner.session.take() {
            session.abort();
        }
        inner.outbound = None;
        inner.credential = None;
        inner.surfaces.clear();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("supervisor: disconnected");
    }

    /// Marks `surface` active. It is joined now if connected, and on every reconnect.
    pub async fn join_surface(&self, surface: SurfaceId) {
        let outbound = {
            let mut inner = self.inner.lock().await;
            if !inner.surfaces.insert(surface) {
                return;
            }
            inner.outbound.clone()
        };
        if let Some(outbound) = outbound {
            if outbound
                .send(ControlFrame::JoinSurface { surface })
                .await
                .is_err()
            {
                debug!(surface = %surface, "supervisor: join deferred to next reconnect");
            }
        }
    }

    pub async fn leave_surface(&self, surface: SurfaceId) {
        let outbound = {
            let mut inner = self.inner.lock().await;
            if !inner.surfaces.remove(&surface) {
                return;
            }
            inner.outbound.clone()
        };
        if let Some(outbound) = outbound {
            let _ = outbound.send(ControlFrame::LeaveSurface { surface }).await;
        }
    }

    pub async fn active_surfaces(&self) -> Vec<SurfaceId> {
        self.inner.lock().await.surfaces.iter().copied().collect()
    }

    /// Sends a frame on the live connection. Nothing is buffered while disconnected.
    pub async fn send_frame(&self, frame: ControlFrame) -> Delivery {
        let outbound = self.inner.lock().await.outbound.clone();
        let Some(outbound) = outbound else {
            return Delivery::Dropped;
        };
        match outbound.send(frame).await {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Dropped,
        }
    }

    async fn run_session(self: Arc<Self>, generation: u64) {
        let Some(credential) = self.inner.lock().await.credential.clone() else {
            return;
        };

        let mut link = match self.connector.open(&credential).await {
            Ok(link) => link,
            Err(err) => {
                warn!(error = %err, "supervisor: connection attempt failed");
                let mut inner = self.inner.lock().await;
                if inner.generation == generation {
                    inner.last_error = Some(err.to_string());
                    inner.session = None;
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                }
                return;
            }
        };

        loop {
            let Some(surfaces) = self.install(generation, &link).await else {
                return;
            };
            for surface in surfaces {
                if link
                    .outbound
                    .send(ControlFrame::JoinSurface { surface })
                    .await
                    .is_err()
                {
                    break;
                }
            }

            while let Some(frame) = link.inbound.recv().await {
                if self.frames.send(frame).await.is_err() {
                    debug!("supervisor: frame consumer went away");
                    return;
                }
            }

            {
                let mut inner = self.inner.lock().await;
                if inner.generation != generation {
                    return;
                }
                inner.outbound = None;
            }
            warn!("supervisor: connection dropped; reconnecting");

            match self.reconnect(generation, &credential).await {
                Some(next) => link = next,
                None => {
                    let mut inner = self.inner.lock().await;
                    if inner.generation == generation {
                        error!(
                            attempts = self.policy.max_attempts,
                            "supervisor: reconnect attempts exhausted; giving up"
                        );
                        inner.last_error = Some("reconnect attempts exhausted".into());
                        inner.session = None;
                        self.state_tx.send_replace(ConnectionState::Disconnected);
                    }
                    return;
                }
            }
        }
    }

    /// Publishes a fresh link and returns the surfaces to rejoin on it. `None` when the
    /// session was superseded.
    async fn install(&self, generation: u64, link: &EventLink) -> Option<Vec<SurfaceId>> {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return None;
        }
        inner.outbound = Some(link.outbound.clone());
        let surfaces: Vec<SurfaceId> = inner.surfaces.iter().copied().collect();
        self.state_tx.send_replace(ConnectionState::Connected);
        info!(surfaces = surfaces.len(), "supervisor: connected");
        Some(surfaces)
    }

    async fn reconnect(&self, generation: u64, credential: &str) -> Option<EventLink> {
        for attempt in 1..=self.policy.max_attempts {
            {
                let inner = self.inner.lock().await;
                if inner.generation != generation {
                    return None;
                }
                self.state_tx
                    .send_replace(ConnectionState::Reconnecting { attempt });
            }
            let delay = self.policy.delay_for_attempt(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "supervisor: waiting before reconnect");
            tokio::time::sleep(delay).await;

            if self.inner.lock().await.generation != generation {
                return None;
            }
            match self.connector.open(credential).await {
                Ok(link) => return Some(link),
                Err(err) => {
                    warn!(attempt, error = %err, "supervisor: reconnect attempt failed");
                }
            }
        }
        None
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
