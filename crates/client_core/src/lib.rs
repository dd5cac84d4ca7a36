use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Weak},
};

use anyhow::{Context, Result};
use chrono::Utc;
use shared::{
    domain::{CorrelationKey, MessageId, SurfaceId, UserId},
    protocol::{ControlFrame, MarkReadRequest, ReactionRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod backend;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod reactions;
pub mod reconciler;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use backend::{HttpBackend, MessageBackend};
pub use config::{load_settings, load_settings_from, ClientSettings, ReconnectPolicy};
pub use lifecycle::{DraftMessage, OptimisticLifecycleManager, OutboundRequest};
pub use reactions::{ReactionAggregator, ReactionOp, ReactionSummary};
pub use reconciler::{Applied, EventReconciler, PageMerge, PagePlacement};
pub use store::{LifecycleStatus, MessageRecord, SurfaceRegistry, SurfaceSnapshot};
pub use supervisor::{ConnectionState, ConnectionSupervisor, Delivery, EventConnector, EventLink};
pub use transport::WebSocketConnector;

use crate::error::{ConnectionError, LifecycleError};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The read model of a surface changed; re-read its snapshot.
    SurfaceChanged(SurfaceId),
    LifecycleChanged {
        surface: SurfaceId,
        key: CorrelationKey,
        status: LifecycleStatus,
    },
    ConnectionChanged(ConnectionState),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptDelivery {
    Sent,
    /// Held until the next successful connection.
    Queued,
}

struct EngineState {
    registry: SurfaceRegistry,
    lifecycle: OptimisticLifecycleManager,
    reconciler: EventReconciler,
    receipts: BTreeMap<SurfaceId, VecDeque<MessageId>>,
}

impl EngineState {
    fn enqueue_receipts(&mut self, surface: SurfaceId, message_ids: &[MessageId], limit: usize) {
        let queue = self.receipts.entry(surface).or_default();
        for message_id in message_ids {
            if !queue.contains(message_id) {
                queue.push_back(*message_id);
            }
        }
        while queue.len() > limit {
            if let Some(dropped) = queue.pop_front() {
                warn!(surface = %surface, message_id = dropped.0, "receipts: queue full; dropping oldest receipt");
            }
        }
    }
}

/// Per-user collaboration client: surface stores, optimistic actions and the event connection.
pub struct CollabClient {
    current_user: UserId,
    settings: ClientSettings,
    backend: Arc<dyn MessageBackend>,
    supervisor: Arc<ConnectionSupervisor>,
    inner: Mutex<EngineState>,
    inflight: Mutex<HashMap<CorrelationKey, JoinHandle<()>>>,
    background: Vec<JoinHandle<()>>,
    events: broadcast::Sender<ClientEvent>,
}

impl CollabClient {
    pub fn new(
        current_user: UserId,
        settings: ClientSettings,
        backend: Arc<dyn MessageBackend>,
        connector: Arc<dyn EventConnector>,
    ) -> Arc<Self> {
        let (supervisor, frames) = ConnectionSupervisor::new(connector, settings.reconnect.clone());
        let (events, _) = broadcast::channel(1024);
        let state_rx = supervisor.subscribe_state();

        Arc::new_cyclic(|client: &Weak<Self>| {
            let background = vec![
                tokio::spawn(pump_frames(client.clone(), frames)),
                tokio::spawn(watch_connection(client.clone(), state_rx)),
            ];
            Self {
                current_user,
                settings,
                backend,
                supervisor,
                inner: Mutex::new(EngineState {
                    registry: SurfaceRegistry::default(),
                    lifecycle: OptimisticLifecycleManager::new(current_user),
                    reconciler: EventReconciler::new(current_user),
                    receipts: BTreeMap::new(),
                }),
                inflight: Mutex::new(HashMap::new()),
                background,
                events,
            }
        })
    }

    /// Client wired to the HTTP backend and the websocket event stream.
    pub fn with_http(
        current_user: UserId,
        settings: ClientSettings,
        token: &str,
    ) -> Result<Arc<Self>> {
        let backend = HttpBackend::new(&settings, token).context("failed to build http client")?;
        let ws_url = settings.websocket_url()?;
        Ok(Self::new(
            current_user,
            settings,
            Arc::new(backend),
            Arc::new(WebSocketConnector::new(ws_url)),
        ))
    }

    pub fn current_user(&self) -> UserId {
        self.current_user
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Connects the event stream and joins every open surface.
    pub async fn connect(&self, credential: &str) -> Result<(), ConnectionError> {
        let surfaces = self.inner.lock().await.registry.ids();
        for surface in surfaces {
            self.supervisor.join_surface(surface).await;
        }
        self.supervisor.connect(credential).await
    }

    pub async fn disconnect(&self) {
        self.supervisor.disconnect().await;
    }

    /// Opens a surface, joins it on the connection and loads its newest page.
    pub async fn open_surface(&self, surface: SurfaceId) -> Result<PageMerge> {
        let opened = self.inner.lock().await.registry.open(surface);
        if opened {
            info!(surface = %surface, "client: opened surface");
        }
        self.supervisor.join_surface(surface).await;
        self.load_latest(surface).await
    }

    pub async fn close_surface(&self, surface: SurfaceId) {
        {
            let mut inner = self.inner.lock().await;
            inner.registry.close(surface);
            inner.receipts.remove(&surface);
        }
        self.supervisor.leave_surface(surface).await;
        info!(surface = %surface, "client: closed surface");
    }

    pub async fn view_surface(&self, surface: Option<SurfaceId>) {
        self.inner.lock().await.registry.view(surface);
        if let Some(surface) = surface {
            self.emit(ClientEvent::SurfaceChanged(surface));
        }
    }

    pub async fn snapshot(&self, surface: SurfaceId) -> Option<SurfaceSnapshot> {
        self.inner.lock().await.registry.snapshot(surface)
    }

    pub async fn surfaces(&self) -> Vec<SurfaceId> {
        self.inner.lock().await.registry.ids()
    }

    pub async fn total_unread(&self) -> u32 {
        self.inner.lock().await.registry.total_unread()
    }

    /// Inserts a pending record and issues the create request in the background.
    pub async fn submit(
        self: &Arc<Self>,
        surface: SurfaceId,
        draft: DraftMessage,
    ) -> Result<CorrelationKey, LifecycleError> {
        let request = {
            let mut inner = self.inner.lock().await;
            let EngineState {
                registry, lifecycle, ..
            } = &mut *inner;
            lifecycle.stage_submit(registry, surface, draft, Utc::now())?
        };
        let key = request.key().clone();
        self.emit(ClientEvent::SurfaceChanged(surface));
        self.emit(ClientEvent::LifecycleChanged {
            surface,
            key: key.clone(),
            status: LifecycleStatus::Pending,
        });
        self.dispatch(request).await;
        Ok(key)
    }

    pub async fn retry(self: &Arc<Self>, key: &CorrelationKey) -> Result<(), LifecycleError> {
        let request = {
            let mut inner = self.inner.lock().await;
            let EngineState {
                registry, lifecycle, ..
            } = &mut *inner;
            lifecycle.stage_retry(registry, key)?
        };
        let surface = request.surface();
        self.emit(ClientEvent::LifecycleChanged {
            surface,
            key: key.clone(),
            status: LifecycleStatus::Pending,
        });
        self.emit(ClientEvent::SurfaceChanged(surface));
        self.dispatch(request).await;
        Ok(())
    }

    pub async fn cancel(&self, key: &CorrelationKey) -> Result<(), LifecycleError> {
        let removed = {
            let mut inner = self.inner.lock().await;
            let EngineState {
                registry, lifecycle, ..
            } = &mut *inner;
            lifecycle.cancel(registry, key)?
        };
        self.emit(ClientEvent::SurfaceChanged(removed.surface));
        Ok(())
    }

    pub async fn edit(
        self: &Arc<Self>,
        surface: SurfaceId,
        message_id: MessageId,
        body: impl Into<String>,
    ) -> Result<CorrelationKey, LifecycleError> {
        let request = {
            let mut inner = self.inner.lock().await;
            let EngineState {
                registry, lifecycle, ..
            } = &mut *inner;
            lifecycle.stage_edit(registry, surface, message_id, body.into(), Utc::now())?
        };
        self.emit(ClientEvent::SurfaceChanged(surface));
        Ok(self.dispatch(request).await)
    }

    pub async fn delete(
        self: &Arc<Self>,
        surface: SurfaceId,
        message_id: MessageId,
    ) -> Result<CorrelationKey, LifecycleError> {
        let request = {
            let mut inner = self.inner.lock().await;
            let EngineState {
                registry, lifecycle, ..
            } = &mut *inner;
            lifecycle.stage_delete(registry, surface, message_id, Utc::now())?
        };
        self.emit(ClientEvent::SurfaceChanged(surface));
        Ok(self.dispatch(request).await)
    }

    pub async fn toggle_reaction(
        self: &Arc<Self>,
        surface: SurfaceId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<CorrelationKey, LifecycleError> {
        let request = {
            let mut inner = self.inner.lock().await;
            let EngineState {
                registry, lifecycle, ..
            } = &mut *inner;
            lifecycle.stage_toggle_reaction(registry, surface, message_id, emoji)?
        };
        self.emit(ClientEvent::SurfaceChanged(surface));
        Ok(self.dispatch(request).await)
    }

    /// Waits until the background request for `key` has finished and been reconciled.
    pub async fn settle(&self, key: &CorrelationKey) {
        let handle = self.inflight.lock().await.remove(key);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn dispatch(self: &Arc<Self>, request: OutboundRequest) -> CorrelationKey {
        let key = request.key().clone();
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            client.execute(request).await;
        });
        let mut inflight = self.inflight.lock().await;
        inflight.retain(|_, pending| !pending.is_finished());
        inflight.insert(key.clone(), handle);
        key
    }

    async fn execute(&self, request: OutboundRequest) {
        match request {
            OutboundRequest::Create {
                surface,
                key,
                request,
            } => match self.backend.create_message(surface, request).await {
                Ok(message) => {
                    self.apply_event(ServerEvent::MessageCreated {
                        message,
                        correlation_key: Some(key),
                    })
                    .await;
                }
                Err(err) => {
                    let status = {
                        let mut inner = self.inner.lock().await;
                        let EngineState {
                            registry, lifecycle, ..
                        } = &mut *inner;
                        lifecycle.send_failed(registry, &key, err)
                    };
                    if let Some(status) = status {
                        self.emit(ClientEvent::LifecycleChanged {
                            surface,
                            key,
                            status,
                        });
                        self.emit(ClientEvent::SurfaceChanged(surface));
                    }
                }
            },
            OutboundRequest::Edit {
                surface,
                message_id,
                request,
            } => {
                let key = request.correlation_key.clone();
                match self.backend.edit_message(surface, message_id, request).await {
                    Ok(message) => match (message.body, message.edited_at) {
                        (Some(body), Some(edited_at)) => {
                            self.apply_event(ServerEvent::MessageEdited {
                                surface,
                                message_id,
                                body,
                                edited_at,
                                correlation_key: Some(key),
                            })
                            .await;
                        }
                        _ => {
                            self.inner.lock().await.lifecycle.resolve_edit(&key);
                        }
                    },
                    Err(err) => {
                        let reverted = {
                            let mut inner = self.inner.lock().await;
                            let EngineState {
                                registry, lifecycle, ..
                            } = &mut *inner;
                            lifecycle.edit_failed(registry, &key, err)
                        };
                        if reverted {
                            self.emit(ClientEvent::SurfaceChanged(surface));
                        }
                    }
                }
            }
            OutboundRequest::Delete {
                surface,
                message_id,
                request,
            } => {
                let key = request.correlation_key.clone();
                match self.backend.delete_message(surface, message_id, request).await {
                    Ok(message) => match message.deleted_at {
                        Some(deleted_at) => {
                            self.apply_event(ServerEvent::MessageDeleted {
                                surface,
                                message_id,
                                deleted_at,
                                correlation_key: Some(key),
                            })
                            .await;
                        }
                        None => {
                            self.inner.lock().await.lifecycle.resolve_delete(&key);
                        }
                    },
                    Err(err) => {
                        let restored = {
                            let mut inner = self.inner.lock().await;
                            let EngineState {
                                registry, lifecycle, ..
                            } = &mut *inner;
                            lifecycle.delete_failed(registry, &key, err)
                        };
                        if restored {
                            self.emit(ClientEvent::SurfaceChanged(surface));
                        }
                    }
                }
            }
            OutboundRequest::Reactions {
                surface,
                message_id,
                key,
                ops,
            } => {
                for op in ops {
                    let request = ReactionRequest {
                        correlation_key: key.clone(),
                        emoji: op.emoji().to_string(),
                    };
                    let result = match &op {
                        ReactionOp::Add(_) => self.backend.add_reaction(surface, message_id, request).await,
                        ReactionOp::Remove(_) => {
                            self.backend
                                .remove_reaction(surface, message_id, request)
                                .await
                        }
                    };
                    match result {
                        Ok(ack) => {
                            let event = match op {
                                ReactionOp::Add(_) => ServerEvent::ReactionAdded {
                                    surface: ack.surface,
                                    message_id: ack.message_id,
                                    user_id: ack.user_id,
                                    emoji: ack.emoji,
                                },
                                ReactionOp::Remove(_) => ServerEvent::ReactionRemoved {
                                    surface: ack.surface,
                                    message_id: ack.message_id,
                                    user_id: ack.user_id,
                                    emoji: ack.emoji,
                                },
                            };
                            self.apply_event(event).await;
                        }
                        Err(err) => {
                            let reverted = {
                                let mut inner = self.inner.lock().await;
                                let EngineState {
                                    registry, lifecycle, ..
                                } = &mut *inner;
                                lifecycle.reaction_op_failed(registry, &key, &op, &err)
                            };
                            if reverted {
                                self.emit(ClientEvent::SurfaceChanged(surface));
                            }
                        }
                    }
                }
                self.inner.lock().await.lifecycle.resolve_reactions(&key);
            }
        }
    }

    /// Routes an authoritative event through the reconciler. Request responses take this path
    /// too, so there is one way for a message to become visible.
    pub async fn apply_event(&self, event: ServerEvent) -> Applied {
        if let ServerEvent::Error(error) = &event {
            self.emit(ClientEvent::Error(error.to_string()));
        }
        let applied = {
            let mut inner = self.inner.lock().await;
            let EngineState {
                registry,
                lifecycle,
                reconciler,
                ..
            } = &mut *inner;
            reconciler.apply(registry, lifecycle, event)
        };
        if let Applied::Promoted { surface, key, .. } = &applied {
            self.emit(ClientEvent::LifecycleChanged {
                surface: *surface,
                key: key.clone(),
                status: LifecycleStatus::Confirmed,
            });
        }
        if let Some(surface) = applied.changed_surface() {
            self.emit(ClientEvent::SurfaceChanged(surface));
        }
        applied
    }

    /// Fetches the newest page and merges it by timestamp.
    pub async fn load_latest(&self, surface: SurfaceId) -> Result<PageMerge> {
        let page = self
            .backend
            .fetch_history(surface, None, self.settings.page_size)
            .await
            .with_context(|| format!("failed to load latest messages for {surface}"))?;
        self.merge(surface, page, PagePlacement::Latest).await
    }

    /// Fetches the page before the oldest loaded message. A no-op when history is exhausted or
    /// a load is already running.
    pub async fn load_older_page(&self, surface: SurfaceId) -> Result<PageMerge> {
        let before = {
            let mut inner = self.inner.lock().await;
            let state = inner
                .registry
                .get_mut(surface)
                .ok_or(LifecycleError::UnknownSurface(surface))?;
            if !state.pagination.has_more || state.pagination.loading {
                return Ok(PageMerge::default());
            }
            state.pagination.loading = true;
            state.pagination.oldest_loaded
        };

        let page = match self
            .backend
            .fetch_history(surface, before, self.settings.page_size)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                if let Some(state) = self.inner.lock().await.registry.get_mut(surface) {
                    state.pagination.loading = false;
                }
                return Err(err).with_context(|| format!("failed to load older messages for {surface}"));
            }
        };
        self.merge(surface, page, PagePlacement::Older).await
    }

    async fn merge(
        &self,
        surface: SurfaceId,
        page: shared::protocol::HistoryPage,
        placement: PagePlacement,
    ) -> Result<PageMerge> {
        let merge = {
            let mut inner = self.inner.lock().await;
            let EngineState {
                registry,
                lifecycle,
                reconciler,
                ..
            } = &mut *inner;
            reconciler
                .merge_page(registry, lifecycle, surface, page, placement)
                .ok_or(LifecycleError::UnknownSurface(surface))?
        };
        self.emit(ClientEvent::SurfaceChanged(surface));
        Ok(merge)
    }

    /// Marks messages read locally and tells the server. While disconnected, or when the
    /// request fails in transport, the receipt is queued and sent after the next connect.
    pub async fn mark_read(
        &self,
        surface: SurfaceId,
        message_ids: Vec<MessageId>,
    ) -> Result<ReceiptDelivery> {
        if !self.inner.lock().await.registry.contains(surface) {
            return Err(LifecycleError::UnknownSurface(surface).into());
        }
        self.apply_event(ServerEvent::MessagesRead {
            surface,
            user_id: self.current_user,
            message_ids: message_ids.clone(),
        })
        .await;

        if self.supervisor.state() != ConnectionState::Connected {
            self.queue_receipts(surface, &message_ids).await;
            return Ok(ReceiptDelivery::Queued);
        }

        match self
            .backend
            .mark_read(
                surface,
                MarkReadRequest {
                    message_ids: message_ids.clone(),
                },
            )
            .await
        {
            Ok(()) => Ok(ReceiptDelivery::Sent),
            Err(err) if err.is_retryable() => {
                warn!(surface = %surface, error = %err, "receipts: mark-read failed; queueing");
                self.queue_receipts(surface, &message_ids).await;
                Ok(ReceiptDelivery::Queued)
            }
            Err(err) => Err(err).context("mark-read rejected"),
        }
    }

    async fn queue_receipts(&self, surface: SurfaceId, message_ids: &[MessageId]) {
        let limit = self.settings.receipt_queue_limit;
        self.inner
            .lock()
            .await
            .enqueue_receipts(surface, message_ids, limit);
        debug!(surface = %surface, count = message_ids.len(), "receipts: queued while offline");
    }

    pub async fn queued_receipts(&self, surface: SurfaceId) -> Vec<MessageId> {
        self.inner
            .lock()
            .await
            .receipts
            .get(&surface)
            .map(|queue| queue.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Sends every queued receipt. Stops at the first transport failure and keeps the rest.
    pub async fn flush_receipts(&self) -> usize {
        let queued: Vec<(SurfaceId, Vec<MessageId>)> = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.receipts)
                .into_iter()
                .map(|(surface, queue)| (surface, Vec::from(queue)))
                .filter(|(_, ids)| !ids.is_empty())
                .collect()
        };

        let mut flushed = 0;
        let mut pending = queued.into_iter();
        while let Some((surface, message_ids)) = pending.next() {
            let request = MarkReadRequest {
                message_ids: message_ids.clone(),
            };
            match self.backend.mark_read(surface, request).await {
                Ok(()) => flushed += message_ids.len(),
                Err(err) if err.is_retryable() => {
                    warn!(surface = %surface, error = %err, "receipts: flush failed; keeping queue");
                    let limit = self.settings.receipt_queue_limit;
                    let mut inner = self.inner.lock().await;
                    inner.enqueue_receipts(surface, &message_ids, limit);
                    for (surface, message_ids) in pending.by_ref() {
                        inner.enqueue_receipts(surface, &message_ids, limit);
                    }
                    break;
                }
                Err(err) => {
                    warn!(surface = %surface, error = %err, "receipts: server refused queued receipts; discarding");
                }
            }
        }
        if flushed > 0 {
            info!(count = flushed, "receipts: flushed queued receipts");
        }
        flushed
    }

    /// Typing notifications are only meaningful live; they are not queued.
    pub async fn set_typing(&self, surface: SurfaceId, typing: bool) -> Delivery {
        let delivery = self
            .supervisor
            .send_frame(ControlFrame::Typing { surface, typing })
            .await;
        if delivery == Delivery::Dropped {
            debug!(surface = %surface, typing, "client: typing notification dropped while disconnected");
        }
        delivery
    }

    /// Re-fetches the newest page of every open surface after a reconnect.
    async fn resync(&self) {
        let surfaces = self.surfaces().await;
        for surface in surfaces {
            if let Err(err) = self.load_latest(surface).await {
                warn!(surface = %surface, error = %err, "client: resync after reconnect failed");
                self.emit(ClientEvent::Error(err.to_string()));
            }
        }
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

async fn pump_frames(client: Weak<CollabClient>, mut frames: mpsc::Receiver<String>) {
    while let Some(frame) = frames.recv().await {
        let Some(client) = client.upgrade() else {
            break;
        };
        match serde_json::from_str::<ServerEvent>(&frame) {
            Ok(event) => {
                client.apply_event(event).await;
            }
            Err(err) => {
                warn!(error = %err, "client: dropping malformed server event");
            }
        }
    }
}

async fn watch_connection(
    client: Weak<CollabClient>,
    mut state_rx: tokio::sync::watch::Receiver<ConnectionState>,
) {
    let mut connected_before = false;
    while state_rx.changed().await.is_ok() {
        let state = *state_rx.borrow_and_update();
        let Some(client) = client.upgrade() else {
            break;
        };
        client.emit(ClientEvent::ConnectionChanged(state));
        if state != ConnectionState::Connected {
            continue;
        }
        client.flush_receipts().await;
        if connected_before {
            client.resync().await;
        }
        connected_before = true;
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
