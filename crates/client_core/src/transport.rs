use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::ControlFrame;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::supervisor::{EventConnector, EventLink};

const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;

/// Opens the event stream over a websocket and authenticates it with the first frame.
///
/// The protocol has no authentication acknowledgement, so the link is handed over as soon as
/// the `authenticate` frame is written. A server that refuses the credential closes the socket,
/// which the supervisor sees as a dropped connection.
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl EventConnector for WebSocketConnector {
    async fn open(&self, credential: &str) -> Result<EventLink> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.url))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let hello = serde_json::to_string(&ControlFrame::Authenticate {
            token: credential.to_string(),
        })?;
        ws_writer
            .send(Message::Text(hello))
            .await
            .context("failed to send authenticate frame")?;

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ControlFrame>(OUTBOUND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_BUFFER);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "transport: failed to encode control frame");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(error = %err, "transport: websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(Some(frame))) => {
                        warn!(
                            code = u16::from(frame.code),
                            reason = %frame.reason,
                            "transport: server closed the websocket"
                        );
                        break;
                    }
                    Ok(Message::Close(None)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "transport: websocket receive failed");
                        break;
                    }
                }
            }
            debug!("transport: websocket reader finished");
        });

        Ok(EventLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
