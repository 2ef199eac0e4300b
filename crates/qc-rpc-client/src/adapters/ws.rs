//! `PubsubConnector` over a WebSocket.

use crate::error::TransportError;
use crate::ports::{InboundFrame, OutboundFrame, PubsubChannel, PubsubConnector};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace};
use url::Url;

/// tokio-tungstenite connector for the notification channel.
pub struct WsConnector {
    ws_url: Url,
}

impl WsConnector {
    pub fn new(ws_url: Url) -> Self {
        Self { ws_url }
    }
}

#[async_trait]
impl PubsubConnector for WsConnector {
    async fn connect(&self) -> Result<PubsubChannel, TransportError> {
        let (ws_stream, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        debug!(url = %self.ws_url, "WebSocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<InboundFrame>();
        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Message>();

        // Writer: caller frames plus pongs queued by the reader
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    frame = outgoing_rx.recv() => match frame {
                        Some(OutboundFrame::Text(text)) => Message::Text(text.into()),
                        Some(OutboundFrame::Ping) => Message::Ping(Default::default()),
                        Some(OutboundFrame::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    Some(pong) = pong_rx.recv() => pong,
                };
                if let Err(e) = write.send(message).await {
                    trace!(error = %e, "WebSocket write failed");
                    break;
                }
            }
        });

        // Reader: forwards frames until the socket ends
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => InboundFrame::Text(text.as_str().to_string()),
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Message::Pong(data));
                        continue;
                    }
                    Ok(Message::Close(_)) => {
                        let _ = incoming_tx.send(InboundFrame::Closed);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = incoming_tx.send(InboundFrame::Error(e.to_string()));
                        let _ = incoming_tx.send(InboundFrame::Closed);
                        break;
                    }
                };
                if incoming_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        Ok(PubsubChannel {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}
