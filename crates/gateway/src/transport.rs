// Gateway Transport
//
// A transport is a pair of channels: text frames out, frames and closure in.
// The WebSocket connector pumps both ends through tokio-tungstenite tasks.

use crate::client::ClientError;
use async_trait::async_trait;
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Something delivered by the transport to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame
    Frame(String),
    /// The connection ended, with an optional reason
    Closed(Option<String>),
}

/// An open connection. Dropping `outbound` closes it.
pub struct Transport {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Transport, ClientError>;
}

/// Connector over a real WebSocket
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<Transport, ClientError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(format!("failed to connect to {}: {}", url, e)))?;
        debug!("WebSocket connection established to {}", url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                    debug!("WebSocket send failed: {}", e);
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match ws_receiver.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx
                            .send(TransportEvent::Frame(text.as_str().to_owned()))
                            .is_err()
                        {
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.as_str().to_owned());
                    }
                    // Pings are answered by tungstenite; binary frames are not part of the protocol
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            let _ = in_tx.send(TransportEvent::Closed(reason));
        });

        Ok(Transport {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
