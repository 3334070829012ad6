//! Duplex transport to the voice agent
//!
//! The WebSocket is split into a write half driven by a writer task and a read
//! half driven by a reader task. Everything the reader sees becomes a
//! [`TransportEvent`] on one channel, drained in order by the session
//! controller. Producers write through a cloneable [`TransportHandle`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info};

use crate::error::{Result, VoiceError};
use crate::events::{OutboundFrame, TransportEvent};

/// Write side of a live transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: UnboundedSender<OutboundFrame>,
    writable: Arc<AtomicBool>,
}

impl TransportHandle {
    /// Whether frames handed over now will reach the socket.
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    pub fn send_json<T: Serialize>(&self, msg: &T) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        self.push(OutboundFrame::Text(text))
    }

    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.push(OutboundFrame::Binary(bytes))
    }

    /// Stop accepting frames and ask the writer to close the socket.
    pub fn close(&self) {
        if self.writable.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(OutboundFrame::Close);
        }
    }

    fn push(&self, frame: OutboundFrame) -> Result<()> {
        if !self.writable.load(Ordering::Acquire) {
            return Err(VoiceError::ConnectionClosed);
        }
        self.tx.send(frame).map_err(|_| VoiceError::ChannelClosed)
    }
}

/// A connected transport: the write handle plus the inbound event stream.
#[derive(Debug)]
pub struct Transport {
    pub handle: TransportHandle,
    pub events: UnboundedReceiver<TransportEvent>,
    /// Lets local producers push failures into `events`. Weak, so the stream
    /// still ends once the socket side is gone.
    pub reporter: WeakUnboundedSender<TransportEvent>,
}

/// The far side of a [`Transport`]: what the socket tasks (or a test) hold.
#[derive(Debug)]
pub struct TransportPeer {
    pub outbound: UnboundedReceiver<OutboundFrame>,
    pub inbound: UnboundedSender<TransportEvent>,
    pub writable: Arc<AtomicBool>,
}

impl TransportPeer {
    /// Mark the transport dead and report why.
    pub fn fail(&self, event: TransportEvent) {
        self.writable.store(false, Ordering::Release);
        let _ = self.inbound.send(event);
    }
}

impl Transport {
    /// Create a connected transport/peer pair.
    pub fn pair() -> (Transport, TransportPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let writable = Arc::new(AtomicBool::new(true));
        (
            Transport {
                handle: TransportHandle { tx: out_tx, writable: writable.clone() },
                events: in_rx,
                reporter: in_tx.downgrade(),
            },
            TransportPeer { outbound: out_rx, inbound: in_tx, writable },
        )
    }
}

/// Opens transports to the agent.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, credential: &str) -> Result<Transport>;
}

/// tokio-tungstenite backed connector.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, credential: &str) -> Result<Transport> {
        info!("Connecting to voice agent at {}", url);

        let mut request = url.into_client_request()?;
        let protocols = HeaderValue::from_str(&format!("token, {}", credential))
            .map_err(|_| VoiceError::MissingConfig("credential is not a valid header value".to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocols);

        let (ws_stream, resp) = connect_async(request).await?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (mut sink, mut stream) = ws_stream.split();
        let (transport, peer) = Transport::pair();
        let TransportPeer { mut outbound, inbound, writable } = peer;

        // Writer task: the single place frames are put on the socket
        let writer_inbound = inbound.clone();
        let writer_flag = writable.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let result = match frame {
                    OutboundFrame::Text(text) => sink.send(Message::Text(text.into())).await,
                    OutboundFrame::Binary(bytes) => sink.send(Message::Binary(bytes.into())).await,
                    OutboundFrame::Close => {
                        if let Err(e) = sink.close().await {
                            debug!("Error while closing socket: {}", e);
                        }
                        break;
                    }
                };
                if let Err(e) = result {
                    error!("Failed to write to agent socket: {}", e);
                    writer_flag.store(false, Ordering::Release);
                    let _ = writer_inbound.send(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
            debug!("Transport writer task terminated");
        });

        // Reader task
        let _ = inbound.send(TransportEvent::Opened);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => TransportEvent::Text(text.as_str().to_string()),
                    Ok(Message::Binary(bytes)) => TransportEvent::Binary(bytes.to_vec()),
                    Ok(Message::Close(frame)) => {
                        info!("Agent socket closed: {:?}", frame);
                        writable.store(false, Ordering::Release);
                        let _ = inbound.send(TransportEvent::Closed(frame.map(|f| f.reason.as_str().to_string())));
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Agent socket error: {}", e);
                        writable.store(false, Ordering::Release);
                        let _ = inbound.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                };
                if inbound.send(event).is_err() {
                    break;
                }
            }
            writable.store(false, Ordering::Release);
            let _ = inbound.send(TransportEvent::Closed(None));
            debug!("Transport reader task terminated");
        });

        info!("Connected to voice agent");
        Ok(transport)
    }
}
