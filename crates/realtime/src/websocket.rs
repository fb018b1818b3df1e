use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::transport::{FrameSink, SessionTarget, Transport, TransportChannel, TransportEvent};

/// Buffered inbound notifications per connection
const INBOUND_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport backed by `tokio-tungstenite`
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self, target: &SessionTarget) -> Result<TransportChannel> {
        let url = target.url()?;

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;

        debug!(session_id = %target.session_id(), "WebSocket handshake complete");

        let (sink, mut stream) = stream.split();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => TransportEvent::Message(text.as_str().to_string()),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_string()))
                            .unwrap_or((None, String::new()));
                        let _ = tx.send(TransportEvent::Closed { code, reason }).await;
                        return;
                    }
                    Ok(Message::Binary(_)) => {
                        warn!("Ignoring binary WebSocket frame");
                        continue;
                    }
                    // ping/pong are answered by tungstenite
                    Ok(_) => continue,
                    Err(e) => TransportEvent::Error(e.to_string()),
                };

                let failed = matches!(event, TransportEvent::Error(_));
                if tx.send(event).await.is_err() || failed {
                    break;
                }
            }

            let _ = tx
                .send(TransportEvent::Closed {
                    code: None,
                    reason: String::new(),
                })
                .await;
        });

        Ok(TransportChannel {
            sink: Box::new(WebSocketSink { inner: sink }),
            events: rx,
        })
    }
}

struct WebSocketSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.inner
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}
