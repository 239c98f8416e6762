//! Framed duplex WebSocket transport
//!
//! One long-lived bidirectional connection per device, produced by the HTTP
//! upgrade endpoint. Text frames carry JSON control messages or plain user
//! text; binary frames carry audio. The outbound half sits behind a mutex so
//! writes from the paced sender and the control path never interleave.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::{Frame, Transport, TransportError};

pub struct WsTransport {
    sender: Mutex<SplitSink<WebSocket, Message>>,
    receiver: Mutex<SplitStream<WebSocket>>,
    connected: AtomicBool,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (sender, receiver) = socket.split();
        Self {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
            connected: AtomicBool::new(true),
        }
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let mut sender = self.sender.lock().await;
        sender.send(message).await.map_err(|e| {
            self.connected.store(false, Ordering::Release);
            TransportError::Send(e.to_string())
        })
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send(Message::Text(text.to_string())).await
    }

    async fn send_binary(&self, data: &[u8]) -> Result<(), TransportError> {
        self.send(Message::Binary(data.to_vec())).await
    }

    async fn recv(&self) -> Option<Frame> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(Frame::Text(text)),
                Some(Ok(Message::Binary(data))) => return Some(Frame::Binary(data.into())),
                Some(Ok(Message::Ping(data))) => {
                    // Control pings answered inline; not surfaced as frames.
                    let _ = self.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    self.connected.store(false, Ordering::Release);
                    return None;
                }
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "websocket receive error");
                    self.connected.store(false, Ordering::Release);
                    return None;
                }
            }
        }
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let mut sender = self.sender.lock().await;
            let _ = sender.send(Message::Close(None)).await;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
