//! Message transports
//!
//! One wire-protocol variant serves each connection: the framed duplex
//! WebSocket channel, or the broker-style control connection paired with a
//! datagram audio endpoint. Both expose the same capability set so the rest
//! of the gateway never branches on the variant.

pub mod broker;
pub mod datagram;
pub mod gateway;
pub mod websocket;

pub use broker::{
    parse_client_id, BrokerConnection, BrokerHandshake, ConnectInfo, ControlPacket, MqttCodec,
};
pub use datagram::{DatagramKey, UdpAudioEndpoint, PACKET_TYPE_AUDIO, PACKET_TYPE_HANDSHAKE};
pub use gateway::AudioHeader;
pub use websocket::WsTransport;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A frame received from the device.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Concrete newtype for storing a transport object in the service
/// container, which can only downcast to sized types.
pub struct SharedTransport(pub std::sync::Arc<dyn Transport>);

/// Capability set every connection variant implements.
///
/// Outbound writes are serialized per connection so a control message never
/// interleaves with an audio packet on the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    async fn send_binary(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the connection is closed.
    async fn recv(&self) -> Option<Frame>;

    /// Idempotent close.
    async fn close(&self);

    fn is_connected(&self) -> bool;

    async fn send_json(&self, value: &serde_json::Value) -> Result<(), TransportError> {
        self.send_text(&value.to_string()).await
    }

    /// Extra fields this variant contributes to the `hello` reply. The
    /// broker transport advertises its datagram endpoint and key here.
    fn hello_extension(&self) -> Option<serde_json::Value> {
        None
    }
}
