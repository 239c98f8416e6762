//! Broker-style control transport
//!
//! Devices behind the datagram audio path speak an MQTT-shaped control
//! protocol over TCP: CONNECT/CONNACK to join, PUBLISH for JSON control
//! messages, PINGREQ/PINGRESP for keep-alive, DISCONNECT to leave. The
//! CONNECT client id has the shape `group@@@MAC@@@uuid`; the middle field,
//! underscores restored to colons, is the device id. The CONNACK is only
//! issued after authentication.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::datagram::{DatagramKey, UdpAudioEndpoint};
use crate::{Frame, Transport, TransportError};

const TYPE_CONNECT: u8 = 1;
const TYPE_CONNACK: u8 = 2;
const TYPE_PUBLISH: u8 = 3;
const TYPE_SUBSCRIBE: u8 = 8;
const TYPE_SUBACK: u8 = 9;
const TYPE_PINGREQ: u8 = 12;
const TYPE_PINGRESP: u8 = 13;
const TYPE_DISCONNECT: u8 = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Connect {
        protocol: String,
        level: u8,
        keep_alive: u16,
        client_id: String,
        username: Option<String>,
        password: Option<String>,
    },
    ConnAck {
        code: u8,
    },
    Publish {
        topic: String,
        payload: Bytes,
    },
    Subscribe {
        packet_id: u16,
        topics: Vec<String>,
    },
    SubAck {
        packet_id: u16,
    },
    PingReq,
    PingResp,
    Disconnect,
}

#[derive(Default)]
pub struct MqttCodec;

impl MqttCodec {
    fn decode_remaining_length(src: &[u8]) -> Option<(usize, usize)> {
        let mut value = 0usize;
        let mut multiplier = 1usize;
        for (i, &digit) in src.iter().take(4).enumerate() {
            value += (digit & 0x7F) as usize * multiplier;
            if digit & 0x80 == 0 {
                return Some((value, i + 1));
            }
            multiplier *= 128;
        }
        None
    }

    fn encode_remaining_length(mut length: usize, dst: &mut BytesMut) {
        loop {
            let mut digit = (length % 128) as u8;
            length /= 128;
            if length > 0 {
                digit |= 0x80;
            }
            dst.put_u8(digit);
            if length == 0 {
                break;
            }
        }
    }

    fn read_string(buf: &mut &[u8]) -> Result<String, TransportError> {
        if buf.len() < 2 {
            return Err(TransportError::Malformed("truncated string".into()));
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        buf.advance(2);
        if buf.len() < len {
            return Err(TransportError::Malformed("truncated string body".into()));
        }
        let s = String::from_utf8(buf[..len].to_vec())
            .map_err(|_| TransportError::Malformed("string is not utf-8".into()))?;
        buf.advance(len);
        Ok(s)
    }

    fn put_string(s: &str, dst: &mut BytesMut) {
        dst.put_u16(s.len() as u16);
        dst.put_slice(s.as_bytes());
    }

    fn parse_connect(mut body: &[u8]) -> Result<ControlPacket, TransportError> {
        let protocol = Self::read_string(&mut body)?;
        if body.len() < 4 {
            return Err(TransportError::Malformed("truncated connect header".into()));
        }
        let level = body[0];
        let flags = body[1];
        let keep_alive = u16::from_be_bytes([body[2], body[3]]);
        body.advance(4);

        let client_id = Self::read_string(&mut body)?;
        let username = if flags & 0x80 != 0 {
            Some(Self::read_string(&mut body)?)
        } else {
            None
        };
        let password = if flags & 0x40 != 0 {
            Some(Self::read_string(&mut body)?)
        } else {
            None
        };

        Ok(ControlPacket::Connect {
            protocol,
            level,
            keep_alive,
            client_id,
            username,
            password,
        })
    }

    fn parse_subscribe(mut body: &[u8]) -> Result<ControlPacket, TransportError> {
        if body.len() < 2 {
            return Err(TransportError::Malformed("truncated subscribe".into()));
        }
        let packet_id = u16::from_be_bytes([body[0], body[1]]);
        body.advance(2);
        let mut topics = Vec::new();
        while !body.is_empty() {
            topics.push(Self::read_string(&mut body)?);
            if !body.is_empty() {
                body.advance(1); // requested QoS, ignored
            }
        }
        Ok(ControlPacket::Subscribe { packet_id, topics })
    }
}

impl Decoder for MqttCodec {
    type Item = ControlPacket;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ControlPacket>, TransportError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let packet_type = src[0] >> 4;
        let Some((remaining, len_bytes)) = Self::decode_remaining_length(&src[1..]) else {
            return if src.len() >= 5 {
                Err(TransportError::Malformed("remaining length overlong".into()))
            } else {
                Ok(None)
            };
        };
        let total = 1 + len_bytes + remaining;
        if src.len() < total {
            return Ok(None);
        }
        let packet = src.split_to(total);
        let body = &packet[1 + len_bytes..];

        let decoded = match packet_type {
            TYPE_CONNECT => Self::parse_connect(body)?,
            TYPE_PUBLISH => {
                let mut cursor = body;
                let topic = Self::read_string(&mut cursor)?;
                ControlPacket::Publish {
                    topic,
                    payload: Bytes::copy_from_slice(cursor),
                }
            }
            TYPE_SUBSCRIBE => Self::parse_subscribe(body)?,
            TYPE_PINGREQ => ControlPacket::PingReq,
            TYPE_DISCONNECT => ControlPacket::Disconnect,
            other => {
                return Err(TransportError::Malformed(format!(
                    "unsupported packet type {other}"
                )))
            }
        };
        Ok(Some(decoded))
    }
}

impl Encoder<ControlPacket> for MqttCodec {
    type Error = TransportError;

    fn encode(&mut self, packet: ControlPacket, dst: &mut BytesMut) -> Result<(), TransportError> {
        match packet {
            ControlPacket::ConnAck { code } => {
                dst.put_u8(TYPE_CONNACK << 4);
                dst.put_u8(2);
                dst.put_u8(0);
                dst.put_u8(code);
            }
            ControlPacket::SubAck { packet_id } => {
                dst.put_u8(TYPE_SUBACK << 4);
                dst.put_u8(3);
                dst.put_u16(packet_id);
                dst.put_u8(0); // granted QoS 0
            }
            ControlPacket::PingResp => {
                dst.put_u8(TYPE_PINGRESP << 4);
                dst.put_u8(0);
            }
            ControlPacket::Publish { topic, payload } => {
                let mut body = BytesMut::new();
                Self::put_string(&topic, &mut body);
                body.put_slice(&payload);
                dst.put_u8(TYPE_PUBLISH << 4);
                Self::encode_remaining_length(body.len(), dst);
                dst.put_slice(&body);
            }
            other => {
                return Err(TransportError::Send(format!(
                    "packet not encodable server-side: {other:?}"
                )))
            }
        }
        Ok(())
    }
}

/// Split a broker client id of the shape `group@@@MAC@@@uuid`.
///
/// The MAC field arrives with `_` in place of `:`; both are returned
/// normalized. The trailing uuid is optional.
pub fn parse_client_id(client_id: &str) -> Option<(String, String, Option<String>)> {
    let parts: Vec<&str> = client_id.split("@@@").collect();
    if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
        return None;
    }
    let device_id = parts[1].replace('_', ":");
    let uuid = parts.get(2).map(|s| s.to_string());
    Some((parts[0].to_string(), device_id, uuid))
}

/// Identity carried by a CONNECT, before authentication.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub client_id: String,
    pub group_id: String,
    pub device_id: String,
    pub client_uuid: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: u16,
}

/// First phase of a broker connection: CONNECT is read, nothing answered
/// yet. The caller authenticates and then either `accept`s or `reject`s.
pub struct BrokerHandshake {
    framed: Framed<TcpStream, MqttCodec>,
    pub info: ConnectInfo,
}

impl BrokerHandshake {
    pub async fn read_connect(stream: TcpStream) -> Result<Self, TransportError> {
        let mut framed = Framed::new(stream, MqttCodec);
        match framed.next().await {
            Some(Ok(ControlPacket::Connect {
                client_id,
                username,
                password,
                keep_alive,
                ..
            })) => {
                let (group_id, device_id, client_uuid) = parse_client_id(&client_id)
                    .ok_or_else(|| {
                        TransportError::Malformed(format!("invalid client id: {client_id}"))
                    })?;
                Ok(Self {
                    framed,
                    info: ConnectInfo {
                        client_id,
                        group_id,
                        device_id,
                        client_uuid,
                        username,
                        password,
                        keep_alive,
                    },
                })
            }
            Some(Ok(other)) => Err(TransportError::Malformed(format!(
                "expected CONNECT, got {other:?}"
            ))),
            Some(Err(err)) => Err(err),
            None => Err(TransportError::Closed),
        }
    }

    /// Refuse the connection (CONNACK code 1) and drop it.
    pub async fn reject(mut self) {
        let _ = self.framed.send(ControlPacket::ConnAck { code: 1 }).await;
    }

    /// Accept (CONNACK code 0) and start the connection tasks.
    pub async fn accept(
        mut self,
        session_id: String,
        udp: Arc<UdpAudioEndpoint>,
    ) -> Result<Arc<BrokerConnection>, TransportError> {
        self.framed.send(ControlPacket::ConnAck { code: 0 }).await?;
        Ok(BrokerConnection::spawn(
            self.framed,
            self.info,
            session_id,
            udp,
        ))
    }
}

pub struct BrokerConnection {
    pub info: ConnectInfo,
    session_id: String,
    reply_topic: String,
    datagram_key: DatagramKey,
    udp: Arc<UdpAudioEndpoint>,
    frames: Mutex<mpsc::Receiver<Frame>>,
    outbound: mpsc::Sender<ControlPacket>,
    connected: Arc<AtomicBool>,
    last_activity_ms: Arc<AtomicU64>,
}

fn monotonic_ms() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

impl BrokerConnection {
    fn spawn(
        framed: Framed<TcpStream, MqttCodec>,
        info: ConnectInfo,
        session_id: String,
        udp: Arc<UdpAudioEndpoint>,
    ) -> Arc<Self> {
        let (frames_tx, frames_rx) = mpsc::channel::<Frame>(64);
        let (outbound_tx, outbound_rx) = mpsc::channel::<ControlPacket>(64);
        let (audio_tx, audio_rx) = mpsc::channel::<Bytes>(64);

        let datagram_key = udp.register(&session_id, audio_tx);
        let reply_topic = format!("devices/p2p/{}", info.device_id.replace(':', "_"));
        let connected = Arc::new(AtomicBool::new(true));
        let last_activity_ms = Arc::new(AtomicU64::new(monotonic_ms()));

        let (sink, stream) = framed.split();
        Self::spawn_writer(outbound_rx, sink, connected.clone());
        Self::spawn_reader(
            stream,
            frames_tx.clone(),
            outbound_tx.clone(),
            connected.clone(),
            last_activity_ms.clone(),
        );
        Self::spawn_audio_forwarder(audio_rx, frames_tx, last_activity_ms.clone());
        if info.keep_alive > 0 {
            Self::spawn_keep_alive_watchdog(
                Duration::from_secs(info.keep_alive as u64),
                connected.clone(),
                last_activity_ms.clone(),
            );
        }

        Arc::new(Self {
            info,
            session_id,
            reply_topic,
            datagram_key,
            udp,
            frames: Mutex::new(frames_rx),
            outbound: outbound_tx,
            connected,
            last_activity_ms,
        })
    }

    fn spawn_writer(
        mut outbound: mpsc::Receiver<ControlPacket>,
        mut sink: SplitSink<Framed<TcpStream, MqttCodec>, ControlPacket>,
        connected: Arc<AtomicBool>,
    ) {
        tokio::spawn(async move {
            while let Some(packet) = outbound.recv().await {
                if let Err(err) = sink.send(packet).await {
                    tracing::debug!(error = %err, "broker write failed");
                    connected.store(false, Ordering::Release);
                    break;
                }
            }
            let _ = sink.close().await;
        });
    }

    fn spawn_reader(
        mut stream: SplitStream<Framed<TcpStream, MqttCodec>>,
        frames_tx: mpsc::Sender<Frame>,
        outbound: mpsc::Sender<ControlPacket>,
        connected: Arc<AtomicBool>,
        last_activity_ms: Arc<AtomicU64>,
    ) {
        tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                last_activity_ms.store(monotonic_ms(), Ordering::Relaxed);
                match next {
                    Ok(ControlPacket::Publish { payload, .. }) => {
                        match String::from_utf8(payload.to_vec()) {
                            Ok(text) => {
                                if frames_tx.send(Frame::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => tracing::debug!("non-utf8 publish payload dropped"),
                        }
                    }
                    Ok(ControlPacket::Subscribe { packet_id, .. }) => {
                        let _ = outbound.send(ControlPacket::SubAck { packet_id }).await;
                    }
                    Ok(ControlPacket::PingReq) => {
                        let _ = outbound.send(ControlPacket::PingResp).await;
                    }
                    Ok(ControlPacket::Disconnect) => break,
                    Ok(other) => {
                        tracing::debug!(packet = ?other, "unexpected broker packet");
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "broker protocol error");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::Release);
        });
    }

    fn spawn_audio_forwarder(
        mut audio_rx: mpsc::Receiver<Bytes>,
        frames_tx: mpsc::Sender<Frame>,
        last_activity_ms: Arc<AtomicU64>,
    ) {
        tokio::spawn(async move {
            while let Some(audio) = audio_rx.recv().await {
                last_activity_ms.store(monotonic_ms(), Ordering::Relaxed);
                if frames_tx.send(Frame::Binary(audio)).await.is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_keep_alive_watchdog(
        keep_alive: Duration,
        connected: Arc<AtomicBool>,
        last_activity_ms: Arc<AtomicU64>,
    ) {
        // Closes the connection when the device goes quiet for longer than
        // 1.5x the negotiated interval.
        let limit_ms = keep_alive.as_millis() as u64 * 3 / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keep_alive / 2);
            loop {
                ticker.tick().await;
                if !connected.load(Ordering::Acquire) {
                    break;
                }
                let idle = monotonic_ms().saturating_sub(last_activity_ms.load(Ordering::Relaxed));
                if idle > limit_ms {
                    tracing::info!(idle_ms = idle, "broker keep-alive expired");
                    connected.store(false, Ordering::Release);
                    break;
                }
            }
        });
    }

    /// Key material for the `hello` reply's `udp` block.
    pub fn datagram_key(&self) -> &DatagramKey {
        &self.datagram_key
    }

    pub fn udp_advertised(&self) -> (String, u16) {
        self.udp.advertised()
    }
}

#[async_trait::async_trait]
impl Transport for BrokerConnection {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(ControlPacket::Publish {
                topic: self.reply_topic.clone(),
                payload: Bytes::copy_from_slice(text.as_bytes()),
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Audio goes over the datagram path; `data` must already carry the
    /// 16-byte header from the paced sender.
    async fn send_binary(&self, data: &[u8]) -> Result<(), TransportError> {
        self.udp.send(&self.session_id, data).await
    }

    async fn recv(&self) -> Option<Frame> {
        let frame = self.frames.lock().await.recv().await;
        if frame.is_none() {
            self.connected.store(false, Ordering::Release);
        }
        frame
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.udp.unregister(&self.session_id);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn hello_extension(&self) -> Option<serde_json::Value> {
        let (server, port) = self.udp.advertised();
        Some(serde_json::json!({
            "server": server,
            "port": port,
            "encryption": "aes-128-ctr",
            "key": self.datagram_key.key_hex(),
            "nonce": self.datagram_key.nonce_hex(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt_string(s: &str) -> Vec<u8> {
        let mut out = (s.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out
    }

    fn connect_bytes(client_id: &str, username: &str, password: &str, keep_alive: u16) -> BytesMut {
        let mut body = Vec::new();
        body.extend(mqtt_string("MQTT"));
        body.push(4); // protocol level
        body.push(0x80 | 0x40); // username + password flags
        body.extend(keep_alive.to_be_bytes());
        body.extend(mqtt_string(client_id));
        body.extend(mqtt_string(username));
        body.extend(mqtt_string(password));

        let mut packet = BytesMut::new();
        packet.put_u8(TYPE_CONNECT << 4);
        MqttCodec::encode_remaining_length(body.len(), &mut packet);
        packet.put_slice(&body);
        packet
    }

    #[test]
    fn decodes_connect_with_credentials() {
        let mut codec = MqttCodec;
        let mut buf = connect_bytes("GID_test@@@aa_bb_cc@@@u-1", "aa:bb:cc", "tok.123", 60);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        match packet {
            ControlPacket::Connect {
                client_id,
                username,
                password,
                keep_alive,
                level,
                ..
            } => {
                assert_eq!(client_id, "GID_test@@@aa_bb_cc@@@u-1");
                assert_eq!(username.as_deref(), Some("aa:bb:cc"));
                assert_eq!(password.as_deref(), Some("tok.123"));
                assert_eq!(keep_alive, 60);
                assert_eq!(level, 4);
            }
            other => panic!("unexpected packet {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_packet_waits_for_more_bytes() {
        let mut codec = MqttCodec;
        let full = connect_bytes("g@@@d", "", "", 0);
        let mut partial = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn publish_round_trip() {
        let mut codec = MqttCodec;
        let mut wire = BytesMut::new();
        codec
            .encode(
                ControlPacket::Publish {
                    topic: "devices/p2p/aa_bb".into(),
                    payload: Bytes::from_static(b"{\"type\":\"hello\"}"),
                },
                &mut wire,
            )
            .unwrap();
        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(
            decoded,
            ControlPacket::Publish {
                topic: "devices/p2p/aa_bb".into(),
                payload: Bytes::from_static(b"{\"type\":\"hello\"}"),
            }
        );
    }

    #[test]
    fn remaining_length_multi_byte() {
        let mut buf = BytesMut::new();
        MqttCodec::encode_remaining_length(321, &mut buf);
        let (value, read) = MqttCodec::decode_remaining_length(&buf).unwrap();
        assert_eq!(value, 321);
        assert_eq!(read, 2);
    }

    #[test]
    fn pingreq_and_disconnect_decode() {
        let mut codec = MqttCodec;
        let mut buf = BytesMut::from(&[TYPE_PINGREQ << 4, 0, TYPE_DISCONNECT << 4, 0][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ControlPacket::PingReq));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ControlPacket::Disconnect)
        );
    }

    #[test]
    fn client_id_parsing() {
        let (group, device, uuid) = parse_client_id("GID_test@@@aa_bb_cc_dd_ee_ff@@@u1").unwrap();
        assert_eq!(group, "GID_test");
        assert_eq!(device, "aa:bb:cc:dd:ee:ff");
        assert_eq!(uuid.as_deref(), Some("u1"));

        let (_, device, uuid) = parse_client_id("g@@@aa_bb").unwrap();
        assert_eq!(device, "aa:bb");
        assert!(uuid.is_none());

        assert!(parse_client_id("no-separator").is_none());
        assert!(parse_client_id("@@@dev").is_none());
    }
}
