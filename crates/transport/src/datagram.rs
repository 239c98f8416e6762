//! Datagram audio endpoint for the broker variant
//!
//! Audio bypasses the broker control connection and flows over UDP. Every
//! datagram is a 16-byte [`AudioHeader`](crate::gateway::AudioHeader)
//! followed by an AES-128-CTR encrypted payload. The per-session key and
//! nonce are minted here and handed to the device inside the `hello` reply.
//!
//! Association contract: the device opens the audio path with a handshake
//! datagram (`type = 0x02`) whose encrypted payload is its session id; the
//! endpoint learns the device's remote address from it. Audio datagrams
//! (`type = 0x01`) from an unassociated address are dropped.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use bytes::Bytes;
use ctr::Ctr128BE;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::gateway::{AudioHeader, HEADER_LEN};
use crate::TransportError;

type Aes128Ctr = Ctr128BE<Aes128>;

pub const PACKET_TYPE_AUDIO: u8 = 0x01;
pub const PACKET_TYPE_HANDSHAKE: u8 = 0x02;

/// Session-level datagram key material.
#[derive(Clone)]
pub struct DatagramKey {
    pub key: [u8; 16],
    pub nonce: [u8; 16],
}

impl DatagramKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 16];
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut nonce);
        Self { key, nonce }
    }

    /// Encrypt or decrypt `buf` in place. The IV is the session nonce with
    /// the packet sequence spliced into its trailing four bytes, so every
    /// datagram gets a distinct keystream.
    pub fn apply(&self, sequence: u32, buf: &mut [u8]) {
        let mut iv = self.nonce;
        iv[12..16].copy_from_slice(&sequence.to_be_bytes());
        let mut cipher = Aes128Ctr::new(&self.key.into(), &iv.into());
        cipher.apply_keystream(buf);
    }

    pub fn key_hex(&self) -> String {
        hex(&self.key)
    }

    pub fn nonce_hex(&self) -> String {
        hex(&self.nonce)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

struct PeerState {
    session_id: String,
    key: DatagramKey,
    addr: RwLock<Option<SocketAddr>>,
    audio_tx: mpsc::Sender<Bytes>,
    highest_recv_seq: AtomicU32,
}

pub struct UdpAudioEndpoint {
    socket: Arc<UdpSocket>,
    peers: DashMap<String, Arc<PeerState>>,
    by_addr: DashMap<SocketAddr, Arc<PeerState>>,
    advertised_host: String,
    advertised_port: u16,
}

impl UdpAudioEndpoint {
    pub async fn bind(
        bind_addr: &str,
        advertised_host: String,
        advertised_port: u16,
    ) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        tracing::info!(bind = bind_addr, "udp audio endpoint listening");
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            peers: DashMap::new(),
            by_addr: DashMap::new(),
            advertised_host,
            advertised_port,
        }))
    }

    /// `(server, port)` block for the `hello` reply.
    pub fn advertised(&self) -> (String, u16) {
        (self.advertised_host.clone(), self.advertised_port)
    }

    /// Mint key material for a session and start accepting its handshake.
    /// Decrypted audio payloads are delivered through `audio_tx`.
    pub fn register(&self, session_id: &str, audio_tx: mpsc::Sender<Bytes>) -> DatagramKey {
        let key = DatagramKey::generate();
        let peer = Arc::new(PeerState {
            session_id: session_id.to_string(),
            key: key.clone(),
            addr: RwLock::new(None),
            audio_tx,
            highest_recv_seq: AtomicU32::new(0),
        });
        self.peers.insert(session_id.to_string(), peer);
        key
    }

    pub fn unregister(&self, session_id: &str) {
        if let Some((_, peer)) = self.peers.remove(session_id) {
            if let Some(addr) = *peer.addr.read() {
                self.by_addr.remove(&addr);
            }
        }
    }

    /// Send one header-prefixed frame; the payload part is encrypted with
    /// the sequence already present in the header.
    pub async fn send(&self, session_id: &str, frame: &[u8]) -> Result<(), TransportError> {
        let peer = self
            .peers
            .get(session_id)
            .ok_or(TransportError::Closed)?
            .clone();
        let addr = (*peer.addr.read()).ok_or(TransportError::Closed)?;

        let header = AudioHeader::decode(frame)?;
        let mut out = frame.to_vec();
        peer.key.apply(header.sequence, &mut out[HEADER_LEN..]);
        self.socket.send_to(&out, addr).await?;
        Ok(())
    }

    pub fn spawn_recv_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let endpoint = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                match endpoint.socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => endpoint.handle_datagram(addr, &buf[..len]),
                    Err(err) => {
                        tracing::error!(error = %err, "udp receive failed");
                        break;
                    }
                }
            }
        })
    }

    fn handle_datagram(&self, addr: SocketAddr, data: &[u8]) {
        let (header, payload) = match AudioHeader::split_frame(data) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::debug!(%addr, error = %err, "dropping malformed datagram");
                return;
            }
        };

        match header.packet_type {
            PACKET_TYPE_HANDSHAKE => self.associate(addr, header.sequence, payload),
            PACKET_TYPE_AUDIO => {
                let Some(peer) = self.by_addr.get(&addr).map(|p| p.clone()) else {
                    tracing::debug!(%addr, "audio datagram from unassociated address");
                    return;
                };
                // Drop replays and reordered stragglers.
                let prev = peer.highest_recv_seq.fetch_max(header.sequence, Ordering::Relaxed);
                if header.sequence < prev {
                    return;
                }
                let mut audio = payload.to_vec();
                peer.key.apply(header.sequence, &mut audio);
                if peer.audio_tx.try_send(Bytes::from(audio)).is_err() {
                    tracing::warn!(session_id = %peer.session_id, "audio channel full, frame dropped");
                }
            }
            other => tracing::debug!(%addr, packet_type = other, "unknown datagram type"),
        }
    }

    fn associate(&self, addr: SocketAddr, sequence: u32, payload: &[u8]) {
        for entry in self.peers.iter() {
            let peer = entry.value();
            if peer.addr.read().is_some() {
                continue;
            }
            let mut plain = payload.to_vec();
            peer.key.apply(sequence, &mut plain);
            if plain == peer.session_id.as_bytes() {
                *peer.addr.write() = Some(addr);
                self.by_addr.insert(addr, peer.clone());
                tracing::info!(session_id = %peer.session_id, %addr, "udp audio path associated");
                return;
            }
        }
        tracing::debug!(%addr, "handshake datagram matched no pending session");
    }
}
