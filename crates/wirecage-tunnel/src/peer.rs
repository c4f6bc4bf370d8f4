use std::net::SocketAddr;
use std::sync::Mutex;

use boringtun::noise::errors::WireGuardError;
use boringtun::noise::{Packet, Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};

use crate::{key::decode_key, TunnelError};

/// How often [`Tunnel::tick`] should run. The protocol timers (handshake
/// retransmission every 5s, keepalives, rekey after 120s, reject after 180s)
/// are maintained inside the Noise state; the tick only has to be frequent
/// enough for them to fire promptly.
pub const TIMER_TICK: std::time::Duration = std::time::Duration::from_millis(250);

/// Observable lifecycle of the peer. Rekeying is handled inside the Noise
/// state and is not distinguishable from `Transport` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No session and no handshake in flight.
    Idle,
    /// A handshake initiation is in flight.
    Handshaking,
    /// A transport session is established.
    Transport,
    /// Handshake attempts were exhausted; the next outbound frame retries.
    Dead,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Our static private key, standard base64.
    pub private_key: String,
    /// The responder's static public key, standard base64.
    pub public_key: String,
    /// Optional pre-shared key, standard base64.
    pub preshared_key: Option<String>,
    /// Remote endpoint the encapsulated traffic is sent to.
    pub endpoint: SocketAddr,
    /// Persistent keepalive interval in seconds, if any.
    pub persistent_keepalive: Option<u16>,
}

struct Inner {
    tunn: Tunn,
    state: PeerState,
}

/// One WireGuard peer: Noise tunnel state plus the endpoint UDP socket.
///
/// The socket must be created in the namespace that can reach the endpoint.
/// On the client that means before `unshare(CLONE_NEWNET)`; sockets keep the
/// network namespace they were created in.
pub struct Tunnel {
    inner: Mutex<Inner>,
    socket: tokio::net::UdpSocket,
    endpoint: SocketAddr,
}

impl Tunnel {
    /// Builds the peer around an already-bound UDP socket. Must be called
    /// from within a tokio runtime.
    pub fn new(cfg: TunnelConfig, socket: std::net::UdpSocket) -> Result<Self, TunnelError> {
        let private_key = StaticSecret::from(decode_key(&cfg.private_key)?);
        let public_key = PublicKey::from(decode_key(&cfg.public_key)?);
        let preshared_key = cfg
            .preshared_key
            .as_deref()
            .map(decode_key)
            .transpose()?;

        let tunn = Tunn::new(
            private_key,
            public_key,
            preshared_key,
            cfg.persistent_keepalive,
            0,
            None,
        )
        .map_err(TunnelError::Init)?;

        socket.set_nonblocking(true)?;
        let socket = tokio::net::UdpSocket::from_std(socket)?;
        tracing::debug!(
            local = %socket.local_addr()?,
            endpoint = %cfg.endpoint,
            "wireguard peer created"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                tunn,
                state: PeerState::Idle,
            }),
            socket,
            endpoint: cfg.endpoint,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn state(&self) -> PeerState {
        self.inner.lock().expect("tunnel lock").state
    }

    /// Encapsulates one outbound IP frame. With no current session this
    /// queues the frame and puts a handshake initiation on the wire instead;
    /// the queued frame is flushed by [`recv`] once the response arrives.
    ///
    /// [`recv`]: Tunnel::recv
    pub async fn send_ip(&self, frame: &[u8]) -> std::io::Result<()> {
        let out = {
            let mut inner = self.inner.lock().expect("tunnel lock");
            if matches!(inner.state, PeerState::Idle | PeerState::Dead) {
                tracing::debug!("initiating wireguard handshake");
                inner.state = PeerState::Handshaking;
            }
            let mut scratch = vec![0u8; frame.len() + 160];
            match inner.tunn.encapsulate(frame, &mut scratch) {
                TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
                TunnResult::Done => None, // queued behind an in-flight handshake
                TunnResult::Err(err) => {
                    tracing::debug!("encapsulation failed: {err:?}");
                    None
                }
                other => {
                    tracing::debug!("unexpected encapsulation result: {other:?}");
                    None
                }
            }
        };
        if let Some(datagram) = out {
            self.socket.send_to(&datagram, self.endpoint).await?;
        }
        Ok(())
    }

    /// Waits for one datagram from the endpoint and decapsulates it.
    /// Protocol messages (handshake responses, cookie replies) are answered
    /// on the socket directly; decapsulated IP frames are appended to
    /// `frames`.
    pub async fn recv(&self, frames: &mut Vec<Vec<u8>>) -> std::io::Result<()> {
        let mut buf = [0u8; 2048];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        let datagram = &buf[..len];

        let mut replies: Vec<Vec<u8>> = Vec::new();
        {
            let mut inner = self.inner.lock().expect("tunnel lock");

            match Tunn::parse_incoming_packet(datagram) {
                Ok(Packet::HandshakeResponse(_)) => {
                    if inner.state != PeerState::Transport {
                        tracing::debug!(%from, "wireguard session established");
                    }
                    inner.state = PeerState::Transport;
                }
                Ok(Packet::PacketCookieReply(_)) => {
                    // The responder is under load; boringtun folds the cookie
                    // into the next initiation's mac2.
                    tracing::debug!(%from, "received cookie reply");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(%from, "dropping undecodable datagram: {err:?}");
                    return Ok(());
                }
            }

            let mut scratch = vec![0u8; 2048];
            match inner.tunn.decapsulate(None, datagram, &mut scratch) {
                TunnResult::WriteToNetwork(data) => {
                    replies.push(data.to_vec());
                    // Flush queued packets: keep decapsulating nothing until
                    // the tunnel reports Done.
                    loop {
                        match inner.tunn.decapsulate(None, &[], &mut scratch) {
                            TunnResult::WriteToNetwork(data) => replies.push(data.to_vec()),
                            _ => break,
                        }
                    }
                }
                TunnResult::WriteToTunnelV4(frame, _) => {
                    inner.state = PeerState::Transport;
                    frames.push(frame.to_vec());
                }
                TunnResult::WriteToTunnelV6(frame, _) => {
                    inner.state = PeerState::Transport;
                    frames.push(frame.to_vec());
                }
                TunnResult::Done => {}
                TunnResult::Err(WireGuardError::DuplicateCounter) => {
                    // Replay within the receive window: drop silently, no
                    // session state changed.
                    tracing::debug!(%from, "dropping replayed transport message");
                }
                TunnResult::Err(err) => {
                    tracing::debug!(%from, "decapsulation failed: {err:?}");
                }
            }
        }

        for reply in replies {
            self.socket.send_to(&reply, self.endpoint).await?;
        }
        Ok(())
    }

    /// Drives the protocol timers; call every [`TIMER_TICK`].
    pub async fn tick(&self) -> std::io::Result<()> {
        let out = {
            let mut inner = self.inner.lock().expect("tunnel lock");
            let mut scratch = vec![0u8; 2048];
            match inner.tunn.update_timers(&mut scratch) {
                TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
                TunnResult::Err(WireGuardError::ConnectionExpired) => {
                    if inner.state != PeerState::Dead {
                        tracing::warn!("wireguard handshake attempts exhausted, peer is down");
                    }
                    inner.state = PeerState::Dead;
                    None
                }
                TunnResult::Err(err) => {
                    tracing::debug!("timer update failed: {err:?}");
                    None
                }
                _ => None,
            }
        };
        if let Some(datagram) = out {
            self.socket.send_to(&datagram, self.endpoint).await?;
        }
        Ok(())
    }
}
