//! The client's WireGuard peer.
//!
//! [`Tunnel`] owns the Noise tunnel state and the UDP endpoint socket, and
//! exposes the packet-in/packet-out surface the datapath needs: `send_ip`
//! encapsulates an outbound IP frame (triggering a handshake when there is no
//! current session), `recv` decapsulates inbound datagrams into IP frames,
//! and `tick` drives the protocol timers (handshake retries, keepalives,
//! rekeying).
//!
//! The cryptography and the session state machine (Noise_IKpsk2,
//! ChaCha20-Poly1305 transport, the sliding replay window, cookie replies)
//! live in `boringtun`; this crate owns the peer lifecycle around it.

mod key;
mod peer;

pub use key::{decode_key, encode_key};
pub use peer::{PeerState, Tunnel, TunnelConfig, TIMER_TICK};

/// Errors constructing or driving the peer.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("invalid WireGuard key: {0}")]
    InvalidKey(&'static str),
    #[error("failed to initialise tunnel state: {0}")]
    Init(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
