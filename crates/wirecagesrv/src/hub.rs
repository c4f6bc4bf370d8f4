//! The responder core, free of I/O: datagrams and TUN frames in, a list of
//! sends and TUN writes out. The async loop in `main` owns the sockets.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result};
use boringtun::noise::handshake::parse_handshake_anon;
use boringtun::noise::{Packet, Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use wirecage_tunnel::decode_key;

use crate::args::PeerConfig;
use crate::peer::{AllowedIp, Peer};

const MAX_PACKET: usize = 65536;

/// What the caller must do after feeding the hub one input.
#[derive(Debug, PartialEq, Eq)]
pub enum HubAction {
    SendDatagram { to: SocketAddr, data: Vec<u8> },
    WriteTun(Vec<u8>),
}

pub struct Hub {
    static_secret: StaticSecret,
    static_public: PublicKey,
    peers: Vec<Peer>,
    by_public_key: HashMap<[u8; 32], usize>,
}

impl Hub {
    pub fn new(private_key: &str, peer_cfgs: &[PeerConfig]) -> Result<Self> {
        let static_secret = StaticSecret::from(
            decode_key(private_key).context("invalid server private key")?,
        );
        let static_public = PublicKey::from(&static_secret);

        let mut peers = Vec::with_capacity(peer_cfgs.len());
        let mut by_public_key = HashMap::new();
        for (slot, cfg) in peer_cfgs.iter().enumerate() {
            let public_key = decode_key(&cfg.public_key)
                .with_context(|| format!("invalid peer public key {:?}", cfg.public_key))?;
            let allowed_ip = AllowedIp::parse(&cfg.allowed_ip)
                .map_err(|err| anyhow::anyhow!("invalid --peer allowed-ip: {err}"))?;

            // The slot doubles as the session index prefix, so transport
            // datagrams route back to their peer by receiver index alone.
            let tunn = Tunn::new(
                static_secret.clone(),
                PublicKey::from(public_key),
                None,
                None,
                slot as u32,
                None,
            )
            .map_err(|err| anyhow::anyhow!("failed to initialise peer tunnel: {err}"))?;

            tracing::info!(
                public_key = %cfg.public_key,
                allowed_ip = %cfg.allowed_ip,
                "added peer"
            );
            by_public_key.insert(public_key, slot);
            peers.push(Peer::new(tunn, public_key, allowed_ip));
        }

        Ok(Self {
            static_secret,
            static_public,
            peers,
            by_public_key,
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Routes one datagram from the listen socket to its peer and
    /// decapsulates it.
    pub fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) -> Vec<HubAction> {
        let slot = match Tunn::parse_incoming_packet(datagram) {
            Ok(Packet::HandshakeInit(ref init)) => {
                // Initiations carry no receiver index; the initiator's
                // identity comes out of the anonymous handshake fields.
                match parse_handshake_anon(&self.static_secret, &self.static_public, init) {
                    Ok(half) => match self.by_public_key.get(&half.peer_static_public) {
                        Some(slot) => *slot,
                        None => {
                            tracing::debug!(%from, "handshake from unconfigured peer");
                            return Vec::new();
                        }
                    },
                    Err(err) => {
                        tracing::debug!(%from, "invalid handshake initiation: {err:?}");
                        return Vec::new();
                    }
                }
            }
            Ok(Packet::HandshakeResponse(p)) => (p.receiver_idx >> 8) as usize,
            Ok(Packet::PacketCookieReply(p)) => (p.receiver_idx >> 8) as usize,
            Ok(Packet::PacketData(p)) => (p.receiver_idx >> 8) as usize,
            Err(err) => {
                tracing::debug!(%from, "dropping undecodable datagram: {err:?}");
                return Vec::new();
            }
        };

        let Some(peer) = self.peers.get_mut(slot) else {
            tracing::debug!(%from, slot, "datagram for unknown receiver index");
            return Vec::new();
        };

        let mut actions = Vec::new();
        let mut scratch = vec![0u8; MAX_PACKET];
        match peer.tunn.decapsulate(None, datagram, &mut scratch) {
            TunnResult::WriteToNetwork(data) => {
                peer.endpoint = Some(from);
                actions.push(HubAction::SendDatagram {
                    to: from,
                    data: data.to_vec(),
                });
                loop {
                    match peer.tunn.decapsulate(None, &[], &mut scratch) {
                        TunnResult::WriteToNetwork(data) => {
                            actions.push(HubAction::SendDatagram {
                                to: from,
                                data: data.to_vec(),
                            });
                        }
                        _ => break,
                    }
                }
            }
            TunnResult::WriteToTunnelV4(frame, src) => {
                peer.endpoint = Some(from);
                route_inbound(peer, IpAddr::V4(src), frame, &mut actions);
            }
            TunnResult::WriteToTunnelV6(frame, src) => {
                peer.endpoint = Some(from);
                route_inbound(peer, IpAddr::V6(src), frame, &mut actions);
            }
            TunnResult::Done => {
                peer.endpoint = Some(from);
            }
            TunnResult::Err(err) => {
                tracing::debug!(%from, "decapsulation failed: {err:?}");
            }
        }
        actions
    }

    /// Routes one frame read from the TUN back to the peer whose
    /// allowed-IPs cover its destination.
    pub fn handle_tun_frame(&mut self, frame: &[u8]) -> Vec<HubAction> {
        let Some(dest) = destination_of(frame) else {
            tracing::debug!(len = frame.len(), "unroutable tun frame");
            return Vec::new();
        };

        let Some(peer) = self
            .peers
            .iter_mut()
            .find(|peer| peer.allowed_ip.contains(dest))
        else {
            tracing::debug!(%dest, "no peer owns destination");
            return Vec::new();
        };
        let Some(endpoint) = peer.endpoint else {
            tracing::debug!(%dest, "peer has no endpoint yet, dropping frame");
            return Vec::new();
        };

        let mut scratch = vec![0u8; frame.len() + 160];
        match peer.tunn.encapsulate(frame, &mut scratch) {
            TunnResult::WriteToNetwork(data) => vec![HubAction::SendDatagram {
                to: endpoint,
                data: data.to_vec(),
            }],
            TunnResult::Done => Vec::new(),
            TunnResult::Err(err) => {
                tracing::debug!(%dest, "encapsulation failed: {err:?}");
                Vec::new()
            }
            other => {
                tracing::debug!(%dest, "unexpected encapsulation result: {other:?}");
                Vec::new()
            }
        }
    }

    /// Per-peer protocol timers.
    pub fn tick(&mut self) -> Vec<HubAction> {
        let mut actions = Vec::new();
        let mut scratch = vec![0u8; MAX_PACKET];
        for peer in &mut self.peers {
            let Some(endpoint) = peer.endpoint else {
                continue;
            };
            match peer.tunn.update_timers(&mut scratch) {
                TunnResult::WriteToNetwork(data) => {
                    actions.push(HubAction::SendDatagram {
                        to: endpoint,
                        data: data.to_vec(),
                    });
                }
                TunnResult::Err(err) => {
                    tracing::debug!(public_key = ?&peer.public_key[..4], "peer timers: {err:?}");
                }
                _ => {}
            }
        }
        actions
    }
}

/// Enforces cryptokey routing: only frames sourced inside the peer's
/// allowed-IPs may enter the TUN.
fn route_inbound(peer: &Peer, src: IpAddr, frame: &[u8], actions: &mut Vec<HubAction>) {
    if !peer.allowed_ip.contains(src) {
        tracing::debug!(%src, "dropping frame outside peer allowed-ips");
        return;
    }
    actions.push(HubAction::WriteTun(frame.to_vec()));
}

/// Pulls the destination address out of a raw IP frame.
fn destination_of(frame: &[u8]) -> Option<IpAddr> {
    match frame.first()? >> 4 {
        4 if frame.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::new(
            frame[16], frame[17], frame[18], frame[19],
        ))),
        6 if frame.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&frame[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wirecage_tunnel::encode_key;

    const CLIENT_ADDR: &str = "192.0.2.50:40123";

    fn client_keys() -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::from([0x11; 32]);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    fn server_key() -> StaticSecret {
        StaticSecret::from([0x22; 32])
    }

    fn hub_with_client(allowed_ip: &str) -> Hub {
        let (_, client_public) = client_keys();
        Hub::new(
            &encode_key(&server_key().to_bytes()),
            &[PeerConfig {
                public_key: encode_key(client_public.as_bytes()),
                allowed_ip: allowed_ip.to_string(),
            }],
        )
        .unwrap()
    }

    fn client_tunn() -> Tunn {
        let (secret, _) = client_keys();
        let server_public = PublicKey::from(&server_key());
        Tunn::new(secret, server_public, None, None, 0, None).unwrap()
    }

    fn ipv4_frame(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let total = 20 + payload.len();
        let mut frame = vec![0u8; 20];
        frame[0] = 0x45;
        frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        frame[8] = 64;
        frame[9] = 17;
        frame[12..16].copy_from_slice(&src);
        frame[16..20].copy_from_slice(&dst);
        frame.extend_from_slice(payload);
        frame
    }

    /// Runs the full handshake and returns the hub plus the client tunnel
    /// with an established session.
    fn establish(allowed_ip: &str, first_frame: &[u8]) -> (Hub, Tunn, Vec<HubAction>) {
        let mut hub = hub_with_client(allowed_ip);
        let mut client = client_tunn();
        let from: SocketAddr = CLIENT_ADDR.parse().unwrap();

        // Client queues the frame and emits a handshake initiation.
        let mut scratch = vec![0u8; 2048];
        let TunnResult::WriteToNetwork(init) = client.encapsulate(first_frame, &mut scratch)
        else {
            panic!("expected handshake initiation");
        };
        let actions = hub.handle_datagram(init, from);
        let HubAction::SendDatagram { data: response, .. } = &actions[0] else {
            panic!("expected handshake response, got {actions:?}");
        };

        // Client processes the response and flushes its queued frame.
        let mut wire_to_hub = Vec::new();
        let mut scratch = vec![0u8; 2048];
        if let TunnResult::WriteToNetwork(data) = client.decapsulate(None, response, &mut scratch)
        {
            wire_to_hub.push(data.to_vec());
            loop {
                let mut scratch = vec![0u8; 2048];
                match client.decapsulate(None, &[], &mut scratch) {
                    TunnResult::WriteToNetwork(data) => wire_to_hub.push(data.to_vec()),
                    _ => break,
                }
            }
        }

        let mut tun_writes = Vec::new();
        for datagram in wire_to_hub {
            tun_writes.extend(hub.handle_datagram(&datagram, from));
        }
        (hub, client, tun_writes)
    }

    #[test]
    fn handshake_then_transport_reaches_the_tun() {
        let frame = ipv4_frame([10, 200, 100, 2], [8, 8, 8, 8], b"payload");
        let (_, _, actions) = establish("10.200.100.2", &frame);
        assert_eq!(actions, vec![HubAction::WriteTun(frame)]);
    }

    #[test]
    fn cryptokey_routing_drops_sources_outside_allowed_ips() {
        let spoofed = ipv4_frame([9, 9, 9, 9], [8, 8, 8, 8], b"nope");
        let (_, _, actions) = establish("10.200.100.2", &spoofed);
        assert_eq!(actions, vec![], "spoofed source must not reach the tun");
    }

    #[test]
    fn tun_frames_are_encapsulated_to_the_owning_peer() {
        let outbound = ipv4_frame([10, 200, 100, 2], [8, 8, 8, 8], b"q");
        let (mut hub, mut client, _) = establish("10.200.100.2", &outbound);

        // A reply frame for the client's address goes back encrypted.
        let reply = ipv4_frame([8, 8, 8, 8], [10, 200, 100, 2], b"a");
        let actions = hub.handle_tun_frame(&reply);
        let HubAction::SendDatagram { to, data } = &actions[0] else {
            panic!("expected datagram, got {actions:?}");
        };
        assert_eq!(to.to_string(), CLIENT_ADDR);

        let mut scratch = vec![0u8; 2048];
        match client.decapsulate(None, data, &mut scratch) {
            TunnResult::WriteToTunnelV4(frame, _) => assert_eq!(frame, &reply[..]),
            other => panic!("client failed to decapsulate: {other:?}"),
        }
    }

    #[test]
    fn frames_for_unowned_destinations_are_dropped() {
        let outbound = ipv4_frame([10, 200, 100, 2], [8, 8, 8, 8], b"q");
        let (mut hub, _, _) = establish("10.200.100.2", &outbound);
        let stray = ipv4_frame([8, 8, 8, 8], [10, 200, 100, 77], b"x");
        assert_eq!(hub.handle_tun_frame(&stray), vec![]);
    }

    #[test]
    fn handshake_from_unconfigured_peer_is_ignored() {
        let mut hub = hub_with_client("10.200.100.2");
        // A different client identity than the configured peer.
        let stranger_secret = StaticSecret::from([0x77; 32]);
        let server_public = PublicKey::from(&server_key());
        let mut stranger = Tunn::new(stranger_secret, server_public, None, None, 0, None).unwrap();

        let mut scratch = vec![0u8; 2048];
        let TunnResult::WriteToNetwork(init) =
            stranger.encapsulate(&ipv4_frame([1, 1, 1, 1], [2, 2, 2, 2], b""), &mut scratch)
        else {
            panic!("expected initiation");
        };
        assert_eq!(hub.handle_datagram(init, CLIENT_ADDR.parse().unwrap()), vec![]);
    }

    #[test]
    fn frames_before_any_handshake_are_dropped() {
        let mut hub = hub_with_client("10.200.100.2");
        let reply = ipv4_frame([8, 8, 8, 8], [10, 200, 100, 2], b"a");
        assert_eq!(hub.handle_tun_frame(&reply), vec![], "no endpoint known yet");
    }
}
