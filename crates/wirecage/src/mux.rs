//! Per-flow glue between the two virtual stacks.
//!
//! Every flow terminated on the TUN side (inner) is mirrored by a flow
//! dialed on the WireGuard side (outer) toward the same original
//! destination, and bytes are copied both ways until both directions are
//! done. The stacks are deliberately not bridged at the IP layer: re-dialing
//! at L4 is what makes the remote end see canonical WireGuard traffic while
//! the child sees transparent networking.

use std::collections::HashMap;

use wirecage_netstack::{Action, FlowId, Millis, NetStack, Proto};

/// Which stack an action came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The TUN-side stack terminating the child's flows.
    Inner,
    /// The WireGuard-side stack dialing toward the remote network.
    Outer,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Inner => Side::Outer,
            Side::Outer => Side::Inner,
        }
    }
}

#[derive(Default)]
pub struct ProxyMux {
    inner_to_outer: HashMap<FlowId, FlowId>,
    outer_to_inner: HashMap<FlowId, FlowId>,
}

impl ProxyMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flow_count(&self) -> usize {
        self.inner_to_outer.len()
    }

    /// Handles one flow event from `side`, performing the mirror operation
    /// on the opposite stack. Returns the actions the opposite stack
    /// produced, tagged with their side. `EmitPacket` actions are the
    /// caller's I/O job and must not be passed here.
    pub fn handle(
        &mut self,
        side: Side,
        action: Action,
        inner: &mut NetStack,
        outer: &mut NetStack,
        now: Millis,
    ) -> Vec<(Side, Action)> {
        match action {
            Action::EmitPacket(_) => unreachable!("EmitPacket is I/O, not a flow event"),

            Action::FlowOpened { flow, proto, src, dst } => {
                if side != Side::Inner {
                    // Unsolicited inbound flow from the tunnel; nothing
                    // proxies toward the child, so shut it down.
                    tracing::debug!(?flow, %src, "rejecting flow terminated on the wireguard side");
                    return tag(Side::Outer, outer.abort(flow, now));
                }
                tracing::debug!(?proto, %src, %dst, "proxying new flow");
                let dialed = match proto {
                    Proto::Tcp => outer.tcp_connect(dst, now),
                    Proto::Udp => outer.udp_open(dst, now),
                };
                match dialed {
                    Ok((outer_id, actions)) => {
                        self.inner_to_outer.insert(flow, outer_id);
                        self.outer_to_inner.insert(outer_id, flow);
                        tag(Side::Outer, actions)
                    }
                    Err(err) => {
                        // TCP manifests to the child as a reset; UDP as
                        // silence, with the datagram discarded.
                        tracing::debug!(%dst, "error dialing: {err}");
                        tag(Side::Inner, inner.abort(flow, now))
                    }
                }
            }

            Action::FlowConnected { flow } => {
                // The dialing stack flushes its own pre-connect buffer.
                tracing::debug!(?flow, "outer flow connected");
                Vec::new()
            }

            Action::FlowData { flow, data } => match self.paired(side, flow) {
                Some(other_id) => {
                    let stack = opposite(side, inner, outer);
                    tag(side.other(), stack.send(other_id, &data, now))
                }
                None => {
                    tracing::debug!(?flow, "data for unpaired flow dropped");
                    Vec::new()
                }
            },

            Action::FlowEof { flow } => match self.paired(side, flow) {
                Some(other_id) => {
                    let stack = opposite(side, inner, outer);
                    tag(side.other(), stack.shutdown_write(other_id, now))
                }
                None => Vec::new(),
            },

            Action::FlowFailed { flow, error } => {
                tracing::debug!(?flow, ?error, "flow failed");
                match self.unpair(side, flow) {
                    Some(other_id) => {
                        let stack = opposite(side, inner, outer);
                        tag(side.other(), stack.abort(other_id, now))
                    }
                    None => Vec::new(),
                }
            }

            Action::FlowClosed { flow } => {
                // A clean close: the paired flow finishes (or already
                // finished) its own close handshake, so only drop the pair.
                self.unpair(side, flow);
                Vec::new()
            }
        }
    }

    fn paired(&self, side: Side, flow: FlowId) -> Option<FlowId> {
        match side {
            Side::Inner => self.inner_to_outer.get(&flow).copied(),
            Side::Outer => self.outer_to_inner.get(&flow).copied(),
        }
    }

    fn unpair(&mut self, side: Side, flow: FlowId) -> Option<FlowId> {
        let other = match side {
            Side::Inner => self.inner_to_outer.remove(&flow),
            Side::Outer => self.outer_to_inner.remove(&flow),
        };
        if let Some(other_id) = other {
            match side {
                Side::Inner => self.outer_to_inner.remove(&other_id),
                Side::Outer => self.inner_to_outer.remove(&other_id),
            };
        }
        other
    }
}

fn opposite<'a>(side: Side, inner: &'a mut NetStack, outer: &'a mut NetStack) -> &'a mut NetStack {
    match side {
        Side::Inner => outer,
        Side::Outer => inner,
    }
}

fn tag(side: Side, actions: Vec<Action>) -> Vec<(Side, Action)> {
    actions.into_iter().map(|a| (side, a)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use wirecage_netstack::packet::ipv4::Ipv4Packet;
    use wirecage_netstack::packet::tcp::{self, TcpSegment, FLAG_SYN};
    use wirecage_netstack::packet::{IPPROTO_TCP, IPPROTO_UDP};
    use wirecage_netstack::StackConfig;

    const CHILD: Ipv4Addr = Ipv4Addr::new(10, 1, 2, 100);
    const DEST: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);
    const WG_ADDR: Ipv4Addr = Ipv4Addr::new(10, 200, 100, 2);

    /// Test harness mirroring the stage-2 datapath: a TUN-side stack, a
    /// WireGuard-side stack, and a third "world" stack standing in for the
    /// remote network behind the tunnel.
    struct Harness {
        inner: NetStack,
        outer: NetStack,
        world: NetStack,
        mux: ProxyMux,
        to_child: Vec<Vec<u8>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                inner: NetStack::new(StackConfig {
                    promiscuous: true,
                    spoofing: true,
                    ..StackConfig::default()
                }),
                outer: NetStack::new(StackConfig {
                    local_addr: Some(IpAddr::V4(WG_ADDR)),
                    ..StackConfig::default()
                }),
                world: NetStack::new(StackConfig {
                    promiscuous: true,
                    spoofing: true,
                    ..StackConfig::default()
                }),
                mux: ProxyMux::new(),
                to_child: Vec::new(),
            }
        }

        /// Feeds one frame from the sandboxed child and settles the system.
        fn child_sends(&mut self, frame: &[u8]) -> Vec<Action> {
            let actions = self.inner.handle_inbound(frame, 0);
            self.settle(tag(Side::Inner, actions))
        }

        /// Drains tagged actions, shuttling frames: Inner EmitPacket goes to
        /// the child (collected), Outer EmitPacket goes to the world stack
        /// and the world's replies come back in.
        fn settle(&mut self, seed: Vec<(Side, Action)>) -> Vec<Action> {
            let mut world_events = Vec::new();
            let mut queue: VecDeque<(Side, Action)> = seed.into();
            while let Some((side, action)) = queue.pop_front() {
                match (side, action) {
                    (Side::Inner, Action::EmitPacket(frame)) => self.to_child.push(frame),
                    (Side::Outer, Action::EmitPacket(frame)) => {
                        let world_actions = self.world.handle_inbound(&frame, 0);
                        for wa in world_actions {
                            match wa {
                                Action::EmitPacket(reply) => {
                                    let outer_actions = self.outer.handle_inbound(&reply, 0);
                                    queue.extend(tag(Side::Outer, outer_actions));
                                }
                                other => world_events.push(other),
                            }
                        }
                    }
                    (side, action) => {
                        let more = self.mux.handle(
                            side,
                            action,
                            &mut self.inner,
                            &mut self.outer,
                            0,
                        );
                        queue.extend(more);
                    }
                }
            }
            world_events
        }

        /// Lets the world-side flow emit bytes and settles them back.
        fn world_sends(&mut self, flow: FlowId, data: &[u8]) {
            let actions = self.world.send(flow, data, 0);
            let mut queue: VecDeque<(Side, Action)> = VecDeque::new();
            for action in actions {
                if let Action::EmitPacket(frame) = action {
                    let outer_actions = self.outer.handle_inbound(&frame, 0);
                    queue.extend(tag(Side::Outer, outer_actions));
                }
            }
            self.settle(queue.into());
        }
    }

    fn tcp_frame(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let seg = tcp::build_segment(
            IpAddr::V4(src),
            IpAddr::V4(dst),
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            0xffff,
            payload,
        );
        Ipv4Packet::serialize(src, dst, IPPROTO_TCP, 1, 64, &seg)
    }

    #[test]
    fn syn_is_re_dialed_with_original_destination_preserved() {
        let mut h = Harness::new();

        let events =
            h.child_sends(&tcp_frame(CHILD, DEST, 40000, 80, 5000, 0, FLAG_SYN, &[]));

        // The world sees a flow whose destination is what the child dialed,
        // originated from the wireguard self-address.
        let (_, _, src, dst) = events
            .iter()
            .find_map(|a| match a {
                Action::FlowOpened { flow, proto, src, dst } => Some((*flow, *proto, *src, *dst)),
                _ => None,
            })
            .expect("world flow opened");
        assert_eq!(dst, SocketAddr::new(IpAddr::V4(DEST), 80));
        assert_eq!(src.ip(), IpAddr::V4(WG_ADDR));
        assert_eq!(h.mux.flow_count(), 1);

        // And the child got its SYN-ACK from the address it dialed.
        let synack = h.to_child.first().expect("SYN-ACK to child");
        let ip = Ipv4Packet::parse(synack).unwrap();
        assert_eq!(ip.src, DEST);
        assert_eq!(ip.dst, CHILD);
    }

    #[test]
    fn bytes_round_trip_between_child_and_world() {
        let mut h = Harness::new();
        let events = h.child_sends(&tcp_frame(CHILD, DEST, 40000, 80, 5000, 0, FLAG_SYN, &[]));
        let world_flow = events
            .iter()
            .find_map(|a| match a {
                Action::FlowOpened { flow, .. } => Some(*flow),
                _ => None,
            })
            .unwrap();

        // Complete the child side of the handshake.
        let synack = h.to_child.remove(0);
        let ip = Ipv4Packet::parse(&synack).unwrap();
        let seg = TcpSegment::parse(ip.payload).unwrap();
        let our_isn = seg.seq;
        h.child_sends(&tcp_frame(
            CHILD,
            DEST,
            40000,
            80,
            5001,
            our_isn.wrapping_add(1),
            tcp::FLAG_ACK,
            &[],
        ));

        // Child payload reaches the world flow.
        let events = h.child_sends(&tcp_frame(
            CHILD,
            DEST,
            40000,
            80,
            5001,
            our_isn.wrapping_add(1),
            tcp::FLAG_ACK | tcp::FLAG_PSH,
            b"GET / HTTP/1.0\r\n\r\n",
        ));
        let payloads: Vec<Vec<u8>> = events
            .iter()
            .filter_map(|a| match a {
                Action::FlowData { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![b"GET / HTTP/1.0\r\n\r\n".to_vec()]);

        // World reply comes back to the child from the original destination.
        h.to_child.clear();
        h.world_sends(world_flow, b"hello");
        let data_frame = h
            .to_child
            .iter()
            .find_map(|frame| {
                let ip = Ipv4Packet::parse(frame).ok()?;
                let seg = TcpSegment::parse(ip.payload).ok()?;
                (!seg.payload.is_empty()).then(|| (ip.src, seg.payload.to_vec()))
            })
            .expect("payload relayed to child");
        assert_eq!(data_frame.0, DEST);
        assert_eq!(data_frame.1, b"hello");
    }

    #[test]
    fn udp_datagrams_are_re_dialed_and_answered() {
        let mut h = Harness::new();
        let dgram = {
            let payload =
                wirecage_netstack::packet::udp::build_datagram(
                    IpAddr::V4(CHILD),
                    IpAddr::V4(DEST),
                    5353,
                    53,
                    b"query",
                );
            Ipv4Packet::serialize(CHILD, DEST, IPPROTO_UDP, 1, 64, &payload)
        };

        let events = h.child_sends(&dgram);
        let world_flow = events
            .iter()
            .find_map(|a| match a {
                Action::FlowOpened { flow, proto: Proto::Udp, .. } => Some(*flow),
                _ => None,
            })
            .expect("world udp flow");
        assert!(events.iter().any(|a| matches!(
            a,
            Action::FlowData { data, .. } if data == b"query"
        )));

        h.world_sends(world_flow, b"answer");
        let reply = h
            .to_child
            .iter()
            .find_map(|frame| {
                let ip = Ipv4Packet::parse(frame).ok()?;
                let dgram = wirecage_netstack::packet::udp::UdpDatagram::parse(ip.payload).ok()?;
                Some((ip.src, dgram.src_port, dgram.payload.to_vec()))
            })
            .expect("udp reply to child");
        assert_eq!(reply, (DEST, 53, b"answer".to_vec()));
    }

    #[test]
    fn failed_dial_aborts_the_inner_flow() {
        let mut h = Harness::new();
        // Dialing an IPv6 destination with only an IPv4 wireguard address
        // cannot work; the child must see a reset.
        let v6_frame = {
            use wirecage_netstack::packet::ipv6::Ipv6Packet;
            let src: std::net::Ipv6Addr = "fd00::100".parse().unwrap();
            let dst: std::net::Ipv6Addr = "2001:db8::9".parse().unwrap();
            let seg = tcp::build_segment(
                IpAddr::V6(src),
                IpAddr::V6(dst),
                40000,
                80,
                1,
                0,
                FLAG_SYN,
                0xffff,
                &[],
            );
            Ipv6Packet::serialize(src, dst, IPPROTO_TCP, 64, &seg)
        };
        h.child_sends(&v6_frame);
        assert_eq!(h.mux.flow_count(), 0);
        // The inner stack aborted the flow: an RST went back to the child.
        let rst = h.to_child.iter().rev().find_map(|frame| {
            use wirecage_netstack::packet::ipv6::Ipv6Packet;
            let ip = Ipv6Packet::parse(frame).ok()?;
            TcpSegment::parse(ip.payload).ok()
        });
        assert!(
            rst.map(|seg| seg.has(tcp::FLAG_RST)).unwrap_or(false),
            "child must see a reset for an undialable destination"
        );
    }
}
