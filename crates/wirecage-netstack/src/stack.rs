use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use crate::packet::icmp::{self, IcmpMessage, ICMPV4_ECHO_REQUEST};
use crate::packet::ipv4::Ipv4Packet;
use crate::packet::ipv6::Ipv6Packet;
use crate::packet::tcp::{
    self, TcpSegment, FLAG_ACK, FLAG_FIN, FLAG_PSH, FLAG_RST, FLAG_SYN,
};
use crate::packet::udp::{self, UdpDatagram};
use crate::packet::{IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

pub type Millis = u64;

const TCP_WINDOW: u16 = 0xffff;
const TTL: u8 = 64;
const EPHEMERAL_FIRST: u16 = 49152;

/// Identifier of one terminated or originated flow within a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Source address for originated (dialed) flows. `None` on a stack that
    /// only terminates flows.
    pub local_addr: Option<IpAddr>,

    /// Link MTU; outbound TCP payloads are chunked so frames never exceed it.
    pub mtu: usize,

    /// Deliver inbound flows addressed to destinations that are not ours.
    pub promiscuous: bool,

    /// Permit outbound frames whose source address is not ours.
    pub spoofing: bool,

    /// Maximum concurrent terminated + originated TCP connections. A SYN
    /// that would exceed this is answered with RST and no state is kept.
    pub max_tcp_in_flight: usize,

    /// Maximum tracked UDP flows; datagrams beyond the cap are dropped.
    pub max_udp_flows: usize,

    pub tcp_syn_retry_ms: u64,
    pub tcp_connect_timeout_ms: u64,

    /// Retransmission timeout for unacknowledged outbound TCP data.
    pub tcp_rto_ms: u64,
    pub tcp_max_retransmits: u32,

    /// Expire UDP flows with no traffic in either direction for this long.
    pub udp_idle_timeout_ms: Option<u64>,

    /// Cap on bytes buffered for a dialed connection before it is established.
    pub max_pending_tx_bytes: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            local_addr: None,
            mtu: 1500,
            promiscuous: false,
            spoofing: false,
            max_tcp_in_flight: 100,
            max_udp_flows: 1024,
            tcp_syn_retry_ms: 1_000,
            tcp_connect_timeout_ms: 10_000,
            tcp_rto_ms: 500,
            tcp_max_retransmits: 8,
            udp_idle_timeout_ms: Some(120_000),
            max_pending_tx_bytes: 256 * 1024,
        }
    }
}

/// Why a flow went away without a clean close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    /// The remote answered the connection attempt with RST.
    Refused,
    /// Handshake or retransmission gave up.
    TimedOut,
    /// The remote reset an established connection.
    Reset,
}

/// Output of the stack. The caller performs all I/O: `EmitPacket` frames go
/// to the link endpoint, flow events go to the proxy mux.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// A raw IP frame to write to the link endpoint.
    EmitPacket(Vec<u8>),

    /// A terminated flow appeared: first SYN (TCP) or first datagram (UDP).
    /// `dst` is the original destination the sender was trying to reach.
    FlowOpened {
        flow: FlowId,
        proto: Proto,
        src: SocketAddr,
        dst: SocketAddr,
    },
    /// A dialed TCP flow completed its handshake.
    FlowConnected { flow: FlowId },
    /// Payload bytes arrived, in order.
    FlowData { flow: FlowId, data: Vec<u8> },
    /// The remote half-closed; no more data will arrive. Writes still work.
    FlowEof { flow: FlowId },
    /// The flow died; no further events follow.
    FlowFailed { flow: FlowId, error: FlowError },
    /// The flow closed cleanly (both FINs exchanged, or UDP idle expiry).
    FlowClosed { flow: FlowId },
}

/// Errors dialing a new flow.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DialError {
    #[error("stack has no local {family} address to originate from")]
    NoLocalAddress { family: &'static str },
    #[error("no free ephemeral port")]
    NoFreePort,
    #[error("connection limit reached")]
    TooManyFlows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    /// Our side on the wire. For terminated flows this is the original
    /// destination the sender addressed; for dialed flows it is
    /// `local_addr` plus an ephemeral port.
    local: SocketAddr,
    remote: SocketAddr,
}

#[derive(Debug)]
struct TcpConn {
    id: FlowId,
    accept_role: bool,

    remote_isn: u32,
    remote_next: u32,

    our_isn: u32,
    our_next: u32,

    syn_acked: bool,
    established: bool,

    // Outbound bytes not yet acknowledged, for go-back-N retransmission.
    send_buf: Vec<u8>,
    send_buf_seq: u32,
    last_progress_at: Millis,
    retransmits: u32,

    fin_sent: bool,
    fin_seq: u32,
    fin_acked: bool,
    remote_fin_received: bool,

    // Dial-role handshake bookkeeping.
    connect_started_at: Millis,
    last_syn_at: Millis,
    pending_tx: Vec<u8>,
    pending_fin: bool,
}

impl TcpConn {
    fn on_remote_ack(&mut self, ack: u32, now: Millis) {
        if !self.syn_acked && ack.wrapping_sub(self.our_isn) >= 1 {
            self.syn_acked = true;
        }

        if !self.send_buf.is_empty() {
            let acked = ack.wrapping_sub(self.send_buf_seq) as usize;
            if acked > 0 && acked <= self.send_buf.len() {
                self.send_buf.drain(0..acked);
                self.send_buf_seq = ack;
                self.last_progress_at = now;
                self.retransmits = 0;
            }
        }

        if self.fin_sent && !self.fin_acked && ack.wrapping_sub(self.fin_seq) >= 1 {
            self.fin_acked = true;
            self.last_progress_at = now;
            self.retransmits = 0;
        }
    }

    fn should_remove(&self) -> bool {
        // Both sides exchanged FINs and the remote ACKed ours.
        self.remote_fin_received && self.fin_sent && self.fin_acked
    }

    fn awaiting_ack(&self) -> bool {
        !self.send_buf.is_empty() || (self.fin_sent && !self.fin_acked)
    }
}

#[derive(Debug)]
struct UdpFlow {
    id: FlowId,
    last_activity: Millis,
}

/// A sans-io dual-stack packet switch above a raw IP link.
///
/// Two instances are used per run: one terminating flows that arrive on the
/// TUN (promiscuous + spoofing) and one originating the mirror flows on the
/// WireGuard link. `handle_inbound` consumes a frame and returns the actions
/// the caller must perform; flow operations do the same in the other
/// direction.
#[derive(Debug)]
pub struct NetStack {
    cfg: StackConfig,
    next_flow: u64,
    next_ephemeral: u16,
    ipv4_ident: u16,

    tcp: HashMap<FlowKey, TcpConn>,
    tcp_by_id: HashMap<FlowId, FlowKey>,
    udp: HashMap<FlowKey, UdpFlow>,
    udp_by_id: HashMap<FlowId, FlowKey>,
}

impl NetStack {
    pub fn new(cfg: StackConfig) -> Self {
        Self {
            cfg,
            next_flow: 1,
            next_ephemeral: EPHEMERAL_FIRST,
            ipv4_ident: 1,
            tcp: HashMap::new(),
            tcp_by_id: HashMap::new(),
            udp: HashMap::new(),
            udp_by_id: HashMap::new(),
        }
    }

    pub fn tcp_flow_count(&self) -> usize {
        self.tcp.len()
    }

    pub fn udp_flow_count(&self) -> usize {
        self.udp.len()
    }

    /// Processes one raw IP frame from the link endpoint.
    pub fn handle_inbound(&mut self, frame: &[u8], now: Millis) -> Vec<Action> {
        let mut actions = Vec::new();
        if frame.is_empty() {
            return actions;
        }
        match frame[0] >> 4 {
            4 => match Ipv4Packet::parse(frame) {
                Ok(ip) => self.handle_transport(
                    IpAddr::V4(ip.src),
                    IpAddr::V4(ip.dst),
                    ip.protocol,
                    ip.payload,
                    now,
                    &mut actions,
                ),
                Err(err) => tracing::debug!("dropping inbound IPv4 frame: {err}"),
            },
            6 => match Ipv6Packet::parse(frame) {
                Ok(ip) => self.handle_transport(
                    IpAddr::V6(ip.src),
                    IpAddr::V6(ip.dst),
                    ip.next_header,
                    ip.payload,
                    now,
                    &mut actions,
                ),
                Err(err) => tracing::debug!("dropping inbound IPv6 frame: {err}"),
            },
            v => tracing::debug!("dropping frame with IP version {v}"),
        }
        actions
    }

    fn handle_transport(
        &mut self,
        src: IpAddr,
        dst: IpAddr,
        protocol: u8,
        payload: &[u8],
        now: Millis,
        actions: &mut Vec<Action>,
    ) {
        match protocol {
            IPPROTO_TCP => self.handle_tcp(src, dst, payload, now, actions),
            IPPROTO_UDP => self.handle_udp(src, dst, payload, now, actions),
            IPPROTO_ICMP => self.handle_icmpv4(src, dst, payload, actions),
            IPPROTO_ICMPV6 => {
                tracing::debug!(%src, %dst, "dropping ICMPv6 message");
            }
            other => {
                tracing::debug!(%src, %dst, protocol = other, "dropping unknown IP protocol");
            }
        }
    }

    // ---- TCP -------------------------------------------------------------

    fn handle_tcp(
        &mut self,
        src: IpAddr,
        dst: IpAddr,
        segment: &[u8],
        now: Millis,
        actions: &mut Vec<Action>,
    ) {
        if !tcp::checksum_valid(src, dst, segment) {
            tracing::debug!(%src, %dst, "dropping TCP segment with bad checksum");
            return;
        }
        let seg = match TcpSegment::parse(segment) {
            Ok(seg) => seg,
            Err(err) => {
                tracing::debug!(%src, %dst, "dropping TCP segment: {err}");
                return;
            }
        };

        let key = FlowKey {
            local: SocketAddr::new(dst, seg.dst_port),
            remote: SocketAddr::new(src, seg.src_port),
        };

        if self.tcp.contains_key(&key) {
            self.handle_tcp_segment(key, seg, now, actions);
            return;
        }

        // No connection for this tuple.
        if seg.has(FLAG_SYN) && !seg.has(FLAG_ACK) {
            self.handle_tcp_syn(key, seg, now, actions);
        } else if !seg.has(FLAG_RST) {
            // Orphan segment: answer with RST so the sender gives up quickly.
            let (seq, ack) = if seg.has(FLAG_ACK) {
                (seg.ack, 0)
            } else {
                (0, seg.seq.wrapping_add(seg.payload.len() as u32).wrapping_add(1))
            };
            let flags = if seg.has(FLAG_ACK) { FLAG_RST } else { FLAG_RST | FLAG_ACK };
            self.emit_tcp(key, seq, ack, flags, &[], actions);
        }
    }

    fn handle_tcp_syn(
        &mut self,
        key: FlowKey,
        seg: TcpSegment<'_>,
        now: Millis,
        actions: &mut Vec<Action>,
    ) {
        if !self.accepts_dst(key.local.ip()) {
            tracing::debug!(local = %key.local, "SYN for foreign address without promiscuous mode");
            return;
        }
        if self.tcp.len() >= self.cfg.max_tcp_in_flight {
            tracing::debug!(
                remote = %key.remote,
                dst = %key.local,
                "TCP connection limit reached, resetting"
            );
            self.emit_tcp(
                key,
                0,
                seg.seq.wrapping_add(1),
                FLAG_RST | FLAG_ACK,
                &[],
                actions,
            );
            return;
        }

        let id = self.alloc_flow_id();
        let our_isn = isn_for_flow(id.0);
        let conn = TcpConn {
            id,
            accept_role: true,
            remote_isn: seg.seq,
            remote_next: seg.seq.wrapping_add(1),
            our_isn,
            our_next: our_isn.wrapping_add(1),
            syn_acked: false,
            established: true,
            send_buf: Vec::new(),
            send_buf_seq: our_isn.wrapping_add(1),
            last_progress_at: now,
            retransmits: 0,
            fin_sent: false,
            fin_seq: 0,
            fin_acked: false,
            remote_fin_received: false,
            connect_started_at: now,
            last_syn_at: now,
            pending_tx: Vec::new(),
            pending_fin: false,
        };

        tracing::debug!(from = %key.remote, to = %key.local, "terminating TCP flow");
        self.emit_tcp(
            key,
            conn.our_isn,
            conn.remote_next,
            FLAG_SYN | FLAG_ACK,
            &[],
            actions,
        );
        actions.push(Action::FlowOpened {
            flow: id,
            proto: Proto::Tcp,
            src: key.remote,
            dst: key.local,
        });
        self.tcp_by_id.insert(id, key);
        self.tcp.insert(key, conn);
    }

    fn handle_tcp_segment(
        &mut self,
        key: FlowKey,
        seg: TcpSegment<'_>,
        now: Millis,
        actions: &mut Vec<Action>,
    ) {
        struct SegOut {
            seq: u32,
            ack: u32,
            flags: u8,
            data: Vec<u8>,
        }
        enum Post {
            None,
            /// A SYN with a fresh ISN replaced a stale tuple; open anew.
            Reopen(OwnedSyn),
            /// A dial handshake just completed; flush buffered writes.
            Flush {
                flow: FlowId,
                data: Vec<u8>,
                fin: bool,
            },
        }

        // Phase 1: mutate the connection and collect decisions. All wire
        // output and map surgery happens afterwards, when the borrow is gone.
        let mut out: Vec<SegOut> = Vec::new();
        let mut remove: Option<(FlowId, Option<Action>)> = None;
        let mut post = Post::None;

        let conn = self.tcp.get_mut(&key).expect("checked by caller");

        if conn.accept_role && seg.has(FLAG_SYN) && !seg.has(FLAG_ACK) {
            // Retransmitted SYN for a terminated flow: keep the first
            // connection and repeat its SYN-ACK.
            if seg.seq == conn.remote_isn {
                out.push(SegOut {
                    seq: conn.our_isn,
                    ack: conn.remote_next,
                    flags: FLAG_SYN | FLAG_ACK,
                    data: Vec::new(),
                });
            } else {
                // A fresh ISN means the old flow is gone on the sender's
                // side; drop it and open a replacement.
                remove = Some((
                    conn.id,
                    Some(Action::FlowFailed {
                        flow: conn.id,
                        error: FlowError::Reset,
                    }),
                ));
                if let Some(owned) = rebuild_syn(seg) {
                    post = Post::Reopen(owned);
                }
            }
        } else if !conn.accept_role && !conn.established {
            // SYN-SENT.
            if seg.has(FLAG_RST) {
                remove = Some((
                    conn.id,
                    Some(Action::FlowFailed {
                        flow: conn.id,
                        error: FlowError::Refused,
                    }),
                ));
            } else if seg.has(FLAG_SYN)
                && seg.has(FLAG_ACK)
                && seg.ack == conn.our_isn.wrapping_add(1)
            {
                conn.remote_isn = seg.seq;
                conn.remote_next = seg.seq.wrapping_add(1);
                conn.syn_acked = true;
                conn.established = true;
                conn.last_progress_at = now;
                out.push(SegOut {
                    seq: conn.our_next,
                    ack: conn.remote_next,
                    flags: FLAG_ACK,
                    data: Vec::new(),
                });
                actions.push(Action::FlowConnected { flow: conn.id });
                post = Post::Flush {
                    flow: conn.id,
                    data: std::mem::take(&mut conn.pending_tx),
                    fin: std::mem::take(&mut conn.pending_fin),
                };
            }
            // Anything else during SYN-SENT is ignored; the SYN retransmit
            // timer covers losses.
        } else {
            if seg.has(FLAG_ACK) {
                conn.on_remote_ack(seg.ack, now);
            }

            if seg.has(FLAG_RST) {
                remove = Some((
                    conn.id,
                    Some(Action::FlowFailed {
                        flow: conn.id,
                        error: FlowError::Reset,
                    }),
                ));
            } else {
                // Payload, with duplicate suppression and out-of-order drops.
                let mut new_payload: &[u8] = &[];
                let mut re_ack = false;
                if !seg.payload.is_empty() {
                    let expected = conn.remote_next;
                    let lag = expected.wrapping_sub(seg.seq);
                    if lag == 0 {
                        new_payload = seg.payload;
                    } else if lag < u32::MAX / 2 && (lag as usize) < seg.payload.len() {
                        // Overlapping retransmit: take only the unseen tail.
                        new_payload = &seg.payload[lag as usize..];
                    } else {
                        // Pure duplicate, or an out-of-order gap: re-ACK the
                        // bytes we have and drop the rest.
                        re_ack = true;
                    }
                }

                if !new_payload.is_empty() {
                    conn.remote_next = conn.remote_next.wrapping_add(new_payload.len() as u32);
                    actions.push(Action::FlowData {
                        flow: conn.id,
                        data: new_payload.to_vec(),
                    });
                    out.push(SegOut {
                        seq: conn.our_next,
                        ack: conn.remote_next,
                        flags: FLAG_ACK,
                        data: Vec::new(),
                    });
                } else if re_ack {
                    out.push(SegOut {
                        seq: conn.our_next,
                        ack: conn.remote_next,
                        flags: FLAG_ACK,
                        data: Vec::new(),
                    });
                }

                // FIN processing happens after payload bytes.
                if seg.has(FLAG_FIN) {
                    let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
                    if fin_seq == conn.remote_next && !conn.remote_fin_received {
                        conn.remote_next = conn.remote_next.wrapping_add(1);
                        conn.remote_fin_received = true;
                        actions.push(Action::FlowEof { flow: conn.id });
                    }
                    // ACK the FIN (idempotent for retransmits).
                    out.push(SegOut {
                        seq: conn.our_next,
                        ack: conn.remote_next,
                        flags: FLAG_ACK,
                        data: Vec::new(),
                    });
                }

                if conn.should_remove() {
                    remove = Some((conn.id, Some(Action::FlowClosed { flow: conn.id })));
                }
            }
        }

        // Phase 2: wire output, map surgery, follow-up operations.
        for seg_out in out {
            self.emit_tcp(key, seg_out.seq, seg_out.ack, seg_out.flags, &seg_out.data, actions);
        }
        if let Some((id, event)) = remove {
            self.tcp.remove(&key);
            self.tcp_by_id.remove(&id);
            actions.extend(event);
        }
        match post {
            Post::None => {}
            Post::Reopen(owned) => {
                self.handle_tcp_syn(key, owned.as_segment(), now, actions);
            }
            Post::Flush { flow, data, fin } => {
                if !data.is_empty() {
                    let more = self.send(flow, &data, now);
                    actions.extend(more);
                }
                if fin {
                    let more = self.shutdown_write(flow, now);
                    actions.extend(more);
                }
            }
        }
    }

    /// Originates a TCP connection to `dst` from our local address. The
    /// handshake proceeds in the background; data passed to [`send`] before
    /// `FlowConnected` is buffered.
    ///
    /// [`send`]: NetStack::send
    pub fn tcp_connect(
        &mut self,
        dst: SocketAddr,
        now: Millis,
    ) -> Result<(FlowId, Vec<Action>), DialError> {
        if self.tcp.len() >= self.cfg.max_tcp_in_flight {
            return Err(DialError::TooManyFlows);
        }
        let local = self.alloc_ephemeral(dst, Proto::Tcp)?;
        let key = FlowKey { local, remote: dst };

        let id = self.alloc_flow_id();
        let our_isn = isn_for_flow(id.0);
        let conn = TcpConn {
            id,
            accept_role: false,
            remote_isn: 0,
            remote_next: 0,
            our_isn,
            our_next: our_isn.wrapping_add(1),
            syn_acked: false,
            established: false,
            send_buf: Vec::new(),
            send_buf_seq: our_isn.wrapping_add(1),
            last_progress_at: now,
            retransmits: 0,
            fin_sent: false,
            fin_seq: 0,
            fin_acked: false,
            remote_fin_received: false,
            connect_started_at: now,
            last_syn_at: now,
            pending_tx: Vec::new(),
            pending_fin: false,
        };

        let mut actions = Vec::new();
        tracing::debug!(from = %local, to = %dst, "dialing TCP flow");
        self.emit_tcp(key, our_isn, 0, FLAG_SYN, &[], &mut actions);
        self.tcp_by_id.insert(id, key);
        self.tcp.insert(key, conn);
        Ok((id, actions))
    }

    /// Opens a UDP flow to `dst` from our local address. No wire traffic is
    /// produced until the first [`send`].
    ///
    /// [`send`]: NetStack::send
    pub fn udp_open(
        &mut self,
        dst: SocketAddr,
        now: Millis,
    ) -> Result<(FlowId, Vec<Action>), DialError> {
        if self.udp.len() >= self.cfg.max_udp_flows {
            return Err(DialError::TooManyFlows);
        }
        let local = self.alloc_ephemeral(dst, Proto::Udp)?;
        let key = FlowKey { local, remote: dst };
        let id = self.alloc_flow_id();
        tracing::debug!(from = %local, to = %dst, "opening UDP flow");
        self.udp.insert(
            key,
            UdpFlow {
                id,
                last_activity: now,
            },
        );
        self.udp_by_id.insert(id, key);
        Ok((id, Vec::new()))
    }

    /// Writes payload bytes onto a flow: TCP segments (MSS-chunked) or one
    /// UDP datagram.
    pub fn send(&mut self, flow: FlowId, data: &[u8], now: Millis) -> Vec<Action> {
        let mut actions = Vec::new();
        if data.is_empty() {
            return actions;
        }

        if let Some(&key) = self.tcp_by_id.get(&flow) {
            let mss = self.mss_for(key.local.ip());
            let conn = self.tcp.get_mut(&key).expect("id map in sync");
            if !conn.established {
                if conn.pending_tx.len() + data.len() > self.cfg.max_pending_tx_bytes {
                    tracing::debug!(?flow, "pre-connect buffer overflow, aborting dial");
                    self.tcp.remove(&key);
                    self.tcp_by_id.remove(&flow);
                    actions.push(Action::FlowFailed {
                        flow,
                        error: FlowError::TimedOut,
                    });
                    return actions;
                }
                conn.pending_tx.extend_from_slice(data);
                return actions;
            }
            if conn.fin_sent {
                tracing::debug!(?flow, "write after shutdown dropped");
                return actions;
            }

            if conn.send_buf.is_empty() {
                conn.send_buf_seq = conn.our_next;
                conn.last_progress_at = now;
            }
            conn.send_buf.extend_from_slice(data);

            struct SegOut {
                seq: u32,
                ack: u32,
                data: Vec<u8>,
            }
            let mut out = Vec::new();
            for chunk in data.chunks(mss) {
                out.push(SegOut {
                    seq: conn.our_next,
                    ack: conn.remote_next,
                    data: chunk.to_vec(),
                });
                conn.our_next = conn.our_next.wrapping_add(chunk.len() as u32);
            }
            for seg in out {
                self.emit_tcp(key, seg.seq, seg.ack, FLAG_ACK | FLAG_PSH, &seg.data, &mut actions);
            }
            return actions;
        }

        if let Some(&key) = self.udp_by_id.get(&flow) {
            if let Some(f) = self.udp.get_mut(&key) {
                f.last_activity = now;
            }
            self.emit_udp(key, data, &mut actions);
            return actions;
        }

        tracing::debug!(?flow, "send on unknown flow");
        actions
    }

    /// Half-closes the write side of a TCP flow (FIN). A no-op for UDP.
    pub fn shutdown_write(&mut self, flow: FlowId, now: Millis) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(&key) = self.tcp_by_id.get(&flow) else {
            return actions;
        };
        let Some(conn) = self.tcp.get_mut(&key) else {
            return actions;
        };
        if conn.fin_sent {
            return actions;
        }
        if !conn.established {
            conn.pending_fin = true;
            return actions;
        }
        conn.fin_sent = true;
        conn.fin_seq = conn.our_next;
        conn.our_next = conn.our_next.wrapping_add(1);
        conn.last_progress_at = now;
        let (seq, ack) = (conn.fin_seq, conn.remote_next);
        let done = conn.should_remove();
        self.emit_tcp(key, seq, ack, FLAG_FIN | FLAG_ACK, &[], &mut actions);
        if done {
            self.tcp.remove(&key);
            self.tcp_by_id.remove(&flow);
            actions.push(Action::FlowClosed { flow });
        }
        actions
    }

    /// Tears a flow down immediately: RST for TCP, silent drop for UDP.
    /// No further events are produced for the flow.
    pub fn abort(&mut self, flow: FlowId, _now: Millis) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(key) = self.tcp_by_id.remove(&flow) {
            if let Some(conn) = self.tcp.remove(&key) {
                if conn.established {
                    self.emit_tcp(
                        key,
                        conn.our_next,
                        conn.remote_next,
                        FLAG_RST | FLAG_ACK,
                        &[],
                        &mut actions,
                    );
                }
            }
        } else if let Some(key) = self.udp_by_id.remove(&flow) {
            self.udp.remove(&key);
        }
        actions
    }

    /// Drives retransmission, connect timeouts and UDP idle expiry. Call
    /// roughly every 100–500 ms.
    pub fn on_tick(&mut self, now: Millis) -> Vec<Action> {
        let mut actions = Vec::new();

        struct SegOut {
            key: FlowKey,
            seq: u32,
            ack: u32,
            flags: u8,
            data: Vec<u8>,
        }
        let mut out: Vec<SegOut> = Vec::new();
        let mut dead: Vec<(FlowKey, FlowId, FlowError)> = Vec::new();

        for (key, conn) in self.tcp.iter_mut() {
            if !conn.established && !conn.accept_role {
                // SYN-SENT: retry or give up.
                if now.saturating_sub(conn.connect_started_at) >= self.cfg.tcp_connect_timeout_ms {
                    dead.push((*key, conn.id, FlowError::TimedOut));
                } else if now.saturating_sub(conn.last_syn_at) >= self.cfg.tcp_syn_retry_ms {
                    conn.last_syn_at = now;
                    out.push(SegOut {
                        key: *key,
                        seq: conn.our_isn,
                        ack: 0,
                        flags: FLAG_SYN,
                        data: Vec::new(),
                    });
                }
                continue;
            }

            if conn.awaiting_ack()
                && now.saturating_sub(conn.last_progress_at) >= self.cfg.tcp_rto_ms
            {
                if conn.retransmits >= self.cfg.tcp_max_retransmits {
                    dead.push((*key, conn.id, FlowError::TimedOut));
                    continue;
                }
                conn.retransmits += 1;
                conn.last_progress_at = now;
                if !conn.send_buf.is_empty() {
                    let mss = match key.local.ip() {
                        IpAddr::V4(_) => self.cfg.mtu.saturating_sub(40).max(536),
                        IpAddr::V6(_) => self.cfg.mtu.saturating_sub(60).max(536),
                    };
                    let len = conn.send_buf.len().min(mss);
                    out.push(SegOut {
                        key: *key,
                        seq: conn.send_buf_seq,
                        ack: conn.remote_next,
                        flags: FLAG_ACK | FLAG_PSH,
                        data: conn.send_buf[..len].to_vec(),
                    });
                } else {
                    // Only the FIN is outstanding.
                    out.push(SegOut {
                        key: *key,
                        seq: conn.fin_seq,
                        ack: conn.remote_next,
                        flags: FLAG_FIN | FLAG_ACK,
                        data: Vec::new(),
                    });
                }
            }
        }

        for seg in out {
            self.emit_tcp(seg.key, seg.seq, seg.ack, seg.flags, &seg.data, &mut actions);
        }
        for (key, id, error) in dead {
            self.tcp.remove(&key);
            self.tcp_by_id.remove(&id);
            actions.push(Action::FlowFailed { flow: id, error });
        }

        if let Some(idle) = self.cfg.udp_idle_timeout_ms {
            let expired: Vec<(FlowKey, FlowId)> = self
                .udp
                .iter()
                .filter(|(_, f)| now.saturating_sub(f.last_activity) >= idle)
                .map(|(k, f)| (*k, f.id))
                .collect();
            for (key, id) in expired {
                self.udp.remove(&key);
                self.udp_by_id.remove(&id);
                actions.push(Action::FlowClosed { flow: id });
            }
        }

        actions
    }

    // ---- UDP -------------------------------------------------------------

    fn handle_udp(
        &mut self,
        src: IpAddr,
        dst: IpAddr,
        datagram: &[u8],
        now: Millis,
        actions: &mut Vec<Action>,
    ) {
        if !udp::checksum_valid(src, dst, datagram) {
            tracing::debug!(%src, %dst, "dropping UDP datagram with bad checksum");
            return;
        }
        let dgram = match UdpDatagram::parse(datagram) {
            Ok(d) => d,
            Err(err) => {
                tracing::debug!(%src, %dst, "dropping UDP datagram: {err}");
                return;
            }
        };

        let key = FlowKey {
            local: SocketAddr::new(dst, dgram.dst_port),
            remote: SocketAddr::new(src, dgram.src_port),
        };

        if let Some(flow) = self.udp.get_mut(&key) {
            flow.last_activity = now;
            actions.push(Action::FlowData {
                flow: flow.id,
                data: dgram.payload.to_vec(),
            });
            return;
        }

        if !self.accepts_dst(key.local.ip()) {
            tracing::debug!(local = %key.local, "datagram for foreign address without promiscuous mode");
            return;
        }
        if self.udp.len() >= self.cfg.max_udp_flows {
            tracing::debug!(remote = %key.remote, "UDP flow limit reached, dropping datagram");
            return;
        }

        // Unlike TCP there is no handshake to gate on: the flow exists as of
        // the first datagram, and that datagram is delivered on it.
        let id = self.alloc_flow_id();
        tracing::debug!(from = %key.remote, to = %key.local, "terminating UDP flow");
        self.udp.insert(
            key,
            UdpFlow {
                id,
                last_activity: now,
            },
        );
        self.udp_by_id.insert(id, key);
        actions.push(Action::FlowOpened {
            flow: id,
            proto: Proto::Udp,
            src: key.remote,
            dst: key.local,
        });
        actions.push(Action::FlowData {
            flow: id,
            data: dgram.payload.to_vec(),
        });
    }

    // ---- ICMP ------------------------------------------------------------

    fn handle_icmpv4(
        &mut self,
        src: IpAddr,
        dst: IpAddr,
        message: &[u8],
        actions: &mut Vec<Action>,
    ) {
        if !icmp::icmpv4_checksum_valid(message) {
            tracing::debug!(%src, %dst, "dropping ICMPv4 message with bad checksum");
            return;
        }
        let msg = match IcmpMessage::parse(message) {
            Ok(m) => m,
            Err(err) => {
                tracing::debug!(%src, %dst, "dropping ICMPv4 message: {err}");
                return;
            }
        };

        // Echo requests are answered locally from the addressed destination,
        // so `ping` works inside the sandbox. Everything else (and notably
        // any would-be error response) is logged and dropped.
        if msg.msg_type == ICMPV4_ECHO_REQUEST && self.accepts_dst(dst) {
            let (IpAddr::V4(src4), IpAddr::V4(dst4)) = (src, dst) else {
                return;
            };
            let reply = icmp::build_echo_reply(msg.body);
            let ident = self.next_ident();
            let frame = Ipv4Packet::serialize(dst4, src4, IPPROTO_ICMP, ident, TTL, &reply);
            self.emit_frame(IpAddr::V4(dst4), frame, actions);
            return;
        }

        tracing::debug!(%src, %dst, msg_type = msg.msg_type, code = msg.code, "dropping ICMPv4 message");
    }

    // ---- helpers ---------------------------------------------------------

    fn accepts_dst(&self, dst: IpAddr) -> bool {
        self.cfg.promiscuous || Some(dst) == self.cfg.local_addr
    }

    fn alloc_flow_id(&mut self) -> FlowId {
        let id = FlowId(self.next_flow);
        self.next_flow += 1;
        id
    }

    fn next_ident(&mut self) -> u16 {
        let ident = self.ipv4_ident;
        self.ipv4_ident = self.ipv4_ident.wrapping_add(1);
        ident
    }

    fn mss_for(&self, local: IpAddr) -> usize {
        match local {
            IpAddr::V4(_) => self.cfg.mtu.saturating_sub(40).max(536),
            IpAddr::V6(_) => self.cfg.mtu.saturating_sub(60).max(536),
        }
    }

    fn alloc_ephemeral(&mut self, dst: SocketAddr, proto: Proto) -> Result<SocketAddr, DialError> {
        let local_ip = match (self.cfg.local_addr, dst.ip()) {
            (Some(ip @ IpAddr::V4(_)), IpAddr::V4(_)) => ip,
            (Some(ip @ IpAddr::V6(_)), IpAddr::V6(_)) => ip,
            (_, IpAddr::V4(_)) => return Err(DialError::NoLocalAddress { family: "IPv4" }),
            (_, IpAddr::V6(_)) => return Err(DialError::NoLocalAddress { family: "IPv6" }),
        };

        for _ in 0..=(u16::MAX - EPHEMERAL_FIRST) {
            let port = self.next_ephemeral;
            self.next_ephemeral = if self.next_ephemeral == u16::MAX {
                EPHEMERAL_FIRST
            } else {
                self.next_ephemeral + 1
            };
            let local = SocketAddr::new(local_ip, port);
            let key = FlowKey { local, remote: dst };
            let in_use = match proto {
                Proto::Tcp => self.tcp.contains_key(&key),
                Proto::Udp => self.udp.contains_key(&key),
            };
            if !in_use {
                return Ok(local);
            }
        }
        Err(DialError::NoFreePort)
    }

    fn emit_tcp(
        &mut self,
        key: FlowKey,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
        actions: &mut Vec<Action>,
    ) {
        let segment = tcp::build_segment(
            key.local.ip(),
            key.remote.ip(),
            key.local.port(),
            key.remote.port(),
            seq,
            ack,
            flags,
            TCP_WINDOW,
            payload,
        );
        let frame = self.wrap_ip(key.local.ip(), key.remote.ip(), IPPROTO_TCP, segment);
        self.emit_frame(key.local.ip(), frame, actions);
    }

    fn emit_udp(&mut self, key: FlowKey, payload: &[u8], actions: &mut Vec<Action>) {
        let datagram = udp::build_datagram(
            key.local.ip(),
            key.remote.ip(),
            key.local.port(),
            key.remote.port(),
            payload,
        );
        let frame = self.wrap_ip(key.local.ip(), key.remote.ip(), IPPROTO_UDP, datagram);
        self.emit_frame(key.local.ip(), frame, actions);
    }

    fn wrap_ip(&mut self, src: IpAddr, dst: IpAddr, protocol: u8, payload: Vec<u8>) -> Vec<u8> {
        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                let ident = self.next_ident();
                Ipv4Packet::serialize(s, d, protocol, ident, TTL, &payload)
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => Ipv6Packet::serialize(s, d, protocol, TTL, &payload),
            _ => unreachable!("mixed address families in one flow"),
        }
    }

    fn emit_frame(&self, src: IpAddr, frame: Vec<u8>, actions: &mut Vec<Action>) {
        if !self.cfg.spoofing && Some(src) != self.cfg.local_addr {
            tracing::debug!(%src, "dropping frame from foreign source without spoofing mode");
            return;
        }
        actions.push(Action::EmitPacket(frame));
    }
}

/// A deterministic LCG keeps ISNs "random enough" without an RNG dependency.
fn isn_for_flow(id: u64) -> u32 {
    let mut x = id as u32 ^ 0xA5A5_5A5A;
    x = x.wrapping_mul(1103515245).wrapping_add(12345);
    x
}

/// Owned copy of a SYN segment so a replacement connection can be opened
/// after the stale one is dropped.
struct OwnedSyn {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    window: u16,
}

impl OwnedSyn {
    fn as_segment(&self) -> TcpSegment<'static> {
        TcpSegment {
            src_port: self.src_port,
            dst_port: self.dst_port,
            seq: self.seq,
            ack: 0,
            flags: FLAG_SYN,
            window: self.window,
            payload: &[],
        }
    }
}

fn rebuild_syn(seg: TcpSegment<'_>) -> Option<OwnedSyn> {
    if !seg.has(FLAG_SYN) || seg.has(FLAG_ACK) {
        return None;
    }
    Some(OwnedSyn {
        src_port: seg.src_port,
        dst_port: seg.dst_port,
        seq: seg.seq,
        window: seg.window,
    })
}
