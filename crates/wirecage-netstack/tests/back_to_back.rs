//! Drives two stacks against each other frame-for-frame: a dialing stack
//! (the WireGuard side of a run) talking to a terminating stack standing in
//! for the remote network. This exercises both TCP roles end-to-end without
//! any real sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use wirecage_netstack::{Action, FlowId, NetStack, Proto, StackConfig};

const WG_ADDR: Ipv4Addr = Ipv4Addr::new(10, 200, 100, 2);
const SERVER: Ipv4Addr = Ipv4Addr::new(10, 200, 100, 1);

fn dialer() -> NetStack {
    NetStack::new(StackConfig {
        local_addr: Some(IpAddr::V4(WG_ADDR)),
        ..StackConfig::default()
    })
}

fn responder() -> NetStack {
    NetStack::new(StackConfig {
        promiscuous: true,
        spoofing: true,
        ..StackConfig::default()
    })
}

/// Collected flow-level observations on one side.
#[derive(Default)]
struct Observed {
    opened: Vec<(FlowId, Proto, SocketAddr, SocketAddr)>,
    connected: Vec<FlowId>,
    data: Vec<(FlowId, Vec<u8>)>,
    eof: Vec<FlowId>,
    closed: Vec<FlowId>,
    failed: Vec<FlowId>,
}

impl Observed {
    fn bytes_for(&self, flow: FlowId) -> Vec<u8> {
        let mut out = Vec::new();
        for (id, chunk) in &self.data {
            if *id == flow {
                out.extend_from_slice(chunk);
            }
        }
        out
    }
}

/// Shuttles emitted frames between the two stacks until neither produces
/// any, recording flow events on each side.
fn settle(a: &mut NetStack, b: &mut NetStack, seed: Vec<Action>, now: u64) -> (Observed, Observed) {
    let mut obs_a = Observed::default();
    let mut obs_b = Observed::default();
    let mut to_b: Vec<Vec<u8>> = Vec::new();
    record(&mut obs_a, seed, &mut to_b);

    let mut to_a: Vec<Vec<u8>> = Vec::new();
    loop {
        if to_a.is_empty() && to_b.is_empty() {
            break;
        }
        for frame in std::mem::take(&mut to_b) {
            let actions = b.handle_inbound(&frame, now);
            record(&mut obs_b, actions, &mut to_a);
        }
        for frame in std::mem::take(&mut to_a) {
            let actions = a.handle_inbound(&frame, now);
            record(&mut obs_a, actions, &mut to_b);
        }
    }
    (obs_a, obs_b)
}

fn record(obs: &mut Observed, actions: Vec<Action>, wire: &mut Vec<Vec<u8>>) {
    for action in actions {
        match action {
            Action::EmitPacket(frame) => wire.push(frame),
            Action::FlowOpened { flow, proto, src, dst } => obs.opened.push((flow, proto, src, dst)),
            Action::FlowConnected { flow } => obs.connected.push(flow),
            Action::FlowData { flow, data } => obs.data.push((flow, data)),
            Action::FlowEof { flow } => obs.eof.push(flow),
            Action::FlowClosed { flow } => obs.closed.push(flow),
            Action::FlowFailed { flow, .. } => obs.failed.push(flow),
        }
    }
}

#[test]
fn tcp_round_trip_preserves_bytes_and_order() {
    let mut dial = dialer();
    let mut accept = responder();
    let dst = SocketAddr::new(IpAddr::V4(SERVER), 8080);

    let (outer, actions) = dial.tcp_connect(dst, 0).unwrap();
    let (obs_d, obs_a) = settle(&mut dial, &mut accept, actions, 0);
    assert_eq!(obs_d.connected, vec![outer]);
    assert_eq!(obs_a.opened.len(), 1);
    let (inner, proto, src, opened_dst) = obs_a.opened[0];
    assert_eq!(proto, Proto::Tcp);
    assert_eq!(src.ip(), IpAddr::V4(WG_ADDR));
    assert_eq!(opened_dst, dst);

    // Dialer -> responder, several writes, order must hold.
    let mut seed = dial.send(outer, b"hello ", 1);
    seed.extend(dial.send(outer, b"world", 1));
    let (_, obs_a) = settle(&mut dial, &mut accept, seed, 1);
    assert_eq!(obs_a.bytes_for(inner), b"hello world");

    // Responder -> dialer, a large write that spans several segments.
    let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let seed = accept.send(inner, &big, 2);
    let (obs_a2, obs_d) = settle(&mut accept, &mut dial, seed, 2);
    assert!(obs_a2.failed.is_empty());
    assert_eq!(obs_d.bytes_for(outer), big, "bytes must arrive intact and in order");
}

#[test]
fn tcp_half_close_is_honored_in_both_directions() {
    let mut dial = dialer();
    let mut accept = responder();
    let dst = SocketAddr::new(IpAddr::V4(SERVER), 8080);

    let (outer, actions) = dial.tcp_connect(dst, 0).unwrap();
    let (_, obs_a) = settle(&mut dial, &mut accept, actions, 0);
    let inner = obs_a.opened[0].0;

    // Dialer half-closes; the responder sees exactly one EOF but can still
    // send afterwards.
    let seed = dial.shutdown_write(outer, 1);
    let (_, obs_a) = settle(&mut dial, &mut accept, seed, 1);
    assert_eq!(obs_a.eof, vec![inner]);

    let seed = accept.send(inner, b"late reply", 2);
    let (_, obs_d) = settle(&mut accept, &mut dial, seed, 2);
    assert_eq!(obs_d.bytes_for(outer), b"late reply");

    // Responder half-closes too; both sides finish cleanly.
    let seed = accept.shutdown_write(inner, 3);
    let (obs_a, obs_d) = settle(&mut accept, &mut dial, seed, 3);
    assert_eq!(obs_d.eof, vec![outer]);
    assert!(obs_a.closed.contains(&inner) || obs_d.closed.contains(&outer));
    assert_eq!(dial.tcp_flow_count(), 0);
    assert_eq!(accept.tcp_flow_count(), 0);
}

#[test]
fn udp_round_trip_multiple_datagrams() {
    let mut dial = dialer();
    let mut accept = responder();
    let dst = SocketAddr::new(IpAddr::V4(SERVER), 53);

    let (outer, _) = dial.udp_open(dst, 0).unwrap();

    // Several datagrams out; every one must be routed to the same flow.
    let mut seed = Vec::new();
    for payload in [b"q1".as_slice(), b"q2", b"q3"] {
        seed.extend(dial.send(outer, payload, 0));
    }
    let (_, obs_a) = settle(&mut dial, &mut accept, seed, 0);
    assert_eq!(obs_a.opened.len(), 1, "one flow for one 5-tuple");
    let inner = obs_a.opened[0].0;
    let received: Vec<Vec<u8>> = obs_a
        .data
        .iter()
        .filter(|(id, _)| *id == inner)
        .map(|(_, d)| d.clone())
        .collect();
    assert_eq!(received, vec![b"q1".to_vec(), b"q2".to_vec(), b"q3".to_vec()]);

    // And the reply comes back on the dialed flow.
    let seed = accept.send(inner, b"answer", 1);
    let (_, obs_d) = settle(&mut accept, &mut dial, seed, 1);
    assert_eq!(obs_d.bytes_for(outer), b"answer");
}
