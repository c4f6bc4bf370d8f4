//! Stage 2: the pinned-thread supervisor that owns the network namespace,
//! the TUN device, both virtual stacks, the WireGuard peer, and the stage-3
//! child.
//!
//! Everything runs on a single-threaded tokio runtime built on this OS
//! thread. That is the load-bearing property of the whole program: the
//! kernel scopes `unshare(CLONE_NEWNET)` to the calling thread, so the
//! stage-3 fork must happen on the same thread that unshared. A runtime
//! that could migrate the task between threads would sometimes spawn the
//! child into the host namespace.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;

use anyhow::{Context, Result};
use nix::sched::{unshare, CloneFlags};
use tokio::process::Child;
use wirecage_netdev::{configure_link, parse_cidr, LinkConfig, TunDevice, TunWriter};
use wirecage_netstack::{Action, Millis, NetStack, StackConfig};
use wirecage_tunnel::{Tunnel, TunnelConfig, TIMER_TICK};

use crate::args::Args;
use crate::mux::{ProxyMux, Side};
use crate::reexec::{self, IdMap};
use crate::{exit_code_of, overlay};

/// MTU of the WireGuard-side stack: 1500 minus the worst-case tunnel
/// overhead, the conventional WireGuard device MTU.
const WG_MTU: usize = 1420;

pub fn run(args: Args) -> Result<i32> {
    tracing::debug!("at second stage");
    args.validate()?;

    let key_file = args.wg_private_key_file.clone().expect("validated");
    let private_key = std::fs::read_to_string(&key_file)
        .with_context(|| format!("could not read {key_file}"))?;
    let endpoint = resolve_endpoint(args.wg_endpoint.as_deref().expect("validated"))?;
    let wg_address = args.wg_address.expect("validated");

    // The endpoint socket must reach the real network, so bind it in the
    // host namespace, before the unshare below. Sockets keep the namespace
    // they were created in.
    let bind_addr: SocketAddr = if endpoint.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let endpoint_socket =
        std::net::UdpSocket::bind(bind_addr).context("failed to bind wireguard socket")?;

    // Single-threaded executor on this thread: namespace syscalls, the TUN
    // descriptor, and the stage-3 fork can never migrate off it.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build stage-2 runtime")?;
    runtime.block_on(datapath(args, private_key, endpoint, wg_address, endpoint_socket))
}

fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    endpoint
        .to_socket_addrs()
        .with_context(|| format!("could not resolve --wg-endpoint {endpoint:?}"))?
        .next()
        .with_context(|| format!("--wg-endpoint {endpoint:?} resolved to no addresses"))
}

async fn datapath(
    args: Args,
    private_key: String,
    endpoint: SocketAddr,
    wg_address: IpAddr,
    endpoint_socket: std::net::UdpSocket,
) -> Result<i32> {
    unshare(CloneFlags::CLONE_NEWNET).context("error creating network namespace")?;

    let tun = TunDevice::create(&args.tun)
        .with_context(|| format!("error creating tun device {:?}", args.tun))?;

    let address = parse_cidr(&args.subnet)
        .with_context(|| format!("error parsing subnet {:?}", args.subnet))?;
    let mtu = configure_link(&LinkConfig {
        device: args.tun.clone(),
        address,
        ipv4_default_route: true,
        ipv6_default_route: true,
        loopback_up: true,
    })
    .await
    .context("error configuring tun device")?;
    tracing::debug!(mtu, "tun device configured");

    // Shadow resolv.conf so the child's DNS goes to the gateway, which the
    // tunnel captures like any other traffic.
    let _overlay = if Path::new("/etc").is_dir() && !args.no_overlay {
        tracing::debug!("overlaying /etc ...");
        let resolv = format!("nameserver {}\n", args.gateway).into_bytes();
        Some(
            overlay::shadow(Path::new("/etc"), &[("resolv.conf", resolv)])
                .context("error setting up overlay")?,
        )
    } else {
        None
    };

    // The TUN-side stack terminates whatever the child dials, so it must
    // accept foreign destinations and answer from them.
    let mut inner = NetStack::new(StackConfig {
        mtu: mtu as usize,
        promiscuous: true,
        spoofing: true,
        ..StackConfig::default()
    });
    // The WireGuard-side stack originates the mirror flows from our
    // allowed-ips self-address.
    let mut outer = NetStack::new(StackConfig {
        local_addr: Some(wg_address),
        mtu: WG_MTU,
        ..StackConfig::default()
    });
    let mut mux = ProxyMux::new();

    let peer = Tunnel::new(
        TunnelConfig {
            private_key,
            public_key: args.wg_public_key.clone().expect("validated"),
            preshared_key: None,
            endpoint,
            persistent_keepalive: None,
        },
        endpoint_socket,
    )
    .context("error creating wireguard peer")?;

    let (mut tun_reader, mut tun_writer) = tun.split().context("error splitting tun device")?;

    // Launch stage 3 from this thread so it inherits the new namespaces.
    let mut child = spawn_stage3(&args)?;

    let start = tokio::time::Instant::now();
    let mut tick = tokio::time::interval(TIMER_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut tun_buf = vec![0u8; mtu as usize + 4];
    let mut wg_frames: Vec<Vec<u8>> = Vec::new();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let now = elapsed_ms(start);
        tokio::select! {
            biased;
            status = child.wait() => {
                let status = status.context("failed to wait for stage 3")?;
                tracing::debug!(?status, "stage 3 exited");
                return Ok(exit_code_of(status));
            }
            _ = &mut ctrl_c => {
                tracing::debug!("interrupted, unwinding");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Ok(130);
            }
            read = tun_reader.recv(&mut tun_buf) => {
                let len = read.context("error reading from tun device")?;
                let actions = inner.handle_inbound(&tun_buf[..len], now);
                drain(Side::Inner, actions, &mut mux, &mut inner, &mut outer, &mut tun_writer, &peer, now).await;
            }
            received = peer.recv(&mut wg_frames) => {
                received.context("error receiving from wireguard endpoint")?;
                for frame in wg_frames.drain(..) {
                    let actions = outer.handle_inbound(&frame, now);
                    drain(Side::Outer, actions, &mut mux, &mut inner, &mut outer, &mut tun_writer, &peer, now).await;
                }
            }
            _ = tick.tick() => {
                if let Err(err) = peer.tick().await {
                    tracing::debug!("wireguard timer send failed: {err}");
                }
                let actions = inner.on_tick(now);
                drain(Side::Inner, actions, &mut mux, &mut inner, &mut outer, &mut tun_writer, &peer, now).await;
                let actions = outer.on_tick(now);
                drain(Side::Outer, actions, &mut mux, &mut inner, &mut outer, &mut tun_writer, &peer, now).await;
            }
        }
    }
}

fn spawn_stage3(args: &Args) -> Result<Child> {
    let uid = args.uid.unwrap_or(0);
    let gid = args.gid.unwrap_or(0);
    tracing::debug!(uid, gid, "launching third stage");

    let mut argv: Vec<String> = vec![
        "--uid".into(),
        uid.to_string(),
        "--gid".into(),
        gid.to_string(),
        "--".into(),
    ];
    argv.extend(args.get_command());

    let mut cmd = reexec::user_ns_command(
        "stage3",
        &argv,
        IdMap { inside: uid, outside: 0 },
        IdMap { inside: gid, outside: 0 },
    );
    cmd.env("PS1", "wirecage # ").env("wirecage", "1");

    tokio::process::Command::from(cmd)
        .spawn()
        .context("error starting third stage subprocess")
}

/// Drains one batch of stack actions: frames go to their link endpoint,
/// flow events go through the mux, and whatever the mux produces is
/// processed in turn until the system is quiescent.
#[allow(clippy::too_many_arguments)]
async fn drain(
    seed_side: Side,
    seed: Vec<Action>,
    mux: &mut ProxyMux,
    inner: &mut NetStack,
    outer: &mut NetStack,
    tun_writer: &mut TunWriter,
    peer: &Tunnel,
    now: Millis,
) {
    let mut queue: VecDeque<(Side, Action)> =
        seed.into_iter().map(|action| (seed_side, action)).collect();
    while let Some((side, action)) = queue.pop_front() {
        match action {
            Action::EmitPacket(frame) => match side {
                Side::Inner => {
                    if let Err(err) = tun_writer.send(&frame).await {
                        tracing::debug!("tun write failed: {err}");
                    }
                }
                Side::Outer => {
                    if let Err(err) = peer.send_ip(&frame).await {
                        tracing::debug!("wireguard send failed: {err}");
                    }
                }
            },
            event => queue.extend(mux.handle(side, event, inner, outer, now)),
        }
    }
}

fn elapsed_ms(start: tokio::time::Instant) -> Millis {
    start.elapsed().as_millis().min(u64::MAX as u128) as u64
}
