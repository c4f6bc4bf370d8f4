mod args;
mod hub;
mod nat;
mod peer;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use wirecage_netdev::{configure_link, parse_cidr, LinkConfig, TunDevice};
use wirecage_tunnel::TIMER_TICK;

use args::ServerArgs;
use hub::{Hub, HubAction};

const MAX_PACKET: usize = 65536;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(&args.log_level)
                    // boringtun logs routine timer races at warn
                    .add_directive("boringtun::noise::timers=error".parse().unwrap())
            }),
        )
        .init();

    let private_key = tokio::fs::read_to_string(&args.private_key_file)
        .await
        .with_context(|| format!("failed to read {}", args.private_key_file))?;
    let mut hub = Hub::new(private_key.trim(), &args.peers)?;
    tracing::info!(peers = hub.peer_count(), "responder configured");

    let socket = UdpSocket::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    tracing::info!("listening on {}", socket.local_addr()?);

    let tun = TunDevice::create(&args.tun)
        .with_context(|| format!("failed to create tun device {:?}", args.tun))?;
    let address = parse_cidr(&args.subnet)
        .with_context(|| format!("error parsing subnet {:?}", args.subnet))?;
    configure_link(&LinkConfig {
        device: args.tun.clone(),
        address,
        ipv4_default_route: false,
        ipv6_default_route: false,
        loopback_up: false,
    })
    .await
    .context("failed to configure tun device")?;
    let (mut tun_reader, mut tun_writer) = tun.split().context("failed to split tun device")?;

    // Forwarding + masquerade so decapsulated traffic reaches the world.
    let _nat = if args.no_nat {
        None
    } else {
        Some(nat::NatGuard::set_up(&args)?)
    };

    let mut tick = tokio::time::interval(TIMER_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut udp_buf = vec![0u8; MAX_PACKET];
    let mut tun_buf = vec![0u8; MAX_PACKET];

    tracing::info!("wirecagesrv running");
    loop {
        let actions = tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                return Ok(());
            }
            received = socket.recv_from(&mut udp_buf) => {
                let (len, from) = received.context("udp receive failed")?;
                hub.handle_datagram(&udp_buf[..len], from)
            }
            read = tun_reader.recv(&mut tun_buf) => {
                let len = read.context("tun read failed")?;
                hub.handle_tun_frame(&tun_buf[..len])
            }
            _ = tick.tick() => hub.tick(),
        };

        for action in actions {
            match action {
                HubAction::SendDatagram { to, data } => {
                    if let Err(err) = socket.send_to(&data, to).await {
                        tracing::warn!(%to, "failed to send datagram: {err}");
                    }
                }
                HubAction::WriteTun(frame) => {
                    if let Err(err) = tun_writer.send(&frame).await {
                        tracing::warn!("failed to write tun frame: {err}");
                    }
                }
            }
        }
    }
}
