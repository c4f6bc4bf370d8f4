use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "wirecagesrv",
    about = "Userspace WireGuard responder that routes cage client traffic to the internet"
)]
pub struct ServerArgs {
    #[arg(long, help = "path to the server private key file")]
    pub private_key_file: String,

    #[arg(long, default_value = "0.0.0.0:51820", help = "listen address and port")]
    pub listen_addr: String,

    #[arg(
        long,
        default_value = "10.200.100.1/24",
        help = "server address and prefix on the TUN interface"
    )]
    pub subnet: String,

    #[arg(long, default_value = "wirecage-srv", help = "TUN interface name")]
    pub tun: String,

    #[arg(
        long,
        help = "outbound network interface for NAT (auto-detected if not specified)"
    )]
    pub outbound_interface: Option<String>,

    #[arg(long, help = "skip IP forwarding and iptables NAT setup")]
    pub no_nat: bool,

    #[arg(
        long,
        default_value = "info",
        value_parser = ["debug", "info", "warn", "error"],
        help = "log level"
    )]
    pub log_level: String,

    #[arg(
        long = "peer",
        value_parser = parse_peer,
        required = true,
        help = "peer as pubkey,allowed-ip[/prefix] (repeatable)"
    )]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: String,
    pub allowed_ip: String,
}

fn parse_peer(s: &str) -> Result<PeerConfig, String> {
    let (public_key, allowed_ip) = s
        .split_once(',')
        .ok_or_else(|| "peer format must be: pubkey,allowed-ip[/prefix]".to_string())?;
    if public_key.is_empty() || allowed_ip.is_empty() {
        return Err("peer format must be: pubkey,allowed-ip[/prefix]".to_string());
    }
    Ok(PeerConfig {
        public_key: public_key.to_string(),
        allowed_ip: allowed_ip.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn peer_flag_parses_pubkey_and_allowed_ip() {
        let args = ServerArgs::parse_from([
            "wirecagesrv",
            "--private-key-file",
            "/etc/wirecage/server.key",
            "--peer",
            "AAAA,10.200.100.2",
            "--peer",
            "BBBB,10.200.100.3/32",
        ]);
        assert_eq!(
            args.peers,
            vec![
                PeerConfig {
                    public_key: "AAAA".into(),
                    allowed_ip: "10.200.100.2".into()
                },
                PeerConfig {
                    public_key: "BBBB".into(),
                    allowed_ip: "10.200.100.3/32".into()
                },
            ]
        );
    }

    #[test]
    fn malformed_peer_flag_is_rejected() {
        let result = ServerArgs::try_parse_from([
            "wirecagesrv",
            "--private-key-file",
            "k",
            "--peer",
            "no-comma-here",
        ]);
        assert!(result.is_err());
    }
}
