//! Host forwarding and source NAT for the cage subnet. The kernel does the
//! actual routing; this module just flips `ip_forward` and maintains the
//! iptables rules for the server's lifetime.

use std::process::Command;

use anyhow::{Context, Result};

use crate::args::ServerArgs;

/// Removes the NAT rules on drop. `ip_forward` is left enabled; turning it
/// back off could break unrelated services on the host.
pub struct NatGuard {
    subnet: String,
    tun: String,
    outbound: String,
}

impl NatGuard {
    pub fn set_up(args: &ServerArgs) -> Result<Self> {
        std::fs::write("/proc/sys/net/ipv4/ip_forward", "1")
            .context("failed to enable IP forwarding - are you running as root?")?;

        let outbound = match &args.outbound_interface {
            Some(iface) => iface.clone(),
            None => default_interface()?,
        };
        tracing::info!(%outbound, subnet = %args.subnet, "setting up NAT");

        iptables(&[
            "-t", "nat", "-A", "POSTROUTING", "-s", &args.subnet, "-o", &outbound, "-j",
            "MASQUERADE",
        ])?;
        iptables(&["-A", "FORWARD", "-i", &args.tun, "-j", "ACCEPT"])?;
        iptables(&["-A", "FORWARD", "-o", &args.tun, "-j", "ACCEPT"])?;

        Ok(Self {
            subnet: args.subnet.clone(),
            tun: args.tun.clone(),
            outbound,
        })
    }
}

impl Drop for NatGuard {
    fn drop(&mut self) {
        tracing::info!("removing NAT rules");
        let _ = iptables(&[
            "-t", "nat", "-D", "POSTROUTING", "-s", &self.subnet, "-o", &self.outbound, "-j",
            "MASQUERADE",
        ]);
        let _ = iptables(&["-D", "FORWARD", "-i", &self.tun, "-j", "ACCEPT"]);
        let _ = iptables(&["-D", "FORWARD", "-o", &self.tun, "-j", "ACCEPT"]);
    }
}

fn iptables(rule: &[&str]) -> Result<()> {
    let output = Command::new("iptables")
        .args(rule)
        .output()
        .context("failed to run iptables")?;
    anyhow::ensure!(
        output.status.success(),
        "iptables {} failed: {}",
        rule.join(" "),
        String::from_utf8_lossy(&output.stderr).trim()
    );
    Ok(())
}

/// Picks the interface of the default route, e.g. `eth0` out of
/// `default via 192.168.1.1 dev eth0 proto dhcp`.
fn default_interface() -> Result<String> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .context("failed to run 'ip route'")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .split_whitespace()
        .skip_while(|word| *word != "dev")
        .nth(1)
        .map(str::to_string)
        .context("could not determine default interface; pass --outbound-interface")
}
