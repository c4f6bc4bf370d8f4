use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::Parser;

/// Which bootstrap stage this invocation is. Selected by the first
/// positional argument of the re-exec'd binary: `stage2` and `stage3` are
/// sentinels, anything else is a normal user invocation (stage 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    One,
    Two,
    Three,
}

impl Stage {
    /// Splits the raw argv into the stage and the argv clap should parse
    /// (with the sentinel removed).
    pub fn split(argv: &[String]) -> (Self, Vec<String>) {
        let stage = match argv.get(1).map(String::as_str) {
            Some("stage2") => Stage::Two,
            Some("stage3") => Stage::Three,
            _ => Stage::One,
        };
        let mut parse_from = Vec::with_capacity(argv.len());
        parse_from.extend(argv.iter().take(1).cloned());
        let skip = if stage == Stage::One { 1 } else { 2 };
        parse_from.extend(argv.iter().skip(skip).cloned());
        (stage, parse_from)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "wirecage",
    about = "Run a command in a network namespace with all traffic tunneled over WireGuard"
)]
pub struct Args {
    #[arg(long, default_value = "wirecage", help = "name of the TUN device that will be created")]
    pub tun: String,

    #[arg(
        long,
        default_value = "10.1.2.100/24",
        help = "IP address of the network interface that the subprocess will see"
    )]
    pub subnet: String,

    #[arg(
        long,
        default_value = "10.1.2.1",
        help = "IP address of the gateway that intercepts and proxies network packets"
    )]
    pub gateway: IpAddr,

    #[arg(long, overrides_with = "uid", help = "run command as this uid")]
    pub uid: Option<u32>,

    #[arg(long, overrides_with = "gid", help = "run command as this gid")]
    pub gid: Option<u32>,

    #[arg(long, help = "run command as this user (username or id)")]
    pub user: Option<String>,

    #[arg(
        long,
        env = "WIRECAGE_NO_OVERLAY",
        help = "do not mount any overlay filesystems"
    )]
    pub no_overlay: bool,

    #[arg(
        long,
        default_value = "info",
        value_parser = ["debug", "info", "warn", "error"],
        help = "log level"
    )]
    pub log_level: String,

    #[arg(long = "wg-public-key", help = "wireguard server public key")]
    pub wg_public_key: Option<String>,

    #[arg(long = "wg-private-key-file", help = "wireguard private key file")]
    pub wg_private_key_file: Option<String>,

    #[arg(long = "wg-endpoint", help = "wireguard server endpoint (host:port)")]
    pub wg_endpoint: Option<String>,

    #[arg(
        long = "wg-address",
        help = "our wireguard address (the allowed-ips the server has for this peer)"
    )]
    pub wg_address: Option<IpAddr>,

    #[arg(trailing_var_arg = true, help = "command to run")]
    pub command: Vec<String>,
}

impl Args {
    /// Resolves the uid/gid the final child should run as. Must run before
    /// any namespace change: afterwards the user database gives answers for
    /// the wrong world. Explicit `--uid`/`--gid` win over `--user`, which
    /// wins over the invoking user's effective ids.
    pub fn resolve_target_user(&self) -> Result<(u32, u32)> {
        let looked_up = match &self.user {
            Some(user) => {
                let entry = if let Ok(uid) = user.parse::<u32>() {
                    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
                } else {
                    nix::unistd::User::from_name(user)
                }
                .with_context(|| format!("error looking up user {user:?}"))?
                .with_context(|| format!("user {user:?} not found"))?;
                Some((entry.uid.as_raw(), entry.gid.as_raw()))
            }
            None => None,
        };

        let uid = self
            .uid
            .or(looked_up.map(|(uid, _)| uid))
            .unwrap_or_else(|| nix::unistd::geteuid().as_raw());
        let gid = self
            .gid
            .or(looked_up.map(|(_, gid)| gid))
            .unwrap_or_else(|| nix::unistd::getegid().as_raw());
        Ok((uid, gid))
    }

    /// Checks the flags the datapath cannot run without. Called at stage-2
    /// entry so the diagnostic names the missing flag.
    pub fn validate(&self) -> Result<()> {
        if self.wg_endpoint.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("--wg-endpoint is required");
        }
        if self.wg_public_key.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("--wg-public-key is required");
        }
        if self.wg_private_key_file.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("--wg-private-key-file is required");
        }
        if self.wg_address.is_none() {
            anyhow::bail!("--wg-address is required");
        }
        Ok(())
    }

    pub fn get_command(&self) -> Vec<String> {
        if self.command.is_empty() {
            vec!["/bin/sh".to_string()]
        } else {
            self.command.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn stage_is_selected_by_first_positional() {
        let (stage, rest) = Stage::split(&argv(&["wirecage", "stage2", "--uid", "7"]));
        assert_eq!(stage, Stage::Two);
        assert_eq!(rest, argv(&["wirecage", "--uid", "7"]));

        let (stage, _) = Stage::split(&argv(&["wirecage", "stage3", "--uid", "7"]));
        assert_eq!(stage, Stage::Three);

        let (stage, rest) = Stage::split(&argv(&["wirecage", "--tun", "t0"]));
        assert_eq!(stage, Stage::One);
        assert_eq!(rest, argv(&["wirecage", "--tun", "t0"]));
    }

    #[test]
    fn stage3_argv_convention_parses() {
        let args = Args::parse_from(argv(&[
            "wirecage", "--uid", "1000", "--gid", "1000", "--", "sh", "-c", "exit 42",
        ]));
        assert_eq!(args.uid, Some(1000));
        assert_eq!(args.gid, Some(1000));
        assert_eq!(args.command, argv(&["sh", "-c", "exit 42"]));
    }

    #[test]
    fn repeated_uid_flag_last_wins() {
        // Stage 1 prepends the resolved ids before the user's original
        // arguments; a user-specified --uid repeats and must not error.
        let args = Args::parse_from(argv(&[
            "wirecage", "--uid", "0", "--gid", "0", "--uid", "1000",
        ]));
        assert_eq!(args.uid, Some(1000));
        assert_eq!(args.gid, Some(0));
    }

    #[test]
    fn command_defaults_to_shell() {
        let args = Args::parse_from(argv(&["wirecage"]));
        assert_eq!(args.get_command(), argv(&["/bin/sh"]));
    }

    #[test]
    fn missing_wg_flags_fail_validation_with_flag_name() {
        let args = Args::parse_from(argv(&["wirecage"]));
        let err = args.validate().unwrap_err().to_string();
        assert!(err.contains("--wg-endpoint"), "diagnostic must name the flag: {err}");
    }

    #[test]
    fn explicit_ids_win_over_effective_ids() {
        let args = Args::parse_from(argv(&["wirecage", "--uid", "42", "--gid", "43"]));
        assert_eq!(args.resolve_target_user().unwrap(), (42, 43));
    }
}
