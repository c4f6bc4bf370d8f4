mod args;
mod mux;
mod overlay;
mod reexec;
mod stage2;

use std::os::unix::process::{CommandExt, ExitStatusExt};

use anyhow::{Context, Result};
use clap::Parser;

use args::{Args, Stage};
use reexec::IdMap;

fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let (stage, parse_from) = Stage::split(&argv);
    let args = Args::parse_from(&parse_from);

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let result = match stage {
        Stage::One => stage1(&args, &argv[1..]),
        Stage::Two => stage2::run(args),
        Stage::Three => stage3(&args),
    };

    match result {
        // A child's exit code is mirrored verbatim, with no extra output.
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("wirecage: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Stage 1: resolve the target user while the user database is still
/// reachable, then re-exec into a fresh user namespace mapping root to the
/// invoking user.
fn stage1(args: &Args, original_args: &[String]) -> Result<i32> {
    tracing::debug!("at first stage, launching second stage in a new user namespace...");

    // Fail on missing configuration before any namespace is created; stage 2
    // checks again, but the diagnostic is clearest from here.
    args.validate()?;

    let (uid, gid) = args.resolve_target_user()?;
    let host_uid = nix::unistd::getuid().as_raw();
    let host_gid = nix::unistd::getgid().as_raw();

    let mut stage2_args: Vec<String> = vec![
        "--uid".into(),
        uid.to_string(),
        "--gid".into(),
        gid.to_string(),
    ];
    stage2_args.extend(original_args.iter().cloned());

    let mut cmd = reexec::user_ns_command(
        "stage2",
        &stage2_args,
        IdMap { inside: 0, outside: host_uid },
        IdMap { inside: 0, outside: host_gid },
    );
    let status = cmd
        .status()
        .context("error re-executing ourselves in a new user namespace")?;
    Ok(exit_code_of(status))
}

/// Stage 3: drop to the target ids, then become the user's command.
fn stage3(args: &Args) -> Result<i32> {
    tracing::debug!("at third stage...");

    // gid first: after setuid the process may no longer have the privilege
    // to change groups.
    if let Some(gid) = args.gid.filter(|gid| *gid != 0) {
        tracing::debug!(gid, "switching gid");
        nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))
            .with_context(|| format!("error switching to group {gid}"))?;
    }
    if let Some(uid) = args.uid.filter(|uid| *uid != 0) {
        tracing::debug!(uid, "switching uid");
        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))
            .with_context(|| format!("error switching to user {uid}"))?;
    }

    let command = args.get_command();
    tracing::debug!(?command, "third stage execing final command");
    let err = std::process::Command::new(&command[0])
        .args(&command[1..])
        .exec();
    Err(err).with_context(|| format!("error executing {:?}", command[0]))
}

/// Maps an exit status to the code we should exit with: the child's code
/// verbatim, or the conventional 128+signal for signal deaths.
pub(crate) fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(1),
    }
}
