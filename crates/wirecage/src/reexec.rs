//! Re-exec of `/proc/self/exe` into a new user namespace.
//!
//! Each stage transition forks, unshares `CLONE_NEWUSER` in the child, and
//! has the child write its own uid/gid maps before exec. Self-written
//! single-entry maps need no privileges and no parent/child synchronization,
//! so there is no window where the child runs with unmapped ids.

use std::ffi::CString;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::sched::CloneFlags;

/// A single-entry id mapping `inside -> outside`.
#[derive(Debug, Clone, Copy)]
pub struct IdMap {
    pub inside: u32,
    pub outside: u32,
}

/// Builds a `Command` that re-execs ourselves at the given stage inside a
/// fresh user namespace with the given maps. stdio is inherited; the
/// caller adds environment and converts to `tokio::process` as needed.
pub fn user_ns_command(
    stage: &str,
    args: &[String],
    uid_map: IdMap,
    gid_map: IdMap,
) -> Command {
    let mut cmd = Command::new("/proc/self/exe");
    cmd.arg(stage);
    cmd.args(args);

    // Everything the closure touches is prepared up front: after fork only
    // async-signal-safe operations are allowed, which rules out allocation.
    let setgroups = CString::new("/proc/self/setgroups").unwrap();
    let uid_map_path = CString::new("/proc/self/uid_map").unwrap();
    let gid_map_path = CString::new("/proc/self/gid_map").unwrap();
    let uid_line = format!("{} {} 1", uid_map.inside, uid_map.outside).into_bytes();
    let gid_line = format!("{} {} 1", gid_map.inside, gid_map.outside).into_bytes();

    // SAFETY: the closure only performs raw syscalls on pre-built buffers.
    unsafe {
        cmd.pre_exec(move || {
            nix::sched::unshare(CloneFlags::CLONE_NEWUSER)
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
            write_whole(&setgroups, b"deny")?;
            write_whole(&gid_map_path, &gid_line)?;
            write_whole(&uid_map_path, &uid_line)?;
            Ok(())
        });
    }
    cmd
}

/// Writes `data` to `path` with raw syscalls only (async-signal-safe).
fn write_whole(path: &CString, data: &[u8]) -> io::Result<()> {
    // SAFETY: path is a valid NUL-terminated string, data outlives the call.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = libc::write(fd, data.as_ptr() as *const libc::c_void, data.len());
        let write_err = if rc == data.len() as isize {
            None
        } else {
            Some(io::Error::last_os_error())
        };
        libc::close(fd);
        match write_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_targets_self_exe_with_stage_sentinel() {
        let cmd = user_ns_command(
            "stage2",
            &["--uid".into(), "1000".into()],
            IdMap { inside: 0, outside: 1000 },
            IdMap { inside: 0, outside: 1000 },
        );
        assert_eq!(cmd.get_program(), "/proc/self/exe");
        let argv: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(argv, vec!["stage2", "--uid", "1000"]);
    }
}
