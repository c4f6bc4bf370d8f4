//! Shadows individual files under a host directory with synthetic contents,
//! visible only inside this process's mount namespace.

use std::path::Path;

use anyhow::{Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};

/// Keeps the overlay mounted while alive. The overlay lives in a private
/// mount namespace, so the host view of the directory is untouched on every
/// exit path; `Drop` additionally unmounts for processes still inside the
/// namespace.
pub struct OverlayGuard {
    target: String,
    _scratch: tempfile::TempDir,
}

/// Makes the processes of this mount namespace see `entries` (as
/// `(file_name, contents)`) inside `target`, leaving every other entry of
/// the directory untouched.
///
/// Must be called on the thread whose mount namespace the final child will
/// inherit.
pub fn shadow(target: &Path, entries: &[(&str, Vec<u8>)]) -> Result<OverlayGuard> {
    anyhow::ensure!(
        target.is_dir(),
        "overlay target {} is not a directory",
        target.display()
    );

    let scratch = tempfile::Builder::new()
        .prefix("wirecage-overlay-")
        .tempdir()
        .context("failed to create overlay scratch directory")?;
    let upper = scratch.path().join("upper");
    let work = scratch.path().join("work");
    std::fs::create_dir(&upper).context("failed to create upper directory")?;
    std::fs::create_dir(&work).context("failed to create work directory")?;

    for (name, contents) in entries {
        std::fs::write(upper.join(name), contents)
            .with_context(|| format!("failed to write overlay entry {name:?}"))?;
    }

    // A private mount namespace so the overlay is invisible to the host.
    unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_FS)
        .context("failed to unshare mount namespace")?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .context("failed to make root filesystem private")?;

    let opts = format!(
        "lowerdir={},upperdir={},workdir={}",
        target.display(),
        upper.display(),
        work.display()
    );
    tracing::debug!(target = %target.display(), %opts, "mounting overlay");
    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .context("failed to mount overlay filesystem")?;

    Ok(OverlayGuard {
        target: target.display().to_string(),
        _scratch: scratch,
    })
}

impl Drop for OverlayGuard {
    fn drop(&mut self) {
        if let Err(err) = umount2(self.target.as_str(), MntFlags::MNT_DETACH) {
            tracing::debug!(target = %self.target, "failed to unmount overlay: {err}");
        }
    }
}
