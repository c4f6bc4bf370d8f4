use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::NetdevError;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// A TUN device carrying raw IP frames (`IFF_TUN | IFF_NO_PI`).
///
/// The descriptor lives in the network namespace of the thread that created
/// it. [`split`] yields independently-owned read and write halves (the write
/// half is a `dup` of the same descriptor).
///
/// [`split`]: TunDevice::split
pub struct TunDevice {
    fd: OwnedFd,
    name: String,
}

impl TunDevice {
    /// Creates (or attaches to) the named TUN device in the current netns.
    pub fn create(name: &str) -> Result<Self, NetdevError> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(NetdevError::NameTooLong(name.to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")
            .map_err(|source| NetdevError::Io {
                action: "open /dev/net/tun",
                source,
            })?;
        let fd: OwnedFd = file.into();

        let mut req = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
            _pad: [0; 22],
        };
        for (dst, src) in req.ifr_name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }

        // SAFETY: fd is a valid tun descriptor and req is a properly
        // initialised ifreq that outlives the call.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &mut req) };
        if rc < 0 {
            return Err(NetdevError::Io {
                action: "TUNSETIFF",
                source: io::Error::last_os_error(),
            });
        }

        tracing::debug!(name, "created tun device");
        Ok(Self {
            fd,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Splits into async read/write halves. Must be called from within a
    /// tokio runtime.
    pub fn split(self) -> Result<(TunReader, TunWriter), NetdevError> {
        let write_fd = dup_nonblocking(&self.fd)?;
        let reader = AsyncFd::with_interest(self.fd, Interest::READABLE).map_err(|source| {
            NetdevError::Io {
                action: "register tun reader",
                source,
            }
        })?;
        let writer = AsyncFd::with_interest(write_fd, Interest::WRITABLE).map_err(|source| {
            NetdevError::Io {
                action: "register tun writer",
                source,
            }
        })?;
        Ok((TunReader { fd: reader }, TunWriter { fd: writer }))
    }
}

fn dup_nonblocking(fd: &OwnedFd) -> Result<OwnedFd, NetdevError> {
    // SAFETY: duplicating a descriptor we own; the result is owned by the
    // returned OwnedFd.
    let raw = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
    if raw < 0 {
        return Err(NetdevError::Io {
            action: "dup tun descriptor",
            source: io::Error::last_os_error(),
        });
    }
    let dup = unsafe { OwnedFd::from_raw_fd(raw) };
    let flags = unsafe { libc::fcntl(dup.as_raw_fd(), libc::F_GETFL) };
    if flags < 0
        || unsafe { libc::fcntl(dup.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
    {
        return Err(NetdevError::Io {
            action: "set tun descriptor non-blocking",
            source: io::Error::last_os_error(),
        });
    }
    Ok(dup)
}

/// The read half of a TUN device; single owner.
pub struct TunReader {
    fd: AsyncFd<OwnedFd>,
}

impl TunReader {
    /// Reads one IP frame. Resolves only when a frame is available.
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable_mut().await?;
            match guard.try_io(|inner| {
                let rc = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// The write half of a TUN device; single owner.
pub struct TunWriter {
    fd: AsyncFd<OwnedFd>,
}

impl TunWriter {
    /// Writes one IP frame. TUN writes are atomic: the frame is either
    /// accepted whole or rejected.
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable_mut().await?;
            match guard.try_io(|inner| {
                let rc = unsafe {
                    libc::write(
                        inner.as_raw_fd(),
                        frame.as_ptr() as *const libc::c_void,
                        frame.len(),
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            }) {
                Ok(Ok(written)) => {
                    if written != frame.len() {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            format!("partial tun write: {written} of {} bytes", frame.len()),
                        ));
                    }
                    return Ok(());
                }
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }
}
