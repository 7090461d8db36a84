//! Local-domain endpoint support: abstract-namespace binding (including
//! kernel auto-selection) and the same-process credential gate applied to
//! accepted local streams.
//!
//! Abstract sockets are a Linux facility; other platforms reject the
//! `@` endpoint family at bind time.

use std::io;
use std::os::unix::net::UnixListener;

/// Listen backlog for the sockets bound here.
#[cfg(target_os = "linux")]
const LISTEN_BACKLOG: i32 = 128;

/// Binds a local-domain abstract endpoint and returns the listener plus
/// the effective endpoint string, `'@'`-prefixed so it round-trips
/// through the endpoint syntax. `None` asks the kernel to auto-select a
/// unique name.
#[cfg(target_os = "linux")]
pub(crate) fn bind_abstract(path: Option<&str>) -> io::Result<(UnixListener, String)> {
    use std::os::linux::net::SocketAddrExt as _;

    let listener = match path {
        Some(path) => {
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(path.as_bytes())?;
            UnixListener::bind_addr(&addr)?
        }
        None => autobind()?,
    };

    let effective = listener
        .local_addr()?
        .as_abstract_name()
        .map(|name| format!("@{}", String::from_utf8_lossy(name)))
        .ok_or_else(|| io::Error::other("bound socket has no abstract name"))?;

    Ok((listener, effective))
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn bind_abstract(_path: Option<&str>) -> io::Result<(UnixListener, String)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract local-domain endpoints require Linux",
    ))
}

/// Binds with an address length of `sizeof(sa_family_t)`, which makes the
/// kernel pick a unique abstract name. Not expressible through std, which
/// always emits a name of its own.
#[cfg(target_os = "linux")]
fn autobind() -> io::Result<UnixListener> {
    use std::os::fd::FromRawFd as _;

    // SAFETY: plain libc socket calls; the descriptor is owned by exactly
    // one of `close` (error paths) or `from_raw_fd` (success path).
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_un = std::mem::zeroed();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let len = std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t;

        if libc::bind(fd, std::ptr::addr_of!(addr).cast(), len) != 0 {
            let error = io::Error::last_os_error();
            libc::close(fd);
            return Err(error);
        }

        if libc::listen(fd, LISTEN_BACKLOG) != 0 {
            let error = io::Error::last_os_error();
            libc::close(fd);
            return Err(error);
        }

        Ok(UnixListener::from_raw_fd(fd))
    }
}

/// Local-domain endpoints are reserved for in-process clients: a peer is
/// admitted only when its credentials carry our own pid.
pub(crate) fn is_own_process(peer_pid: Option<i32>) -> bool {
    peer_pid.and_then(|pid| u32::try_from(pid).ok()) == Some(std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_admitted() {
        let pid = i32::try_from(std::process::id()).expect("pid fits in i32");
        assert!(is_own_process(Some(pid)));
    }

    #[test]
    fn foreign_or_absent_pid_is_rejected() {
        assert!(!is_own_process(None));
        assert!(!is_own_process(Some(-1)));
        let pid = i32::try_from(std::process::id()).expect("pid fits in i32");
        assert!(!is_own_process(Some(pid.wrapping_add(1))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn autobind_reports_a_kernel_name() {
        let (listener, effective) = bind_abstract(None).expect("autobind failed");
        assert!(effective.starts_with('@'));
        assert!(effective.len() > 1);
        drop(listener);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn named_bind_round_trips() {
        let name = format!("replidb-test-{}", std::process::id());
        let (listener, effective) = bind_abstract(Some(&name)).expect("bind failed");
        assert_eq!(effective, format!("@{name}"));
        drop(listener);
    }
}
