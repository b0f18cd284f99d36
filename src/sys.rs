// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Minimal libc wrappers for netlink, signalfd and poll.
// Author: Lukas Bower
#![allow(unsafe_code)]

//! Raw descriptor plumbing.
//!
//! Every `unsafe` block of the crate lives here. Descriptors are wrapped in
//! [`OwnedFd`] as soon as the kernel hands them out.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// Multicast group the kernel publishes uevents on.
const KERNEL_UEVENT_GROUP: u32 = 1;
const RECEIVE_BUFFER_BYTES: libc::c_int = 1 << 20;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Non-blocking `NETLINK_KOBJECT_UEVENT` socket bound to the kernel group.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: OwnedFd,
}

impl NetlinkSocket {
    /// Open and bind the kernel uevent socket.
    pub fn kobject_uevent() -> io::Result<Self> {
        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw = cvt(unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        })?;
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = KERNEL_UEVENT_GROUP;
        // SAFETY: `addr` outlives the call and the length matches its type.
        cvt(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        })?;

        let socket = Self { fd };
        if let Err(err) = socket.grow_receive_buffer() {
            log::debug!("keeping default uevent receive buffer: {err}");
        }
        Ok(socket)
    }

    fn grow_receive_buffer(&self) -> io::Result<()> {
        let size = RECEIVE_BUFFER_BYTES;
        // SAFETY: `size` is a live c_int and the option length matches it.
        cvt(unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                ptr::addr_of!(size).cast::<libc::c_void>(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })
        .map(|_| ())
    }

    /// Receive one datagram, returning its length and the sender port id.
    ///
    /// `Ok(None)` means the socket has nothing queued.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, u32)>> {
        loop {
            // SAFETY: see `kobject_uevent`.
            let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
            // SAFETY: `buf` and `addr` are valid for the lengths passed.
            let read = unsafe {
                libc::recvfrom(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                    0,
                    ptr::addr_of_mut!(addr).cast::<libc::sockaddr>(),
                    &mut len,
                )
            };
            if read >= 0 {
                return Ok(Some((read as usize, addr.nl_pid)));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }
    }
}

#[cfg(test)]
impl NetlinkSocket {
    /// Wrap an arbitrary datagram descriptor.
    pub(crate) fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// `signalfd` delivering SIGTERM and SIGINT instead of their default action.
///
/// The previous signal mask is restored on drop.
pub struct SignalFd {
    fd: OwnedFd,
    previous: libc::sigset_t,
}

impl std::fmt::Debug for SignalFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalFd").field("fd", &self.fd).finish_non_exhaustive()
    }
}

impl SignalFd {
    /// Block SIGTERM/SIGINT for the process and route them to a descriptor.
    pub fn termination() -> io::Result<Self> {
        // SAFETY: sigset_t is initialised by sigemptyset before any read.
        let mut mask: libc::sigset_t = unsafe { mem::zeroed() };
        let mut previous: libc::sigset_t = unsafe { mem::zeroed() };
        // SAFETY: both sets are live, properly typed locals.
        unsafe {
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, libc::SIGTERM);
            libc::sigaddset(&mut mask, libc::SIGINT);
        }
        // SAFETY: masks are valid; pthread_sigmask reports errors by value.
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &mask, &mut previous) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        // SAFETY: `mask` is valid; -1 asks for a new descriptor.
        let raw = match cvt(unsafe {
            libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC)
        }) {
            Ok(raw) => raw,
            Err(err) => {
                // SAFETY: restoring the mask captured above.
                unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &previous, ptr::null_mut()) };
                return Err(err);
            }
        };
        // SAFETY: fresh descriptor from signalfd.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd, previous })
    }

    /// Read one pending signal number, if any.
    pub fn read_signal(&self) -> io::Result<Option<u32>> {
        loop {
            // SAFETY: signalfd_siginfo is plain old data.
            let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
            let size = mem::size_of::<libc::signalfd_siginfo>();
            // SAFETY: `info` is writable for `size` bytes.
            let read = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    ptr::addr_of_mut!(info).cast::<libc::c_void>(),
                    size,
                )
            };
            if read == size as isize {
                return Ok(Some(info.ssi_signo));
            }
            if read >= 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short signalfd read"));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }
    }
}

impl AsRawFd for SignalFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for SignalFd {
    fn drop(&mut self) {
        // SAFETY: `previous` was filled in by pthread_sigmask.
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut()) };
    }
}

/// Block until at least one descriptor is readable.
///
/// Returns one readiness flag per input descriptor, in order. Hang-ups,
/// errors and invalid descriptors count as readable so the owner observes
/// them on its next read.
pub fn wait_readable(fds: &[RawFd]) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    loop {
        // SAFETY: `pollfds` is a live buffer of exactly `len` entries.
        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(pollfds
        .iter()
        .map(|pfd| pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0)
        .collect())
}

/// Queue `signo` for the calling thread.
#[cfg(test)]
pub(crate) fn raise_in_thread(signo: libc::c_int) -> io::Result<()> {
    // SAFETY: pthread_self always names the calling thread.
    let rc = unsafe { libc::pthread_kill(libc::pthread_self(), signo) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn wait_reports_ready_descriptor() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let (_idle_tx, idle_rx) = UnixStream::pair().unwrap();
        tx.write_all(b"x").unwrap();
        let ready = wait_readable(&[idle_rx.as_raw_fd(), rx.as_raw_fd()]).unwrap();
        assert_eq!(ready, vec![false, true]);
    }

    #[test]
    fn blocked_termination_signal_is_read_from_descriptor() {
        let signals = SignalFd::termination().unwrap();
        assert_eq!(signals.read_signal().unwrap(), None);

        raise_in_thread(libc::SIGTERM).unwrap();
        assert_eq!(wait_readable(&[signals.as_raw_fd()]).unwrap(), vec![true]);
        assert_eq!(signals.read_signal().unwrap(), Some(libc::SIGTERM as u32));
        assert_eq!(signals.read_signal().unwrap(), None);
    }
}
