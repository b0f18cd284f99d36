// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Single-threaded readiness loop driving the request manager.
// Author: Lukas Bower

//! Daemon event loop.
//!
//! One `poll(2)` covers the uevent socket, the termination signalfd and,
//! in tentative mode, the inotify descriptor. Each readiness notification is
//! processed to completion before the loop waits again.

use std::os::fd::{AsRawFd, RawFd};

use log::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::error::FirmwaredError;
use crate::manager::Manager;
use crate::sys::{self, SignalFd};
use crate::uevent::UeventSource;

/// Running daemon: event sources plus the request manager.
#[derive(Debug)]
pub struct Daemon {
    manager: Manager,
    uevents: UeventSource,
    signals: SignalFd,
}

impl Daemon {
    /// Open every descriptor the loop waits on.
    ///
    /// Any failure here is fatal to the process.
    pub fn new(config: DaemonConfig) -> Result<Self, FirmwaredError> {
        let signals = SignalFd::termination().map_err(FirmwaredError::Multiplexer)?;
        let uevents = UeventSource::open()?;
        let manager = Manager::new(config)?;
        Ok(Self {
            manager,
            uevents,
            signals,
        })
    }

    /// Serve requests until SIGTERM or SIGINT arrives.
    pub fn run(mut self) -> Result<(), FirmwaredError> {
        let config = self.manager.config();
        info!(
            "firmwared running (tentative: {}, search path: {:?})",
            config.tentative,
            config.search_path.dirs()
        );
        // The socket is already bound, so anything announced from here on is
        // seen twice at worst and add handling is idempotent.
        let found = self.manager.coldplug();
        if found > 0 {
            info!("picked up {found} pending request(s)");
        }

        loop {
            let mut fds: Vec<RawFd> = vec![self.signals.as_raw_fd(), self.uevents.as_raw_fd()];
            if let Some(fd) = self.manager.watch_fd() {
                fds.push(fd);
            }
            let ready = sys::wait_readable(&fds).map_err(FirmwaredError::Multiplexer)?;

            if ready[0] {
                match self.signals.read_signal() {
                    Ok(Some(signo)) => {
                        info!("received signal {signo}, shutting down");
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => return Err(FirmwaredError::Multiplexer(err)),
                }
            }
            if ready[1] {
                self.pump_uevents()?;
            }
            if ready.get(2).copied().unwrap_or(false) {
                self.manager.drain_watch_events()?;
            }
        }

        self.manager.shutdown();
        debug!("event loop stopped");
        Ok(())
    }

    fn pump_uevents(&mut self) -> Result<(), FirmwaredError> {
        for event in self.uevents.drain() {
            self.manager.handle_event(event?);
        }
        if self.uevents.take_overflow() {
            warn!("rescanning pending requests after uevent loss");
            self.manager.coldplug();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::SearchPath;
    use crate::sys::NetlinkSocket;
    use std::fs;
    use std::os::fd::OwnedFd;
    use std::os::unix::fs::symlink;
    use std::os::unix::net::UnixDatagram;
    use std::path::Path;
    use tempfile::TempDir;

    fn pending_request(sysfs: &Path, name: &str) -> std::path::PathBuf {
        let dir = sysfs.join("devices/virtual/firmware").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("loading"), b"").unwrap();
        fs::write(dir.join("data"), b"").unwrap();
        let class = sysfs.join("class/firmware");
        fs::create_dir_all(&class).unwrap();
        symlink(&dir, class.join(name)).unwrap();
        dir
    }

    #[test]
    fn termination_signal_ends_run_after_coldplug() {
        let sysfs = TempDir::new().unwrap();
        let firmware = TempDir::new().unwrap();
        fs::write(firmware.path().join("ready.bin"), b"fw").unwrap();
        let ready = pending_request(sysfs.path(), "ready.bin");
        let waiting = pending_request(sysfs.path(), "waiting.bin");
        let config = DaemonConfig {
            tentative: true,
            search_path: SearchPath::new(vec![firmware.path().into()]).unwrap(),
            sysfs_root: sysfs.path().into(),
            max_attempts: None,
            chunk_size: 4096,
        };
        let (_tx, rx) = UnixDatagram::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let signals = SignalFd::termination().unwrap();
        let daemon = Daemon {
            manager: Manager::new(config).unwrap(),
            uevents: UeventSource::from_socket(NetlinkSocket::from_fd(OwnedFd::from(rx))),
            signals,
        };

        sys::raise_in_thread(libc::SIGTERM).unwrap();
        daemon.run().unwrap();

        assert_eq!(fs::read_to_string(ready.join("loading")).unwrap(), "10");
        assert_eq!(fs::read(ready.join("data")).unwrap(), b"fw");
        assert_eq!(fs::read_to_string(waiting.join("loading")).unwrap(), "");
    }
}
