// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Decode kernel uevents and filter firmware requests.
// Author: Lukas Bower

//! Kernel uevent adapter.
//!
//! The kernel broadcasts each uevent as one netlink datagram:
//!
//! ```text
//! add@/devices/virtual/firmware/foo.bin\0ACTION=add\0DEVPATH=/devices/...\0
//! SUBSYSTEM=firmware\0FIRMWARE=foo.bin\0SEQNUM=4711\0
//! ```
//!
//! [`decode`] turns such a record into a [`KernelEvent`]; [`UeventSource`]
//! pulls records from the socket and yields only firmware events.

use std::os::fd::{AsRawFd, RawFd};
use std::str;

use log::{debug, trace, warn};

use crate::error::{DecodeError, FirmwaredError};
use crate::request::DevicePath;
use crate::sys::NetlinkSocket;

/// `SUBSYSTEM` value of firmware loading requests.
pub const FIRMWARE_SUBSYSTEM: &str = "firmware";

const RECORD_BUFFER_BYTES: usize = 8192;

/// Kind of change announced by a uevent, decided once at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// A request directory appeared.
    Add,
    /// A request directory went away.
    Remove,
    /// Anything else (`change`, `bind`, ...).
    Other,
}

impl Action {
    fn parse(value: &str) -> Self {
        match value {
            "add" => Self::Add,
            "remove" => Self::Remove,
            _ => Self::Other,
        }
    }
}

/// Structured uevent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelEvent {
    /// Decoded `ACTION`.
    pub action: Action,
    /// `DEVPATH`, relative to the sysfs mount point.
    pub device_path: DevicePath,
    /// `SUBSYSTEM`.
    pub subsystem: String,
    /// `SEQNUM`, when the kernel supplied one.
    pub sequence_number: Option<u64>,
    /// `FIRMWARE`, the requested image name.
    pub firmware: Option<String>,
}

impl KernelEvent {
    /// Whether the event belongs to the firmware loading subsystem.
    pub fn is_firmware(&self) -> bool {
        self.subsystem == FIRMWARE_SUBSYSTEM
    }
}

/// Decode one raw record.
///
/// Fields are separated by NUL bytes; records without any NUL are split on
/// ASCII whitespace instead. Tokens without `=` (the `action@devpath`
/// header) and unknown keys are skipped.
pub fn decode(record: &[u8]) -> Result<KernelEvent, DecodeError> {
    let mut action = None;
    let mut device_path = None;
    let mut subsystem = None;
    let mut sequence = None;
    let mut firmware = None;

    let mut saw_pair = false;
    for field in fields(record) {
        let Some(split) = field.iter().position(|&b| b == b'=') else {
            continue;
        };
        saw_pair = true;
        let (key, value) = (&field[..split], &field[split + 1..]);
        match key {
            b"ACTION" => action = Some(text("ACTION", value)?),
            b"DEVPATH" => device_path = Some(text("DEVPATH", value)?),
            b"SUBSYSTEM" => subsystem = Some(text("SUBSYSTEM", value)?),
            b"SEQNUM" => sequence = Some(text("SEQNUM", value)?),
            b"FIRMWARE" => firmware = Some(text("FIRMWARE", value)?),
            _ => {}
        }
    }
    if !saw_pair {
        return Err(DecodeError::Empty);
    }

    let action = action.ok_or(DecodeError::MissingKey("ACTION"))?;
    let device_path = device_path.ok_or(DecodeError::MissingKey("DEVPATH"))?;
    let subsystem = subsystem.ok_or(DecodeError::MissingKey("SUBSYSTEM"))?;
    if !is_valid_device_path(device_path) {
        return Err(DecodeError::InvalidDevicePath(device_path.to_owned()));
    }
    let sequence_number = sequence
        .map(|seq| {
            seq.parse::<u64>()
                .map_err(|_| DecodeError::InvalidSequence(seq.to_owned()))
        })
        .transpose()?;

    Ok(KernelEvent {
        action: Action::parse(action),
        device_path: DevicePath::new(device_path),
        subsystem: subsystem.to_owned(),
        sequence_number,
        firmware: firmware.filter(|name| !name.is_empty()).map(str::to_owned),
    })
}

fn fields(record: &[u8]) -> Box<dyn Iterator<Item = &[u8]> + '_> {
    if record.contains(&0) {
        Box::new(record.split(|&b| b == 0).filter(|field| !field.is_empty()))
    } else {
        Box::new(
            record
                .split(u8::is_ascii_whitespace)
                .filter(|field| !field.is_empty()),
        )
    }
}

fn text<'a>(key: &'static str, value: &'a [u8]) -> Result<&'a str, DecodeError> {
    str::from_utf8(value).map_err(|_| DecodeError::InvalidUtf8(key))
}

fn is_valid_device_path(path: &str) -> bool {
    path.starts_with('/') && path.len() > 1 && !path.split('/').any(|part| part == "..")
}

/// Decode a record and keep it only if it is a firmware event.
///
/// Malformed records are logged and dropped.
pub fn accept(record: &[u8]) -> Option<KernelEvent> {
    match decode(record) {
        Ok(event) if event.is_firmware() => Some(event),
        Ok(event) => {
            trace!("ignoring {} event for {}", event.subsystem, event.device_path);
            None
        }
        Err(err) => {
            warn!("dropping uevent: {}", FirmwaredError::from(err));
            None
        }
    }
}

/// Firmware events read from the kernel uevent socket.
#[derive(Debug)]
pub struct UeventSource {
    socket: NetlinkSocket,
    buffer: Vec<u8>,
    overflowed: bool,
}

impl UeventSource {
    /// Bind to the kernel's uevent multicast group.
    pub fn open() -> Result<Self, FirmwaredError> {
        let socket = NetlinkSocket::kobject_uevent().map_err(FirmwaredError::EventChannel)?;
        debug!("listening for kernel uevents");
        Ok(Self {
            socket,
            buffer: vec![0; RECORD_BUFFER_BYTES],
            overflowed: false,
        })
    }

    /// Iterate over the firmware events queued right now.
    ///
    /// Stops when the socket has nothing left; the next readiness
    /// notification resumes the sequence. A receive error other than
    /// buffer overflow is yielded once and means the channel is unusable.
    pub fn drain(&mut self) -> Drain<'_> {
        Drain { source: self }
    }

    /// Report (and clear) whether records were lost to buffer overflow.
    pub fn take_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }

    #[cfg(test)]
    pub(crate) fn from_socket(socket: NetlinkSocket) -> Self {
        Self {
            socket,
            buffer: vec![0; RECORD_BUFFER_BYTES],
            overflowed: false,
        }
    }

    fn next_event(&mut self) -> Result<Option<KernelEvent>, FirmwaredError> {
        loop {
            let (len, sender) = match self.socket.recv(&mut self.buffer) {
                Ok(Some(received)) => received,
                Ok(None) => return Ok(None),
                Err(err) if err.raw_os_error() == Some(libc::ENOBUFS) => {
                    warn!("uevent receive buffer overflowed; events were lost");
                    self.overflowed = true;
                    continue;
                }
                Err(err) => return Err(FirmwaredError::EventChannel(err)),
            };
            if sender != 0 {
                debug!("ignoring uevent from port {sender}");
                continue;
            }
            if let Some(event) = accept(&self.buffer[..len]) {
                return Ok(Some(event));
            }
        }
    }
}

impl AsRawFd for UeventSource {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Iterator returned by [`UeventSource::drain`].
#[derive(Debug)]
pub struct Drain<'a> {
    source: &'a mut UeventSource,
}

impl Iterator for Drain<'_> {
    type Item = Result<KernelEvent, FirmwaredError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.source.next_event().transpose()
    }
}
