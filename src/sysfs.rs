// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive the loading/data attribute handshake of a firmware request.
// Author: Lukas Bower

//! Sysfs load protocol.
//!
//! A request directory exposes two write-only attributes:
//!
//! ```text
//! /sys/devices/virtual/firmware/<name>/
//! ├── loading   # "1" start, "0" commit, "-1" abort
//! └── data      # raw image bytes, written sequentially
//! ```
//!
//! [`load`] opens each attribute once, streams the image in bounded chunks
//! and commits or aborts. Handles are [`AttributeHandle`]s and close on
//! every exit path.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::{debug, trace, warn};

use crate::error::FirmwaredError;
use crate::request::DevicePath;

/// Attribute toggled to start, commit or abort a load.
pub const LOADING_ATTR: &str = "loading";
/// Attribute receiving the image bytes.
pub const DATA_ATTR: &str = "data";

const LOADING_START: &[u8] = b"1";
const LOADING_COMMIT: &[u8] = b"0";
const LOADING_ABORT: &[u8] = b"-1";

/// Kernel directory of one firmware request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDir {
    path: PathBuf,
}

impl RequestDir {
    /// Locate the directory of `device_path` below `sysfs_root`.
    pub fn new(sysfs_root: &Path, device_path: &DevicePath) -> Self {
        Self {
            path: sysfs_root.join(device_path.relative()),
        }
    }

    /// Filesystem path of the directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self, attribute: &'static str) -> Result<AttributeHandle, FirmwaredError> {
        AttributeHandle::open(self, attribute)
    }
}

/// Open, write-only handle on one request attribute.
#[derive(Debug)]
pub struct AttributeHandle {
    dir: PathBuf,
    attribute: &'static str,
    file: File,
}

impl AttributeHandle {
    fn open(dir: &RequestDir, attribute: &'static str) -> Result<Self, FirmwaredError> {
        let file = OpenOptions::new()
            .write(true)
            .open(dir.path.join(attribute))
            .map_err(|err| FirmwaredError::attribute(&dir.path, attribute, err))?;
        trace!("opened {attribute} of {}", dir.path.display());
        Ok(Self {
            dir: dir.path.clone(),
            attribute,
            file,
        })
    }

    fn write_value(&mut self, value: &[u8]) -> Result<(), FirmwaredError> {
        self.file
            .write_all(value)
            .map_err(|err| FirmwaredError::attribute(&self.dir, self.attribute, err))
    }
}

impl Drop for AttributeHandle {
    fn drop(&mut self) {
        trace!("closed {} of {}", self.attribute, self.dir.display());
    }
}

/// Result of one load attempt.
#[derive(Debug)]
pub enum LoadOutcome {
    /// Image transferred and `loading=0` accepted.
    Committed {
        /// Bytes written to `data`.
        bytes: u64,
    },
    /// Transfer failed; `loading=-1` was attempted.
    Aborted {
        /// First failure of the attempt.
        reason: FirmwaredError,
    },
    /// The request directory was unusable, typically already removed.
    Cancelled {
        /// Failure opening or starting the load.
        reason: FirmwaredError,
    },
}

/// Transfer `image` into the request at `dir`.
///
/// Never retries; a failed attempt is final for this invocation.
pub fn load(dir: &RequestDir, image: &Path, chunk_size: usize) -> LoadOutcome {
    let mut loading = match dir.open(LOADING_ATTR) {
        Ok(handle) => handle,
        Err(reason) => return LoadOutcome::Cancelled { reason },
    };
    if let Err(reason) = loading.write_value(LOADING_START) {
        return LoadOutcome::Cancelled { reason };
    }

    let streamed = stream_image(dir, image, chunk_size);
    let result = streamed.and_then(|bytes| loading.write_value(LOADING_COMMIT).map(|()| bytes));
    match result {
        Ok(bytes) => LoadOutcome::Committed { bytes },
        Err(reason) => {
            if let Err(err) = loading.write_value(LOADING_ABORT) {
                warn!("abort of {} failed: {err}", dir.path.display());
            }
            LoadOutcome::Aborted { reason }
        }
    }
}

/// Signal failure for a request without transferring anything.
pub fn abort(dir: &RequestDir) -> Result<(), FirmwaredError> {
    let mut loading = dir.open(LOADING_ATTR)?;
    loading.write_value(LOADING_ABORT)?;
    debug!("aborted {}", dir.path.display());
    Ok(())
}

fn stream_image(dir: &RequestDir, image: &Path, chunk_size: usize) -> Result<u64, FirmwaredError> {
    let image_error = |source: io::Error| FirmwaredError::FirmwareImage {
        path: image.to_path_buf(),
        source,
    };
    let mut source = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(image)
        .map_err(image_error)?;
    if !source.metadata().map_err(image_error)?.is_file() {
        return Err(image_error(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    let mut data = dir.open(DATA_ATTR)?;
    let mut chunk = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;
    loop {
        let read = match source.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(image_error(err)),
        };
        data.write_value(&chunk[..read])?;
        total += read as u64;
        trace!("wrote {read} bytes ({total} total) to {}", dir.path.display());
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn request_dir(root: &TempDir) -> RequestDir {
        let device = DevicePath::from("/devices/virtual/firmware/fw.bin");
        let dir = RequestDir::new(root.path(), &device);
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join(LOADING_ATTR), b"").unwrap();
        fs::write(dir.path().join(DATA_ATTR), b"").unwrap();
        dir
    }

    #[test]
    fn request_dir_is_relative_to_root() {
        let device = DevicePath::from("/devices/virtual/firmware/fw.bin");
        let dir = RequestDir::new(Path::new("/sys"), &device);
        assert_eq!(dir.path(), Path::new("/sys/devices/virtual/firmware/fw.bin"));
    }

    #[test]
    fn chunked_stream_preserves_bytes() {
        let root = TempDir::new().unwrap();
        let dir = request_dir(&root);
        let image = root.path().join("image.bin");
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        fs::write(&image, &payload).unwrap();

        let outcome = load(&dir, &image, 333);
        assert!(matches!(outcome, LoadOutcome::Committed { bytes: 10_000 }));
        assert_eq!(fs::read(dir.path().join(DATA_ATTR)).unwrap(), payload);
        assert_eq!(fs::read(dir.path().join(LOADING_ATTR)).unwrap(), b"10");
    }

    #[test]
    fn empty_image_commits() {
        let root = TempDir::new().unwrap();
        let dir = request_dir(&root);
        let image = root.path().join("empty.bin");
        fs::write(&image, b"").unwrap();
        assert!(matches!(load(&dir, &image, 16), LoadOutcome::Committed { bytes: 0 }));
        assert_eq!(fs::read(dir.path().join(LOADING_ATTR)).unwrap(), b"10");
    }

    #[test]
    fn vanished_image_aborts() {
        let root = TempDir::new().unwrap();
        let dir = request_dir(&root);
        let outcome = load(&dir, &root.path().join("gone.bin"), 16);
        assert!(matches!(
            outcome,
            LoadOutcome::Aborted {
                reason: FirmwaredError::FirmwareImage { .. }
            }
        ));
        assert_eq!(fs::read(dir.path().join(LOADING_ATTR)).unwrap(), b"1-1");
    }

    #[test]
    fn missing_data_attribute_aborts() {
        let root = TempDir::new().unwrap();
        let dir = request_dir(&root);
        fs::remove_file(dir.path().join(DATA_ATTR)).unwrap();
        let image = root.path().join("image.bin");
        fs::write(&image, b"narf").unwrap();
        assert!(matches!(load(&dir, &image, 16), LoadOutcome::Aborted { .. }));
        assert_eq!(fs::read(dir.path().join(LOADING_ATTR)).unwrap(), b"1-1");
    }

    #[test]
    fn missing_directory_cancels() {
        let root = TempDir::new().unwrap();
        let dir = RequestDir::new(root.path(), &DevicePath::from("/devices/gone"));
        let image = root.path().join("image.bin");
        fs::write(&image, b"narf").unwrap();
        assert!(matches!(load(&dir, &image, 16), LoadOutcome::Cancelled { .. }));
        assert!(abort(&dir).is_err());
    }

    #[test]
    fn abort_writes_only_minus_one() {
        let root = TempDir::new().unwrap();
        let dir = request_dir(&root);
        abort(&dir).unwrap();
        assert_eq!(fs::read(dir.path().join(LOADING_ATTR)).unwrap(), b"-1");
        assert!(fs::read(dir.path().join(DATA_ATTR)).unwrap().is_empty());
    }
}
