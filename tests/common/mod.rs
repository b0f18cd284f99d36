// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Shared fake-sysfs fixture for firmwared integration tests.
// Author: Lukas Bower
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use firmwared::uevent::{decode, KernelEvent};
use firmwared::{DaemonConfig, DevicePath, SearchPath};
use tempfile::TempDir;

/// Fake sysfs tree plus a firmware directory.
///
/// Request attributes are regular files, so their contents are the
/// concatenation of every value the daemon wrote.
pub struct Fixture {
    pub sysfs: TempDir,
    pub firmware: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            sysfs: TempDir::new().expect("sysfs tempdir"),
            firmware: TempDir::new().expect("firmware tempdir"),
        }
    }

    pub fn config(&self, tentative: bool) -> DaemonConfig {
        DaemonConfig {
            tentative,
            search_path: SearchPath::new(vec![self.firmware.path().to_path_buf()])
                .expect("search path"),
            sysfs_root: self.sysfs.path().to_path_buf(),
            max_attempts: None,
            chunk_size: 3,
        }
    }

    /// Create the request directory the kernel would expose for `name`.
    pub fn request(&self, name: &str) -> DevicePath {
        let device = DevicePath::new(format!(
            "/devices/virtual/firmware/{}",
            name.replace('/', "!")
        ));
        let dir = self.dir(&device);
        fs::create_dir_all(&dir).expect("request dir");
        fs::write(dir.join("loading"), b"").expect("loading attr");
        fs::write(dir.join("data"), b"").expect("data attr");
        device
    }

    pub fn dir(&self, device: &DevicePath) -> PathBuf {
        self.sysfs.path().join(device.relative())
    }

    pub fn loading(&self, device: &DevicePath) -> String {
        fs::read_to_string(self.dir(device).join("loading")).expect("read loading")
    }

    pub fn data(&self, device: &DevicePath) -> Vec<u8> {
        fs::read(self.dir(device).join("data")).expect("read data")
    }

    /// Drop a firmware image into the search directory.
    pub fn install(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.firmware.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("firmware subdir");
        }
        fs::write(&path, bytes).expect("write firmware");
        path
    }

    pub fn firmware_dir(&self) -> &Path {
        self.firmware.path()
    }
}

pub fn add_event(device: &DevicePath, firmware: &str) -> KernelEvent {
    let record = format!(
        "add@{device}\0ACTION=add\0DEVPATH={device}\0SUBSYSTEM=firmware\0FIRMWARE={firmware}\0SEQNUM=1\0"
    );
    decode(record.as_bytes()).expect("decode add")
}

pub fn remove_event(device: &DevicePath) -> KernelEvent {
    let record = format!("remove@{device}\0ACTION=remove\0DEVPATH={device}\0SUBSYSTEM=firmware\0SEQNUM=2\0");
    decode(record.as_bytes()).expect("decode remove")
}
