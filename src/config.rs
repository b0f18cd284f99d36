// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Daemon configuration, built-in defaults and TOML overrides.
// Author: Lukas Bower

//! Daemon configuration.
//!
//! [`DaemonConfig`] is built once at startup, from defaults, an optional
//! TOML file and CLI overrides, and then handed to every component.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::FirmwaredError;
use crate::resolver::SearchPath;

/// Mount point of sysfs on a regular system.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";
/// Bytes handed to the `data` attribute per write.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
/// Upper bound accepted for `chunk_size`.
pub const MAX_CHUNK_SIZE: usize = 1 << 20;

const FIRMWARE_ROOT: &str = "/lib/firmware";
const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Defer requests whose firmware does not exist yet.
    pub tentative: bool,
    /// Ordered firmware directories, first match wins.
    pub search_path: SearchPath,
    /// Directory that kernel `DEVPATH`s are relative to.
    pub sysfs_root: PathBuf,
    /// Resolution attempts allowed per request; `None` waits indefinitely.
    pub max_attempts: Option<u32>,
    /// Size of each write into the `data` attribute.
    pub chunk_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tentative: false,
            search_path: default_search_path(),
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            max_attempts: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    tentative: Option<bool>,
    search_path: Option<Vec<PathBuf>>,
    sysfs_root: Option<PathBuf>,
    max_attempts: Option<u32>,
    chunk_size: Option<usize>,
}

impl DaemonConfig {
    /// Load defaults overlaid with the settings of a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, FirmwaredError> {
        let text = fs::read_to_string(path).map_err(|err| FirmwaredError::ConfigFile {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::from_toml(&text).map_err(|err| match err {
            FirmwaredError::Config(message) => FirmwaredError::ConfigFile {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parse TOML text on top of the built-in defaults.
    pub fn from_toml(text: &str) -> Result<Self, FirmwaredError> {
        let parsed: ConfigToml =
            toml::from_str(text).map_err(|err| FirmwaredError::config(err.message().to_owned()))?;
        let mut config = Self::default();
        if let Some(tentative) = parsed.tentative {
            config.tentative = tentative;
        }
        if let Some(dirs) = parsed.search_path {
            config.search_path = SearchPath::new(dirs)?;
        }
        if let Some(root) = parsed.sysfs_root {
            config.sysfs_root = root;
        }
        if parsed.max_attempts.is_some() {
            config.max_attempts = parsed.max_attempts;
        }
        if let Some(chunk_size) = parsed.chunk_size {
            config.chunk_size = chunk_size;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the components rely on.
    pub fn validate(&self) -> Result<(), FirmwaredError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(FirmwaredError::config(format!(
                "chunk_size must be within 1..={MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(FirmwaredError::config("max_attempts must be at least 1"));
        }
        if self.sysfs_root.as_os_str().is_empty() {
            return Err(FirmwaredError::config("sysfs_root must not be empty"));
        }
        Ok(())
    }
}

/// Kernel-style default search path for the running kernel release.
pub fn default_search_path() -> SearchPath {
    search_path_for_release(kernel_release().as_deref())
}

/// Kernel-style default search path for an explicit release string.
///
/// Release-specific directories are left out when `release` is `None`.
pub fn search_path_for_release(release: Option<&str>) -> SearchPath {
    let root = Path::new(FIRMWARE_ROOT);
    let updates = root.join("updates");
    let mut dirs = Vec::with_capacity(4);
    if let Some(release) = release {
        dirs.push(updates.join(release));
    }
    dirs.push(updates);
    if let Some(release) = release {
        dirs.push(root.join(release));
    }
    dirs.push(root.to_path_buf());
    SearchPath::from_dirs(dirs)
}

fn kernel_release() -> Option<String> {
    let release = fs::read_to_string(OSRELEASE_PATH).ok()?;
    let release = release.trim();
    if release.is_empty() || release.contains('/') {
        return None;
    }
    Some(release.to_owned())
}
