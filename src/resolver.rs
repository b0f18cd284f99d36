// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Resolve requested firmware names against the ordered search path.
// Author: Lukas Bower

//! Firmware name resolution.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};

use log::{trace, warn};

use crate::error::FirmwaredError;

/// Outcome of a single resolution pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// First readable regular file in search order.
    Found(PathBuf),
    /// No directory holds a readable regular file of that name.
    NotFound,
}

/// Ordered list of firmware directories; earlier entries win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    /// Build a search path, rejecting an empty list.
    pub fn new(dirs: Vec<PathBuf>) -> Result<Self, FirmwaredError> {
        if dirs.is_empty() {
            return Err(FirmwaredError::config("search path must name at least one directory"));
        }
        Ok(Self { dirs })
    }

    pub(crate) fn from_dirs(dirs: Vec<PathBuf>) -> Self {
        debug_assert!(!dirs.is_empty());
        Self { dirs }
    }

    /// Directories in priority order.
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Candidate image paths for `name`, in priority order.
    ///
    /// Yields nothing when `name` is not a safe relative path.
    pub fn candidates<'a>(&'a self, name: &str) -> impl Iterator<Item = PathBuf> + 'a {
        let relative = validate_name(name).map(Path::to_path_buf);
        self.dirs
            .iter()
            .filter_map(move |dir| relative.as_ref().map(|rel| dir.join(rel)))
    }

    /// Return the first readable regular file named `name`.
    pub fn resolve(&self, name: &str) -> Resolution {
        if validate_name(name).is_none() {
            warn!("refusing to resolve unsafe firmware name {name:?}");
            return Resolution::NotFound;
        }
        for candidate in self.candidates(name) {
            if is_readable_file(&candidate) {
                trace!("resolved {name} to {}", candidate.display());
                return Resolution::Found(candidate);
            }
        }
        Resolution::NotFound
    }
}

/// Accept `name` only as a non-empty relative path without `..` components.
///
/// `Path::join` replaces the base for absolute names, so those never reach
/// the search directories.
pub fn validate_name(name: &str) -> Option<&Path> {
    if name.is_empty() || name.contains('\0') {
        return None;
    }
    let path = Path::new(name);
    let mut normal = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    normal.then_some(path)
}

/// Opening a FIFO or device node may block, so the type is checked first
/// and the probe open never waits.
pub(crate) fn is_readable_file(path: &Path) -> bool {
    if !fs::metadata(path).map(|meta| meta.is_file()).unwrap_or(false) {
        return false;
    }
    match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
    {
        Ok(file) => file.metadata().map(|meta| meta.is_file()).unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn rejects_escaping_names() {
        assert!(validate_name("").is_none());
        assert!(validate_name("/etc/shadow").is_none());
        assert!(validate_name("../secret.bin").is_none());
        assert!(validate_name("brcm/../../x").is_none());
        assert!(validate_name(".").is_none());
        assert!(validate_name("brcm/fw.bin").is_some());
        assert!(validate_name("./fw.bin").is_some());
    }

    #[test]
    fn first_directory_wins() {
        let high = TempDir::new().unwrap();
        let low = TempDir::new().unwrap();
        fs::write(high.path().join("fw.bin"), b"high").unwrap();
        fs::write(low.path().join("fw.bin"), b"low").unwrap();
        let path = SearchPath::new(vec![high.path().into(), low.path().into()]).unwrap();
        assert_eq!(
            path.resolve("fw.bin"),
            Resolution::Found(high.path().join("fw.bin"))
        );
    }

    #[test]
    fn skips_directories_with_same_name() {
        let high = TempDir::new().unwrap();
        let low = TempDir::new().unwrap();
        fs::create_dir(high.path().join("fw.bin")).unwrap();
        fs::write(low.path().join("fw.bin"), b"low").unwrap();
        let path = SearchPath::new(vec![high.path().into(), low.path().into()]).unwrap();
        assert_eq!(path.resolve("fw.bin"), Resolution::Found(low.path().join("fw.bin")));
    }

    #[allow(unsafe_code)]
    fn make_fifo(path: &Path) {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        // SAFETY: `c_path` is a valid NUL-terminated path for the call.
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
        assert_eq!(rc, 0, "mkfifo {}", path.display());
    }

    #[test]
    fn fifo_is_skipped_without_blocking() {
        let high = TempDir::new().unwrap();
        let low = TempDir::new().unwrap();
        make_fifo(&high.path().join("fifo.bin"));
        let path = SearchPath::new(vec![high.path().into()]).unwrap();
        assert_eq!(path.resolve("fifo.bin"), Resolution::NotFound);

        fs::write(low.path().join("fifo.bin"), b"real").unwrap();
        let path = SearchPath::new(vec![high.path().into(), low.path().into()]).unwrap();
        assert_eq!(
            path.resolve("fifo.bin"),
            Resolution::Found(low.path().join("fifo.bin"))
        );
    }

    #[test]
    fn missing_everywhere_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = SearchPath::new(vec![dir.path().into(), dir.path().join("absent")]).unwrap();
        assert_eq!(path.resolve("fw.bin"), Resolution::NotFound);
        assert_eq!(path.resolve("/etc/hostname"), Resolution::NotFound);
    }
}
