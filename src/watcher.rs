// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: inotify-backed deferral of requests whose firmware is not on disk yet.
// Author: Lukas Bower

//! Deferral watcher.
//!
//! Holds one inotify instance for the whole daemon. Each deferred request
//! registers interest in its firmware file name across the search path and
//! receives an opaque [`WatchToken`]. Directory watches are shared and
//! reference counted between interests. The watcher never touches request
//! state; it reports [`WatchEvent`]s and the manager decides what to do.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Component, Path, PathBuf};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use log::{debug, trace, warn};

use crate::error::FirmwaredError;
use crate::request::DevicePath;
use crate::resolver::{is_readable_file, validate_name, SearchPath};

const EVENT_BUFFER_BYTES: usize = 4096;

/// Ownership of one request's interest in a firmware file.
///
/// Returned by [`DeferralWatcher::register`] and handed back through
/// [`DeferralWatcher::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct WatchToken {
    id: u64,
    device_path: DevicePath,
}

impl WatchToken {
    /// Identifier echoed in [`WatchEvent`]s for this interest.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Request the token was issued for.
    pub fn device_path(&self) -> &DevicePath {
        &self.device_path
    }

    #[cfg(test)]
    pub(crate) fn detached(id: u64, device_path: DevicePath) -> Self {
        Self { id, device_path }
    }
}

/// Notification routed back to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file matching the interest was completed in a watched directory.
    CandidateReady {
        /// Token id of the interest.
        token: u64,
        /// Request the interest belongs to.
        device_path: DevicePath,
        /// Requested firmware name.
        firmware_name: String,
    },
    /// Every directory watched for the interest has gone away.
    WatchLost {
        /// Token id of the interest.
        token: u64,
        /// Request the interest belongs to.
        device_path: DevicePath,
        /// Requested firmware name.
        firmware_name: String,
    },
}

impl WatchEvent {
    /// Token id carried by the event.
    pub fn token(&self) -> u64 {
        match self {
            Self::CandidateReady { token, .. } | Self::WatchLost { token, .. } => *token,
        }
    }

    /// Request the event is addressed to.
    pub fn device_path(&self) -> &DevicePath {
        match self {
            Self::CandidateReady { device_path, .. } | Self::WatchLost { device_path, .. } => {
                device_path
            }
        }
    }
}

#[derive(Debug)]
struct Interest {
    device_path: DevicePath,
    firmware_name: String,
    /// Name components; the last one is the file itself.
    parts: Vec<OsString>,
    anchors: Vec<Anchor>,
}

impl Interest {
    fn candidate(&self, token: u64) -> WatchEvent {
        WatchEvent::CandidateReady {
            token,
            device_path: self.device_path.clone(),
            firmware_name: self.firmware_name.clone(),
        }
    }

    fn lost(&self, token: u64) -> WatchEvent {
        WatchEvent::WatchLost {
            token,
            device_path: self.device_path.clone(),
            firmware_name: self.firmware_name.clone(),
        }
    }

    fn is_final(&self, anchor: &Anchor) -> bool {
        anchor.depth + 1 == self.parts.len()
    }
}

/// Deepest existing directory on the way from one search directory to the
/// file. `parts[depth]` is the entry expected to appear in `dir`.
#[derive(Debug)]
struct Anchor {
    root: PathBuf,
    dir: PathBuf,
    depth: usize,
    wd: WatchDescriptor,
}

#[derive(Debug)]
struct WatchedDir {
    path: PathBuf,
    refs: usize,
}

struct RawEvent {
    wd: WatchDescriptor,
    mask: EventMask,
    name: Option<OsString>,
}

/// Directory watcher for deferred firmware requests.
pub struct DeferralWatcher {
    inotify: Inotify,
    dirs: HashMap<WatchDescriptor, WatchedDir>,
    interests: BTreeMap<u64, Interest>,
    next_id: u64,
    buffer: [u8; EVENT_BUFFER_BYTES],
}

impl std::fmt::Debug for DeferralWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferralWatcher")
            .field("dirs", &self.dirs.len())
            .field("interests", &self.interests.len())
            .finish_non_exhaustive()
    }
}

fn watch_mask() -> WatchMask {
    WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO | WatchMask::CREATE | WatchMask::ONLYDIR
}

fn name_parts(name: &Path) -> Vec<OsString> {
    name.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_os_string()),
            _ => None,
        })
        .collect()
}

fn deepest_existing(root: &Path, parts: &[OsString]) -> Option<(PathBuf, usize)> {
    if !root.is_dir() {
        return None;
    }
    let mut dir = root.to_path_buf();
    let mut depth = 0;
    while depth + 1 < parts.len() {
        let next = dir.join(&parts[depth]);
        if !next.is_dir() {
            break;
        }
        dir = next;
        depth += 1;
    }
    Some((dir, depth))
}

impl DeferralWatcher {
    /// Create the inotify instance (non-blocking, close-on-exec).
    pub fn new() -> Result<Self, FirmwaredError> {
        let inotify = Inotify::init().map_err(FirmwaredError::WatchInit)?;
        Ok(Self {
            inotify,
            dirs: HashMap::new(),
            interests: BTreeMap::new(),
            next_id: 1,
            buffer: [0; EVENT_BUFFER_BYTES],
        })
    }

    /// Number of live interests.
    pub fn pending(&self) -> usize {
        self.interests.len()
    }

    /// Number of directories currently under watch.
    pub fn watched_dirs(&self) -> usize {
        self.dirs.len()
    }

    /// Watch every search directory for `firmware_name`.
    ///
    /// For names with subdirectories the deepest existing directory on the
    /// way is watched and the watch moves down as directories appear.
    /// Search directories that do not exist are skipped; registration fails
    /// only when nothing at all could be watched.
    pub fn register(
        &mut self,
        search_path: &SearchPath,
        device_path: &DevicePath,
        firmware_name: &str,
    ) -> Result<WatchToken, FirmwaredError> {
        let registration_error = || FirmwaredError::WatchRegistration {
            name: firmware_name.to_owned(),
        };
        let parts = validate_name(firmware_name)
            .map(name_parts)
            .filter(|parts| !parts.is_empty())
            .ok_or_else(registration_error)?;

        let mut anchors: Vec<Anchor> = Vec::new();
        for root in search_path.dirs() {
            let Some(anchor) = self.anchor(root, &parts) else {
                continue;
            };
            if anchors.iter().any(|held| held.wd == anchor.wd) {
                self.unref(anchor.wd);
                continue;
            }
            trace!("watching {} for {firmware_name}", anchor.dir.display());
            anchors.push(anchor);
        }
        if anchors.is_empty() {
            return Err(registration_error());
        }

        let id = self.next_id;
        self.next_id += 1;
        self.interests.insert(
            id,
            Interest {
                device_path: device_path.clone(),
                firmware_name: firmware_name.to_owned(),
                parts,
                anchors,
            },
        );
        Ok(WatchToken {
            id,
            device_path: device_path.clone(),
        })
    }

    /// Drop the interest behind `token`, removing directory watches nobody
    /// else needs.
    pub fn release(&mut self, token: WatchToken) {
        let Some(interest) = self.interests.remove(&token.id) else {
            return;
        };
        for anchor in interest.anchors {
            self.unref(anchor.wd);
        }
        trace!("released watch {} for {}", token.id, token.device_path);
    }

    fn anchor(&mut self, root: &Path, parts: &[OsString]) -> Option<Anchor> {
        let (dir, depth) = deepest_existing(root, parts)?;
        match self.hold(&dir) {
            Ok(wd) => Some(Anchor {
                root: root.to_path_buf(),
                dir,
                depth,
                wd,
            }),
            Err(err) => {
                debug!("cannot watch {}: {err}", dir.display());
                None
            }
        }
    }

    fn hold(&mut self, dir: &Path) -> io::Result<WatchDescriptor> {
        let wd = self.inotify.watches().add(dir, watch_mask())?;
        self.dirs
            .entry(wd.clone())
            .and_modify(|watched| watched.refs += 1)
            .or_insert_with(|| WatchedDir {
                path: dir.to_path_buf(),
                refs: 1,
            });
        Ok(wd)
    }

    fn unref(&mut self, wd: WatchDescriptor) {
        let Some(watched) = self.dirs.get_mut(&wd) else {
            return;
        };
        watched.refs = watched.refs.saturating_sub(1);
        if watched.refs > 0 {
            return;
        }
        if let Some(watched) = self.dirs.remove(&wd) {
            if let Err(err) = self.inotify.watches().remove(wd) {
                debug!("removing watch on {}: {err}", watched.path.display());
            }
        }
    }

    /// Re-derive every anchor of interest `id` that sits on `wd`.
    ///
    /// Returns whether the interest still watches anything.
    fn reanchor(&mut self, id: u64, wd: &WatchDescriptor) -> bool {
        let Some(interest) = self.interests.get_mut(&id) else {
            return false;
        };
        let parts = interest.parts.clone();
        let (moved, mut anchors): (Vec<Anchor>, Vec<Anchor>) = std::mem::take(&mut interest.anchors)
            .into_iter()
            .partition(|anchor| &anchor.wd == wd);
        for old in moved {
            if let Some(anchor) = self.anchor(&old.root, &parts) {
                if anchors.iter().any(|held| held.wd == anchor.wd) {
                    self.unref(anchor.wd);
                } else {
                    trace!("watch for {} moved to {}", old.dir.display(), anchor.dir.display());
                    anchors.push(anchor);
                }
            }
            self.unref(old.wd);
        }
        let watching = !anchors.is_empty();
        if let Some(interest) = self.interests.get_mut(&id) {
            interest.anchors = anchors;
        }
        watching
    }

    /// Whether the file already sits in one of the interest's final
    /// directories; it may have landed before the watch moved there.
    fn already_present(&self, id: u64) -> bool {
        self.interests.get(&id).is_some_and(|interest| {
            interest.anchors.iter().any(|anchor| {
                interest.is_final(anchor)
                    && interest
                        .parts
                        .last()
                        .is_some_and(|file| is_readable_file(&anchor.dir.join(file)))
            })
        })
    }

    /// Drain the inotify queue and translate it into [`WatchEvent`]s.
    ///
    /// Each interest is reported at most once per call. Never blocks.
    pub fn read_events(&mut self) -> Result<Vec<WatchEvent>, FirmwaredError> {
        let mut raw = Vec::new();
        loop {
            let events = match self.inotify.read_events(&mut self.buffer) {
                Ok(events) => events,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(FirmwaredError::WatchInit(err)),
            };
            let before = raw.len();
            raw.extend(events.map(|event| RawEvent {
                wd: event.wd,
                mask: event.mask,
                name: event.name.map(OsStr::to_os_string),
            }));
            if raw.len() == before {
                break;
            }
        }

        let mut fired = BTreeSet::new();
        let mut out = Vec::new();
        for event in raw {
            self.dispatch(event, &mut fired, &mut out);
        }
        Ok(out)
    }

    fn dispatch(&mut self, event: RawEvent, fired: &mut BTreeSet<u64>, out: &mut Vec<WatchEvent>) {
        if event.mask.contains(EventMask::Q_OVERFLOW) {
            warn!("inotify queue overflowed; rechecking every deferred request");
            for (id, interest) in &self.interests {
                if fired.insert(*id) {
                    out.push(interest.candidate(*id));
                }
            }
            return;
        }
        if event.mask.contains(EventMask::IGNORED) {
            self.forget_dir(&event.wd, fired, out);
            return;
        }
        let Some(name) = event.name else {
            return;
        };
        let Some(watched) = self.dirs.get(&event.wd) else {
            return;
        };
        let path = watched.path.join(&name);
        let completed = event
            .mask
            .intersects(EventMask::CLOSE_WRITE | EventMask::MOVED_TO)
            || (event.mask.contains(EventMask::CREATE) && is_symlink(&path));
        let arrived_dir =
            event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) && path.is_dir();

        let mut descend = BTreeSet::new();
        for (id, interest) in &self.interests {
            for anchor in &interest.anchors {
                if anchor.wd != event.wd || interest.parts.get(anchor.depth) != Some(&name) {
                    continue;
                }
                if interest.is_final(anchor) {
                    if completed && fired.insert(*id) {
                        debug!("{} appeared for {}", path.display(), interest.device_path);
                        out.push(interest.candidate(*id));
                    }
                } else if arrived_dir {
                    descend.insert(*id);
                }
            }
        }
        for id in descend {
            self.reanchor(id, &event.wd);
            if self.already_present(id) && fired.insert(id) {
                if let Some(interest) = self.interests.get(&id) {
                    debug!("{} arrived with its directory", interest.firmware_name);
                    out.push(interest.candidate(id));
                }
            }
        }
    }

    fn forget_dir(&mut self, wd: &WatchDescriptor, fired: &mut BTreeSet<u64>, out: &mut Vec<WatchEvent>) {
        // Unknown descriptors are the echo of our own removals.
        let Some(watched) = self.dirs.remove(wd) else {
            return;
        };
        warn!("watched directory {} went away", watched.path.display());
        let affected: Vec<u64> = self
            .interests
            .iter()
            .filter(|(_, interest)| interest.anchors.iter().any(|anchor| &anchor.wd == wd))
            .map(|(id, _)| *id)
            .collect();
        for id in affected {
            let event = if !self.reanchor(id, wd) {
                self.interests.get(&id).map(|interest| interest.lost(id))
            } else if self.already_present(id) {
                self.interests.get(&id).map(|interest| interest.candidate(id))
            } else {
                None
            };
            if let Some(event) = event {
                if fired.insert(id) {
                    out.push(event);
                }
            }
        }
    }
}

impl AsRawFd for DeferralWatcher {
    fn as_raw_fd(&self) -> RawFd {
        self.inotify.as_raw_fd()
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}
