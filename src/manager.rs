// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Request orchestrator tying events, resolution, loading and deferral.
// Author: Lukas Bower

//! Request orchestrator.
//!
//! The [`Manager`] owns the registry `device_path -> LoadRequest` and is the
//! only code that changes a request's state. Requests are taken out of the
//! registry for the duration of a turn and put back only while deferred;
//! terminal requests are simply not reinserted.

use std::collections::BTreeMap;
use std::fs;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use log::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::error::FirmwaredError;
use crate::request::{DevicePath, LoadRequest, RequestState};
use crate::resolver::{validate_name, Resolution};
use crate::sysfs::{self, LoadOutcome, RequestDir};
use crate::uevent::{Action, KernelEvent};
use crate::watcher::{DeferralWatcher, WatchEvent};

/// Class directory listing pending fallback requests.
const FIRMWARE_CLASS_DIR: &str = "class/firmware";
/// Global knob living next to the request links.
const FIRMWARE_CLASS_TIMEOUT: &str = "timeout";

/// Firmware request orchestrator.
#[derive(Debug)]
pub struct Manager {
    config: DaemonConfig,
    requests: BTreeMap<DevicePath, LoadRequest>,
    watcher: Option<DeferralWatcher>,
}

impl Manager {
    /// Build the manager; the watch channel exists only in tentative mode.
    pub fn new(config: DaemonConfig) -> Result<Self, FirmwaredError> {
        config.validate()?;
        let watcher = if config.tentative {
            Some(DeferralWatcher::new()?)
        } else {
            None
        };
        Ok(Self {
            config,
            requests: BTreeMap::new(),
            watcher,
        })
    }

    /// Configuration the manager runs with.
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Number of live requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no request is live.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Borrow the live request for `device_path`.
    pub fn request(&self, device_path: &DevicePath) -> Option<&LoadRequest> {
        self.requests.get(device_path)
    }

    /// State of the live request for `device_path`.
    pub fn state_of(&self, device_path: &DevicePath) -> Option<RequestState> {
        self.requests.get(device_path).map(LoadRequest::state)
    }

    /// Watch channel descriptor, present in tentative mode.
    pub fn watch_fd(&self) -> Option<RawFd> {
        self.watcher.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Number of interests held by the deferral watcher.
    pub fn pending_watches(&self) -> usize {
        self.watcher.as_ref().map_or(0, DeferralWatcher::pending)
    }

    /// Dispatch one decoded uevent.
    pub fn handle_event(&mut self, event: KernelEvent) {
        match event.action {
            Action::Add => self.on_add_event(&event.device_path, event.firmware.as_deref()),
            Action::Remove => self.on_remove_event(&event.device_path),
            Action::Other => debug!("ignoring non add/remove event for {}", event.device_path),
        }
    }

    /// Start servicing a newly announced request.
    ///
    /// Repeated announcements of a live request are ignored. `announced` is
    /// the uevent's `FIRMWARE` value; without it the name is recovered from
    /// the request directory name.
    pub fn on_add_event(&mut self, device_path: &DevicePath, announced: Option<&str>) {
        if self.requests.contains_key(device_path) {
            debug!("{device_path} already being serviced");
            return;
        }
        let firmware_name = match firmware_name(device_path, announced) {
            Ok(name) => name,
            Err(err) => {
                warn!("dropping request: {err}");
                return;
            }
        };
        info!("{device_path} requests {firmware_name}");
        let request = LoadRequest::new(device_path.clone(), firmware_name, self.config.tentative);
        self.attempt(request);
    }

    /// Withdraw a request the kernel has given up on.
    pub fn on_remove_event(&mut self, device_path: &DevicePath) {
        let Some(mut request) = self.requests.remove(device_path) else {
            debug!("remove for {device_path} with no live request");
            return;
        };
        self.release_watch(&mut request);
        if self.settle(&mut request, RequestState::Cancelled) {
            info!("{device_path} cancelled by kernel");
        }
    }

    /// React to a notification from the deferral watcher.
    pub fn on_watch_event(&mut self, event: WatchEvent) {
        let device_path = event.device_path().clone();
        let current = self
            .requests
            .get(&device_path)
            .and_then(LoadRequest::pending_watch)
            .map(|token| token.id());
        if current != Some(event.token()) {
            debug!("stale watch event for {device_path}");
            return;
        }
        let Some(mut request) = self.requests.remove(&device_path) else {
            return;
        };
        self.release_watch(&mut request);
        match event {
            WatchEvent::CandidateReady { .. } => {
                if self.settle(&mut request, RequestState::Resolving) {
                    debug!("retrying {device_path}");
                    self.attempt(request);
                }
            }
            WatchEvent::WatchLost { firmware_name, .. } => {
                warn!("{device_path}: no directory left to watch for {firmware_name}");
                self.abort(request);
            }
        }
    }

    /// Pull pending notifications from the watch channel and act on them.
    ///
    /// A read failure means the watch channel itself is broken.
    pub fn drain_watch_events(&mut self) -> Result<(), FirmwaredError> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Ok(());
        };
        let events = watcher.read_events()?;
        for event in events {
            self.on_watch_event(event);
        }
        Ok(())
    }

    /// Pick up requests that were announced before the daemon listened.
    ///
    /// Returns the number of request directories found.
    pub fn coldplug(&mut self) -> usize {
        let class_dir = self.config.sysfs_root.join(FIRMWARE_CLASS_DIR);
        let entries = match fs::read_dir(&class_dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("no pending requests under {}: {err}", class_dir.display());
                return 0;
            }
        };
        let root = match fs::canonicalize(&self.config.sysfs_root) {
            Ok(root) => root,
            Err(err) => {
                warn!("cannot resolve {}: {err}", self.config.sysfs_root.display());
                return 0;
            }
        };
        let mut found = Vec::new();
        for entry in entries.flatten() {
            if entry.file_name() == FIRMWARE_CLASS_TIMEOUT {
                continue;
            }
            match device_path_below(&root, &entry.path()) {
                Some(path) => found.push(path),
                None => debug!("skipping {}", entry.path().display()),
            }
        }
        found.sort();
        let count = found.len();
        for device_path in found {
            self.on_add_event(&device_path, None);
        }
        count
    }

    /// Cancel every live request and release what it holds.
    pub fn shutdown(&mut self) {
        let requests = std::mem::take(&mut self.requests);
        for (device_path, mut request) in requests {
            self.release_watch(&mut request);
            if self.settle(&mut request, RequestState::Cancelled) {
                debug!("{device_path} cancelled on shutdown");
            }
        }
    }

    fn attempt(&mut self, mut request: LoadRequest) {
        let attempt = request.begin_attempt();
        match self.config.search_path.resolve(request.firmware_name()) {
            Resolution::Found(image) => self.load(request, &image),
            Resolution::NotFound if request.tentative() => {
                match self.config.max_attempts {
                    Some(limit) if attempt >= limit => {
                        let err = FirmwaredError::AttemptsExhausted {
                            device_path: request.device_path().to_string(),
                            limit,
                        };
                        warn!("{err}");
                        self.abort(request);
                    }
                    _ => self.defer(request),
                }
            }
            Resolution::NotFound => {
                warn!(
                    "{} not found for {}",
                    request.firmware_name(),
                    request.device_path()
                );
                self.abort(request);
            }
        }
    }

    fn load(&mut self, mut request: LoadRequest, image: &Path) {
        if !self.settle(&mut request, RequestState::Loading) {
            return;
        }
        let dir = RequestDir::new(&self.config.sysfs_root, request.device_path());
        match sysfs::load(&dir, image, self.config.chunk_size) {
            LoadOutcome::Committed { bytes } => {
                if self.settle(&mut request, RequestState::Committed) {
                    info!(
                        "loaded {} ({bytes} bytes) into {}",
                        image.display(),
                        request.device_path()
                    );
                }
            }
            LoadOutcome::Aborted { reason } => {
                warn!("load into {} aborted: {reason}", request.device_path());
                self.settle(&mut request, RequestState::Aborted);
            }
            LoadOutcome::Cancelled { reason } => {
                warn!("{} vanished before loading: {reason}", request.device_path());
                self.settle(&mut request, RequestState::Cancelled);
            }
        }
    }

    fn defer(&mut self, mut request: LoadRequest) {
        let registered = match self.watcher.as_mut() {
            Some(watcher) => watcher.register(
                &self.config.search_path,
                request.device_path(),
                request.firmware_name(),
            ),
            None => Err(FirmwaredError::WatchRegistration {
                name: request.firmware_name().to_owned(),
            }),
        };
        let token = match registered {
            Ok(token) => token,
            Err(err) => {
                warn!("{}: {err}; aborting instead of deferring", request.device_path());
                self.abort(request);
                return;
            }
        };
        // A file completed before the watch existed produces no event.
        if let Resolution::Found(image) = self.config.search_path.resolve(request.firmware_name()) {
            if let Some(watcher) = self.watcher.as_mut() {
                watcher.release(token);
            }
            debug!("{} appeared while deferring", image.display());
            self.load(request, &image);
            return;
        }
        match request.defer(token) {
            Ok(()) => {
                info!(
                    "{} not found yet, deferring {}",
                    request.firmware_name(),
                    request.device_path()
                );
                self.requests.insert(request.device_path().clone(), request);
            }
            Err(err) => {
                error!("{err}");
                self.release_watch(&mut request);
                self.abort(request);
            }
        }
    }

    fn abort(&mut self, mut request: LoadRequest) {
        let dir = RequestDir::new(&self.config.sysfs_root, request.device_path());
        if let Err(err) = sysfs::abort(&dir) {
            warn!("{}: {err}", request.device_path());
        }
        self.settle(&mut request, RequestState::Aborted);
    }

    fn release_watch(&mut self, request: &mut LoadRequest) {
        if let Some(token) = request.take_watch() {
            if let Some(watcher) = self.watcher.as_mut() {
                watcher.release(token);
            }
        }
    }

    /// Apply a transition, logging refusals. Returns whether it happened.
    fn settle(&self, request: &mut LoadRequest, next: RequestState) -> bool {
        match request.transition(next) {
            Ok(_) => true,
            Err(err) => {
                error!("{err}");
                false
            }
        }
    }
}

/// Pick the firmware name for a request.
///
/// Device names cannot contain `/`, so the kernel substitutes `!` when it
/// names the request directory after the firmware.
fn firmware_name(device_path: &DevicePath, announced: Option<&str>) -> Result<String, FirmwaredError> {
    let name = match announced {
        Some(name) => name.to_owned(),
        None => device_path
            .device_name()
            .map(|name| name.replace('!', "/"))
            .unwrap_or_default(),
    };
    if validate_name(&name).is_none() {
        return Err(FirmwaredError::FirmwareName {
            device_path: device_path.to_string(),
        });
    }
    Ok(name)
}

fn device_path_below(root: &Path, entry: &Path) -> Option<DevicePath> {
    let target = fs::canonicalize(entry).ok()?;
    let relative = target.strip_prefix(root).ok()?;
    let relative = relative.to_str()?;
    if relative.is_empty() {
        return None;
    }
    Some(DevicePath::new(format!("/{relative}")))
}
