// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load request record and its explicit state machine.
// Author: Lukas Bower

//! Per-request state.
//!
//! A [`LoadRequest`] moves through
//! `Resolving -> {Loading -> Committed | Aborted} | Deferred -> Resolving`,
//! and any live state may end in `Cancelled`. Every change goes through
//! [`LoadRequest::transition`], which refuses edges outside that graph and
//! enforces that a deferred request owns exactly one watch.

use std::fmt;

use crate::error::FirmwaredError;
use crate::watcher::WatchToken;

/// Kernel `DEVPATH` of a firmware request directory, e.g.
/// `/devices/virtual/firmware/foo.bin`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePath(String);

impl DevicePath {
    /// Wrap a `DEVPATH` value.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Borrow the raw value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path relative to the sysfs mount point.
    pub fn relative(&self) -> &str {
        self.0.trim_start_matches('/')
    }

    /// Final component of the path, i.e. the kernel device name.
    pub fn device_name(&self) -> Option<&str> {
        self.relative().rsplit('/').next().filter(|name| !name.is_empty())
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DevicePath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle state of a load request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Looking the firmware name up in the search path.
    Resolving,
    /// Driving the attribute handshake.
    Loading,
    /// Waiting for the firmware file to appear.
    Deferred,
    /// Image handed over and committed.
    Committed,
    /// Load aborted via `loading=-1`.
    Aborted,
    /// Request withdrawn by the kernel or the daemon shutting down.
    Cancelled,
}

impl RequestState {
    /// Whether the state ends the request's life.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted | Self::Cancelled)
    }

    /// Whether `self -> next` is an edge of the request state machine.
    pub fn permits(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Resolving, Loading | Deferred | Aborted | Cancelled) => true,
            (Loading, Committed | Aborted | Cancelled) => true,
            // Aborted covers a lost watch or an exhausted attempt bound.
            (Deferred, Resolving | Aborted | Cancelled) => true,
            _ => false,
        }
    }

    /// Lower-case label used in log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolving => "resolving",
            Self::Loading => "loading",
            Self::Deferred => "deferred",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One kernel firmware request being serviced.
#[derive(Debug)]
pub struct LoadRequest {
    device_path: DevicePath,
    firmware_name: String,
    state: RequestState,
    attempt_count: u32,
    tentative: bool,
    pending_watch: Option<WatchToken>,
}

impl LoadRequest {
    /// Create a request in the `Resolving` state.
    pub fn new(device_path: DevicePath, firmware_name: impl Into<String>, tentative: bool) -> Self {
        Self {
            device_path,
            firmware_name: firmware_name.into(),
            state: RequestState::Resolving,
            attempt_count: 0,
            tentative,
            pending_watch: None,
        }
    }

    /// Key of the request in the manager registry.
    pub fn device_path(&self) -> &DevicePath {
        &self.device_path
    }

    /// Firmware name announced by the kernel.
    pub fn firmware_name(&self) -> &str {
        &self.firmware_name
    }

    /// Current state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Number of resolution attempts started so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether the request defers instead of aborting on a miss.
    pub fn tentative(&self) -> bool {
        self.tentative
    }

    /// Watch held while deferred.
    pub fn pending_watch(&self) -> Option<&WatchToken> {
        self.pending_watch.as_ref()
    }

    /// Count a new resolution attempt and return its ordinal.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.attempt_count
    }

    /// Move to `next`, returning the previous state.
    ///
    /// Entering `Deferred` is only possible through [`Self::defer`]; leaving
    /// it requires the watch to have been taken back with
    /// [`Self::take_watch`] first.
    pub fn transition(&mut self, next: RequestState) -> Result<RequestState, FirmwaredError> {
        let deferral_ok = match next {
            RequestState::Deferred => self.pending_watch.is_some(),
            _ => self.pending_watch.is_none(),
        };
        if !self.state.permits(next) || !deferral_ok {
            return Err(FirmwaredError::IllegalTransition {
                device_path: self.device_path.to_string(),
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    /// Park the request on `watch` until the firmware shows up.
    pub fn defer(&mut self, watch: WatchToken) -> Result<(), FirmwaredError> {
        if !self.state.permits(RequestState::Deferred) || self.pending_watch.is_some() {
            return Err(FirmwaredError::IllegalTransition {
                device_path: self.device_path.to_string(),
                from: self.state,
                to: RequestState::Deferred,
            });
        }
        self.pending_watch = Some(watch);
        self.transition(RequestState::Deferred).map(|_| ())
    }

    /// Hand the watch back so it can be released.
    pub fn take_watch(&mut self) -> Option<WatchToken> {
        self.pending_watch.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LoadRequest {
        LoadRequest::new(DevicePath::from("/devices/virtual/firmware/fw.bin"), "fw.bin", true)
    }

    #[test]
    fn device_path_helpers() {
        let path = DevicePath::from("/devices/virtual/firmware/brcm!fw.bin");
        assert_eq!(path.relative(), "devices/virtual/firmware/brcm!fw.bin");
        assert_eq!(path.device_name(), Some("brcm!fw.bin"));
        assert_eq!(DevicePath::from("/").device_name(), None);
    }

    #[test]
    fn load_path_reaches_committed() {
        let mut req = request();
        assert_eq!(req.transition(RequestState::Loading).unwrap(), RequestState::Resolving);
        req.transition(RequestState::Committed).unwrap();
        assert!(req.state().is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [RequestState::Committed, RequestState::Aborted, RequestState::Cancelled] {
            for next in [
                RequestState::Resolving,
                RequestState::Loading,
                RequestState::Deferred,
                RequestState::Committed,
                RequestState::Aborted,
                RequestState::Cancelled,
            ] {
                assert!(!terminal.permits(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn resolving_is_reachable_only_from_deferred() {
        for from in [
            RequestState::Resolving,
            RequestState::Loading,
            RequestState::Committed,
            RequestState::Aborted,
            RequestState::Cancelled,
        ] {
            assert!(!from.permits(RequestState::Resolving));
        }
        assert!(RequestState::Deferred.permits(RequestState::Resolving));
    }

    #[test]
    fn deferral_requires_a_watch() {
        let mut req = request();
        let err = req.transition(RequestState::Deferred).unwrap_err();
        assert!(matches!(err, FirmwaredError::IllegalTransition { .. }));
        assert_eq!(req.state(), RequestState::Resolving);
    }

    #[test]
    fn deferred_request_must_hand_back_its_watch() {
        let mut req = request();
        let path = req.device_path().clone();
        req.defer(WatchToken::detached(7, path.clone())).unwrap();
        assert_eq!(req.state(), RequestState::Deferred);
        assert_eq!(req.pending_watch().map(WatchToken::id), Some(7));
        assert!(req.defer(WatchToken::detached(8, path)).is_err());

        assert!(req.transition(RequestState::Resolving).is_err());
        let token = req.take_watch().unwrap();
        assert_eq!(token.id(), 7);
        req.transition(RequestState::Resolving).unwrap();
        assert_eq!(req.state(), RequestState::Resolving);
    }

    #[test]
    fn attempts_are_counted() {
        let mut req = request();
        assert_eq!(req.begin_attempt(), 1);
        assert_eq!(req.begin_attempt(), 2);
        assert_eq!(req.attempt_count(), 2);
    }
}
