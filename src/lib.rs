// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Library root for the firmwared firmware loading daemon.
// Author: Lukas Bower
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! firmwared services the Linux kernel's user-space firmware fallback.
//!
//! When a driver requests firmware the kernel cannot find itself, it creates
//! a request directory under `/sys/devices/.../firmware/<name>` and emits a
//! `SUBSYSTEM=firmware` uevent. firmwared resolves the name against its
//! search path and feeds the image through the `loading`/`data` attributes,
//! or, in tentative mode, waits until the file shows up.

/// Daemon configuration and defaults.
pub mod config;
/// Readiness loop binding the event sources to the manager.
pub mod daemon;
/// Error types.
pub mod error;
/// Request orchestrator.
pub mod manager;
/// Load request record and state machine.
pub mod request;
/// Firmware name resolution.
pub mod resolver;
mod sys;
/// Attribute handshake with the kernel.
pub mod sysfs;
/// Kernel uevent adapter.
pub mod uevent;
/// Deferral watcher for not-yet-present firmware.
pub mod watcher;

pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use error::{DecodeError, FirmwaredError};
pub use manager::Manager;
pub use request::{DevicePath, LoadRequest, RequestState};
pub use resolver::{Resolution, SearchPath};
