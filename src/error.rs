// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Error taxonomy shared by every firmwared component.
// Author: Lukas Bower

//! Errors surfaced by firmwared components.
//!
//! Only the initialization variants ever reach the process boundary; the
//! rest are scoped to a single load request and end up in the log.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::request::RequestState;

/// Errors raised while decoding a raw uevent record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The record carried no `KEY=VALUE` pairs at all.
    #[error("empty record")]
    Empty,
    /// A mandatory key was absent.
    #[error("missing {0} key")]
    MissingKey(&'static str),
    /// A recognised key carried bytes that are not UTF-8.
    #[error("{0} value is not valid UTF-8")]
    InvalidUtf8(&'static str),
    /// `SEQNUM` did not parse as an unsigned integer.
    #[error("invalid SEQNUM {0:?}")]
    InvalidSequence(String),
    /// `DEVPATH` was relative or tried to escape the sysfs root.
    #[error("invalid DEVPATH {0:?}")]
    InvalidDevicePath(String),
}

/// Errors surfaced by firmwared operations.
#[derive(Debug, Error)]
pub enum FirmwaredError {
    /// The kernel uevent channel could not be opened or bound.
    #[error("open kernel uevent channel: {0}")]
    EventChannel(#[source] io::Error),
    /// The readiness multiplexer or termination descriptor failed.
    #[error("event multiplexer: {0}")]
    Multiplexer(#[source] io::Error),
    /// The inotify instance could not be created or read.
    #[error("filesystem watch channel: {0}")]
    WatchInit(#[source] io::Error),
    /// None of the search directories could be watched for a deferred name.
    #[error("no search directory can be watched for {name}")]
    WatchRegistration {
        /// Firmware name the watch was requested for.
        name: String,
    },
    /// Opening or writing a kernel request attribute failed.
    #[error("{attribute} attribute of {}: {source}", .dir.display())]
    Attribute {
        /// Request directory holding the attribute.
        dir: PathBuf,
        /// Attribute name (`loading` or `data`).
        attribute: &'static str,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// Reading the resolved firmware image failed.
    #[error("firmware image {}: {source}", .path.display())]
    FirmwareImage {
        /// Resolved image path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// A raw uevent record could not be decoded.
    #[error("malformed uevent: {0}")]
    Decode(#[from] DecodeError),
    /// No usable firmware name could be recovered for a request.
    #[error("no usable firmware name for {device_path}")]
    FirmwareName {
        /// Device path of the dropped request.
        device_path: String,
    },
    /// A request state change outside the permitted edges.
    #[error("illegal transition {from} -> {to} for {device_path}")]
    IllegalTransition {
        /// Device path of the request.
        device_path: String,
        /// State the request was in.
        from: RequestState,
        /// State that was requested.
        to: RequestState,
    },
    /// The attempt bound configured for the daemon was exceeded.
    #[error("{device_path} exceeded {limit} resolution attempts")]
    AttemptsExhausted {
        /// Device path of the request.
        device_path: String,
        /// Configured bound.
        limit: u32,
    },
    /// Configuration values failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The configuration file could not be read or parsed.
    #[error("configuration file {}: {message}", .path.display())]
    ConfigFile {
        /// Path of the configuration file.
        path: PathBuf,
        /// Reader or parser message.
        message: String,
    },
}

impl FirmwaredError {
    pub(crate) fn attribute(dir: impl Into<PathBuf>, attribute: &'static str, source: io::Error) -> Self {
        Self::Attribute {
            dir: dir.into(),
            attribute,
            source,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
