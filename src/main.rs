// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the firmwared daemon.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! firmwared - Linux firmware loader daemon.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use firmwared::{Daemon, DaemonConfig, SearchPath};
use log::debug;

/// CLI options for firmwared.
#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "Linux firmware loader daemon")]
struct Args {
    /// Defer loading of firmware that does not exist yet.
    #[arg(short, long, action = ArgAction::SetTrue)]
    tentative: bool,

    /// Firmware directory to search (repeat for more; replaces the default list).
    #[arg(short = 'd', long = "dir", value_name = "PATH")]
    dirs: Vec<PathBuf>,

    /// TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Mount point of sysfs.
    #[arg(long, value_name = "DIR")]
    sysfs_root: Option<PathBuf>,

    /// Give up on a request after this many resolution attempts.
    #[arg(long, value_name = "N")]
    max_attempts: Option<u32>,

    /// Increase log verbosity (repeat for trace output).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)?,
            None => DaemonConfig::default(),
        };
        if self.tentative {
            config.tentative = true;
        }
        if !self.dirs.is_empty() {
            config.search_path = SearchPath::new(self.dirs)?;
        }
        if let Some(root) = self.sysfs_root {
            config.sysfs_root = root;
        }
        if self.max_attempts.is_some() {
            config.max_attempts = self.max_attempts;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    let config = args.into_config().context("build daemon configuration")?;
    debug!("configuration: {config:?}");
    let daemon = Daemon::new(config).context("initialise firmwared")?;
    daemon.run().context("firmwared event loop")
}
