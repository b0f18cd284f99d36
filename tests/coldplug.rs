// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Verify pickup of firmware requests announced before startup.
// Author: Lukas Bower

mod common;

use std::fs;
use std::os::unix::fs::symlink;

use common::{add_event, Fixture};
use firmwared::{DevicePath, Manager, RequestState};

fn link_class_entry(fx: &Fixture, device: &DevicePath) {
    let class = fx.sysfs.path().join("class/firmware");
    fs::create_dir_all(&class).unwrap();
    let name = device.device_name().unwrap();
    symlink(fx.dir(device), class.join(name)).unwrap();
}

#[test]
fn pending_requests_are_picked_up() {
    let fx = Fixture::new();
    fx.install("early.bin", b"early");
    let early = fx.request("early.bin");
    let waiting = fx.request("brcm/waiting.bin");
    fs::create_dir_all(fx.firmware_dir().join("brcm")).unwrap();
    link_class_entry(&fx, &early);
    link_class_entry(&fx, &waiting);
    fs::write(fx.sysfs.path().join("class/firmware/timeout"), b"60\n").unwrap();
    let mut manager = Manager::new(fx.config(true)).unwrap();

    assert_eq!(manager.coldplug(), 2);

    assert_eq!(fx.loading(&early), "10");
    assert_eq!(fx.data(&early), b"early");
    assert_eq!(manager.state_of(&waiting), Some(RequestState::Deferred));
    assert_eq!(
        manager.request(&waiting).unwrap().firmware_name(),
        "brcm/waiting.bin"
    );
}

#[test]
fn coldplug_and_live_event_do_not_duplicate() {
    let fx = Fixture::new();
    let device = fx.request("dup.bin");
    link_class_entry(&fx, &device);
    let mut manager = Manager::new(fx.config(true)).unwrap();

    manager.handle_event(add_event(&device, "dup.bin"));
    manager.coldplug();

    assert_eq!(manager.len(), 1);
    assert_eq!(manager.pending_watches(), 1);
}

#[test]
fn missing_class_directory_finds_nothing() {
    let fx = Fixture::new();
    let mut manager = Manager::new(fx.config(false)).unwrap();
    assert_eq!(manager.coldplug(), 0);
    assert!(manager.is_empty());
}
