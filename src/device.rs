// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the device bring-up collaborator.
//!
//! Bring-up is chip specific and happens outside of this crate. The exerciser only needs to know
//! that the device is ready; the bring-up itself gets its knobs through an explicit
//! [`DeviceConfig`].

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Gate the exerciser checks before submitting anything.
pub trait DeviceReady {
    fn is_ready(&self) -> bool;
}

/// Bring-up options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Number of encode engines to bring up.
    pub num_engines: usize,
    /// Clock the engines from their private PLL instead of the shared one.
    pub private_pll: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            num_engines: 1,
            private_pll: false,
        }
    }
}

pub trait DeviceBringUp: DeviceReady {
    /// Runs the chip-specific initialization sequence.
    fn bring_up(&mut self, config: &DeviceConfig) -> anyhow::Result<()>;
}

/// A device-ready signal that can be raised from anywhere.
#[derive(Clone, Debug, Default)]
pub struct ReadyFlag(Arc<AtomicBool>);

impl ReadyFlag {
    pub fn new(ready: bool) -> Self {
        Self(Arc::new(AtomicBool::new(ready)))
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Release)
    }
}

impl DeviceReady for ReadyFlag {
    fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Bring-up of the software engines: nothing to program, the device is ready once brought up.
#[derive(Debug, Default)]
pub struct SoftwareDevice {
    ready: ReadyFlag,
    config: Option<DeviceConfig>,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Default::default()
    }

    /// Configuration the device was brought up with.
    pub fn config(&self) -> Option<&DeviceConfig> {
        self.config.as_ref()
    }
}

impl DeviceReady for SoftwareDevice {
    fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }
}

impl DeviceBringUp for SoftwareDevice {
    fn bring_up(&mut self, config: &DeviceConfig) -> anyhow::Result<()> {
        anyhow::ensure!(config.num_engines > 0, "at least one engine is required");
        log::info!(
            "bringing up {} software engines (private PLL: {})",
            config.num_engines,
            config.private_pll
        );

        self.config = Some(config.clone());
        self.ready.set(true);
        Ok(())
    }
}
