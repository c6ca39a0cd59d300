// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Exerciser for multi-engine hardware video encoders.
//!
//! The crate drives every available encode engine through a catalog of scenarios (see
//! [`stream`]), resolves each frame's reference pictures through static indirection tables
//! (see [`refs`]), submits the per-frame command sequence to each engine's command queue (see
//! [`submit`]), waits for all engines to complete (see [`sync`]), and hands the produced
//! bitstream to a golden-value checker (see [`golden`]). The whole run is driven by
//! [`orchestrator::TestOrchestrator`].

pub mod backend;
pub mod buffer;
pub mod codec;
pub mod content;
pub mod context;
pub mod device;
pub mod golden;
pub mod orchestrator;
pub mod provider;
pub mod refs;
pub mod stream;
pub mod submit;
pub mod sync;
pub mod utils;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Returns the smallest resolution containing both `self` and `other`.
    pub fn union(&self, other: Self) -> Self {
        Self {
            width: self.width.max(other.width),
            height: self.height.max(other.height),
        }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Returns the size of a NV12 frame of `width`x`height` without any padding.
pub fn nv12_frame_size(resolution: Resolution) -> usize {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let y_size = width * height;
    // Chroma planes need to be aligned to 2.
    let uv_size = ((width + 1) / 2) * ((height + 1) / 2) * 2;

    y_size + uv_size
}

/// Returns the size of the luma plane of a NV12 frame of `width`x`height`.
pub fn nv12_luma_size(resolution: Resolution) -> usize {
    resolution.width as usize * resolution.height as usize
}

/// Specifies the rate control mode the engine is programmed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    /// The engine shall maintain the constant bitrate
    ConstantBitrate(u64),

    /// The engine shall keep its codec specific quality parameter constant (eg. QP for H.264),
    /// disregarding bitrate.
    ConstantQuality(u32),
}

impl RateControl {
    /// Numeric mode identifier written into the engine's control parameters.
    pub(crate) fn mode_id(&self) -> u32 {
        match self {
            RateControl::ConstantBitrate(_) => 1,
            RateControl::ConstantQuality(_) => 2,
        }
    }

    /// Bitrate target or quality value, depending on the mode.
    pub(crate) fn value(&self) -> u64 {
        match self {
            RateControl::ConstantBitrate(target) => *target,
            RateControl::ConstantQuality(qp) => *qp as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_sizes() {
        assert_eq!(nv12_frame_size(Resolution::from((16, 16))), 384);
        assert_eq!(nv12_luma_size(Resolution::from((16, 16))), 256);
        // Odd dimensions round chroma up.
        assert_eq!(nv12_frame_size(Resolution::from((3, 3))), 9 + 8);
    }

    #[test]
    fn resolution_union() {
        let a = Resolution::from((320, 240));
        let b = Resolution::from((176, 480));

        let u = a.union(b);
        assert_eq!(u, Resolution::from((320, 480)));
        assert!(u.can_contain(a));
        assert!(u.can_contain(b));
        assert!(!a.can_contain(b));
    }
}
