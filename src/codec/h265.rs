// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::CodecClass;
use crate::codec::CodecVariant;
use crate::refs::Direction;
use crate::refs::Family;

/// H.265 consumes the reference lists and the temporal motion vector prediction buffers.
pub struct H265;

impl CodecVariant for H265 {
    fn class(&self) -> CodecClass {
        CodecClass::H265
    }

    fn control_structure_size(&self) -> usize {
        768
    }

    fn families(&self) -> &'static [Family] {
        &[
            Family::RefPicList,
            Family::MotionVectorPrediction(Direction::In),
            Family::MotionVectorPrediction(Direction::Out),
        ]
    }
}
