// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::CodecClass;
use crate::codec::CodecVariant;
use crate::refs::Direction;
use crate::refs::Family;

/// H.264 consumes the reference lists and co-located data for direct prediction.
pub struct H264;

impl CodecVariant for H264 {
    fn class(&self) -> CodecClass {
        CodecClass::H264
    }

    fn control_structure_size(&self) -> usize {
        512
    }

    fn families(&self) -> &'static [Family] {
        &[
            Family::RefPicList,
            Family::Colocated(Direction::In),
            Family::Colocated(Direction::Out),
        ]
    }
}
