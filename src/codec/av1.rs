// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::AuxBuffer;
use crate::codec::CodecClass;
use crate::codec::CodecVariant;
use crate::context::ContextResult;
use crate::context::EngineContext;
use crate::refs::Direction;
use crate::refs::Family;
use crate::refs::ResolvedFamily;

/// AV1 is probability-adaptive: the symbol counters are carried from frame to frame. It also
/// keeps temporal motion buffers, and entry 0 of its reference list doubles as the LAST frame.
pub struct Av1;

impl CodecVariant for Av1 {
    fn class(&self) -> CodecClass {
        CodecClass::Av1
    }

    fn control_structure_size(&self) -> usize {
        1024
    }

    fn families(&self) -> &'static [Family] {
        &[
            Family::RefPicList,
            Family::Temporal(Direction::In),
            Family::Temporal(Direction::Out),
        ]
    }

    fn aux_buffers(&self) -> &'static [AuxBuffer] {
        &[AuxBuffer::ProbabilityCounters]
    }

    fn bind_extra_references(
        &self,
        ctx: &mut EngineContext,
        refs: &ResolvedFamily,
    ) -> ContextResult<()> {
        match refs.slots[0].physical() {
            Some(last) => ctx.bind_last_reference(last),
            None => Ok(()),
        }
    }
}
