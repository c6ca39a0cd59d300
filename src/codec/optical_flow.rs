// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::AuxBuffer;
use crate::codec::CodecClass;
use crate::codec::CodecVariant;
use crate::codec::ReferenceSource;
use crate::codec::StatusLayout;
use crate::context::ContextResult;
use crate::context::EngineContext;
use crate::refs::Family;
use crate::refs::ResolvedFamily;
use crate::sync::STATUS_OUTPUT_SIZE_OFFSET;

/// Optical flow estimates motion between raw pictures: its references are copies of previous
/// inputs rather than reconstructed pictures, and it takes external motion hints.
pub struct OpticalFlow;

impl CodecVariant for OpticalFlow {
    fn class(&self) -> CodecClass {
        CodecClass::OpticalFlow
    }

    fn control_structure_size(&self) -> usize {
        256
    }

    fn families(&self) -> &'static [Family] {
        &[Family::RefPicList]
    }

    fn aux_buffers(&self) -> &'static [AuxBuffer] {
        &[AuxBuffer::ExternalHint]
    }

    fn reference_source(&self) -> ReferenceSource {
        ReferenceSource::ExternalInput
    }

    fn status_layout(&self) -> StatusLayout {
        // The flow engine has no error code field.
        StatusLayout {
            output_size_offset: STATUS_OUTPUT_SIZE_OFFSET,
            error_code_offset: None,
        }
    }

    fn bind_extra_references(
        &self,
        ctx: &mut EngineContext,
        refs: &ResolvedFamily,
    ) -> ContextResult<()> {
        match refs.slots[0].physical() {
            Some(previous) => ctx.bind_motion_compensation_reference(previous),
            None => Ok(()),
        }
    }
}
