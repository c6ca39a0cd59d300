// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec classes and their engine programming variants.
//!
//! Everything that differs between codecs during frame submission lives behind
//! [`CodecVariant`]. The [`CodecRegistry`] maps a [`CodecClass`] to its variant; supporting a new
//! codec means registering a new variant.

pub mod av1;
pub mod h264;
pub mod h265;
pub mod optical_flow;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use enumn::N;

use crate::context::ContextResult;
use crate::context::EngineContext;
use crate::refs::Family;
use crate::refs::ResolvedFamily;
use crate::sync::STATUS_ERROR_CODE_OFFSET;
use crate::sync::STATUS_OUTPUT_SIZE_OFFSET;

/// Codec classes, with their application identifier as discriminant.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum CodecClass {
    H264 = 1,
    H265 = 2,
    Av1 = 3,
    OpticalFlow = 4,
}

impl CodecClass {
    pub fn application_id(&self) -> u32 {
        *self as u32
    }
}

impl FromStr for CodecClass {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(CodecClass::H264),
            "h265" | "H265" | "hevc" | "HEVC" => Ok(CodecClass::H265),
            "av1" | "AV1" => Ok(CodecClass::Av1),
            "of" | "optical-flow" => Ok(CodecClass::OpticalFlow),
            _ => Err("unrecognized codec. Valid values: h264, h265, av1, optical-flow"),
        }
    }
}

/// Codec-specific buffers outside of the indirection families.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuxBuffer {
    /// Symbol counters of probability-adaptive codecs.
    ProbabilityCounters,
    /// External motion hints consumed by optical flow.
    ExternalHint,
}

/// Where a frame's output reference picture comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReferenceSource {
    /// The engine writes the reconstructed picture.
    Reconstructed,
    /// The input picture itself is copied into the slot.
    ExternalInput,
}

/// Location of the fields of the codec's status structure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusLayout {
    pub output_size_offset: usize,
    /// Not every engine reports an error code.
    pub error_code_offset: Option<usize>,
}

impl Default for StatusLayout {
    fn default() -> Self {
        Self {
            output_size_offset: STATUS_OUTPUT_SIZE_OFFSET,
            error_code_offset: Some(STATUS_ERROR_CODE_OFFSET),
        }
    }
}

/// How a codec class is programmed into an engine.
pub trait CodecVariant: Send + Sync {
    fn class(&self) -> CodecClass;

    /// Size of one frame's control structure in the picture-setup buffer.
    fn control_structure_size(&self) -> usize;

    /// Indirection families the codec consumes.
    fn families(&self) -> &'static [Family];

    /// Extra buffers the codec needs on every frame.
    fn aux_buffers(&self) -> &'static [AuxBuffer] {
        &[]
    }

    fn reference_source(&self) -> ReferenceSource {
        ReferenceSource::Reconstructed
    }

    fn status_layout(&self) -> StatusLayout {
        Default::default()
    }

    /// Binds the codec's extra buffers.
    fn bind_aux_buffers(&self, ctx: &mut EngineContext) -> ContextResult<()> {
        for aux in self.aux_buffers() {
            ctx.bind_aux_buffer(*aux)?;
        }

        Ok(())
    }

    /// Binds references with a codec-specific role, derived from the frame's resolved
    /// reference list.
    fn bind_extra_references(
        &self,
        _ctx: &mut EngineContext,
        _refs: &ResolvedFamily,
    ) -> ContextResult<()> {
        Ok(())
    }
}

/// Maps codec classes to their variants.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    variants: BTreeMap<CodecClass, Arc<dyn CodecVariant>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// A registry with every codec supported by this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(h264::H264));
        registry.register(Arc::new(h265::H265));
        registry.register(Arc::new(av1::Av1));
        registry.register(Arc::new(optical_flow::OpticalFlow));

        registry
    }

    /// Registers `variant`, replacing any previous variant of the same class.
    pub fn register(&mut self, variant: Arc<dyn CodecVariant>) {
        log::trace!("registering codec variant {:?}", variant.class());
        self.variants.insert(variant.class(), variant);
    }

    pub fn get(&self, class: CodecClass) -> Option<&Arc<dyn CodecVariant>> {
        self.variants.get(&class)
    }

    pub fn classes(&self) -> impl Iterator<Item = CodecClass> + '_ {
        self.variants.keys().copied()
    }
}
