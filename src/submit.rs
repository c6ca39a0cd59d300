// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recording of the command sequence of one frame on one engine.

use std::sync::Arc;

use thiserror::Error;

use crate::backend::BindPoint;
use crate::backend::Command;
use crate::backend::ControlParam;
use crate::backend::QueueError;
use crate::codec::CodecClass;
use crate::codec::CodecRegistry;
use crate::codec::CodecVariant;
use crate::codec::ReferenceSource;
use crate::codec::StatusLayout;
use crate::context::BufferKind;
use crate::context::ContextError;
use crate::context::EngineContext;
use crate::refs::Family;
use crate::refs::IndirectionTables;
use crate::refs::RefSlot;
use crate::refs::ResolvedFamily;
use crate::stream::StreamCatalog;
use crate::stream::StreamDescriptor;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("{0:?} is not allocated for this engine")]
    ResourceNotBound(BufferKind),
    #[error("codec {0:?} has no registered variant")]
    UnsupportedCodec(CodecClass),
    #[error("stream {0} is not in the catalog")]
    UnknownStream(usize),
    #[error("stream {stream} has no frame {frame}")]
    UnknownFrame { stream: usize, frame: usize },
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<ContextError> for SubmitError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::ResourceNotBound(kind) => SubmitError::ResourceNotBound(kind),
            ContextError::UnsupportedCodec(codec) => SubmitError::UnsupportedCodec(codec),
            ContextError::Queue(err) => SubmitError::Queue(err),
        }
    }
}

pub type SubmitResult<T> = Result<T, SubmitError>;

/// Everything resolved for one submission before a single command is recorded.
#[derive(Clone, Debug)]
pub struct FrameSubmission {
    pub codec: CodecClass,
    pub output_slot: RefSlot,
    /// Resolved slots of the families the codec consumes. Families unused for the frame are
    /// left out.
    pub families: Vec<ResolvedFamily>,
    /// Reference picture list of the frame, also for codecs that derive extra references from it.
    pub ref_pic_list: ResolvedFamily,
    pub setup_offset: usize,
    pub setup_size: usize,
}

impl FrameSubmission {
    fn plan(
        desc: &StreamDescriptor,
        tables: &IndirectionTables,
        variant: &dyn CodecVariant,
        stream: usize,
        frame: usize,
    ) -> Self {
        let families = variant
            .families()
            .iter()
            .map(|family| tables.resolve_frame(*family, stream, frame))
            .filter(|resolved| !resolved.is_unused())
            .collect();

        let setup_size = variant.control_structure_size();

        Self {
            codec: variant.class(),
            output_slot: desc.output_picture.get(frame).copied().unwrap_or_default(),
            families,
            ref_pic_list: tables.resolve_frame(Family::RefPicList, stream, frame),
            setup_offset: frame * setup_size,
            setup_size,
        }
    }

    /// Checks that `ctx` has every buffer the plan binds.
    fn check(&self, ctx: &EngineContext, variant: &dyn CodecVariant) -> SubmitResult<()> {
        let capacity = ctx.pool().capacity();
        let check_slot = |physical: usize| {
            if physical < capacity {
                Ok(())
            } else {
                Err(SubmitError::ResourceNotBound(BufferKind::Reference(physical)))
            }
        };

        if let Some(physical) = self.output_slot.physical() {
            check_slot(physical)?;
        }

        for resolved in &self.families {
            for (_, physical) in resolved.used() {
                match resolved.family {
                    Some(Family::RefPicList) | None => check_slot(physical)?,
                    Some(family) => {
                        ctx.aux_slot(family.kind(), physical)?;
                    }
                }
            }
        }

        for aux in variant.aux_buffers() {
            ctx.aux_buffer(*aux)?;
        }

        if self.setup_offset + self.setup_size > ctx.picture_setup().len() {
            return Err(SubmitError::ResourceNotBound(BufferKind::PictureSetup));
        }

        Ok(())
    }
}

/// Result of a successful submission.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Submitted {
    /// Value the engine writes to the completion token once done with the frame.
    pub token: u64,
    pub output_slot: RefSlot,
    pub setup_offset: usize,
    /// Status structure layout to read back the outcome with.
    pub layout: StatusLayout,
}

/// Records frames of the catalog's streams on engine contexts.
pub struct FrameSubmitter<'a> {
    catalog: &'a StreamCatalog,
    tables: &'a IndirectionTables,
    registry: &'a CodecRegistry,
}

impl<'a> FrameSubmitter<'a> {
    pub fn new(
        catalog: &'a StreamCatalog,
        tables: &'a IndirectionTables,
        registry: &'a CodecRegistry,
    ) -> Self {
        Self {
            catalog,
            tables,
            registry,
        }
    }

    /// Records the command sequence of `frame` of `stream` on `ctx`, programmed as `codec`.
    ///
    /// Nothing is flushed. On error, the commands recorded so far are discarded so the engine
    /// never sees a partial frame.
    pub fn submit_frame(
        &self,
        stream: usize,
        frame: usize,
        ctx: &mut EngineContext,
        codec: CodecClass,
    ) -> SubmitResult<Submitted> {
        let variant = self
            .registry
            .get(codec)
            .map(Arc::clone)
            .ok_or(SubmitError::UnsupportedCodec(codec))?;
        let desc = self.catalog.get(stream).ok_or(SubmitError::UnknownStream(stream))?;
        if frame >= desc.num_frames() {
            return Err(SubmitError::UnknownFrame { stream, frame });
        }

        let plan = FrameSubmission::plan(desc, self.tables, variant.as_ref(), stream, frame);
        plan.check(ctx, variant.as_ref())?;

        match self.record(desc, &plan, variant.as_ref(), stream, frame, ctx) {
            Ok(submitted) => {
                log::trace!(
                    "engine {}: {} frame {} recorded, output {}, token {:#x}",
                    ctx.engine_id(),
                    desc.name,
                    frame,
                    plan.output_slot,
                    submitted.token
                );
                Ok(submitted)
            }
            Err(e) => {
                ctx.queue().discard();
                Err(e)
            }
        }
    }

    fn record(
        &self,
        desc: &StreamDescriptor,
        plan: &FrameSubmission,
        variant: &dyn CodecVariant,
        stream: usize,
        frame: usize,
        ctx: &mut EngineContext,
    ) -> SubmitResult<Submitted> {
        // Control parameters.
        let params = [
            ControlParam::Application(plan.codec.application_id()),
            ControlParam::ForceOutputPicture(desc.force_output),
            ControlParam::RateControl {
                mode: desc.rate_control.mode_id(),
                value: desc.rate_control.value(),
            },
            ControlParam::StreamFlags(desc.flags),
        ];
        for param in params {
            ctx.push(Command::SetParam(param))?;
        }

        // Input picture and state buffers.
        ctx.bind_input_picture()?;
        ctx.bind_state_buffers()?;

        // Output reference.
        if let Some(physical) = plan.output_slot.physical() {
            match variant.reference_source() {
                ReferenceSource::Reconstructed => ctx.bind_output_reference(physical)?,
                ReferenceSource::ExternalInput => ctx.copy_input_into_reference(physical)?,
            }
        }

        // Indirection families.
        for resolved in &plan.families {
            let family = resolved.family.unwrap_or(Family::RefPicList);
            for (logical, physical) in resolved.used() {
                match family {
                    Family::RefPicList => ctx.bind_input_reference(physical, logical)?,
                    family => ctx.bind_aux_slot(family, logical, physical)?,
                }
            }
        }

        // Codec specific buffers.
        variant.bind_extra_references(ctx, &plan.ref_pic_list)?;
        variant.bind_aux_buffers(ctx)?;

        // Control structure of the frame.
        let setup = ctx.picture_setup().range(plan.setup_offset, plan.setup_size);
        ctx.bind(BindPoint::PictureSetup, setup)?;

        let token = ctx.next_token(stream, frame);
        ctx.push(Command::Execute)?;
        ctx.push(Command::WriteToken(token))?;

        Ok(Submitted {
            token,
            output_slot: plan.output_slot,
            setup_offset: plan.setup_offset,
            layout: variant.status_layout(),
        })
    }
}
