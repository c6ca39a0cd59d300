// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-engine resources.
//!
//! An [`EngineContext`] owns everything one engine works with for the duration of a run: its
//! command queue, completion token, reference picture pool and every scratch buffer the codecs
//! of the run need. It is allocated once, sized for the worst-case stream, and cleared between
//! streams. Contexts never share memory, so engines can run fully overlapped.

pub mod pool;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;

use crate::backend::BindPoint;
use crate::backend::Command;
use crate::backend::CommandQueue;
use crate::backend::Plane;
use crate::backend::QueueError;
use crate::buffer::BufferRef;
use crate::buffer::CompletionToken;
use crate::buffer::DeviceBuffer;
use crate::codec::AuxBuffer;
use crate::codec::CodecClass;
use crate::codec::CodecRegistry;
use crate::context::pool::CombinedReferencePool;
use crate::context::pool::ReferencePool;
use crate::context::pool::SplitReferencePool;
use crate::nv12_frame_size;
use crate::nv12_luma_size;
use crate::refs::Family;
use crate::refs::FamilyKind;
use crate::refs::IndirectionTables;
use crate::stream::StreamCatalog;
use crate::sync::SyncStrategy;
use crate::sync::STATUS_STRUCT_SIZE;
use crate::Resolution;

const HISTORY_SIZE: usize = 4096;
const RATE_CONTROL_STATE_SIZE: usize = 1024;
const PROBABILITY_COUNTERS_SIZE: usize = 16 * 1024;

/// Buffers an engine context may own.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferKind {
    InputPicture,
    Status,
    History,
    RateControlState,
    Bitstream,
    PictureSetup,
    /// Slot of the reference picture pool.
    Reference(usize),
    /// Slot of one of the auxiliary family pools.
    AuxSlot(FamilyKind, usize),
    Aux(AuxBuffer),
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("{0:?} was never allocated for this engine")]
    ResourceNotBound(BufferKind),
    #[error("codec {0:?} has no registered variant")]
    UnsupportedCodec(CodecClass),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type ContextResult<T> = Result<T, ContextError>;

/// Hardware generations, which differ in how reference pictures are laid out in memory.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Generation {
    /// Separate luma and chroma surfaces per reference.
    SplitPlanes,
    /// One NV12 surface per reference.
    #[default]
    CombinedPlanes,
}

/// Static configuration of one engine context.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub engine_id: usize,
    pub generation: Generation,
    /// Largest resolution of any stream the engine will run.
    pub max_resolution: Resolution,
    /// Largest frame count of any stream the engine will run.
    pub max_frames: usize,
    /// Number of slots of the reference picture pool and of every auxiliary pool.
    pub pool_capacity: usize,
    /// Codecs whose working set must be allocated.
    pub codecs: Vec<CodecClass>,
    pub sync: SyncStrategy,
    pub sync_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: 0,
            generation: Default::default(),
            max_resolution: Resolution::from((320, 240)),
            max_frames: 1,
            pool_capacity: 1,
            codecs: Vec::new(),
            sync: Default::default(),
            sync_timeout: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Returns a configuration sized for the worst case of `catalog`.
    pub fn for_catalog(
        engine_id: usize,
        catalog: &StreamCatalog,
        tables: &IndirectionTables,
    ) -> Self {
        let pool_capacity = catalog
            .streams()
            .iter()
            .enumerate()
            .map(|(idx, desc)| desc.required_pool_slots(tables, idx))
            .max()
            .unwrap_or(0)
            .max(1);

        Self {
            engine_id,
            max_resolution: catalog.max_resolution(),
            max_frames: catalog.max_frames(),
            pool_capacity,
            codecs: catalog.codecs(),
            ..Default::default()
        }
    }
}

/// Size of one auxiliary family slot for `resolution`.
fn aux_slot_size(kind: FamilyKind, resolution: Resolution) -> usize {
    // One entry per 16x16 block.
    let blocks = ((resolution.width as usize + 15) / 16) * ((resolution.height as usize + 15) / 16);
    match kind {
        FamilyKind::RefPicList => 0,
        FamilyKind::Colocated => blocks * 16,
        FamilyKind::MotionVectorPrediction => blocks * 8,
        FamilyKind::Temporal => blocks * 4,
    }
}

pub struct EngineContext {
    config: EngineConfig,
    queue: Box<dyn CommandQueue>,
    token: CompletionToken,
    /// Number of tokens handed out so far.
    sequence: u64,
    pool: Box<dyn ReferencePool>,
    input: DeviceBuffer,
    status: DeviceBuffer,
    history: DeviceBuffer,
    rate_control: DeviceBuffer,
    bitstream: DeviceBuffer,
    picture_setup: DeviceBuffer,
    aux_pools: BTreeMap<FamilyKind, Vec<DeviceBuffer>>,
    aux: BTreeMap<AuxBuffer, DeviceBuffer>,
}

impl EngineContext {
    /// Allocates the working set of every codec in `config.codecs` and binds the context to
    /// `queue`.
    pub fn new(
        config: EngineConfig,
        queue: Box<dyn CommandQueue>,
        registry: &CodecRegistry,
    ) -> ContextResult<Self> {
        let id = config.engine_id;
        let res = config.max_resolution;

        let mut kinds = BTreeSet::new();
        let mut aux_kinds = BTreeSet::new();
        let mut setup_size = 0;
        for codec in &config.codecs {
            let variant = registry
                .get(*codec)
                .ok_or(ContextError::UnsupportedCodec(*codec))?;
            kinds.extend(variant.families().iter().map(Family::kind));
            aux_kinds.extend(variant.aux_buffers().iter().copied());
            setup_size = setup_size.max(variant.control_structure_size());
        }

        let mut pool: Box<dyn ReferencePool> = match config.generation {
            Generation::SplitPlanes => Box::new(SplitReferencePool::new(id)),
            Generation::CombinedPlanes => Box::new(CombinedReferencePool::new(id)),
        };
        pool.init_reference_pool(config.pool_capacity, res);

        let aux_pools = kinds
            .into_iter()
            .filter(|kind| *kind != FamilyKind::RefPicList)
            .map(|kind| {
                let slots = (0..config.pool_capacity)
                    .map(|slot| {
                        DeviceBuffer::new(
                            format!("engine{}/{:?}[{}]", id, kind, slot),
                            aux_slot_size(kind, res),
                        )
                    })
                    .collect();
                (kind, slots)
            })
            .collect();

        let aux = aux_kinds
            .into_iter()
            .map(|kind| {
                let size = match kind {
                    AuxBuffer::ProbabilityCounters => PROBABILITY_COUNTERS_SIZE,
                    AuxBuffer::ExternalHint => {
                        aux_slot_size(FamilyKind::MotionVectorPrediction, res)
                    }
                };
                (kind, DeviceBuffer::new(format!("engine{}/{:?}", id, kind), size))
            })
            .collect();

        let mut ctx = Self {
            queue,
            token: CompletionToken::new(),
            sequence: 0,
            pool,
            input: DeviceBuffer::new(format!("engine{}/input", id), nv12_frame_size(res)),
            status: DeviceBuffer::new(format!("engine{}/status", id), STATUS_STRUCT_SIZE),
            history: DeviceBuffer::new(format!("engine{}/history", id), HISTORY_SIZE),
            rate_control: DeviceBuffer::new(format!("engine{}/rc", id), RATE_CONTROL_STATE_SIZE),
            bitstream: DeviceBuffer::new(format!("engine{}/bitstream", id), nv12_frame_size(res)),
            picture_setup: DeviceBuffer::new(
                format!("engine{}/picture_setup", id),
                setup_size * config.max_frames,
            ),
            aux_pools,
            aux,
            config,
        };
        ctx.bind_to_queue();

        log::debug!(
            "engine {}: context allocated for {:?}, {} reference slots, {:?}",
            id,
            ctx.config.codecs,
            ctx.config.pool_capacity,
            ctx.config.max_resolution
        );

        Ok(ctx)
    }

    fn bind_to_queue(&mut self) {
        self.queue.bind_completion_token(self.token.clone());
    }

    pub fn engine_id(&self) -> usize {
        self.config.engine_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&mut self) -> &mut dyn CommandQueue {
        self.queue.as_mut()
    }

    pub fn token(&self) -> &CompletionToken {
        &self.token
    }

    pub fn pool(&self) -> &dyn ReferencePool {
        self.pool.as_ref()
    }

    pub fn input_picture(&self) -> &DeviceBuffer {
        &self.input
    }

    pub fn status_buffer(&self) -> &DeviceBuffer {
        &self.status
    }

    pub fn bitstream(&self) -> &DeviceBuffer {
        &self.bitstream
    }

    pub fn picture_setup(&self) -> &DeviceBuffer {
        &self.picture_setup
    }

    /// Returns slot `physical` of the pool of `kind`.
    pub fn aux_slot(&self, kind: FamilyKind, physical: usize) -> ContextResult<&DeviceBuffer> {
        self.aux_pools
            .get(&kind)
            .and_then(|slots| slots.get(physical))
            .ok_or(ContextError::ResourceNotBound(BufferKind::AuxSlot(kind, physical)))
    }

    pub fn aux_buffer(&self, kind: AuxBuffer) -> ContextResult<&DeviceBuffer> {
        self.aux
            .get(&kind)
            .ok_or(ContextError::ResourceNotBound(BufferKind::Aux(kind)))
    }

    /// Returns the token value for a new submission of `frame` of `stream`.
    ///
    /// Values are unique per (stream, frame) and strictly increasing for the context.
    pub fn next_token(&mut self, stream: usize, frame: usize) -> u64 {
        self.sequence += 1;
        (self.sequence << 32) | ((stream as u64 & 0xffff) << 16) | (frame as u64 & 0xffff)
    }

    /// Every buffer owned by the context.
    pub fn buffers(&self) -> Vec<DeviceBuffer> {
        let mut buffers = vec![
            self.input.clone(),
            self.status.clone(),
            self.history.clone(),
            self.rate_control.clone(),
            self.bitstream.clone(),
            self.picture_setup.clone(),
        ];
        buffers.extend(self.aux_pools.values().flatten().cloned());
        buffers.extend(self.aux.values().cloned());
        buffers.extend(self.pool.surfaces());

        buffers
    }

    /// Fills every owned buffer and the completion token with `pattern`, so no stream can
    /// observe data left over by a previous one.
    pub fn clear(&mut self, pattern: u8) {
        log::trace!("engine {}: clearing with {:#04x}", self.engine_id(), pattern);
        for buffer in self.buffers() {
            buffer.fill(pattern);
        }
        self.token.fill(pattern);
    }

    pub fn push(&mut self, command: Command) -> ContextResult<()> {
        Ok(self.queue.push(command)?)
    }

    pub fn bind(&mut self, point: BindPoint, range: BufferRef) -> ContextResult<()> {
        self.push(Command::Bind(point, range))
    }

    /// Binds the input picture as a luma/chroma pair.
    pub fn bind_input_picture(&mut self) -> ContextResult<()> {
        let luma_size = nv12_luma_size(self.config.max_resolution);
        let chroma_size = self.input.len() - luma_size;
        let luma = self.input.range(0, luma_size);
        let chroma = self.input.range(luma_size, chroma_size);

        self.bind(BindPoint::InputPicture(Plane::Luma), luma)?;
        self.bind(BindPoint::InputPicture(Plane::Chroma), chroma)
    }

    /// Binds the status, history, rate control state and bitstream buffers.
    pub fn bind_state_buffers(&mut self) -> ContextResult<()> {
        let bindings = [
            (BindPoint::Status, self.status.whole()),
            (BindPoint::History, self.history.whole()),
            (BindPoint::RateControlState, self.rate_control.whole()),
            (BindPoint::Bitstream, self.bitstream.whole()),
        ];
        for (point, range) in bindings {
            self.bind(point, range)?;
        }

        Ok(())
    }

    pub fn bind_aux_slot(
        &mut self,
        family: Family,
        logical_slot: usize,
        physical: usize,
    ) -> ContextResult<()> {
        let range = self.aux_slot(family.kind(), physical)?.whole();
        self.bind(BindPoint::Aux { family, logical_slot }, range)
    }

    pub fn bind_aux_buffer(&mut self, kind: AuxBuffer) -> ContextResult<()> {
        let range = self.aux_buffer(kind)?.whole();
        let point = match kind {
            AuxBuffer::ProbabilityCounters => BindPoint::ProbabilityCounters,
            AuxBuffer::ExternalHint => BindPoint::ExternalHint,
        };
        self.bind(point, range)
    }

    pub fn bind_output_reference(&mut self, physical: usize) -> ContextResult<()> {
        self.pool.bind_output_reference(self.queue.as_mut(), physical)
    }

    pub fn bind_input_reference(&mut self, physical: usize, list_slot: usize) -> ContextResult<()> {
        self.pool.bind_input_reference(self.queue.as_mut(), physical, list_slot)
    }

    pub fn bind_last_reference(&mut self, physical: usize) -> ContextResult<()> {
        self.pool.bind_last_reference(self.queue.as_mut(), physical)
    }

    pub fn bind_motion_compensation_reference(&mut self, physical: usize) -> ContextResult<()> {
        self.pool.bind_motion_compensation_reference(self.queue.as_mut(), physical)
    }

    pub fn copy_input_into_reference(&mut self, physical: usize) -> ContextResult<()> {
        self.pool
            .copy_external_picture_into_reference(self.queue.as_mut(), physical, &self.input)
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        self.pool.free_reference_pool();
    }
}
