// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture pools.
//!
//! Hardware generations lay out reference pictures differently: older engines want separate
//! luma and chroma surfaces per reference while newer ones take a single NV12 surface. Both
//! layouts implement [`ReferencePool`], so the submission code never needs to know which one it
//! is talking to.

use crate::backend::BindPoint;
use crate::backend::Command;
use crate::backend::CommandQueue;
use crate::backend::Plane;
use crate::buffer::DeviceBuffer;
use crate::context::BufferKind;
use crate::context::ContextError;
use crate::context::ContextResult;
use crate::nv12_frame_size;
use crate::nv12_luma_size;
use crate::Resolution;

/// Capabilities shared by every reference pool layout.
pub trait ReferencePool: Send {
    /// Allocates `capacity` reference pictures of `resolution`, dropping any previous ones.
    fn init_reference_pool(&mut self, capacity: usize, resolution: Resolution);

    /// Releases all reference pictures.
    fn free_reference_pool(&mut self);

    fn capacity(&self) -> usize;

    /// Binds slot `physical` as the destination of the reconstructed picture.
    fn bind_output_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
    ) -> ContextResult<()>;

    /// Binds slot `physical` as entry `list_slot` of the reference list.
    fn bind_input_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
        list_slot: usize,
    ) -> ContextResult<()>;

    fn bind_last_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
    ) -> ContextResult<()>;

    fn bind_motion_compensation_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
    ) -> ContextResult<()>;

    /// Queues a copy of the NV12 `picture` into slot `physical`.
    fn copy_external_picture_into_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
        picture: &DeviceBuffer,
    ) -> ContextResult<()>;

    /// Every surface of the pool.
    fn surfaces(&self) -> Vec<DeviceBuffer>;
}

fn not_bound(physical: usize) -> ContextError {
    ContextError::ResourceNotBound(BufferKind::Reference(physical))
}

/// One NV12 surface per reference.
pub struct CombinedReferencePool {
    engine_id: usize,
    surfaces: Vec<DeviceBuffer>,
}

impl CombinedReferencePool {
    pub fn new(engine_id: usize) -> Self {
        Self {
            engine_id,
            surfaces: Vec::new(),
        }
    }

    fn bind(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
        point: fn(Plane) -> BindPoint,
    ) -> ContextResult<()> {
        let surface = self.surfaces.get(physical).ok_or_else(|| not_bound(physical))?;
        queue.push(Command::Bind(point(Plane::Combined), surface.whole()))?;
        Ok(())
    }
}

impl ReferencePool for CombinedReferencePool {
    fn init_reference_pool(&mut self, capacity: usize, resolution: Resolution) {
        let size = nv12_frame_size(resolution);
        self.surfaces = (0..capacity)
            .map(|slot| DeviceBuffer::new(format!("engine{}/ref[{}]", self.engine_id, slot), size))
            .collect();
    }

    fn free_reference_pool(&mut self) {
        log::trace!("engine {}: freeing {} references", self.engine_id, self.surfaces.len());
        self.surfaces.clear();
    }

    fn capacity(&self) -> usize {
        self.surfaces.len()
    }

    fn bind_output_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
    ) -> ContextResult<()> {
        self.bind(queue, physical, BindPoint::OutputReference)
    }

    fn bind_input_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
        list_slot: usize,
    ) -> ContextResult<()> {
        let surface = self.surfaces.get(physical).ok_or_else(|| not_bound(physical))?;
        let point = BindPoint::InputReference {
            list_slot,
            plane: Plane::Combined,
        };
        queue.push(Command::Bind(point, surface.whole()))?;
        Ok(())
    }

    fn bind_last_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
    ) -> ContextResult<()> {
        self.bind(queue, physical, BindPoint::LastReference)
    }

    fn bind_motion_compensation_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
    ) -> ContextResult<()> {
        self.bind(queue, physical, BindPoint::MotionCompensationReference)
    }

    fn copy_external_picture_into_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
        picture: &DeviceBuffer,
    ) -> ContextResult<()> {
        let surface = self.surfaces.get(physical).ok_or_else(|| not_bound(physical))?;
        let len = surface.len().min(picture.len());
        queue.push(Command::Copy {
            src: picture.range(0, len),
            dst: surface.range(0, len),
        })?;
        Ok(())
    }

    fn surfaces(&self) -> Vec<DeviceBuffer> {
        self.surfaces.clone()
    }
}

/// Separate luma and chroma surfaces per reference.
pub struct SplitReferencePool {
    engine_id: usize,
    luma: Vec<DeviceBuffer>,
    chroma: Vec<DeviceBuffer>,
}

impl SplitReferencePool {
    pub fn new(engine_id: usize) -> Self {
        Self {
            engine_id,
            luma: Vec::new(),
            chroma: Vec::new(),
        }
    }

    fn planes(&self, physical: usize) -> ContextResult<(&DeviceBuffer, &DeviceBuffer)> {
        match (self.luma.get(physical), self.chroma.get(physical)) {
            (Some(luma), Some(chroma)) => Ok((luma, chroma)),
            _ => Err(not_bound(physical)),
        }
    }

    fn bind(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
        point: impl Fn(Plane) -> BindPoint,
    ) -> ContextResult<()> {
        let (luma, chroma) = self.planes(physical)?;
        queue.push(Command::Bind(point(Plane::Luma), luma.whole()))?;
        queue.push(Command::Bind(point(Plane::Chroma), chroma.whole()))?;
        Ok(())
    }
}

impl ReferencePool for SplitReferencePool {
    fn init_reference_pool(&mut self, capacity: usize, resolution: Resolution) {
        let luma_size = nv12_luma_size(resolution);
        let chroma_size = nv12_frame_size(resolution) - luma_size;

        self.luma = (0..capacity)
            .map(|slot| {
                DeviceBuffer::new(format!("engine{}/ref[{}].y", self.engine_id, slot), luma_size)
            })
            .collect();
        self.chroma = (0..capacity)
            .map(|slot| {
                DeviceBuffer::new(format!("engine{}/ref[{}].uv", self.engine_id, slot), chroma_size)
            })
            .collect();
    }

    fn free_reference_pool(&mut self) {
        log::trace!("engine {}: freeing {} references", self.engine_id, self.luma.len());
        self.luma.clear();
        self.chroma.clear();
    }

    fn capacity(&self) -> usize {
        self.luma.len().min(self.chroma.len())
    }

    fn bind_output_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
    ) -> ContextResult<()> {
        self.bind(queue, physical, BindPoint::OutputReference)
    }

    fn bind_input_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
        list_slot: usize,
    ) -> ContextResult<()> {
        self.bind(queue, physical, |plane| BindPoint::InputReference { list_slot, plane })
    }

    fn bind_last_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
    ) -> ContextResult<()> {
        self.bind(queue, physical, BindPoint::LastReference)
    }

    fn bind_motion_compensation_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
    ) -> ContextResult<()> {
        self.bind(queue, physical, BindPoint::MotionCompensationReference)
    }

    fn copy_external_picture_into_reference(
        &self,
        queue: &mut dyn CommandQueue,
        physical: usize,
        picture: &DeviceBuffer,
    ) -> ContextResult<()> {
        let (luma, chroma) = self.planes(physical)?;
        let luma_len = luma.len().min(picture.len());
        let chroma_len = chroma.len().min(picture.len() - luma_len);

        queue.push(Command::Copy {
            src: picture.range(0, luma_len),
            dst: luma.range(0, luma_len),
        })?;
        queue.push(Command::Copy {
            src: picture.range(luma_len, chroma_len),
            dst: chroma.range(0, chroma_len),
        })?;
        Ok(())
    }

    fn surfaces(&self) -> Vec<DeviceBuffer> {
        self.luma.iter().chain(self.chroma.iter()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::software::SoftwareEngine;
    use crate::buffer::CompletionToken;

    fn pools() -> Vec<Box<dyn ReferencePool>> {
        let mut pools: Vec<Box<dyn ReferencePool>> = vec![
            Box::new(CombinedReferencePool::new(0)),
            Box::new(SplitReferencePool::new(0)),
        ];
        for pool in pools.iter_mut() {
            pool.init_reference_pool(2, Resolution::from((16, 16)));
        }

        pools
    }

    #[test]
    fn capacity_and_free() {
        for mut pool in pools() {
            assert_eq!(pool.capacity(), 2);
            let total: usize = pool.surfaces().iter().map(DeviceBuffer::len).sum();
            assert_eq!(total, 2 * 384);

            pool.free_reference_pool();
            assert_eq!(pool.capacity(), 0);
            assert!(pool.surfaces().is_empty());
        }
    }

    #[test]
    fn out_of_range_slot_is_not_bound() {
        for pool in pools() {
            let mut queue = SoftwareEngine::new(0, Default::default());
            assert!(matches!(
                pool.bind_output_reference(&mut queue, 2),
                Err(ContextError::ResourceNotBound(BufferKind::Reference(2)))
            ));
            assert!(pool.bind_input_reference(&mut queue, 1, 0).is_ok());
        }
    }

    #[test]
    fn external_copy_lands_in_slot() {
        for pool in pools() {
            let token = CompletionToken::new();
            let mut queue = SoftwareEngine::new(0, Default::default());
            queue.bind_completion_token(token);

            let picture = DeviceBuffer::new("picture", 384);
            picture.fill(0x77);

            pool.copy_external_picture_into_reference(&mut queue, 1, &picture)
                .unwrap();
            queue.push(Command::WriteToken(1)).unwrap();
            queue.flush().unwrap();
            assert!(queue.wait_idle(Duration::from_secs(5)).unwrap());

            let copied: Vec<u8> = pool
                .surfaces()
                .iter()
                .filter(|s| s.label().contains("ref[1]"))
                .flat_map(DeviceBuffer::snapshot)
                .collect();
            assert_eq!(copied, vec![0x77; 384]);
        }
    }
}
