// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Source of the per-frame codec control structures.
//!
//! The exerciser does not interpret control structures: it copies whatever the provider returns
//! into the picture-setup buffer of every engine.

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::codec::CodecClass;
use crate::codec::CodecRegistry;

pub trait ControlStructureProvider {
    /// Returns the control structure of `frame` of `stream`. Its length must be the control
    /// structure size of `codec`.
    fn fill_control_structure(
        &self,
        stream: usize,
        frame: usize,
        codec: CodecClass,
    ) -> anyhow::Result<Vec<u8>>;
}

/// Provider generating deterministic control structures, for running without captured vectors.
pub struct SyntheticControlStructures {
    registry: CodecRegistry,
}

impl SyntheticControlStructures {
    const MAGIC: u32 = u32::from_le_bytes(*b"CTRL");

    pub fn new(registry: CodecRegistry) -> Self {
        Self { registry }
    }
}

impl ControlStructureProvider for SyntheticControlStructures {
    fn fill_control_structure(
        &self,
        stream: usize,
        frame: usize,
        codec: CodecClass,
    ) -> anyhow::Result<Vec<u8>> {
        let size = self
            .registry
            .get(codec)
            .map(|v| v.control_structure_size())
            .ok_or_else(|| anyhow::anyhow!("no control structure layout for {:?}", codec))?;
        anyhow::ensure!(size >= 16, "control structure of {:?} is too small", codec);

        let mut data = vec![0u8; size];
        LittleEndian::write_u32(&mut data[0..], Self::MAGIC);
        LittleEndian::write_u32(&mut data[4..], codec.application_id());
        LittleEndian::write_u32(&mut data[8..], stream as u32);
        LittleEndian::write_u32(&mut data[12..], frame as u32);
        for (i, b) in data[16..].iter_mut().enumerate() {
            *b = (i + frame * 31 + stream * 7) as u8;
        }

        Ok(data)
    }
}
