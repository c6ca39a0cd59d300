// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Catalog of encode scenarios ("streams").

use crate::codec::CodecClass;
use crate::refs::FamilyKind;
use crate::refs::IndirectionTables;
use crate::refs::RefSlot;
use crate::RateControl;
use crate::Resolution;

/// Stream flag: the engine only runs motion estimation, no picture is reconstructed.
pub const FLAG_MOTION_ESTIMATION_ONLY: u32 = 1 << 0;
/// Stream flag: every frame is coded as a key frame candidate.
pub const FLAG_FORCE_INTRA_REFRESH: u32 = 1 << 1;

/// Description of one scenario.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub name: &'static str,
    pub codec: CodecClass,
    pub resolution: Resolution,
    pub rate_control: RateControl,
    /// Whether the engine must output a picture for every frame.
    pub force_output: bool,
    /// Per-scenario override flags, passed verbatim to the engine.
    pub flags: u32,
    /// For every frame, the reference pool slot receiving the frame's picture.
    pub output_picture: Vec<RefSlot>,
}

impl StreamDescriptor {
    pub fn num_frames(&self) -> usize {
        self.output_picture.len()
    }

    /// Returns one past the highest pool slot the stream at index `stream` of the catalog uses,
    /// either as output picture or through any indirection family.
    pub fn required_pool_slots(&self, tables: &IndirectionTables, stream: usize) -> usize {
        let outputs = self
            .output_picture
            .iter()
            .filter_map(RefSlot::physical)
            .map(|p| p + 1)
            .max()
            .unwrap_or(0);

        [
            FamilyKind::RefPicList,
            FamilyKind::Colocated,
            FamilyKind::MotionVectorPrediction,
            FamilyKind::Temporal,
        ]
        .into_iter()
        .map(|kind| tables.required_slots(kind, stream))
        .fold(outputs, usize::max)
    }
}

/// An ordered, immutable list of streams.
#[derive(Clone, Debug, Default)]
pub struct StreamCatalog {
    streams: Vec<StreamDescriptor>,
}

const P0: RefSlot = RefSlot::Physical(0);
const P1: RefSlot = RefSlot::Physical(1);
const P2: RefSlot = RefSlot::Physical(2);
const P3: RefSlot = RefSlot::Physical(3);
const UNUSED: RefSlot = RefSlot::Unused;

impl StreamCatalog {
    pub fn new(streams: Vec<StreamDescriptor>) -> Self {
        Self { streams }
    }

    /// The built-in scenarios, matching [`IndirectionTables::builtin`].
    pub fn builtin() -> Self {
        Self::new(vec![
            StreamDescriptor {
                name: "h264_ipp_320x240",
                codec: CodecClass::H264,
                resolution: Resolution::from((320, 240)),
                rate_control: RateControl::ConstantQuality(26),
                force_output: false,
                flags: 0,
                output_picture: vec![P0, P1, P2, P0],
            },
            StreamDescriptor {
                name: "h265_ipp_640x480",
                codec: CodecClass::H265,
                resolution: Resolution::from((640, 480)),
                rate_control: RateControl::ConstantBitrate(2_000_000),
                force_output: false,
                flags: 0,
                output_picture: vec![P0, P1, P2, P3, P0],
            },
            StreamDescriptor {
                name: "av1_lowdelay_352x288",
                codec: CodecClass::Av1,
                resolution: Resolution::from((352, 288)),
                rate_control: RateControl::ConstantQuality(128),
                force_output: true,
                flags: FLAG_FORCE_INTRA_REFRESH,
                output_picture: vec![P0, P1, P2, P3],
            },
            StreamDescriptor {
                name: "optical_flow_320x180",
                codec: CodecClass::OpticalFlow,
                resolution: Resolution::from((320, 180)),
                rate_control: RateControl::ConstantQuality(0),
                force_output: false,
                flags: 0,
                output_picture: vec![P0, P1, P0, P1],
            },
            StreamDescriptor {
                name: "h264_me_only_176x144",
                codec: CodecClass::H264,
                resolution: Resolution::from((176, 144)),
                rate_control: RateControl::ConstantQuality(30),
                force_output: false,
                flags: FLAG_MOTION_ESTIMATION_ONLY,
                output_picture: vec![UNUSED, UNUSED],
            },
        ])
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn get(&self, stream: usize) -> Option<&StreamDescriptor> {
        self.streams.get(stream)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Smallest resolution containing every stream's resolution.
    pub fn max_resolution(&self) -> Resolution {
        self.streams
            .iter()
            .fold(Resolution::default(), |acc, s| acc.union(s.resolution))
    }

    pub fn max_frames(&self) -> usize {
        self.streams.iter().map(StreamDescriptor::num_frames).max().unwrap_or(0)
    }

    /// Distinct codecs used by the catalog, in ascending order.
    pub fn codecs(&self) -> Vec<CodecClass> {
        let mut codecs: Vec<CodecClass> = self.streams.iter().map(|s| s.codec).collect();
        codecs.sort();
        codecs.dedup();
        codecs
    }
}
