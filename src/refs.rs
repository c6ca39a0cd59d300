// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Static indirection tables mapping a codec's logical reference slots to physical slots of an
//! engine's buffer pools.
//!
//! Each [`Family`] has its own table, indexed by stream, frame and logical slot. Codecs consume
//! different subsets of the families, so a family that resolves to [`RefSlot::Unused`] for every
//! slot of a frame means the resource is not needed for that frame and must not be bound.

use std::fmt;

/// Number of logical slots per frame in every family.
pub const MAX_LOGICAL_SLOTS: usize = 4;

/// Raw entry for a slot that is not used by the frame.
pub const UNUSED: i8 = -2;
/// Raw entry for a slot that has not been referenced yet. Resolves like [`UNUSED`].
pub const NOT_REFERENCED: i8 = -1;

const U: i8 = UNUSED;
const N: i8 = NOT_REFERENCED;

/// Raw table entries of one frame.
pub type FrameEntries = [i8; MAX_LOGICAL_SLOTS];

/// A resolved slot: either unused or an index into one of the engine's pools.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum RefSlot {
    #[default]
    Unused,
    Physical(u8),
}

impl RefSlot {
    pub fn from_raw(raw: i8) -> Self {
        if raw >= 0 {
            RefSlot::Physical(raw as u8)
        } else {
            RefSlot::Unused
        }
    }

    pub fn physical(&self) -> Option<usize> {
        match self {
            RefSlot::Physical(idx) => Some(*idx as usize),
            RefSlot::Unused => None,
        }
    }

    pub fn is_unused(&self) -> bool {
        matches!(self, RefSlot::Unused)
    }
}

impl fmt::Display for RefSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefSlot::Unused => write!(f, "unused"),
            RefSlot::Physical(idx) => write!(f, "#{}", idx),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    In,
    Out,
}

/// The kind of pool a family indexes into.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FamilyKind {
    RefPicList,
    Colocated,
    MotionVectorPrediction,
    Temporal,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    /// Reference picture lists. Indexes into the reference picture pool.
    RefPicList,
    /// Co-located motion data.
    Colocated(Direction),
    /// Motion vector prediction data.
    MotionVectorPrediction(Direction),
    /// Temporal motion buffers.
    Temporal(Direction),
}

impl Family {
    pub const ALL: [Family; 7] = [
        Family::RefPicList,
        Family::Colocated(Direction::In),
        Family::Colocated(Direction::Out),
        Family::MotionVectorPrediction(Direction::In),
        Family::MotionVectorPrediction(Direction::Out),
        Family::Temporal(Direction::In),
        Family::Temporal(Direction::Out),
    ];

    fn index(&self) -> usize {
        match self {
            Family::RefPicList => 0,
            Family::Colocated(Direction::In) => 1,
            Family::Colocated(Direction::Out) => 2,
            Family::MotionVectorPrediction(Direction::In) => 3,
            Family::MotionVectorPrediction(Direction::Out) => 4,
            Family::Temporal(Direction::In) => 5,
            Family::Temporal(Direction::Out) => 6,
        }
    }

    pub fn kind(&self) -> FamilyKind {
        match self {
            Family::RefPicList => FamilyKind::RefPicList,
            Family::Colocated(_) => FamilyKind::Colocated,
            Family::MotionVectorPrediction(_) => FamilyKind::MotionVectorPrediction,
            Family::Temporal(_) => FamilyKind::Temporal,
        }
    }

    /// Returns the families of `kind`.
    pub fn of_kind(kind: FamilyKind) -> impl Iterator<Item = Family> {
        Family::ALL.into_iter().filter(move |f| f.kind() == kind)
    }
}

/// All resolved slots of one family for one frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedFamily {
    pub family: Option<Family>,
    pub slots: [RefSlot; MAX_LOGICAL_SLOTS],
}

impl ResolvedFamily {
    /// Whether the resource is not needed for this frame.
    pub fn is_unused(&self) -> bool {
        self.slots.iter().all(RefSlot::is_unused)
    }

    /// Iterates over the `(logical slot, physical index)` pairs that are in use.
    pub fn used(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(logical, slot)| slot.physical().map(|p| (logical, p)))
    }
}

/// Indirection table of one family, indexed by stream then frame.
#[derive(Clone, Debug, Default)]
struct FamilyTable(Vec<Vec<FrameEntries>>);

impl FamilyTable {
    fn entry(&self, stream: usize, frame: usize, slot: usize) -> i8 {
        self.0
            .get(stream)
            .and_then(|frames| frames.get(frame))
            .and_then(|entries| entries.get(slot))
            .copied()
            .unwrap_or(UNUSED)
    }
}

/// The full set of indirection tables, one per [`Family`].
#[derive(Clone, Debug, Default)]
pub struct IndirectionTables {
    tables: [FamilyTable; 7],
}

impl IndirectionTables {
    /// Tables where every lookup resolves to [`RefSlot::Unused`].
    pub fn empty() -> Self {
        Default::default()
    }

    /// Tables matching [`crate::stream::StreamCatalog::builtin`].
    pub fn builtin() -> Self {
        let mut tables = Self::empty();
        for (family, streams) in BUILTIN {
            for (stream, frames) in streams.iter().enumerate() {
                tables.set_stream(*family, stream, frames.to_vec());
            }
        }

        tables
    }

    /// Replaces the entries of `family` for `stream`.
    pub fn set_stream(&mut self, family: Family, stream: usize, frames: Vec<FrameEntries>) {
        let table = &mut self.tables[family.index()].0;
        if table.len() <= stream {
            table.resize(stream + 1, Vec::new());
        }
        table[stream] = frames;
    }

    /// Builder flavour of [`IndirectionTables::set_stream`].
    pub fn with_stream(mut self, family: Family, stream: usize, frames: Vec<FrameEntries>) -> Self {
        self.set_stream(family, stream, frames);
        self
    }

    /// Resolves `logical_slot` of `frame` in `stream` for `family`. Never fails: anything out of
    /// range resolves to [`RefSlot::Unused`].
    pub fn resolve(
        &self,
        family: Family,
        stream: usize,
        frame: usize,
        logical_slot: usize,
    ) -> RefSlot {
        let raw = self.tables[family.index()].entry(stream, frame, logical_slot);
        if raw == NOT_REFERENCED {
            log::trace!(
                "{:?} stream {} frame {} slot {} not referenced yet",
                family,
                stream,
                frame,
                logical_slot
            );
        }

        RefSlot::from_raw(raw)
    }

    /// Resolves every logical slot of `frame` in `stream` for `family`.
    pub fn resolve_frame(&self, family: Family, stream: usize, frame: usize) -> ResolvedFamily {
        let mut resolved = ResolvedFamily {
            family: Some(family),
            ..Default::default()
        };
        for (slot, out) in resolved.slots.iter_mut().enumerate() {
            *out = self.resolve(family, stream, frame, slot);
        }

        resolved
    }

    /// Returns one past the highest physical index `stream` uses in any family of `kind`.
    pub fn required_slots(&self, kind: FamilyKind, stream: usize) -> usize {
        Family::of_kind(kind)
            .filter_map(|family| self.tables[family.index()].0.get(stream))
            .flatten()
            .flatten()
            .filter_map(|raw| RefSlot::from_raw(*raw).physical())
            .map(|p| p + 1)
            .max()
            .unwrap_or(0)
    }
}

type BuiltinTable = (Family, &'static [&'static [FrameEntries]]);

/// Raw tables for the built-in catalog. The outer index of each table is the stream index.
const BUILTIN: &[BuiltinTable] = &[
    (
        Family::RefPicList,
        &[
            // h264_ipp
            &[[U, U, U, U], [0, U, U, U], [1, 0, U, U], [2, 1, U, U]],
            // h265_ipp
            &[
                [U, U, U, U],
                [0, U, U, U],
                [1, 0, U, U],
                [2, 1, U, U],
                [3, 2, U, U],
            ],
            // av1_lowdelay
            &[[U, U, U, U], [0, U, U, U], [1, 0, U, U], [2, 1, 0, U]],
            // optical_flow
            &[[U, U, U, U], [0, U, U, U], [1, U, U, U], [0, U, U, U]],
            // h264_me_only
            &[[N, N, N, N], [N, N, N, N]],
        ],
    ),
    (
        Family::Colocated(Direction::In),
        &[&[[U, U, U, U], [0, U, U, U], [1, U, U, U], [2, U, U, U]]],
    ),
    (
        Family::Colocated(Direction::Out),
        &[&[[0, U, U, U], [1, U, U, U], [2, U, U, U], [0, U, U, U]]],
    ),
    (
        Family::MotionVectorPrediction(Direction::In),
        &[
            &[],
            &[
                [U, U, U, U],
                [0, U, U, U],
                [1, U, U, U],
                [2, U, U, U],
                [3, U, U, U],
            ],
        ],
    ),
    (
        Family::MotionVectorPrediction(Direction::Out),
        &[
            &[],
            &[
                [0, U, U, U],
                [1, U, U, U],
                [2, U, U, U],
                [3, U, U, U],
                [0, U, U, U],
            ],
        ],
    ),
    (
        Family::Temporal(Direction::In),
        &[
            &[],
            &[],
            &[[U, U, U, U], [0, U, U, U], [1, U, U, U], [2, U, U, U]],
        ],
    ),
    (
        Family::Temporal(Direction::Out),
        &[
            &[],
            &[],
            &[[0, U, U, U], [1, U, U, U], [2, U, U, U], [3, U, U, U]],
        ],
    ),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamCatalog;

    #[test]
    fn out_of_range_is_unused() {
        let tables = IndirectionTables::builtin();
        assert_eq!(tables.resolve(Family::RefPicList, 0, 1, 0), RefSlot::Physical(0));
        assert_eq!(tables.resolve(Family::RefPicList, 0, 1, MAX_LOGICAL_SLOTS), RefSlot::Unused);
        assert_eq!(tables.resolve(Family::RefPicList, 0, 100, 0), RefSlot::Unused);
        assert_eq!(tables.resolve(Family::RefPicList, 100, 0, 0), RefSlot::Unused);
        assert!(IndirectionTables::empty()
            .resolve_frame(Family::RefPicList, 0, 0)
            .is_unused());
    }

    #[test]
    fn both_sentinels_resolve_to_unused() {
        assert_eq!(RefSlot::from_raw(UNUSED), RefSlot::Unused);
        assert_eq!(RefSlot::from_raw(NOT_REFERENCED), RefSlot::Unused);
        assert_eq!(RefSlot::from_raw(3), RefSlot::Physical(3));

        let tables = IndirectionTables::builtin();
        // The motion-estimation-only stream is filled with "not referenced" entries.
        assert!(tables.resolve_frame(Family::RefPicList, 4, 1).is_unused());
    }

    #[test]
    fn resolve_frame_lists_used_slots() {
        let tables = IndirectionTables::builtin();
        let resolved = tables.resolve_frame(Family::RefPicList, 2, 3);
        assert_eq!(resolved.used().collect::<Vec<_>>(), vec![(0, 2), (1, 1), (2, 0)]);
        assert!(!resolved.is_unused());
    }

    #[test]
    fn resolved_indices_within_pool_capacity() {
        let catalog = StreamCatalog::builtin();
        let tables = IndirectionTables::builtin();

        for (stream, desc) in catalog.streams().iter().enumerate() {
            let capacity = desc.required_pool_slots(&tables, stream);
            for frame in 0..desc.num_frames() {
                for family in Family::ALL {
                    for slot in 0..MAX_LOGICAL_SLOTS {
                        if let Some(p) = tables.resolve(family, stream, frame, slot).physical() {
                            assert!(
                                p < capacity,
                                "{} frame {} {:?}: {} >= {}",
                                desc.name,
                                frame,
                                family,
                                p,
                                capacity
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn no_forward_references() {
        let catalog = StreamCatalog::builtin();
        let tables = IndirectionTables::builtin();

        let consumers = [
            (Family::RefPicList, None),
            (
                Family::Colocated(Direction::In),
                Some(Family::Colocated(Direction::Out)),
            ),
            (
                Family::MotionVectorPrediction(Direction::In),
                Some(Family::MotionVectorPrediction(Direction::Out)),
            ),
            (
                Family::Temporal(Direction::In),
                Some(Family::Temporal(Direction::Out)),
            ),
        ];

        for (stream, desc) in catalog.streams().iter().enumerate() {
            for (consumer, producer) in consumers {
                let mut produced = std::collections::BTreeSet::new();
                for frame in 0..desc.num_frames() {
                    for (_, p) in tables.resolve_frame(consumer, stream, frame).used() {
                        assert!(
                            p == 0 || produced.contains(&p),
                            "{} frame {} reads {:?} slot {} before it is produced",
                            desc.name,
                            frame,
                            consumer,
                            p
                        );
                    }

                    match producer {
                        Some(producer) => {
                            let out = tables.resolve_frame(producer, stream, frame);
                            produced.extend(out.used().map(|(_, p)| p));
                        }
                        None => produced.extend(desc.output_picture[frame].physical()),
                    }
                }
            }
        }
    }
}
