// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Golden-value checking of engine output.

use std::collections::BTreeMap;

/// Result of checking one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GoldenVerdict {
    Pass,
    /// The output differs from the golden value, with a description of the difference.
    Fail(String),
}

pub trait GoldenValidator {
    /// Checks the output of `frame` of `stream`.
    fn check_frame(&mut self, stream: usize, frame: usize, output: &[u8]) -> GoldenVerdict;
}

/// Golden values as CRC32 checksums of the frame output.
///
/// In capture mode, unknown frames are recorded and pass; otherwise they fail.
#[derive(Clone, Debug, Default)]
pub struct Crc32Goldens {
    goldens: BTreeMap<(usize, usize), u32>,
    capture: bool,
}

impl Crc32Goldens {
    pub fn new() -> Self {
        Default::default()
    }

    /// A table recording the checksum of every frame it has not seen yet.
    pub fn capturing() -> Self {
        Self {
            capture: true,
            ..Default::default()
        }
    }

    pub fn insert(&mut self, stream: usize, frame: usize, crc: u32) {
        self.goldens.insert((stream, frame), crc);
    }

    pub fn get(&self, stream: usize, frame: usize) -> Option<u32> {
        self.goldens.get(&(stream, frame)).copied()
    }

    /// Stops recording new values. Frames seen from now on must match.
    pub fn freeze(&mut self) {
        self.capture = false;
    }

    /// Iterates over `((stream, frame), crc)` in stream then frame order.
    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), u32)> + '_ {
        self.goldens.iter().map(|(k, v)| (*k, *v))
    }

    pub fn len(&self) -> usize {
        self.goldens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goldens.is_empty()
    }
}

impl GoldenValidator for Crc32Goldens {
    fn check_frame(&mut self, stream: usize, frame: usize, output: &[u8]) -> GoldenVerdict {
        let crc = crc32fast::hash(output);

        match self.get(stream, frame) {
            Some(expected) if expected == crc => GoldenVerdict::Pass,
            Some(expected) => GoldenVerdict::Fail(format!(
                "crc {:08x} != golden {:08x} ({} bytes)",
                crc,
                expected,
                output.len()
            )),
            None if self.capture => {
                log::debug!("capturing golden {:08x} for stream {} frame {}", crc, stream, frame);
                self.insert(stream, frame, crc);
                GoldenVerdict::Pass
            }
            None => GoldenVerdict::Fail(format!(
                "no golden value for stream {} frame {}",
                stream, frame
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_then_check() {
        let mut goldens = Crc32Goldens::capturing();
        assert_eq!(goldens.check_frame(0, 0, b"frame0"), GoldenVerdict::Pass);
        assert_eq!(goldens.get(0, 0), Some(crc32fast::hash(b"frame0")));

        goldens.freeze();
        assert_eq!(goldens.check_frame(0, 0, b"frame0"), GoldenVerdict::Pass);
        assert!(matches!(goldens.check_frame(0, 0, b"frame1"), GoldenVerdict::Fail(_)));
        assert!(matches!(goldens.check_frame(0, 1, b"frame0"), GoldenVerdict::Fail(_)));
        assert_eq!(goldens.len(), 1);
    }
}
