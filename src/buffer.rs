// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Memory shared between the exerciser and an engine.
//!
//! A [`DeviceBuffer`] is a handle to a block of memory the engine can read and write. Handles
//! are cheap to clone; all clones refer to the same memory. A [`CompletionToken`] is the single
//! 64-bit word an engine writes when it finishes a submission.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

#[derive(Clone)]
pub struct DeviceBuffer {
    label: Arc<str>,
    mem: Arc<Mutex<Vec<u8>>>,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("label", &self.label)
            .field("len", &self.len())
            .finish()
    }
}

impl DeviceBuffer {
    /// Allocates a zeroed buffer of `size` bytes.
    pub fn new(label: impl Into<String>, size: usize) -> Self {
        let label: String = label.into();
        log::trace!("allocating buffer {} ({} bytes)", label, size);

        Self {
            label: label.into(),
            mem: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `self` and `other` refer to the same memory.
    pub fn same_memory(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.mem, &other.mem)
    }

    /// Locks the buffer's memory for direct access.
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // A poisoned lock only means another thread panicked while holding it; the bytes are
        // still valid.
        self.mem.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sets every byte of the buffer to `pattern`.
    pub fn fill(&self, pattern: u8) {
        self.lock().fill(pattern);
    }

    /// Copies `data` into the buffer at `offset`. Returns `false` if it does not fit.
    pub fn write(&self, offset: usize, data: &[u8]) -> bool {
        let mut mem = self.lock();
        match offset.checked_add(data.len()) {
            Some(end) if end <= mem.len() => {
                mem[offset..end].copy_from_slice(data);
                true
            }
            _ => false,
        }
    }

    /// Returns a copy of `len` bytes starting at `offset`, or `None` if out of range.
    pub fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let mem = self.lock();
        let end = offset.checked_add(len)?;
        mem.get(offset..end).map(<[u8]>::to_vec)
    }

    /// Returns a copy of the whole buffer.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// A reference to the whole buffer.
    pub fn whole(&self) -> BufferRef {
        BufferRef {
            buffer: self.clone(),
            offset: 0,
            len: self.len(),
        }
    }

    /// A reference to `len` bytes of the buffer starting at `offset`.
    pub fn range(&self, offset: usize, len: usize) -> BufferRef {
        BufferRef {
            buffer: self.clone(),
            offset,
            len,
        }
    }
}

/// A range of a [`DeviceBuffer`], as bound to an engine.
#[derive(Clone, Debug)]
pub struct BufferRef {
    pub buffer: DeviceBuffer,
    pub offset: usize,
    pub len: usize,
}

impl BufferRef {
    /// Whether the range lies entirely within the buffer.
    pub fn is_valid(&self) -> bool {
        self.offset
            .checked_add(self.len)
            .map(|end| end <= self.buffer.len())
            .unwrap_or(false)
    }

    /// Returns a copy of the referenced bytes.
    pub fn read(&self) -> Option<Vec<u8>> {
        self.buffer.read(self.offset, self.len)
    }
}

/// Memory word written by the engine upon completion of a submission.
#[derive(Clone, Debug, Default)]
pub struct CompletionToken(Arc<AtomicU64>);

impl CompletionToken {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn store(&self, value: u64) {
        self.0.store(value, Ordering::Release)
    }

    /// Sets every byte of the token to `pattern`.
    pub fn fill(&self, pattern: u8) {
        self.store(u64::from_ne_bytes([pattern; 8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read() {
        let buf = DeviceBuffer::new("test", 8);
        assert!(buf.write(2, &[1, 2, 3]));
        assert_eq!(buf.read(0, 6).unwrap(), vec![0, 0, 1, 2, 3, 0]);

        assert!(!buf.write(6, &[1, 2, 3]));
        assert!(buf.read(6, 3).is_none());
        assert!(buf.read(usize::MAX, 2).is_none());
    }

    #[test]
    fn clones_share_memory() {
        let buf = DeviceBuffer::new("test", 4);
        let clone = buf.clone();
        clone.fill(0xab);

        assert!(buf.same_memory(&clone));
        assert_eq!(buf.snapshot(), vec![0xab; 4]);
        assert!(!buf.same_memory(&DeviceBuffer::new("other", 4)));
    }

    #[test]
    fn buffer_ref_validity() {
        let buf = DeviceBuffer::new("test", 16);
        assert!(buf.range(8, 8).is_valid());
        assert!(!buf.range(8, 9).is_valid());
        assert!(!buf.range(usize::MAX, 1).is_valid());
        assert_eq!(buf.whole().len, 16);
    }

    #[test]
    fn token_fill() {
        let token = CompletionToken::new();
        assert_eq!(token.load(), 0);
        token.fill(0x5a);
        assert_eq!(token.load(), 0x5a5a_5a5a_5a5a_5a5a);
        token.store(7);
        assert_eq!(token.clone().load(), 7);
    }
}
