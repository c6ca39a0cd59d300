// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared code for engine backends.
//!
//! A backend is the provider of an engine's command queue, most likely a hardware encode unit.
//! This module contains the command model every backend understands and the [`CommandQueue`]
//! trait the rest of the crate programs engines through. The [`software`] backend executes the
//! commands on the CPU and is used by the tests and the demo.

pub mod software;

use std::time::Duration;

use thiserror::Error;

use crate::buffer::BufferRef;
use crate::buffer::CompletionToken;
use crate::refs::Family;

/// Which part of a picture a binding refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Plane {
    /// Luma and chroma in a single surface.
    Combined,
    Luma,
    Chroma,
}

/// Engine-side binding points.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BindPoint {
    /// The picture being encoded.
    InputPicture(Plane),
    /// Hardware status structure, written on completion.
    Status,
    History,
    RateControlState,
    /// Coded output of the engine.
    Bitstream,
    /// Destination of the reconstructed picture.
    OutputReference(Plane),
    /// Entry `list_slot` of the reference picture list.
    InputReference { list_slot: usize, plane: Plane },
    LastReference(Plane),
    MotionCompensationReference(Plane),
    /// Slot of one of the auxiliary indirection families (co-located, MVP, temporal).
    Aux { family: Family, logical_slot: usize },
    ProbabilityCounters,
    ExternalHint,
    /// Control structure of the current frame inside the picture-setup buffer.
    PictureSetup,
}

/// Control parameters written before execution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlParam {
    Application(u32),
    ForceOutputPicture(bool),
    RateControl { mode: u32, value: u64 },
    StreamFlags(u32),
}

#[derive(Clone, Debug)]
pub enum Command {
    SetParam(ControlParam),
    Bind(BindPoint, BufferRef),
    /// Copy engine transfer, executed in queue order.
    Copy { src: BufferRef, dst: BufferRef },
    /// Runs the engine with the current parameters and bindings.
    Execute,
    /// Writes the value to the bound completion token once everything before it is done.
    WriteToken(u64),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("command queue of engine {0} is closed")]
    Closed(usize),
    #[error("buffer range for {0:?} is out of bounds")]
    InvalidRange(BindPoint),
    #[error("copy ranges are out of bounds or of different sizes")]
    InvalidCopy,
    #[error("no completion token bound to the queue")]
    NoCompletionToken,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// The command queue of one engine.
///
/// Commands are recorded with [`push`] and only handed to the engine by [`flush`]. Engines
/// execute flushed commands in order and independently from each other.
///
/// [`push`]: CommandQueue::push
/// [`flush`]: CommandQueue::flush
pub trait CommandQueue: Send {
    /// Index of the engine this queue feeds.
    fn engine_id(&self) -> usize;

    /// Binds the memory word the engine writes [`Command::WriteToken`] values to.
    fn bind_completion_token(&mut self, token: CompletionToken);

    /// Records `command` without submitting it.
    fn push(&mut self, command: Command) -> QueueResult<()>;

    /// Submits all recorded commands to the engine.
    fn flush(&mut self) -> QueueResult<()>;

    /// Drops all recorded commands without submitting them.
    fn discard(&mut self);

    /// Blocks until the engine has executed all flushed commands, or `timeout` expires. Returns
    /// `false` on timeout.
    fn wait_idle(&mut self, timeout: Duration) -> QueueResult<bool>;
}

/// Validates the ranges of `command` before recording it.
pub(crate) fn check_command(command: &Command) -> QueueResult<()> {
    match command {
        Command::Bind(point, range) if !range.is_valid() => Err(QueueError::InvalidRange(*point)),
        Command::Copy { src, dst } if !src.is_valid() || !dst.is_valid() || src.len != dst.len => {
            Err(QueueError::InvalidCopy)
        }
        _ => Ok(()),
    }
}
