// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Waiting for engine completion and classifying the outcome.

use std::time::Duration;
use std::time::Instant;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use thiserror::Error;

use crate::backend::QueueError;
use crate::codec::StatusLayout;
use crate::context::EngineContext;
use crate::utils::poll_until;

/// Size of the status structure every engine writes on completion.
pub const STATUS_STRUCT_SIZE: usize = 16;
/// Offset of the little-endian `u32` holding the number of bytes produced.
pub const STATUS_OUTPUT_SIZE_OFFSET: usize = 0;
/// Offset of the little-endian `u32` error code, on engines that report one.
pub const STATUS_ERROR_CODE_OFFSET: usize = 4;

/// Token polling interval once the queue drained without writing the expected token.
const IDLE_RECHECK_INTERVAL: Duration = Duration::from_millis(1);

/// How completion of an engine is detected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Poll the completion token every `interval`.
    PollToken { interval: Duration },
    /// Block on the queue becoming idle, then check the completion token. A drained queue that
    /// did not write the token is waited on until the timeout.
    QueueIdle,
}

impl Default for SyncStrategy {
    fn default() -> Self {
        SyncStrategy::PollToken {
            interval: Duration::from_millis(1),
        }
    }
}

/// Successful outcome of a submission.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Complete { output_size: usize },
    /// The engine produced less than the output buffer holds. Output buffers are sized for the
    /// worst case, so this is expected and only reported.
    Warning { output_size: usize, allocated: usize },
}

impl CompletionStatus {
    pub fn output_size(&self) -> usize {
        match self {
            CompletionStatus::Complete { output_size } => *output_size,
            CompletionStatus::Warning { output_size, .. } => *output_size,
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, CompletionStatus::Warning { .. })
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(
        "engine {engine} did not complete token {expected:#x} within {timeout:?} \
         (last seen {observed:#x})"
    )]
    TimeoutOrFault {
        engine: usize,
        expected: u64,
        observed: u64,
        timeout: Duration,
    },
    #[error("engine {engine} reported hardware error {code:#x}")]
    HardwareFault { engine: usize, code: u32 },
    #[error("engine {engine} completed without producing any output")]
    EmptyOutput { engine: usize },
    #[error("engine {engine} reported {size} output bytes, but only {allocated} are allocated")]
    OutputOverflow {
        engine: usize,
        size: usize,
        allocated: usize,
    },
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Blocks the caller until the engine of `ctx` wrote `expected_token`, or fails with
/// [`SyncError::TimeoutOrFault`] once `timeout` has elapsed. On completion, the status
/// structure is read back using `layout` and classified.
pub fn wait_for_completion(
    ctx: &mut EngineContext,
    expected_token: u64,
    timeout: Duration,
    layout: StatusLayout,
) -> SyncResult<CompletionStatus> {
    let engine = ctx.engine_id();
    let start = Instant::now();
    let timed_out = |ctx: &EngineContext| SyncError::TimeoutOrFault {
        engine,
        expected: expected_token,
        observed: ctx.token().load(),
        timeout,
    };

    let sync = ctx.config().sync;
    match sync {
        SyncStrategy::PollToken { interval } => {
            let token = ctx.token().clone();
            poll_until(interval, timeout, || (token.load() == expected_token).then_some(()))
                .map_err(|_| timed_out(&*ctx))?;
        }
        SyncStrategy::QueueIdle => {
            ctx.queue().wait_idle(timeout)?;
            let token = ctx.token().clone();
            let remaining = timeout.saturating_sub(start.elapsed());
            poll_until(IDLE_RECHECK_INTERVAL, remaining, || {
                (token.load() == expected_token).then_some(())
            })
            .map_err(|_| timed_out(&*ctx))?;
        }
    }

    log::trace!(
        "engine {}: token {:#x} completed after {:?}",
        engine,
        expected_token,
        start.elapsed()
    );

    classify_status(ctx, layout)
}

/// Reads the status structure of `ctx` and classifies it.
pub fn classify_status(ctx: &EngineContext, layout: StatusLayout) -> SyncResult<CompletionStatus> {
    let engine = ctx.engine_id();
    let status = ctx.status_buffer().snapshot();
    let read_u32 = |offset: usize| {
        status
            .get(offset..offset + 4)
            .map(LittleEndian::read_u32)
            .unwrap_or(0)
    };

    let output_size = read_u32(layout.output_size_offset) as usize;
    let allocated = ctx.bitstream().len();

    if output_size == 0 {
        return Err(SyncError::EmptyOutput { engine });
    }

    if let Some(offset) = layout.error_code_offset {
        let code = read_u32(offset);
        if code != 0 {
            return Err(SyncError::HardwareFault { engine, code });
        }
    }

    if output_size > allocated {
        return Err(SyncError::OutputOverflow {
            engine,
            size: output_size,
            allocated,
        });
    }

    if output_size < allocated {
        log::warn!(
            "engine {}: produced {} bytes, {} allocated",
            engine,
            output_size,
            allocated
        );
        return Ok(CompletionStatus::Warning {
            output_size,
            allocated,
        });
    }

    Ok(CompletionStatus::Complete { output_size })
}
