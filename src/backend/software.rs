// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a software engine whose only purpose is to let the exerciser run without
//! hardware, so it can be tested in isolation.
//!
//! Each engine owns a worker thread standing in for the hardware unit: flushed command batches
//! are executed there in order, so different engines run in parallel. The "encode" is a CRC of
//! everything the engine was given, expanded into a deterministic pseudo bitstream, which makes
//! the output sensitive to every binding while staying identical across engines.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::backend::check_command;
use crate::backend::BindPoint;
use crate::backend::Command;
use crate::backend::CommandQueue;
use crate::backend::ControlParam;
use crate::backend::Plane;
use crate::backend::QueueError;
use crate::backend::QueueResult;
use crate::buffer::BufferRef;
use crate::buffer::CompletionToken;
use crate::refs::Direction;
use crate::refs::Family;
use crate::sync::STATUS_ERROR_CODE_OFFSET;
use crate::sync::STATUS_OUTPUT_SIZE_OFFSET;
use crate::sync::STATUS_STRUCT_SIZE;

/// Bitstream size produced for every frame is within `MIN_CODED_SIZE..MAX_CODED_SIZE`.
const MIN_CODED_SIZE: usize = 64;
const MAX_CODED_SIZE: usize = 1024;

/// Misbehaviours the software engine can simulate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Stops executing before the first completion token write and never goes idle.
    Hang,
    /// Reports the error code in the status structure.
    ErrorCode(u32),
    /// Reports zero output bytes.
    EmptyOutput,
    /// Reports more output bytes than the bitstream buffer holds.
    Oversize,
}

#[derive(Clone, Debug, Default)]
pub struct SoftwareEngineConfig {
    /// Time spent executing every flushed batch.
    pub latency: Duration,
    pub fault: Option<Fault>,
}

/// What the engine saw for one [`Command::Execute`].
#[derive(Clone, Debug, Default)]
pub struct ExecutionRecord {
    pub params: Vec<ControlParam>,
    pub bindings: Vec<BindPoint>,
    pub copies: usize,
    pub coded_size: usize,
}

/// Shared log of executions, for inspection by tests.
pub type ExecutionLog = Arc<Mutex<Vec<ExecutionRecord>>>;

#[derive(Default)]
struct IdleState {
    /// Number of flushed batches not executed yet.
    pending: usize,
    hung: bool,
}

type Idle = Arc<(Mutex<IdleState>, Condvar)>;

pub struct SoftwareEngine {
    engine_id: usize,
    token: Option<CompletionToken>,
    recorded: Vec<Command>,
    sender: Option<mpsc::Sender<Vec<Command>>>,
    worker: Option<JoinHandle<()>>,
    idle: Idle,
    log: ExecutionLog,
    config: SoftwareEngineConfig,
}

impl SoftwareEngine {
    pub fn new(engine_id: usize, config: SoftwareEngineConfig) -> Self {
        Self {
            engine_id,
            token: None,
            recorded: Vec::new(),
            sender: None,
            worker: None,
            idle: Default::default(),
            log: Default::default(),
            config,
        }
    }

    /// Returns the log of all executions performed by this engine.
    pub fn execution_log(&self) -> ExecutionLog {
        Arc::clone(&self.log)
    }

    fn start_worker(&mut self, token: CompletionToken) -> QueueResult<mpsc::Sender<Vec<Command>>> {
        let (sender, receiver) = mpsc::channel::<Vec<Command>>();
        let mut unit = Unit {
            engine_id: self.engine_id,
            token,
            bindings: HashMap::new(),
            params: Vec::new(),
            copies: 0,
            idle: Arc::clone(&self.idle),
            log: Arc::clone(&self.log),
            config: self.config.clone(),
        };

        let worker = std::thread::Builder::new()
            .name(format!("sw-engine-{}", self.engine_id))
            .spawn(move || {
                while let Ok(batch) = receiver.recv() {
                    unit.run_batch(batch);
                }
            })
            .map_err(|e| QueueError::Other(e.into()))?;

        self.worker = Some(worker);
        Ok(sender)
    }
}

impl CommandQueue for SoftwareEngine {
    fn engine_id(&self) -> usize {
        self.engine_id
    }

    fn bind_completion_token(&mut self, token: CompletionToken) {
        self.token = Some(token);
    }

    fn push(&mut self, command: Command) -> QueueResult<()> {
        check_command(&command)?;
        if matches!(command, Command::WriteToken(_)) && self.token.is_none() {
            return Err(QueueError::NoCompletionToken);
        }

        self.recorded.push(command);
        Ok(())
    }

    fn flush(&mut self) -> QueueResult<()> {
        if self.recorded.is_empty() {
            return Ok(());
        }

        if self.sender.is_none() {
            let token = self.token.clone().ok_or(QueueError::NoCompletionToken)?;
            self.sender = Some(self.start_worker(token)?);
        }

        let batch = std::mem::take(&mut self.recorded);
        log::trace!("engine {}: flushing {} commands", self.engine_id, batch.len());

        let (lock, _) = &*self.idle;
        lock.lock().unwrap_or_else(|e| e.into_inner()).pending += 1;

        let sender = self.sender.as_ref().ok_or(QueueError::Closed(self.engine_id))?;
        sender.send(batch).map_err(|_| QueueError::Closed(self.engine_id))
    }

    fn discard(&mut self) {
        log::debug!("engine {}: discarding {} commands", self.engine_id, self.recorded.len());
        self.recorded.clear();
    }

    fn wait_idle(&mut self, timeout: Duration) -> QueueResult<bool> {
        let (lock, cvar) = &*self.idle;
        let state = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (state, res) = cvar
            .wait_timeout_while(state, timeout, |s| s.pending > 0)
            .unwrap_or_else(|e| e.into_inner());

        if res.timed_out() {
            log::debug!(
                "engine {}: still busy after {:?} ({} batches pending, hung: {})",
                self.engine_id,
                timeout,
                state.pending,
                state.hung
            );
        }

        Ok(!res.timed_out())
    }
}

impl Drop for SoftwareEngine {
    fn drop(&mut self) {
        // Closing the channel stops the worker once it drained its queue.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("engine {}: worker thread panicked", self.engine_id);
            }
        }
    }
}

/// The simulated hardware unit, living on the worker thread.
struct Unit {
    engine_id: usize,
    token: CompletionToken,
    bindings: HashMap<BindPoint, BufferRef>,
    params: Vec<ControlParam>,
    copies: usize,
    idle: Idle,
    log: ExecutionLog,
    config: SoftwareEngineConfig,
}

impl Unit {
    fn run_batch(&mut self, batch: Vec<Command>) {
        if self.is_hung() {
            log::trace!("engine {}: hung, dropping batch", self.engine_id);
            return;
        }

        if !self.config.latency.is_zero() {
            std::thread::sleep(self.config.latency);
        }

        for command in batch {
            match command {
                Command::SetParam(param) => self.params.push(param),
                Command::Bind(point, range) => {
                    self.bindings.insert(point, range);
                }
                Command::Copy { src, dst } => {
                    if let Some(data) = src.read() {
                        dst.buffer.write(dst.offset, &data);
                    }
                    self.copies += 1;
                }
                Command::Execute => self.execute(),
                Command::WriteToken(value) => {
                    if self.config.fault == Some(Fault::Hang) {
                        log::trace!("engine {}: hanging before token {:#x}", self.engine_id, value);
                        self.idle.0.lock().unwrap_or_else(|e| e.into_inner()).hung = true;
                        return;
                    }
                    self.token.store(value);
                }
            }
        }

        let (lock, cvar) = &*self.idle;
        lock.lock().unwrap_or_else(|e| e.into_inner()).pending -= 1;
        cvar.notify_all();
    }

    fn is_hung(&self) -> bool {
        self.idle.0.lock().unwrap_or_else(|e| e.into_inner()).hung
    }

    fn read_binding(&self, point: &BindPoint) -> Option<Vec<u8>> {
        self.bindings.get(point).and_then(BufferRef::read)
    }

    /// Reads a picture from either a combined surface or a luma/chroma pair.
    fn read_picture(&self, point: impl Fn(Plane) -> BindPoint) -> Option<Vec<u8>> {
        match self.read_binding(&point(Plane::Combined)) {
            Some(data) => Some(data),
            None => {
                let mut data = self.read_binding(&point(Plane::Luma))?;
                data.extend(self.read_binding(&point(Plane::Chroma))?);
                Some(data)
            }
        }
    }

    /// Writes `data` to either a combined surface or a luma/chroma pair.
    fn write_picture(&self, point: impl Fn(Plane) -> BindPoint, data: &[u8]) {
        if let Some(range) = self.bindings.get(&point(Plane::Combined)) {
            let len = range.len.min(data.len());
            range.buffer.write(range.offset, &data[..len]);
            return;
        }

        let mut data = data;
        for plane in [Plane::Luma, Plane::Chroma] {
            if let Some(range) = self.bindings.get(&point(plane)) {
                let len = range.len.min(data.len());
                range.buffer.write(range.offset, &data[..len]);
                data = &data[len..];
            }
        }
    }

    fn execute(&mut self) {
        let mut hasher = crc32fast::Hasher::new();
        for param in &self.params {
            hasher.update(format!("{:?}", param).as_bytes());
        }

        let input = self.read_picture(BindPoint::InputPicture).unwrap_or_default();
        hasher.update(&input);

        // Every input the engine may depend on, in a stable order.
        let mut inputs: Vec<BindPoint> = self
            .bindings
            .keys()
            .filter(|p| match p {
                BindPoint::PictureSetup
                | BindPoint::ProbabilityCounters
                | BindPoint::ExternalHint => true,
                BindPoint::Aux { family, .. } => matches!(
                    family,
                    Family::Colocated(Direction::In)
                        | Family::MotionVectorPrediction(Direction::In)
                        | Family::Temporal(Direction::In)
                ),
                BindPoint::InputReference { .. }
                | BindPoint::LastReference(_)
                | BindPoint::MotionCompensationReference(_) => true,
                _ => false,
            })
            .copied()
            .collect();
        inputs.sort_by_key(|p| format!("{:?}", p));
        for point in &inputs {
            if let Some(data) = self.read_binding(point) {
                hasher.update(&data);
            }
        }

        let crc = hasher.finalize();
        let seed = crc.to_le_bytes()[0];

        // Reconstructed picture and output side data.
        let recon: Vec<u8> = input.iter().map(|b| b ^ seed).collect();
        self.write_picture(BindPoint::OutputReference, &recon);
        for (point, range) in &self.bindings {
            let out = match point {
                BindPoint::Aux { family, .. } => matches!(
                    family,
                    Family::Colocated(Direction::Out)
                        | Family::MotionVectorPrediction(Direction::Out)
                        | Family::Temporal(Direction::Out)
                ),
                BindPoint::ProbabilityCounters
                | BindPoint::History
                | BindPoint::RateControlState => true,
                _ => false,
            };
            if out {
                range.buffer.write(range.offset, &vec![seed; range.len]);
            }
        }

        let bitstream = self.bindings.get(&BindPoint::Bitstream);
        let capacity = bitstream.map(|r| r.len).unwrap_or(0);
        let mut coded_size = MIN_CODED_SIZE + crc as usize % (MAX_CODED_SIZE - MIN_CODED_SIZE);
        coded_size = coded_size.min(capacity);
        if let Some(range) = bitstream {
            let mut state = crc | 1;
            let coded: Vec<u8> = (0..coded_size)
                .map(|_| {
                    // xorshift32
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    state as u8
                })
                .collect();
            range.buffer.write(range.offset, &coded);
        }

        let (reported_size, error_code) = match self.config.fault {
            Some(Fault::EmptyOutput) => (0, 0),
            Some(Fault::Oversize) => (capacity + 1, 0),
            Some(Fault::ErrorCode(code)) => (coded_size, code),
            _ => (coded_size, 0),
        };

        if let Some(range) = self.bindings.get(&BindPoint::Status) {
            let mut status = [0u8; STATUS_STRUCT_SIZE];
            LittleEndian::write_u32(&mut status[STATUS_OUTPUT_SIZE_OFFSET..], reported_size as u32);
            LittleEndian::write_u32(&mut status[STATUS_ERROR_CODE_OFFSET..], error_code);
            let len = range.len.min(STATUS_STRUCT_SIZE);
            range.buffer.write(range.offset, &status[..len]);
        }

        log::trace!(
            "engine {}: executed, crc {:#010x}, {} bytes",
            self.engine_id,
            crc,
            reported_size
        );

        let mut bindings: Vec<BindPoint> = self.bindings.keys().copied().collect();
        bindings.sort_by_key(|p| format!("{:?}", p));
        self.log.lock().unwrap_or_else(|e| e.into_inner()).push(ExecutionRecord {
            params: std::mem::take(&mut self.params),
            bindings,
            copies: std::mem::take(&mut self.copies),
            coded_size: reported_size,
        });
        self.bindings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DeviceBuffer;

    fn setup(engine: &mut SoftwareEngine, token: &CompletionToken) -> (DeviceBuffer, DeviceBuffer) {
        engine.bind_completion_token(token.clone());

        let input = DeviceBuffer::new("input", 24);
        input.fill(0x10);
        let status = DeviceBuffer::new("status", STATUS_STRUCT_SIZE);
        let bitstream = DeviceBuffer::new("bitstream", 4096);

        engine
            .push(Command::Bind(BindPoint::InputPicture(Plane::Combined), input.whole()))
            .unwrap();
        engine.push(Command::Bind(BindPoint::Status, status.whole())).unwrap();
        engine.push(Command::Bind(BindPoint::Bitstream, bitstream.whole())).unwrap();
        engine.push(Command::Execute).unwrap();
        engine.push(Command::WriteToken(5)).unwrap();

        (status, bitstream)
    }

    #[test]
    fn executes_and_writes_token() {
        let token = CompletionToken::new();
        let mut engine = SoftwareEngine::new(0, Default::default());
        let (status, _) = setup(&mut engine, &token);

        // Nothing happens before flushing.
        assert!(engine.wait_idle(Duration::from_millis(1)).unwrap());
        assert_eq!(token.load(), 0);

        engine.flush().unwrap();
        assert!(engine.wait_idle(Duration::from_secs(5)).unwrap());
        assert_eq!(token.load(), 5);

        let size = LittleEndian::read_u32(&status.snapshot()[STATUS_OUTPUT_SIZE_OFFSET..]) as usize;
        assert!((MIN_CODED_SIZE..MAX_CODED_SIZE).contains(&size));

        let log = engine.execution_log();
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].coded_size, size);
        assert!(log[0].bindings.contains(&BindPoint::Status));
    }

    #[test]
    fn identical_inputs_give_identical_output() {
        let mut outputs = Vec::new();
        for id in 0..2 {
            let token = CompletionToken::new();
            let mut engine = SoftwareEngine::new(id, Default::default());
            let (_, bitstream) = setup(&mut engine, &token);
            engine.flush().unwrap();
            assert!(engine.wait_idle(Duration::from_secs(5)).unwrap());
            outputs.push(bitstream.snapshot());
        }

        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn hang_never_goes_idle() {
        let token = CompletionToken::new();
        let mut engine = SoftwareEngine::new(
            0,
            SoftwareEngineConfig {
                fault: Some(Fault::Hang),
                ..Default::default()
            },
        );
        setup(&mut engine, &token);
        engine.flush().unwrap();

        assert!(!engine.wait_idle(Duration::from_millis(50)).unwrap());
        assert_eq!(token.load(), 0);
    }

    #[test]
    fn write_token_requires_binding() {
        let mut engine = SoftwareEngine::new(0, Default::default());
        assert!(matches!(
            engine.push(Command::WriteToken(1)),
            Err(QueueError::NoCompletionToken)
        ));
    }

    #[test]
    fn copy_is_executed_in_order() {
        let token = CompletionToken::new();
        let mut engine = SoftwareEngine::new(0, Default::default());
        engine.bind_completion_token(token.clone());

        let src = DeviceBuffer::new("src", 8);
        src.fill(0x42);
        let dst = DeviceBuffer::new("dst", 8);

        engine
            .push(Command::Copy {
                src: src.whole(),
                dst: dst.whole(),
            })
            .unwrap();
        engine.push(Command::WriteToken(1)).unwrap();
        engine.flush().unwrap();

        assert!(engine.wait_idle(Duration::from_secs(5)).unwrap());
        assert_eq!(dst.snapshot(), vec![0x42; 8]);
    }
}
