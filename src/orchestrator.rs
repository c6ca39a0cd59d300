// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Outer driver of a run.
//!
//! [`TestOrchestrator`] walks the stream catalog and, for every stream, runs the state machine
//! `Reset -> PrepareControlStructures -> SubmitFrame -> FlushAll -> WaitEngine -> Validate ->
//! (SubmitFrame | StreamDone)`. Every active engine is submitted a frame before any of them is
//! waited on, and a frame is only submitted once every engine completed the previous one.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::codec::CodecRegistry;
use crate::content::generate_stream_inputs;
use crate::context::BufferKind;
use crate::context::EngineContext;
use crate::device::DeviceReady;
use crate::golden::GoldenValidator;
use crate::golden::GoldenVerdict;
use crate::provider::ControlStructureProvider;
use crate::refs::IndirectionTables;
use crate::stream::StreamCatalog;
use crate::submit::FrameSubmitter;
use crate::submit::SubmitError;
use crate::submit::Submitted;
use crate::sync::wait_for_completion;
use crate::sync::SyncError;
use crate::Resolution;

/// Run options.
#[derive(Clone, Debug, Default)]
pub struct ExerciserConfig {
    /// Bit `n` set skips stream `n`.
    pub stream_skip_mask: u64,
    /// Bit `n` set skips the engine with id `n`.
    pub engine_skip_mask: u64,
    /// Maximum number of frames run per stream.
    pub max_frames: Option<usize>,
    /// Restart from the first stream after the last one until stopped.
    pub keep_running: bool,
    /// Byte every engine buffer is filled with before a stream starts.
    pub clear_pattern: u8,
    /// Record a [`TraceEvent`] for every step.
    pub trace: bool,
    /// Directory the output of every validated frame is saved to.
    pub save_output_dir: Option<PathBuf>,
}

fn is_masked(mask: u64, idx: usize) -> bool {
    idx < 64 && mask & (1 << idx) != 0
}

/// States of a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    Reset,
    PrepareControlStructures,
    SubmitFrame(usize),
    FlushAll(usize),
    WaitEngine(usize),
    Validate(usize),
    StreamDone,
}

/// Step of a run, recorded when tracing is enabled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    StreamStart { stream: usize },
    Submit { stream: usize, frame: usize, engine: usize },
    Flush { stream: usize, frame: usize },
    Wait { stream: usize, frame: usize, engine: usize },
    Validate { stream: usize, frame: usize, engine: usize },
    StreamDone { stream: usize },
    StreamAborted { stream: usize },
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("engine {engine} frame {frame}: {source}")]
    Submit {
        engine: usize,
        frame: usize,
        #[source]
        source: SubmitError,
    },
    #[error("engine {engine} frame {frame}: {source}")]
    Sync {
        engine: usize,
        frame: usize,
        #[source]
        source: SyncError,
    },
    #[error("control structure provider failed for frame {frame}: {source}")]
    ControlStructure {
        frame: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("control structure of frame {frame} is {actual} bytes, expected {expected}")]
    ControlStructureSize {
        frame: usize,
        expected: usize,
        actual: usize,
    },
    #[error("engine {engine}: {kind:?} cannot hold the stream")]
    ResourceTooSmall { engine: usize, kind: BufferKind },
    #[error("failed to save output: {0}")]
    SaveOutput(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("every stream is skipped, nothing to do")]
    AllStreamsSkipped,
    #[error("every engine is skipped, nothing to do")]
    AllEnginesSkipped,
    #[error("the device is not ready")]
    DeviceNotReady,
}

/// Golden check failure of one frame on one engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    pub frame: usize,
    pub engine: usize,
    pub diff: String,
}

/// Mismatches kept per stream, over all of its runs.
const MAX_RECORDED_MISMATCHES: usize = 64;
/// Trace events kept. Once reached, the older half is dropped.
const MAX_TRACE_EVENTS: usize = 1 << 16;

/// Counters of a stream that ran to completion, summed over every run of the stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames: usize,
    pub submissions: usize,
    pub waits: usize,
    pub validations: usize,
    /// Completions that produced less output than allocated.
    pub warnings: usize,
    /// First mismatches found, up to a fixed limit.
    pub mismatches: Vec<Mismatch>,
    /// Mismatches found past the recorded ones.
    pub dropped_mismatches: usize,
}

impl StreamSummary {
    fn push_mismatch(&mut self, mismatch: Mismatch) {
        if self.mismatches.len() < MAX_RECORDED_MISMATCHES {
            self.mismatches.push(mismatch);
        } else {
            self.dropped_mismatches += 1;
        }
    }

    fn merge(&mut self, other: StreamSummary) {
        self.frames += other.frames;
        self.submissions += other.submissions;
        self.waits += other.waits;
        self.validations += other.validations;
        self.warnings += other.warnings;
        self.dropped_mismatches += other.dropped_mismatches;
        for mismatch in other.mismatches {
            self.push_mismatch(mismatch);
        }
    }
}

#[derive(Debug)]
pub struct StreamReport {
    pub stream: usize,
    pub name: &'static str,
    /// Number of times the stream ran.
    pub runs: usize,
    /// Totals of every run, or the first error that aborted one.
    pub result: Result<StreamSummary, StreamError>,
}

impl StreamReport {
    pub fn passed(&self) -> bool {
        matches!(&self.result, Ok(summary) if summary.mismatches.is_empty())
    }

    fn merge(&mut self, result: Result<StreamSummary, StreamError>) {
        self.runs += 1;
        match result {
            Ok(summary) => {
                if let Ok(total) = &mut self.result {
                    total.merge(summary);
                }
            }
            Err(e) => {
                if self.result.is_ok() {
                    self.result = Err(e);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    /// Number of passes over the catalog started.
    pub passes: usize,
    /// One report per stream run, in the order they first ran.
    pub streams: Vec<StreamReport>,
}

impl RunReport {
    /// Whether at least one stream ran and none of them failed.
    pub fn passed(&self) -> bool {
        !self.streams.is_empty() && self.streams.iter().all(StreamReport::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StreamReport> {
        self.streams.iter().filter(|r| !r.passed())
    }

    fn record(
        &mut self,
        stream: usize,
        name: &'static str,
        result: Result<StreamSummary, StreamError>,
    ) {
        match self.streams.iter_mut().find(|r| r.stream == stream) {
            Some(report) => report.merge(result),
            None => self.streams.push(StreamReport {
                stream,
                name,
                runs: 1,
                result,
            }),
        }
    }
}

#[derive(Debug)]
struct Trace {
    enabled: bool,
    limit: usize,
    events: Vec<TraceEvent>,
}

impl Trace {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            limit: MAX_TRACE_EVENTS,
            events: Vec::new(),
        }
    }

    fn record(&mut self, event: TraceEvent) {
        if self.enabled {
            log::trace!("{:?}", event);
            if self.events.len() >= self.limit {
                self.events.drain(..self.limit / 2 + 1);
            }
            self.events.push(event);
        }
    }
}

/// Input pictures of the current stream, rendered once per surface size.
#[derive(Default)]
struct StreamInputs(Vec<(Resolution, Vec<Vec<u8>>)>);

impl StreamInputs {
    fn prepare(&mut self, resolution: Resolution, surface: Resolution, num_frames: usize) {
        if !self.0.iter().any(|(s, _)| *s == surface) {
            self.0
                .push((surface, generate_stream_inputs(resolution, surface, num_frames)));
        }
    }

    fn get(&self, surface: Resolution, frame: usize) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(s, _)| *s == surface)
            .and_then(|(_, frames)| frames.get(frame))
            .map(Vec::as_slice)
    }
}

pub struct TestOrchestrator {
    catalog: StreamCatalog,
    tables: IndirectionTables,
    registry: CodecRegistry,
    engines: Vec<EngineContext>,
    config: ExerciserConfig,
    stop: Arc<AtomicBool>,
    trace: Trace,
}

impl TestOrchestrator {
    pub fn new(
        catalog: StreamCatalog,
        tables: IndirectionTables,
        registry: CodecRegistry,
        engines: Vec<EngineContext>,
        config: ExerciserConfig,
    ) -> Self {
        let trace = Trace::new(config.trace);

        Self {
            catalog,
            tables,
            registry,
            engines,
            config,
            stop: Default::default(),
            trace,
        }
    }

    /// Flag stopping a keep-running loop. It is only checked between streams, and cleared when a
    /// run starts.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Most recent trace events.
    pub fn trace(&self) -> &[TraceEvent] {
        &self.trace.events
    }

    pub fn engines(&self) -> &[EngineContext] {
        &self.engines
    }

    /// Runs every stream not masked out on every engine not masked out.
    ///
    /// Stream failures are recorded in the report and do not stop the run.
    pub fn run(
        &mut self,
        device: &dyn DeviceReady,
        provider: &dyn ControlStructureProvider,
        golden: &mut dyn GoldenValidator,
    ) -> Result<RunReport, RunError> {
        let streams: Vec<usize> = (0..self.catalog.len())
            .filter(|idx| !is_masked(self.config.stream_skip_mask, *idx))
            .collect();
        if streams.is_empty() {
            return Err(RunError::AllStreamsSkipped);
        }

        let engines: Vec<usize> = self
            .engines
            .iter()
            .enumerate()
            .filter(|(_, ctx)| !is_masked(self.config.engine_skip_mask, ctx.engine_id()))
            .map(|(idx, _)| idx)
            .collect();
        if engines.is_empty() {
            return Err(RunError::AllEnginesSkipped);
        }

        if !device.is_ready() {
            return Err(RunError::DeviceNotReady);
        }

        self.stop.store(false, Ordering::Release);

        log::info!(
            "running {} streams on {} engines{}",
            streams.len(),
            engines.len(),
            if self.config.keep_running { " until stopped" } else { "" }
        );

        let mut report = RunReport::default();
        'passes: loop {
            report.passes += 1;
            for &stream in &streams {
                if self.stop.load(Ordering::Acquire) {
                    log::info!("stop requested");
                    break 'passes;
                }

                let result = self.run_stream(stream, &engines, provider, golden);
                let name = self.catalog.get(stream).map(|d| d.name).unwrap_or_default();
                match &result {
                    Ok(summary) => log::info!(
                        "{}: done, {} frames, {} mismatches",
                        name,
                        summary.frames,
                        summary.mismatches.len()
                    ),
                    Err(e) => log::error!("{}: aborted: {}", name, e),
                }

                report.record(stream, name, result);
            }

            if !self.config.keep_running || self.stop.load(Ordering::Acquire) {
                break;
            }
        }

        Ok(report)
    }

    fn run_stream(
        &mut self,
        stream: usize,
        engines: &[usize],
        provider: &dyn ControlStructureProvider,
        golden: &mut dyn GoldenValidator,
    ) -> Result<StreamSummary, StreamError> {
        self.trace.record(TraceEvent::StreamStart { stream });

        match self.drive_stream(stream, engines, provider, golden) {
            Ok(summary) => {
                self.trace.record(TraceEvent::StreamDone { stream });
                Ok(summary)
            }
            Err(e) => {
                self.abort_stream(engines);
                self.trace.record(TraceEvent::StreamAborted { stream });
                Err(e)
            }
        }
    }

    /// Drops whatever the engines have recorded and lets them drain what they were given.
    fn abort_stream(&mut self, engines: &[usize]) {
        for &idx in engines {
            let ctx = &mut self.engines[idx];
            let timeout = ctx.config().sync_timeout;
            let queue = ctx.queue();
            queue.discard();
            if !matches!(queue.wait_idle(timeout), Ok(true)) {
                log::warn!("engine {} did not drain after abort", ctx.engine_id());
            }
        }
    }

    fn drive_stream(
        &mut self,
        stream: usize,
        engines: &[usize],
        provider: &dyn ControlStructureProvider,
        golden: &mut dyn GoldenValidator,
    ) -> Result<StreamSummary, StreamError> {
        let desc = match self.catalog.get(stream) {
            Some(desc) => desc.clone(),
            None => return Ok(Default::default()),
        };
        let num_frames = desc
            .num_frames()
            .min(self.config.max_frames.unwrap_or(usize::MAX));
        let submitter = FrameSubmitter::new(&self.catalog, &self.tables, &self.registry);

        let mut summary = StreamSummary {
            frames: num_frames,
            ..Default::default()
        };
        let mut inputs = StreamInputs::default();
        let mut submitted: Vec<Submitted> = Vec::with_capacity(engines.len());
        let mut output_sizes: Vec<usize> = Vec::with_capacity(engines.len());

        let mut state = StreamState::Reset;
        loop {
            log::trace!("{}: {:?}", desc.name, state);
            state = match state {
                StreamState::Reset => {
                    for &idx in engines {
                        self.engines[idx].clear(self.config.clear_pattern);
                    }
                    StreamState::PrepareControlStructures
                }

                StreamState::PrepareControlStructures => {
                    let size = self
                        .registry
                        .get(desc.codec)
                        .map(|v| v.control_structure_size())
                        .ok_or(StreamError::Submit {
                            engine: self.engines[engines[0]].engine_id(),
                            frame: 0,
                            source: SubmitError::UnsupportedCodec(desc.codec),
                        })?;

                    for frame in 0..num_frames {
                        let data = provider
                            .fill_control_structure(stream, frame, desc.codec)
                            .map_err(|source| StreamError::ControlStructure { frame, source })?;
                        if data.len() != size {
                            return Err(StreamError::ControlStructureSize {
                                frame,
                                expected: size,
                                actual: data.len(),
                            });
                        }

                        for &idx in engines {
                            let ctx = &self.engines[idx];
                            if !ctx.picture_setup().write(frame * size, &data) {
                                return Err(StreamError::ResourceTooSmall {
                                    engine: ctx.engine_id(),
                                    kind: BufferKind::PictureSetup,
                                });
                            }
                        }
                    }

                    for &idx in engines {
                        let ctx = &self.engines[idx];
                        let surface = ctx.config().max_resolution;
                        if !surface.can_contain(desc.resolution) {
                            return Err(StreamError::ResourceTooSmall {
                                engine: ctx.engine_id(),
                                kind: BufferKind::InputPicture,
                            });
                        }
                        inputs.prepare(desc.resolution, surface, num_frames);
                    }

                    if num_frames == 0 {
                        StreamState::StreamDone
                    } else {
                        StreamState::SubmitFrame(0)
                    }
                }

                StreamState::SubmitFrame(frame) => {
                    submitted.clear();
                    for &idx in engines {
                        let ctx = &mut self.engines[idx];
                        let engine = ctx.engine_id();
                        let picture = inputs.get(ctx.config().max_resolution, frame);
                        upload_input_picture(ctx, picture)?;

                        let res = submitter
                            .submit_frame(stream, frame, ctx, desc.codec)
                            .map_err(|source| StreamError::Submit {
                                engine,
                                frame,
                                source,
                            })?;
                        self.trace.record(TraceEvent::Submit { stream, frame, engine });
                        summary.submissions += 1;
                        submitted.push(res);
                    }
                    StreamState::FlushAll(frame)
                }

                StreamState::FlushAll(frame) => {
                    for &idx in engines {
                        let ctx = &mut self.engines[idx];
                        let engine = ctx.engine_id();
                        ctx.queue().flush().map_err(|e| StreamError::Sync {
                            engine,
                            frame,
                            source: e.into(),
                        })?;
                    }
                    self.trace.record(TraceEvent::Flush { stream, frame });
                    StreamState::WaitEngine(frame)
                }

                StreamState::WaitEngine(frame) => {
                    output_sizes.clear();
                    for (&idx, sub) in engines.iter().zip(submitted.iter()) {
                        let ctx = &mut self.engines[idx];
                        let engine = ctx.engine_id();
                        let timeout = ctx.config().sync_timeout;
                        let status = wait_for_completion(ctx, sub.token, timeout, sub.layout)
                            .map_err(|source| StreamError::Sync {
                                engine,
                                frame,
                                source,
                            })?;
                        self.trace.record(TraceEvent::Wait { stream, frame, engine });
                        summary.waits += 1;
                        if status.is_warning() {
                            summary.warnings += 1;
                        }
                        output_sizes.push(status.output_size());
                    }
                    StreamState::Validate(frame)
                }

                StreamState::Validate(frame) => {
                    let has_output = submitted
                        .first()
                        .map_or(false, |s| !s.output_slot.is_unused());
                    if has_output {
                        for (&idx, size) in engines.iter().zip(output_sizes.iter()) {
                            let ctx = &self.engines[idx];
                            let engine = ctx.engine_id();
                            let output = ctx.bitstream().read(0, *size).unwrap_or_default();

                            self.save_output(desc.name, engine, frame, &output)?;

                            let verdict = golden.check_frame(stream, frame, &output);
                            self.trace.record(TraceEvent::Validate { stream, frame, engine });
                            summary.validations += 1;
                            if let GoldenVerdict::Fail(diff) = verdict {
                                log::warn!(
                                    "{} frame {} engine {}: {}",
                                    desc.name,
                                    frame,
                                    engine,
                                    diff
                                );
                                summary.push_mismatch(Mismatch { frame, engine, diff });
                            }
                        }
                    }

                    if frame + 1 < num_frames {
                        StreamState::SubmitFrame(frame + 1)
                    } else {
                        StreamState::StreamDone
                    }
                }

                StreamState::StreamDone => break,
            };
        }

        Ok(summary)
    }

    fn save_output(
        &self,
        name: &str,
        engine: usize,
        frame: usize,
        output: &[u8],
    ) -> std::io::Result<()> {
        let dir = match &self.config.save_output_dir {
            Some(dir) => dir,
            None => return Ok(()),
        };

        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(format!("{}_engine{}_frame{:03}.bin", name, engine, frame)), output)
    }
}

fn upload_input_picture(ctx: &EngineContext, picture: Option<&[u8]>) -> Result<(), StreamError> {
    match picture {
        Some(picture) if ctx.input_picture().write(0, picture) => Ok(()),
        _ => Err(StreamError::ResourceTooSmall {
            engine: ctx.engine_id(),
            kind: BufferKind::InputPicture,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::*;
    use crate::backend::software::SoftwareEngine;
    use crate::backend::Command;
    use crate::backend::CommandQueue;
    use crate::backend::ControlParam;
    use crate::backend::QueueResult;
    use crate::buffer::CompletionToken;
    use crate::codec::CodecClass;
    use crate::context::EngineConfig;
    use crate::device::ReadyFlag;
    use crate::golden::Crc32Goldens;
    use crate::provider::SyntheticControlStructures;
    use crate::refs::Family;
    use crate::refs::RefSlot;
    use crate::refs::UNUSED;
    use crate::stream::StreamDescriptor;
    use crate::RateControl;

    /// Provider counting its calls.
    struct CountingProvider {
        inner: SyntheticControlStructures,
        calls: Cell<usize>,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                inner: SyntheticControlStructures::new(CodecRegistry::with_builtin()),
                calls: Cell::new(0),
            }
        }
    }

    impl ControlStructureProvider for CountingProvider {
        fn fill_control_structure(
            &self,
            stream: usize,
            frame: usize,
            codec: CodecClass,
        ) -> anyhow::Result<Vec<u8>> {
            self.calls.set(self.calls.get() + 1);
            self.inner.fill_control_structure(stream, frame, codec)
        }
    }

    /// Validator recording every check, optionally raising a stop flag after `stop_after` checks.
    #[derive(Default)]
    struct RecordingValidator {
        checks: Vec<(usize, usize, usize)>,
        stop: Option<(usize, Arc<AtomicBool>)>,
    }

    impl GoldenValidator for RecordingValidator {
        fn check_frame(&mut self, stream: usize, frame: usize, output: &[u8]) -> GoldenVerdict {
            self.checks.push((stream, frame, output.len()));
            if let Some((after, stop)) = &self.stop {
                if self.checks.len() >= *after {
                    stop.store(true, Ordering::Release);
                }
            }
            GoldenVerdict::Pass
        }
    }

    /// Queue dropping the completion token write of one codec, as a hung engine would.
    struct HangOnCodec {
        inner: SoftwareEngine,
        codec: CodecClass,
        current: Option<u32>,
    }

    impl CommandQueue for HangOnCodec {
        fn engine_id(&self) -> usize {
            self.inner.engine_id()
        }

        fn bind_completion_token(&mut self, token: CompletionToken) {
            self.inner.bind_completion_token(token)
        }

        fn push(&mut self, command: Command) -> QueueResult<()> {
            match command {
                Command::SetParam(ControlParam::Application(id)) => self.current = Some(id),
                Command::WriteToken(_) if self.current == Some(self.codec.application_id()) => {
                    return Ok(())
                }
                _ => (),
            }
            self.inner.push(command)
        }

        fn flush(&mut self) -> QueueResult<()> {
            self.inner.flush()
        }

        fn discard(&mut self) {
            self.inner.discard()
        }

        fn wait_idle(&mut self, timeout: Duration) -> QueueResult<bool> {
            self.inner.wait_idle(timeout)
        }
    }

    fn engines(
        catalog: &StreamCatalog,
        tables: &IndirectionTables,
        count: usize,
        queue: impl Fn(usize) -> Box<dyn CommandQueue>,
    ) -> Vec<EngineContext> {
        (0..count)
            .map(|id| {
                let config = EngineConfig {
                    sync_timeout: Duration::from_millis(200),
                    ..EngineConfig::for_catalog(id, catalog, tables)
                };
                EngineContext::new(config, queue(id), &CodecRegistry::with_builtin()).unwrap()
            })
            .collect()
    }

    fn software(id: usize) -> Box<dyn CommandQueue> {
        Box::new(SoftwareEngine::new(id, Default::default()))
    }

    fn orchestrator(num_engines: usize, config: ExerciserConfig) -> TestOrchestrator {
        let catalog = StreamCatalog::builtin();
        let tables = IndirectionTables::builtin();
        let engines = engines(&catalog, &tables, num_engines, software);
        TestOrchestrator::new(catalog, tables, CodecRegistry::with_builtin(), engines, config)
    }

    fn ready() -> ReadyFlag {
        ReadyFlag::new(true)
    }

    #[test]
    fn three_frame_scenario() {
        let catalog = StreamCatalog::new(vec![StreamDescriptor {
            name: "scenario",
            codec: CodecClass::H264,
            resolution: Resolution::from((64, 64)),
            rate_control: RateControl::ConstantQuality(30),
            force_output: false,
            flags: 0,
            output_picture: vec![RefSlot::Unused, RefSlot::Physical(0), RefSlot::Physical(1)],
        }]);
        let tables = IndirectionTables::empty().with_stream(
            Family::RefPicList,
            0,
            vec![[UNUSED; 4], [0, UNUSED, UNUSED, UNUSED], [1, UNUSED, UNUSED, UNUSED]],
        );
        let engines = engines(&catalog, &tables, 1, software);
        assert_eq!(engines[0].config().pool_capacity, 2);

        let config = ExerciserConfig {
            trace: true,
            ..Default::default()
        };
        let mut orchestrator =
            TestOrchestrator::new(catalog, tables, CodecRegistry::with_builtin(), engines, config);
        let mut validator = RecordingValidator::default();
        let report = orchestrator
            .run(&ready(), &CountingProvider::new(), &mut validator)
            .unwrap();

        assert!(report.passed());
        let summary = report.streams[0].result.as_ref().unwrap();
        assert_eq!(summary.waits, 3);
        assert_eq!(summary.validations, 2);
        assert_eq!(validator.checks.len(), 2);
        assert!(validator.checks.iter().all(|(_, _, size)| *size > 0));
        assert_eq!(
            validator.checks.iter().map(|(_, f, _)| *f).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(orchestrator.trace().last(), Some(&TraceEvent::StreamDone { stream: 0 }));
    }

    #[test]
    fn one_submit_and_wait_per_frame_and_engine() {
        let mut orchestrator = orchestrator(2, Default::default());
        let report = orchestrator
            .run(&ready(), &CountingProvider::new(), &mut Crc32Goldens::capturing())
            .unwrap();

        assert_eq!(report.passes, 1);
        assert_eq!(report.streams.len(), 5);
        let catalog = StreamCatalog::builtin();
        for stream in &report.streams {
            let summary = stream.result.as_ref().unwrap();
            let frames = catalog.get(stream.stream).unwrap().num_frames();
            assert_eq!(summary.submissions, 2 * frames);
            assert_eq!(summary.waits, 2 * frames);
            assert!(summary.mismatches.is_empty(), "{}: {:?}", stream.name, summary.mismatches);
        }
    }

    #[test]
    fn engines_produce_identical_output() {
        // Golden values captured from engine 0 must hold for engine 1.
        let mut first = orchestrator(2, Default::default());
        let mut goldens = Crc32Goldens::capturing();
        let report = first.run(&ready(), &CountingProvider::new(), &mut goldens).unwrap();
        assert!(report.passed());

        // And for a second run on fresh engines.
        goldens.freeze();
        let mut second = orchestrator(1, Default::default());
        let report = second.run(&ready(), &CountingProvider::new(), &mut goldens).unwrap();
        assert!(report.passed());
    }

    #[test]
    fn frames_are_barriered_across_engines() {
        let config = ExerciserConfig {
            trace: true,
            ..Default::default()
        };
        let mut orchestrator = orchestrator(3, config);
        orchestrator
            .run(&ready(), &CountingProvider::new(), &mut Crc32Goldens::capturing())
            .unwrap();

        let trace = orchestrator.trace();
        let position = |pred: fn(&TraceEvent, usize, usize) -> bool, stream: usize, frame: usize| {
            trace
                .iter()
                .enumerate()
                .filter(|(_, e)| pred(e, stream, frame))
                .map(|(i, _)| i)
                .collect::<Vec<usize>>()
        };
        let is_submit = |e: &TraceEvent, stream: usize, frame: usize| {
            matches!(e, TraceEvent::Submit { stream: s, frame: f, .. }
                if *s == stream && *f == frame)
        };
        let is_wait = |e: &TraceEvent, stream: usize, frame: usize| {
            matches!(e, TraceEvent::Wait { stream: s, frame: f, .. } if *s == stream && *f == frame)
        };
        let is_flush =
            |e: &TraceEvent, stream: usize, frame: usize| *e == TraceEvent::Flush { stream, frame };

        let catalog = StreamCatalog::builtin();
        for (stream, desc) in catalog.streams().iter().enumerate() {
            for frame in 0..desc.num_frames() {
                let submits = position(is_submit, stream, frame);
                let waits = position(is_wait, stream, frame);
                let flush = position(is_flush, stream, frame);

                assert_eq!(submits.len(), 3);
                assert_eq!(waits.len(), 3);
                assert_eq!(flush.len(), 1);
                // Every engine is submitted before the flush, and waited on after it.
                assert!(submits.iter().all(|s| *s < flush[0]));
                assert!(waits.iter().all(|w| *w > flush[0]));

                for next in position(is_submit, stream, frame + 1) {
                    assert!(waits.iter().all(|w| *w < next));
                }
            }
        }
    }

    #[test]
    fn all_streams_skipped() {
        let config = ExerciserConfig {
            stream_skip_mask: u64::MAX,
            ..Default::default()
        };
        let mut orchestrator = orchestrator(1, config);
        let provider = CountingProvider::new();

        let res = orchestrator.run(&ready(), &provider, &mut Crc32Goldens::capturing());
        assert!(matches!(res, Err(RunError::AllStreamsSkipped)));
        assert_eq!(provider.calls.get(), 0);
    }

    #[test]
    fn device_not_ready() {
        let mut orchestrator = orchestrator(1, Default::default());
        let provider = CountingProvider::new();

        let res =
            orchestrator.run(&ReadyFlag::new(false), &provider, &mut Crc32Goldens::capturing());
        assert!(matches!(res, Err(RunError::DeviceNotReady)));
        assert_eq!(provider.calls.get(), 0);
    }

    #[test]
    fn masks_and_frame_limit() {
        let config = ExerciserConfig {
            // Only stream 1, on engine 1.
            stream_skip_mask: !(1 << 1),
            engine_skip_mask: 1 << 0,
            max_frames: Some(2),
            trace: true,
            ..Default::default()
        };
        let mut orchestrator = orchestrator(2, config);
        let report = orchestrator
            .run(&ready(), &CountingProvider::new(), &mut Crc32Goldens::capturing())
            .unwrap();

        assert_eq!(report.streams.len(), 1);
        assert_eq!(report.streams[0].stream, 1);
        let summary = report.streams[0].result.as_ref().unwrap();
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.submissions, 2);
        assert!(orchestrator
            .trace()
            .iter()
            .all(|e| !matches!(e, TraceEvent::Submit { engine: 0, .. })));
    }

    #[test]
    fn keep_running_stops_between_streams() {
        let config = ExerciserConfig {
            // Only stream 0, four frames.
            stream_skip_mask: !1,
            keep_running: true,
            ..Default::default()
        };
        let mut orchestrator = orchestrator(1, config);
        let mut validator = RecordingValidator {
            stop: Some((5, orchestrator.stop_handle())),
            ..Default::default()
        };

        let report = orchestrator
            .run(&ready(), &CountingProvider::new(), &mut validator)
            .unwrap();

        // The stop flag was raised during the second pass, which still ran to completion.
        assert_eq!(report.passes, 2);
        assert_eq!(report.streams.len(), 1);
        assert_eq!(report.streams[0].runs, 2);
        assert!(report.passed());
        assert_eq!(validator.checks.len(), 8);

        let summary = report.streams[0].result.as_ref().unwrap();
        assert_eq!(summary.frames, 8);
        assert_eq!(summary.validations, 8);
    }

    #[test]
    fn stopped_orchestrator_runs_again() {
        let config = ExerciserConfig {
            stream_skip_mask: !1,
            keep_running: true,
            ..Default::default()
        };
        let mut orchestrator = orchestrator(1, config);
        let mut validator = RecordingValidator {
            stop: Some((1, orchestrator.stop_handle())),
            ..Default::default()
        };
        let report = orchestrator
            .run(&ready(), &CountingProvider::new(), &mut validator)
            .unwrap();
        assert_eq!(report.passes, 1);
        assert!(orchestrator.stop_handle().load(Ordering::Acquire));

        let mut validator = RecordingValidator {
            stop: Some((1, orchestrator.stop_handle())),
            ..Default::default()
        };
        let report = orchestrator
            .run(&ready(), &CountingProvider::new(), &mut validator)
            .unwrap();
        assert_eq!(report.streams.len(), 1);
        assert_eq!(validator.checks.len(), 4);
        assert!(report.passed());
    }

    #[test]
    fn empty_report_does_not_pass() {
        assert!(!RunReport::default().passed());
    }

    #[test]
    fn repeated_runs_are_aggregated() {
        let mut report = RunReport::default();
        let failing = |frame| StreamSummary {
            frames: 1,
            mismatches: vec![Mismatch {
                frame,
                engine: 0,
                diff: "crc".into(),
            }],
            ..Default::default()
        };

        for frame in 0..MAX_RECORDED_MISMATCHES + 10 {
            report.record(3, "stream", Ok(failing(frame)));
        }
        assert_eq!(report.streams.len(), 1);
        let stream = &report.streams[0];
        assert_eq!(stream.runs, MAX_RECORDED_MISMATCHES + 10);
        let summary = stream.result.as_ref().unwrap();
        assert_eq!(summary.frames, MAX_RECORDED_MISMATCHES + 10);
        assert_eq!(summary.mismatches.len(), MAX_RECORDED_MISMATCHES);
        assert_eq!(summary.dropped_mismatches, 10);
        assert!(!report.passed());

        // The first abort is kept over later runs.
        report.record(4, "other", Ok(Default::default()));
        report.record(
            4,
            "other",
            Err(StreamError::ResourceTooSmall {
                engine: 1,
                kind: BufferKind::InputPicture,
            }),
        );
        report.record(4, "other", Ok(Default::default()));
        assert_eq!(report.streams.len(), 2);
        assert_eq!(report.streams[1].runs, 3);
        assert!(matches!(
            report.streams[1].result,
            Err(StreamError::ResourceTooSmall { engine: 1, .. })
        ));
    }

    #[test]
    fn trace_is_bounded() {
        let mut trace = Trace::new(true);
        trace.limit = 8;
        for stream in 0..100 {
            trace.record(TraceEvent::StreamStart { stream });
        }
        assert!(trace.events.len() <= 8);
        assert_eq!(trace.events.last(), Some(&TraceEvent::StreamStart { stream: 99 }));

        let mut disabled = Trace::new(false);
        disabled.record(TraceEvent::StreamStart { stream: 0 });
        assert!(disabled.events.is_empty());
    }

    #[test]
    fn input_picture_must_fit() {
        let catalog = StreamCatalog::builtin();
        let tables = IndirectionTables::builtin();
        let engines = engines(&catalog, &tables, 1, software);
        let ctx = &engines[0];
        let size = ctx.input_picture().len();

        assert!(upload_input_picture(ctx, Some(vec![0x11; size].as_slice())).is_ok());
        assert_eq!(ctx.input_picture().read(0, 4), Some(vec![0x11; 4]));

        for picture in [Some(vec![0u8; size + 1]), None] {
            assert!(matches!(
                upload_input_picture(ctx, picture.as_deref()),
                Err(StreamError::ResourceTooSmall {
                    engine: 0,
                    kind: BufferKind::InputPicture
                })
            ));
        }
    }

    #[test]
    fn timeout_aborts_only_its_stream() {
        let catalog = StreamCatalog::builtin();
        let tables = IndirectionTables::builtin();
        let engines = engines(&catalog, &tables, 2, |id| {
            Box::new(HangOnCodec {
                inner: SoftwareEngine::new(id, Default::default()),
                codec: CodecClass::Av1,
                current: None,
            })
        });
        let mut orchestrator = TestOrchestrator::new(
            catalog,
            tables,
            CodecRegistry::with_builtin(),
            engines,
            Default::default(),
        );

        let report = orchestrator
            .run(&ready(), &CountingProvider::new(), &mut Crc32Goldens::capturing())
            .unwrap();

        assert_eq!(report.streams.len(), 5);
        for stream in &report.streams {
            if stream.stream == 2 {
                assert!(matches!(
                    stream.result,
                    Err(StreamError::Sync {
                        frame: 0,
                        source: SyncError::TimeoutOrFault { .. },
                        ..
                    })
                ));
            } else {
                assert!(stream.passed(), "{}: {:?}", stream.name, stream.result);
            }
        }
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn bad_control_structure_size() {
        struct Short;
        impl ControlStructureProvider for Short {
            fn fill_control_structure(
                &self,
                _: usize,
                _: usize,
                _: CodecClass,
            ) -> anyhow::Result<Vec<u8>> {
                Ok(vec![0; 8])
            }
        }

        let config = ExerciserConfig {
            stream_skip_mask: !1,
            ..Default::default()
        };
        let mut orchestrator = orchestrator(1, config);
        let report = orchestrator
            .run(&ready(), &Short, &mut Crc32Goldens::capturing())
            .unwrap();

        assert!(matches!(
            report.streams[0].result,
            Err(StreamError::ControlStructureSize {
                frame: 0,
                expected: 512,
                actual: 8
            })
        ));
    }

    #[test]
    fn saves_validated_outputs() {
        let dir = std::env::temp_dir().join(format!("encexer-save-{}", std::process::id()));
        let config = ExerciserConfig {
            stream_skip_mask: !(1 << 4 | 1),
            save_output_dir: Some(dir.clone()),
            ..Default::default()
        };
        let mut orchestrator = orchestrator(1, config);
        orchestrator
            .run(&ready(), &CountingProvider::new(), &mut Crc32Goldens::capturing())
            .unwrap();

        let mut files: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        std::fs::remove_dir_all(&dir).unwrap();

        // The motion estimation only stream has no output to validate.
        assert_eq!(
            files,
            (0..4)
                .map(|f| format!("h264_ipp_320x240_engine0_frame{:03}.bin", f))
                .collect::<Vec<_>>()
        );
    }
}
