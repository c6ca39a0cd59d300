// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs the built-in stream catalog on software engines.

use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use argh::FromArgs;

use cros_encexerciser::backend::software::Fault;
use cros_encexerciser::backend::software::SoftwareEngine;
use cros_encexerciser::backend::software::SoftwareEngineConfig;
use cros_encexerciser::codec::CodecRegistry;
use cros_encexerciser::context::EngineConfig;
use cros_encexerciser::context::EngineContext;
use cros_encexerciser::context::Generation;
use cros_encexerciser::device::DeviceBringUp;
use cros_encexerciser::device::DeviceConfig;
use cros_encexerciser::device::SoftwareDevice;
use cros_encexerciser::golden::Crc32Goldens;
use cros_encexerciser::orchestrator::ExerciserConfig;
use cros_encexerciser::orchestrator::TestOrchestrator;
use cros_encexerciser::provider::SyntheticControlStructures;
use cros_encexerciser::refs::IndirectionTables;
use cros_encexerciser::stream::StreamCatalog;
use cros_encexerciser::sync::SyncStrategy;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
enum SyncMode {
    #[default]
    Poll,
    Idle,
}

impl FromStr for SyncMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poll" => Ok(Self::Poll),
            "idle" => Ok(Self::Idle),
            _ => Err("unrecognized sync strategy. Valid values: poll, idle"),
        }
    }
}

/// Multi-engine encoder exerciser
#[derive(Debug, FromArgs)]
struct Args {
    /// number of engines
    #[argh(option, default = "2")]
    engines: usize,

    /// use separate luma and chroma reference surfaces
    #[argh(switch)]
    split_planes: bool,

    /// bitmask of streams to skip
    #[argh(option, default = "0")]
    stream_skip_mask: u64,

    /// bitmask of engines to skip
    #[argh(option, default = "0")]
    engine_skip_mask: u64,

    /// maximum number of frames per stream
    #[argh(option)]
    max_frames: Option<usize>,

    /// loop over the catalog until the duration elapsed
    #[argh(option)]
    keep_running_secs: Option<u64>,

    /// completion timeout in milliseconds
    #[argh(option, default = "2000")]
    timeout_ms: u64,

    /// how completion is detected: poll or idle
    #[argh(option, default = "SyncMode::Poll")]
    sync: SyncMode,

    /// simulated engine latency in milliseconds
    #[argh(option, default = "0")]
    latency_ms: u64,

    /// make the engine with this id hang
    #[argh(option)]
    hang_engine: Option<usize>,

    /// clock the engines from their private PLL
    #[argh(switch)]
    private_pll: bool,

    /// golden file to check against, or to write when --capture is set
    #[argh(option)]
    goldens: Option<PathBuf>,

    /// record golden values instead of checking them
    #[argh(switch)]
    capture: bool,

    /// directory to save the output of every frame to
    #[argh(option)]
    save_output: Option<PathBuf>,

    /// print the trace of the run
    #[argh(switch)]
    trace: bool,
}

fn load_goldens(path: &Path) -> Crc32Goldens {
    let file = File::open(path).expect("error opening golden file");
    let mut goldens = Crc32Goldens::new();
    for line in BufReader::new(file).lines() {
        let line = line.expect("error reading golden file");
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let [stream, frame, crc] = fields[..] {
            goldens.insert(
                stream.parse().expect("invalid stream index"),
                frame.parse().expect("invalid frame index"),
                u32::from_str_radix(crc, 16).expect("invalid crc"),
            );
        }
    }

    goldens
}

fn store_goldens(path: &Path, goldens: &Crc32Goldens) {
    let mut file = File::create(path).expect("error creating golden file");
    for ((stream, frame), crc) in goldens.iter() {
        writeln!(file, "{} {} {:08x}", stream, frame, crc).expect("error writing golden file");
    }
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let mut device = SoftwareDevice::new();
    device
        .bring_up(&DeviceConfig {
            num_engines: args.engines,
            private_pll: args.private_pll,
        })
        .expect("device bring-up failed");

    let catalog = StreamCatalog::builtin();
    let tables = IndirectionTables::builtin();
    let registry = CodecRegistry::with_builtin();

    let engines = (0..args.engines)
        .map(|id| {
            let config = EngineConfig {
                generation: if args.split_planes {
                    Generation::SplitPlanes
                } else {
                    Generation::CombinedPlanes
                },
                sync: match args.sync {
                    SyncMode::Poll => Default::default(),
                    SyncMode::Idle => SyncStrategy::QueueIdle,
                },
                sync_timeout: Duration::from_millis(args.timeout_ms),
                ..EngineConfig::for_catalog(id, &catalog, &tables)
            };
            let engine = SoftwareEngine::new(
                id,
                SoftwareEngineConfig {
                    latency: Duration::from_millis(args.latency_ms),
                    fault: (args.hang_engine == Some(id)).then_some(Fault::Hang),
                },
            );

            EngineContext::new(config, Box::new(engine), &registry)
                .expect("failed to create engine")
        })
        .collect();

    let config = ExerciserConfig {
        stream_skip_mask: args.stream_skip_mask,
        engine_skip_mask: args.engine_skip_mask,
        max_frames: args.max_frames,
        keep_running: args.keep_running_secs.is_some(),
        trace: args.trace,
        save_output_dir: args.save_output.clone(),
        ..Default::default()
    };

    let provider = SyntheticControlStructures::new(registry.clone());
    let mut goldens = match (&args.goldens, args.capture) {
        (Some(path), false) => load_goldens(path),
        _ => Crc32Goldens::capturing(),
    };

    let mut orchestrator = TestOrchestrator::new(catalog, tables, registry, engines, config);

    if let Some(secs) = args.keep_running_secs {
        let stop = orchestrator.stop_handle();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            stop.store(true, Ordering::Release);
        });
    }

    let report = orchestrator
        .run(&device, &provider, &mut goldens)
        .expect("run failed");

    if args.trace {
        for event in orchestrator.trace() {
            println!("{:?}", event);
        }
    }

    for stream in &report.streams {
        match &stream.result {
            Ok(summary) => println!(
                "{:<24} {} runs, {} frames, {} submissions, {} validations, {} mismatches",
                stream.name,
                stream.runs,
                summary.frames,
                summary.submissions,
                summary.validations,
                summary.mismatches.len() + summary.dropped_mismatches
            ),
            Err(e) => println!("{:<24} FAILED: {}", stream.name, e),
        }
    }

    if let (Some(path), true) = (&args.goldens, args.capture) {
        store_goldens(path, &goldens);
    }

    if !report.passed() {
        std::process::exit(1);
    }
}
