//! CLI for the simblk device model.
//!
//! Creates and inspects disk images, replays request traces through the
//! driver and disk model, and runs a write-then-verify sweep.

mod runner;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use simblk::backing::{BackingStore, FileStore, create_image};
use simblk::block::{BlockOp, BlockRequest};
use simblk::config::{BackendKind, DiskConfig, DriverConfig, SimConfig};
use simblk::request::SECTOR_SIZE;
use tracing_subscriber::EnvFilter;

use crate::runner::{Buffer, Finished, Outcome, Runner};

/// simblk: register-level block device simulator.
#[derive(Parser)]
#[command(name = "simblk", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create a zero-filled disk image.
    Create {
        /// Path of the image to create.
        image: PathBuf,

        /// Capacity in 512-byte sectors.
        #[arg(long, default_value = "2048")]
        sectors: u32,
    },

    /// Display image size and geometry.
    Info {
        /// Path to the image.
        image: PathBuf,
    },

    /// Replay a JSON request trace and print completions and stats as JSON.
    Replay {
        /// Simulation config (JSON).
        config: PathBuf,

        /// Request trace (JSON).
        trace: PathBuf,

        /// Ticks allowed for the final drain.
        #[arg(long, default_value = "1000000")]
        max_ticks: u64,
    },

    /// Write every sector, read it back, and report cost in ticks.
    Exercise {
        /// Capacity of the scratch image in sectors.
        #[arg(long, default_value = "2048")]
        sectors: u32,

        /// Tag pool size.
        #[arg(long, default_value = "4")]
        ntags: u8,

        /// Sectors per request.
        #[arg(long, default_value = "16")]
        max_request_length: u32,

        /// Read and write latency in ticks.
        #[arg(long, default_value = "100")]
        latency: u64,

        /// Words each streaming direction carries per tick.
        #[arg(long, default_value = "8")]
        words_per_tick: usize,

        /// Backing store implementation.
        #[arg(long, default_value = "file")]
        backend: Backend,
    },
}

/// Backing store choice on the command line.
#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// Positional file I/O.
    File,
    /// Memory-mapped file.
    Mmap,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::File => Self::File,
            Backend::Mmap => Self::Mmap,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Create { image, sectors } => cmd_create(&image, sectors),
        Commands::Info { image } => cmd_info(&image),
        Commands::Replay {
            config,
            trace,
            max_ticks,
        } => cmd_replay(&config, &trace, max_ticks),
        Commands::Exercise {
            sectors,
            ntags,
            max_request_length,
            latency,
            words_per_tick,
            backend,
        } => cmd_exercise(&ExerciseParams {
            sectors,
            ntags,
            max_request_length,
            latency,
            words_per_tick,
            backend: backend.into(),
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `simblk create <image> --sectors N`.
fn cmd_create(image: &Path, sectors: u32) -> Result<(), Box<dyn std::error::Error>> {
    if image.exists() {
        return Err(format!("'{}' already exists", image.display()).into());
    }
    create_image(image, sectors)?;
    println!(
        "Created {} ({sectors} sectors, {})",
        image.display(),
        format_bytes(u64::from(sectors) * SECTOR_SIZE as u64)
    );
    Ok(())
}

/// Implements `simblk info <image>`.
fn cmd_info(image: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::open(image, true)?;
    let bytes = store.len_bytes();
    let nsectors = store.nsectors();
    let trailing = bytes % SECTOR_SIZE as u64;

    println!("Image: {}", image.display());
    println!("  Size: {} ({bytes} bytes)", format_bytes(bytes));
    println!("  Sectors: {nsectors} x {SECTOR_SIZE} bytes");
    if trailing != 0 {
        println!("  Trailing bytes ignored: {trailing}");
    }
    if nsectors == 0 {
        println!("  A driver probing this image would find no device.");
    }
    Ok(())
}

/// A request trace for `simblk replay`.
#[derive(Debug, Deserialize)]
struct Trace {
    #[serde(default)]
    driver: DriverConfig,
    steps: Vec<Step>,
}

/// One trace step.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Step {
    /// Read `sectors` sectors at `sector`.
    Read { sector: u32, sectors: u32 },
    /// Write `sectors` sectors at `sector`, every byte set to `pattern`.
    Write {
        sector: u32,
        sectors: u32,
        #[serde(default)]
        pattern: u8,
    },
    /// Any other block operation, dispatched without a buffer.
    Control { kind: BlockOp },
    /// Run `count` ticks.
    Tick { count: u64 },
    /// Tick until every request has completed.
    Drain,
}

/// A replayed request's result.
#[derive(Debug, Serialize)]
struct ReplayCompletion {
    step: usize,
    op: BlockOp,
    outcome: Outcome,
    tick: u64,
    /// For reads: the byte every sector holds, if the data is uniform.
    #[serde(skip_serializing_if = "Option::is_none")]
    uniform_byte: Option<u8>,
}

/// Output of `simblk replay`.
#[derive(Debug, Serialize)]
struct ReplayReport<'a> {
    ticks: u64,
    completions: Vec<ReplayCompletion>,
    stats: &'a simblk::DiskStats,
}

/// Implements `simblk replay <config> <trace>`.
fn cmd_replay(
    config_path: &Path,
    trace_path: &Path,
    max_ticks: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = SimConfig::from_json_file(config_path)?;
    let trace: Trace = serde_json::from_str(&std::fs::read_to_string(trace_path)?)?;
    let mut runner = Runner::new(&config, trace.driver)?;

    let mut pending: HashMap<usize, (BlockOp, Option<Buffer>)> = HashMap::new();
    let mut completions = Vec::new();

    for (step, entry) in trace.steps.into_iter().enumerate() {
        match entry {
            Step::Read { sector, sectors } => {
                let buffer = runner.alloc(sectors);
                pending.insert(step, (BlockOp::Read, Some(buffer)));
                runner.submit(Runner::request(BlockOp::Read, step, sector, sectors, buffer))?;
            }
            Step::Write {
                sector,
                sectors,
                pattern,
            } => {
                let buffer = runner.alloc(sectors);
                runner
                    .sim()
                    .memory()
                    .write(buffer.addr, &vec![pattern; buffer.len])?;
                pending.insert(step, (BlockOp::Write, None));
                runner.submit(Runner::request(BlockOp::Write, step, sector, sectors, buffer))?;
            }
            Step::Control { kind } => {
                pending.insert(step, (kind, None));
                runner.submit(BlockRequest::control(kind, step))?;
            }
            Step::Tick { count } => {
                for _ in 0..count {
                    runner.tick()?;
                }
            }
            Step::Drain => {
                runner.drain(max_ticks)?;
            }
        }
        resolve(&mut runner, &mut pending, &mut completions)?;
    }

    runner.drain(max_ticks)?;
    resolve(&mut runner, &mut pending, &mut completions)?;
    if !pending.is_empty() {
        tracing::warn!(
            outstanding = pending.len(),
            "requests still outstanding after {max_ticks} drain ticks"
        );
    }

    let report = ReplayReport {
        ticks: runner.sim().now(),
        completions,
        stats: runner.sim().stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Moves finished requests from `pending` to `completions`.
fn resolve(
    runner: &mut Runner,
    pending: &mut HashMap<usize, (BlockOp, Option<Buffer>)>,
    completions: &mut Vec<ReplayCompletion>,
) -> Result<(), Box<dyn std::error::Error>> {
    for done in runner.take_finished() {
        let Some((op, buffer)) = pending.remove(&done.request) else {
            continue;
        };
        let uniform_byte = match (buffer, done.outcome) {
            (Some(buffer), Outcome::Ok) => {
                let mut data = vec![0u8; buffer.len];
                runner.sim().memory().read(buffer.addr, &mut data)?;
                uniform(&data)
            }
            _ => None,
        };
        completions.push(ReplayCompletion {
            step: done.request,
            op,
            outcome: done.outcome,
            tick: done.tick,
            uniform_byte,
        });
    }
    Ok(())
}

fn uniform(data: &[u8]) -> Option<u8> {
    let (&first, rest) = data.split_first()?;
    rest.iter().all(|&b| b == first).then_some(first)
}

struct ExerciseParams {
    sectors: u32,
    ntags: u8,
    max_request_length: u32,
    latency: u64,
    words_per_tick: usize,
    backend: BackendKind,
}

/// Implements `simblk exercise`.
#[allow(clippy::cast_precision_loss)]
fn cmd_exercise(params: &ExerciseParams) -> Result<(), Box<dyn std::error::Error>> {
    println!("simblk write-then-verify sweep");
    println!("  Sectors: {}", params.sectors);
    println!("  Tags: {}", params.ntags);
    println!("  Request length: {} sectors", params.max_request_length);
    println!("  Latency: {} ticks", params.latency);
    println!("  Words per tick: {}", params.words_per_tick);
    println!();

    let temp_dir = std::env::temp_dir().join("simblk_exercise");
    let _ = std::fs::remove_dir_all(&temp_dir);
    std::fs::create_dir_all(&temp_dir)?;
    let image = temp_dir.join("disk.img");
    create_image(&image, params.sectors)?;

    let config = SimConfig {
        disk: DiskConfig {
            backend: params.backend,
            ntags: params.ntags,
            max_request_length: params.max_request_length,
            read_latency: params.latency,
            write_latency: params.latency,
            ..DiskConfig::with_backing(&image)
        },
        words_per_tick: params.words_per_tick,
        ..SimConfig::default()
    };
    let mut runner = Runner::new(&config, DriverConfig::default())?;

    let chunks: Vec<(u32, u32)> = (0..params.sectors)
        .step_by(params.max_request_length as usize)
        .map(|start| (start, params.max_request_length.min(params.sectors - start)))
        .collect();
    let drain_limit = (params.latency + 1 + u64::from(params.max_request_length) * 64)
        * (chunks.len() as u64 + 1);

    let start = Instant::now();

    for (id, &(sector, sectors)) in chunks.iter().enumerate() {
        let buffer = runner.alloc(sectors);
        runner
            .sim()
            .memory()
            .write(buffer.addr, &vec![pattern_for(id); buffer.len])?;
        runner.submit(Runner::request(BlockOp::Write, id, sector, sectors, buffer))?;
    }
    let write_ticks = runner.drain(drain_limit)?;
    let write_failures = count_failures(&runner.take_finished());

    let mut buffers = Vec::with_capacity(chunks.len());
    let read_start = runner.sim().now();
    for (id, &(sector, sectors)) in chunks.iter().enumerate() {
        let buffer = runner.alloc(sectors);
        buffers.push(buffer);
        runner.submit(Runner::request(BlockOp::Read, id, sector, sectors, buffer))?;
    }

    // Checked as each read lands; wrapped buffers are reused by later reads.
    let mut mismatches = 0usize;
    let mut read_failures = 0usize;
    let mut verified = 0usize;
    let read_deadline = read_start + drain_limit;
    while verified + read_failures < chunks.len() && runner.sim().now() < read_deadline {
        runner.tick()?;
        for done in runner.take_finished() {
            if done.outcome != Outcome::Ok {
                read_failures += 1;
                continue;
            }
            let buffer = buffers[done.request];
            let mut data = vec![0u8; buffer.len];
            runner.sim().memory().read(buffer.addr, &mut data)?;
            if uniform(&data) != Some(pattern_for(done.request)) {
                mismatches += 1;
            }
            verified += 1;
        }
    }
    let read_ticks = runner.sim().now() - read_start;
    runner.sim_mut().sync()?;

    let elapsed = start.elapsed();
    let requests = chunks.len() * 2;

    println!("Results:");
    println!("  Requests: {requests}");
    println!("  Write ticks: {write_ticks}");
    println!("  Read ticks: {read_ticks}");
    println!(
        "  Ticks per request: {:.1}",
        (write_ticks + read_ticks) as f64 / requests as f64
    );
    println!("  Write failures: {write_failures}");
    println!("  Read failures: {read_failures}");
    println!("  Mismatched sectors: {mismatches}");
    println!("  Elapsed: {elapsed:.3?}");
    println!();
    println!("{}", serde_json::to_string_pretty(runner.sim().stats())?);

    let _ = std::fs::remove_dir_all(&temp_dir);

    if write_failures + read_failures + mismatches > 0 {
        return Err("sweep found errors".into());
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)] // id % 251 fits in a byte
fn pattern_for(id: usize) -> u8 {
    (id % 251) as u8 + 1
}

fn count_failures(finished: &[Finished]) -> usize {
    finished.iter().filter(|f| f.outcome != Outcome::Ok).count()
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
