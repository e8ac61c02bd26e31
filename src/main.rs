//! # Main — CLI Entry Point and Worktodo Loop
//!
//! Parses flags, sets up logging (stdout plus `gpuowl.log`), picks a GPU,
//! then works through `worktodo.txt` one exponent at a time: compile the
//! kernels for the exponent's FFT shape, run the PRP test, append the
//! result, delete the queue entry. Stops on user interrupt, on a persistent
//! error, or after finding a probable prime.

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use gpuowl::gpu::Gpu;
use gpuowl::prp::{self, PrpResult};
use gpuowl::shape::FftShape;
use gpuowl::{cl, report, stop, worktodo, PROGRAM, VERSION};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Tail {
    /// Single fused inner-FFT + square + inner-FFT kernel
    Fused,
    /// Separate fftH, square, fftH launches
    Split,
}

#[derive(Parser)]
#[command(name = "gpuowl", about = "GPU OpenCL probable-prime tester for Mersenne numbers")]
struct Cli {
    /// GPU device index (default: first GPU found)
    #[arg(long)]
    device: Option<usize>,

    /// List visible GPU devices and exit
    #[arg(long)]
    list_devices: bool,

    /// User name included in results
    #[arg(long)]
    user: Option<String>,

    /// Computer/GPU label included in results (default: device name)
    #[arg(long)]
    cpu: Option<String>,

    /// OpenCL kernel source file
    #[arg(long, default_value = "gpuowl.cl")]
    kernel: PathBuf,

    /// Directory for OpenCL compiler intermediate dumps
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Extra options passed to the OpenCL compiler
    #[arg(long, default_value = "")]
    cl_args: String,

    /// Measure and report per-kernel times at every check
    #[arg(long)]
    time_kernels: bool,

    /// Tail strategy for the inner FFT
    #[arg(long, value_enum, default_value = "fused")]
    tail: Tail,

    /// Work queue file
    #[arg(long, default_value = "worktodo.txt")]
    worktodo: PathBuf,

    /// Results file
    #[arg(long, default_value = "results.txt")]
    results: PathBuf,
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stdout);
    let registry = tracing_subscriber::registry().with(filter).with(stdout_layer);

    match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open("gpuowl.log")
    {
        Ok(file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            registry.with(file_layer).init();
        }
        Err(_) => registry.init(),
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    info!("{PROGRAM} v{VERSION} GPU Mersenne primality checker");

    if cli.list_devices {
        let devices = cl::list_devices();
        if devices.is_empty() {
            info!("no GPU devices visible");
        }
        for (i, (_, device)) in devices.iter().enumerate() {
            info!("{i}: {}", cl::device_label(device));
        }
        return Ok(());
    }

    let (platform, device) = cl::select_device(cli.device)?;
    info!("{}", cl::device_label(&device));
    let cpu_name = cli
        .cpu
        .clone()
        .unwrap_or_else(|| cl::device_label(&device));

    let context = cl::create_context(platform, device)?;
    let queue = cl::create_queue(&context, device, cli.time_kernels)?;

    stop::install();
    let mut failure = None;
    loop {
        let Some(entry) = worktodo::read_entry(&cli.worktodo)? else {
            break;
        };
        match run_exponent(&cli, &context, device, &queue, &cpu_name, &entry) {
            Ok(true) => continue,
            Ok(false) => break,
            Err(err) => {
                error!("M({}) failed: {err:#}", entry.exponent);
                failure = Some(err);
                break;
            }
        }
    }
    stop::restore();
    if let Some(err) = failure {
        return Err(err);
    }
    info!("Bye");
    Ok(())
}

/// Test one exponent end to end. Returns whether to keep going: false after
/// a stop request or a probable prime.
fn run_exponent(
    cli: &Cli,
    context: &ocl::Context,
    device: ocl::Device,
    queue: &ocl::Queue,
    cpu_name: &str,
    entry: &worktodo::Entry,
) -> Result<bool> {
    let e = entry.exponent;
    let shape = FftShape::for_exponent(e);

    let source = fs::read_to_string(&cli.kernel)
        .with_context(|| format!("reading kernel source {}", cli.kernel.display()))?;
    let defines = [
        ("EXP", e),
        ("WIDTH", shape.width as u32),
        ("NW", shape.n_w() as u32),
        ("HEIGHT", shape.height as u32),
        ("NH", shape.n_h() as u32),
    ];
    let dump = cli
        .dump
        .as_ref()
        .map(|dir| format!("{}/{}", dir.display(), shape.config_name()));
    let program = cl::build_program(
        context,
        device,
        &source,
        &defines,
        &cli.cl_args,
        dump.as_deref(),
    )?;

    let use_split_tail = cli.tail == Tail::Split;
    info!(
        "Note: using long carry and {} tail kernels",
        if use_split_tail { "split" } else { "fused" }
    );

    let mut gpu = Gpu::new(e, shape, &program, queue.clone(), cli.time_kernels, use_split_tail)?;

    match prp::check_prime(
        &mut gpu,
        e,
        &shape,
        Path::new("."),
        cpu_name,
        cli.time_kernels,
        stop::flag(),
    )? {
        PrpResult::Stopped => Ok(false),
        PrpResult::Finished(outcome) => {
            let line = report::result_line(
                e,
                outcome.is_prime,
                outcome.res64,
                shape.fft_label(),
                outcome.n_errors,
                cli.user.as_deref(),
                Some(cpu_name),
                entry.aid.as_deref(),
                report::utc_timestamp(),
            );
            report::write_result(&cli.results, &line)?;
            worktodo::delete_entry(&cli.worktodo, e)?;
            // A probable prime stops the queue; everything else continues.
            Ok(!outcome.is_prime)
        }
    }
}
