//! # CL — OpenCL Device, Program and Kernel Plumbing
//!
//! Thin layer over the `ocl` crate: GPU enumeration and selection, program
//! compilation with the CL2.0/fallback dance, and the [`Kern`] wrapper that
//! gives each kernel a name, sticky named arguments, and optional
//! event-profiled timing. Everything GPU-owned is RAII: dropping the engine
//! releases buffers, kernels, program and queue in order.

use anyhow::{anyhow, bail, Result};
use ocl::enums::{ProfilingInfo, ProfilingInfoResult};
use ocl::{Context, Device, Event, Kernel, Platform, Program, Queue};
use std::cell::Cell;
use tracing::info;

/// `ocl` still reports errors through its own type; flatten to anyhow at the
/// boundary so callers stay on `?`.
pub fn cl_err(e: ocl::Error) -> anyhow::Error {
    anyhow!("OpenCL: {}", e)
}

/// All visible GPU devices, across every platform, in a stable order.
pub fn list_devices() -> Vec<(Platform, Device)> {
    let mut found = Vec::new();
    for platform in Platform::list() {
        if let Ok(devices) = Device::list(platform, Some(ocl::flags::DEVICE_TYPE_GPU)) {
            found.extend(devices.into_iter().map(|d| (platform, d)));
        }
    }
    found
}

/// Pick the GPU at `index`, or the first one when no index is given.
pub fn select_device(index: Option<usize>) -> Result<(Platform, Device)> {
    let devices = list_devices();
    match index {
        Some(i) => devices.get(i).copied().ok_or_else(|| {
            anyhow!(
                "device index {} out of range ({} GPU device(s) visible)",
                i,
                devices.len()
            )
        }),
        None => devices
            .first()
            .copied()
            .ok_or_else(|| anyhow!("no GPU device found; see --list-devices")),
    }
}

/// Short device label: vendor and name, as reported by the driver.
pub fn device_label(device: &Device) -> String {
    let name = device.name().unwrap_or_else(|_| "?".into());
    let vendor = device.vendor().unwrap_or_else(|_| "?".into());
    format!("{} {}", vendor.trim(), name.trim())
}

pub fn create_context(platform: Platform, device: Device) -> Result<Context> {
    Context::builder()
        .platform(platform)
        .devices(device)
        .build()
        .map_err(cl_err)
}

pub fn create_queue(context: &Context, device: Device, profiling: bool) -> Result<Queue> {
    let props = profiling.then_some(ocl::flags::QUEUE_PROFILING_ENABLE);
    Queue::new(context, device, props).map_err(cl_err)
}

/// Compile the kernel source with the given integer defines. Tries
/// `-cl-std=CL2.0 -cl-fast-relaxed-math` first and falls back to the
/// non-2.0 variant, like the original build.
pub fn build_program(
    context: &Context,
    device: Device,
    source: &str,
    defines: &[(&str, u32)],
    extra_args: &str,
    dump: Option<&str>,
) -> Result<Program> {
    let opts = |cl20: bool| {
        let mut s = String::new();
        if cl20 {
            s.push_str("-cl-std=CL2.0 ");
        }
        s.push_str("-cl-fast-relaxed-math");
        for (key, value) in defines {
            s.push_str(&format!(" -D {}={}u", key, value));
        }
        if !extra_args.is_empty() {
            s.push(' ');
            s.push_str(extra_args);
        }
        if let Some(dir) = dump {
            s.push_str(&format!(" -save-temps={}", dir));
        }
        s
    };

    let try_build = |options: String| {
        let mut builder = Program::builder();
        builder
            .devices(device)
            .src(source.to_string())
            .cmplr_opt(options);
        builder.build(context)
    };

    match try_build(opts(true)) {
        Ok(program) => Ok(program),
        Err(first) => match try_build(opts(false)) {
            Ok(program) => {
                info!("kernel build fell back to pre-CL2.0 options");
                Ok(program)
            }
            Err(second) => bail!(
                "kernel build failed.\nwith CL2.0: {}\nwithout: {}",
                first,
                second
            ),
        },
    }
}

/// Per-kernel wall-time tally, in device nanoseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernStats {
    pub calls: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

impl KernStats {
    fn record(&mut self, ns: u64) {
        if self.calls == 0 {
            self.min_ns = ns;
            self.max_ns = ns;
        } else {
            self.min_ns = self.min_ns.min(ns);
            self.max_ns = self.max_ns.max(ns);
        }
        self.calls += 1;
        self.total_ns += ns;
    }

    pub fn mean_us(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_ns as f64 / self.calls as f64 / 1000.0
        }
    }
}

/// A named kernel with sticky arguments.
///
/// Arguments are set ahead of time and persist across invocations; the
/// engine updates only the ones that vary per call. When timing is on, each
/// run blocks on its event and accumulates the device-side start/end delta.
pub struct Kern {
    name: &'static str,
    kernel: Kernel,
    timed: bool,
    stats: Cell<KernStats>,
}

impl Kern {
    pub fn new(name: &'static str, kernel: Kernel, timed: bool) -> Self {
        Kern {
            name,
            kernel,
            timed,
            stats: Cell::new(KernStats::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Enqueue with the current argument set.
    pub fn run(&self) -> Result<()> {
        if self.timed {
            let mut event = Event::empty();
            unsafe {
                self.kernel.cmd().enew(&mut event).enq().map_err(cl_err)?;
            }
            event.wait_for().map_err(|e| cl_err(e.into()))?;
            let start = profiling_ns(&event, ProfilingInfo::Start)?;
            let end = profiling_ns(&event, ProfilingInfo::End)?;
            let mut stats = self.stats.get();
            stats.record(end.saturating_sub(start));
            self.stats.set(stats);
        } else {
            unsafe {
                self.kernel.cmd().enq().map_err(cl_err)?;
            }
        }
        Ok(())
    }

    /// Current tally, cleared for the next interval.
    pub fn take_stats(&self) -> KernStats {
        self.stats.replace(KernStats::default())
    }
}

fn profiling_ns(event: &Event, info: ProfilingInfo) -> Result<u64> {
    match event.profiling_info(info).map_err(cl_err)? {
        ProfilingInfoResult::Queued(ns)
        | ProfilingInfoResult::Submit(ns)
        | ProfilingInfoResult::Start(ns)
        | ProfilingInfoResult::End(ns) => Ok(ns),
    }
}

/// Log per-kernel timings, heaviest first, dropping entries under 0.5%.
pub fn log_kernel_times(entries: &mut [(&'static str, KernStats)]) {
    let total: u64 = entries.iter().map(|(_, s)| s.total_ns).sum();
    if total == 0 {
        return;
    }
    entries.sort_by(|a, b| b.1.total_ns.cmp(&a.1.total_ns));
    for (name, stats) in entries.iter() {
        let percent = 100.0 * stats.total_ns as f64 / total as f64;
        if percent < 0.5 {
            continue;
        }
        info!(
            "{:4.1}% {:<12}: {:6.0} [{:6.0}, {:6.0}] us/call  x {:6} calls",
            percent,
            name,
            stats.mean_us(),
            stats.min_ns as f64 / 1000.0,
            stats.max_ns as f64 / 1000.0,
            stats.calls
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kern_stats_tracks_extremes() {
        let mut s = KernStats::default();
        s.record(3000);
        s.record(1000);
        s.record(2000);
        assert_eq!(s.calls, 3);
        assert_eq!(s.min_ns, 1000);
        assert_eq!(s.max_ns, 3000);
        assert_eq!(s.mean_us(), 2.0);
    }

    #[test]
    fn empty_stats_mean_is_zero() {
        assert_eq!(KernStats::default().mean_us(), 0.0);
    }

    #[test]
    fn log_kernel_times_handles_empty_interval() {
        // No calls recorded: must not divide by zero.
        log_kernel_times(&mut [("fftP", KernStats::default())]);
    }
}
