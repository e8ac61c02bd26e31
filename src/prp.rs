//! # Prp — Gerbicz-Li Outer Loop
//!
//! Drives the PRP-3 test for one exponent: blocks of squarings on the data
//! register, a parallel check register folded in once per block, and a
//! periodic consistency check of the algebraic relation between the two.
//!
//! ## The check
//!
//! After each block of B squarings, `check_new = check_old · data` must
//! equal `check_old^(2^B) · 3`. Agreement certifies all B squarings of data
//! were performed correctly, with error probability around 2^−64. On
//! mismatch the loop rolls back to the state snapshotted at the last good
//! check; the same wrong residue twice in a row means the fault is
//! persistent (bad hardware, not a cosmic ray) and the exponent is
//! abandoned.
//!
//! ## Cadence
//!
//! Checks run every 50,000 iterations, at the end of the test, on a
//! requested stop, and on the second block after a resume (to validate a
//! freshly loaded or rolled-back state early). Checkpoints persist every
//! 100,000 iterations and on stop, only after the check passes.
//!
//! The loop talks to the squaring engine through [`PrpEngine`], which the
//! GPU implements; tests drive the identical protocol with a host-side
//! bignum engine.

use anyhow::{ensure, Context, Result};
use std::cmp::min;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::checkpoint::{self, PrpState};
use crate::shape::FftShape;
use crate::stats::Stats;
use crate::stop;
use crate::words;

/// The squaring-engine seam between the outer loop and the GPU.
pub trait PrpEngine {
    /// Upload a compact check register and rebuild data from it.
    fn write_state(&mut self, check: &[u32], block_size: u32) -> Result<()>;
    /// `reps` squarings of the data register, in place.
    fn data_loop(&mut self, reps: u32) -> Result<()>;
    /// check ·= data.
    fn update_check(&mut self) -> Result<()>;
    /// Run the Gerbicz verification; updates check, leaves data untouched.
    fn check_and_update(&mut self, block_size: u32) -> Result<bool>;
    /// res64 of the data register.
    fn data_residue(&mut self) -> Result<u64>;
    /// Read a register through the host and back; returns its compact form.
    fn roundtrip_data(&mut self) -> Result<Vec<u32>>;
    fn roundtrip_check(&mut self) -> Result<Vec<u32>>;
    /// Snapshot (data, check) for rollback / restore the snapshot.
    fn save_good(&mut self) -> Result<()>;
    fn revert_good(&mut self) -> Result<()>;
    /// Drain the queue; the block-boundary timing barrier.
    fn finish(&mut self) -> Result<()>;
    fn log_time_kernels(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestOutcome {
    pub is_prime: bool,
    pub res64: u64,
    pub n_errors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrpResult {
    Finished(TestOutcome),
    /// Stop was requested; a checkpoint was persisted at the last block.
    Stopped,
}

/// Residue sentinel for persistent-error detection. A genuine wrong residue
/// matching it is possible but vanishingly unlikely.
const RANDOM_RESIDUE: u64 = 0xbad0_beef_dead_beef;

const CHECK_EVERY: u32 = 50_000;
const SAVE_EVERY: u32 = 100_000;
const SMALL_LOG_EVERY: u32 = 10_000;

/// Run the PRP-3 test of M(E) to completion, rollback included.
///
/// Returns `Stopped` when `stop` was raised (state saved), the outcome on a
/// verified final iteration, and `Err` on an initial check failure or a
/// persistent compute error.
pub fn check_prime(
    engine: &mut impl PrpEngine,
    e: u32,
    shape: &FftShape,
    checkpoint_dir: &Path,
    cpu_name: &str,
    time_kernels: bool,
    stop: &AtomicBool,
) -> Result<PrpResult> {
    let PrpState {
        mut k,
        mut n_errors,
        block_size,
        check,
    } = checkpoint::load(checkpoint_dir, e)?;
    engine.write_state(&check, block_size)?;

    info!(
        "PRP M({}): FFT {} ({}x{}x2), {:.2} bits/word, block {}, at iteration {}",
        e,
        shape.fft_label(),
        shape.width,
        shape.height,
        shape.bits_per_word(e),
        block_size,
        k
    );

    let k_end = e;
    ensure!(
        k % block_size == 0 && k < k_end,
        "checkpoint iteration {k} inconsistent with block {block_size} and exponent {e}"
    );

    let res64 = engine.data_residue()?;
    if engine.check_and_update(block_size)? {
        info!("OK initial check; {:016x}", res64);
    } else {
        error!("initial consistency check failed; {:016x}", res64);
        anyhow::bail!("initial consistency check failed for M({e})");
    }

    engine.save_good()?;
    let mut good_k = k;
    let start_k = k;
    let mut stats = Stats::new();
    let mut error_residue = RANDOM_RESIDUE;
    let mut outcome: Option<TestOutcome> = None;
    let mut stopping = false;
    let mut block_timer = Instant::now();

    loop {
        debug_assert!(k % block_size == 0);

        engine.data_loop(min(block_size, k_end - k))?;

        if k_end - k <= block_size {
            // The exponent is reached inside this block: take the final
            // residue now, then run the block to its boundary so the
            // closing check still covers every squaring.
            let mut words = engine.roundtrip_data()?;
            let res_raw = words::residue(&words);
            words::do_div9(e, &mut words);
            let res_div = words::residue(&words);
            words[0] = 0;
            let is_prime = res_raw == 9 && words::is_all_zero(&words);

            info!(
                "{} {:8} / {}, {:016x} (raw {:016x})",
                if is_prime { "PP" } else { "CC" },
                k_end,
                e,
                res_div,
                res_raw
            );
            outcome = Some(TestOutcome {
                is_prime,
                res64: res_div,
                n_errors,
            });

            let iters_left = block_size - (k_end - k);
            if iters_left > 0 {
                engine.data_loop(iters_left)?;
            }
        }

        engine.finish()?;
        k += block_size;
        let delta = block_timer.elapsed();
        block_timer = Instant::now();
        stats.add(delta.as_secs_f64() * 1000.0 / block_size as f64);

        if stop.load(Ordering::Acquire) && !stopping {
            stopping = true;
            info!("stopping, please wait..");
            stop::restore();
        }

        let do_check = k % CHECK_EVERY == 0
            || k >= k_end
            || stopping
            || k - start_k == 2 * block_size;
        if !do_check {
            engine.update_check()?;
            if k % SMALL_LOG_EVERY == 0 {
                let res = engine.data_residue()?;
                info!("   {}", progress_line(e, k, res, &stats, cpu_name));
                stats.reset();
            }
            continue;
        }

        let res = engine.data_residue()?;
        let would_save = k < k_end && (k % SAVE_EVERY == 0 || stopping);
        // Read the check register before check_and_update mutates it.
        let compact_check = if would_save {
            Some(engine.roundtrip_check()?)
        } else {
            None
        };

        let check_timer = Instant::now();
        let ok = engine.check_and_update(block_size)?;
        let mut did_save = false;
        if ok {
            if let Some(check) = compact_check {
                let state = PrpState {
                    k,
                    n_errors,
                    block_size,
                    check,
                };
                match checkpoint::save(checkpoint_dir, e, &state) {
                    Ok(()) => did_save = true,
                    Err(err) => warn!("checkpoint save failed: {err:#}"),
                }
            }
        }
        info!(
            "{} {} (check {:.2}s){}{}",
            if ok { "OK" } else { "EE" },
            progress_line(e, k, res, &stats, cpu_name),
            check_timer.elapsed().as_secs_f64(),
            if n_errors == 0 {
                String::new()
            } else {
                format!("; ({n_errors} errors)")
            },
            if did_save { " (saved)" } else { "" }
        );
        stats.reset();

        if ok {
            if k >= k_end {
                let outcome = outcome.context("finished final block without a recorded residue")?;
                return Ok(PrpResult::Finished(outcome));
            }
            engine.save_good()?;
            good_k = k;
            error_residue = RANDOM_RESIDUE;
        } else {
            if error_residue == res {
                error!("persistent error at iteration {k}; giving up");
                anyhow::bail!("persistent check failure for M({e}) (res64 {res:016x})");
            }
            error_residue = res;
            n_errors += 1;
            outcome = None;
            engine.revert_good()?;
            k = good_k;
            warn!("rolled back to last good iteration {good_k}");
        }

        if time_kernels {
            engine.log_time_kernels();
        }
        if stopping {
            return Ok(PrpResult::Stopped);
        }
    }
}

/// Progress line: iteration, percent, per-iteration timing, ETA, res64.
fn progress_line(e: u32, k: u32, res: u64, stats: &Stats, cpu_name: &str) -> String {
    let end = ((e - 1) / 1000 + 1) * 1000;
    let percent = 100.0 * k as f64 / end as f64;
    let eta_mins = ((end - min(k, end)) as f64 * stats.mean() / 60_000.0 + 0.5) as u64;
    let (days, hours, mins) = (eta_mins / (24 * 60), eta_mins / 60 % 24, eta_mins % 60);
    format!(
        "{}{:8}/{} [{:5.2}%], {:.2} ms/it [{:.2}, {:.2}]; ETA {}d {:02}:{:02}; {:016x}",
        if cpu_name.is_empty() {
            String::new()
        } else {
            format!("{cpu_name} ")
        },
        k,
        e,
        percent,
        stats.mean(),
        stats.low(),
        stats.high(),
        days,
        hours,
        mins,
        res
    )
}
