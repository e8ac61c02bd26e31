//! # Checkpoint — OWL Save Files with Atomic Rotation
//!
//! A checkpoint persists only the compact **check** register plus the loop
//! counters; the data register is reconstructed on load through the
//! Gerbicz-Li state relation, so files stay at one residue instead of two.
//!
//! ## File format
//!
//! One ASCII header line, then `⌈E/32⌉` raw little-endian u32 words:
//!
//! ```text
//! OWL 4 <E> <k> <nErrors> <checkStep> <checksum-16hex>\n
//! ```
//!
//! Version 3 files (header `OWL 3 …`, no checksum, data+check vectors) are
//! still read; only the check vector is used.
//!
//! ## Rotation
//!
//! Saves write `E-temp.owl` in full, then unlink `E-prev.owl`, rename
//! `E.owl` → `E-prev.owl`, rename `E-temp.owl` → `E.owl`. A crash at any
//! point leaves at most one of current/previous corrupt, and the loader
//! falls back from `E.owl` to `E-prev.owl`. Every 20M iterations an
//! archival `E.<k>.owl` is written outside the rotation.

use anyhow::{bail, ensure, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::words::n_words;

/// Default Gerbicz block size for fresh runs.
pub const CHECK_STEP: u32 = 200;

/// Iteration multiple at which permanent archival snapshots are kept.
const PERSIST_STEP: u32 = 20_000_000;

/// Loop state as persisted: the compact check register and counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrpState {
    pub k: u32,
    pub n_errors: u32,
    pub block_size: u32,
    pub check: Vec<u32>,
}

impl PrpState {
    /// The state of a run that has not started: check = 1, k = 0.
    pub fn initial(e: u32) -> Self {
        let mut check = vec![0u32; n_words(e)];
        check[0] = 1;
        PrpState {
            k: 0,
            n_errors: 0,
            block_size: CHECK_STEP,
            check,
        }
    }
}

/// Order-sensitive Fletcher-like checksum over the compact words.
pub fn checksum(words: &[u32]) -> u64 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &x in words {
        a = a.wrapping_add(x);
        b = b.wrapping_add(a);
    }
    ((a as u64) << 32) | b as u64
}

fn current_file(dir: &Path, e: u32) -> PathBuf {
    dir.join(format!("{e}.owl"))
}

fn prev_file(dir: &Path, e: u32) -> PathBuf {
    dir.join(format!("{e}-prev.owl"))
}

fn temp_file(dir: &Path, e: u32) -> PathBuf {
    dir.join(format!("{e}-temp.owl"))
}

fn archival_file(dir: &Path, e: u32, k: u32) -> PathBuf {
    dir.join(format!("{e}.{k}.owl"))
}

fn write_file(path: &Path, e: u32, state: &PrpState) -> Result<()> {
    debug_assert_eq!(state.check.len(), n_words(e));
    let header = format!(
        "OWL 4 {} {} {} {} {:016x}\n",
        e,
        state.k,
        state.n_errors,
        state.block_size,
        checksum(&state.check)
    );
    let mut bytes = Vec::with_capacity(header.len() + state.check.len() * 4);
    bytes.extend_from_slice(header.as_bytes());
    for &word in &state.check {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    fs::write(path, &bytes).with_context(|| format!("writing checkpoint {}", path.display()))
}

/// Save with the temp/current/prev rotation. Fails only if the temp write
/// or the final rename fails; a missing current file is not an error.
pub fn save(dir: &Path, e: u32, state: &PrpState) -> Result<()> {
    let temp = temp_file(dir, e);
    let current = current_file(dir, e);
    let prev = prev_file(dir, e);

    write_file(&temp, e, state)?;
    let _ = fs::remove_file(&prev);
    let _ = fs::rename(&current, &prev);
    fs::rename(&temp, &current)
        .with_context(|| format!("rotating checkpoint into {}", current.display()))?;

    if state.k > 0 && state.k % PERSIST_STEP == 0 {
        let archival = archival_file(dir, e, state.k);
        if let Err(err) = write_file(&archival, e, state) {
            warn!("archival checkpoint failed: {err:#}");
        }
    }
    Ok(())
}

fn parse_words(bytes: &[u8], count: usize) -> Result<Vec<u32>> {
    ensure!(bytes.len() >= count * 4, "checkpoint truncated");
    Ok(bytes[..count * 4]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn load_file(path: &Path, e: u32) -> Result<PrpState> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let newline = bytes
        .iter()
        .position(|&b| b == b'\n')
        .context("checkpoint header missing newline")?;
    let header = std::str::from_utf8(&bytes[..newline]).context("checkpoint header not ASCII")?;
    let body = &bytes[newline + 1..];
    let fields: Vec<&str> = header.split_whitespace().collect();

    let nw = n_words(e);
    match fields.as_slice() {
        ["OWL", "4", fe, fk, ferr, fstep, fsum] => {
            let file_e: u32 = fe.parse().context("bad exponent field")?;
            ensure!(file_e == e, "checkpoint is for exponent {file_e}, not {e}");
            let state = PrpState {
                k: fk.parse().context("bad iteration field")?,
                n_errors: ferr.parse().context("bad error-count field")?,
                block_size: fstep.parse().context("bad check-step field")?,
                check: parse_words(body, nw)?,
            };
            let expected = u64::from_str_radix(fsum, 16).context("bad checksum field")?;
            let actual = checksum(&state.check);
            ensure!(
                expected == actual,
                "checksum mismatch: header {expected:016x}, computed {actual:016x}"
            );
            ensure!(state.block_size > 1, "invalid check step");
            Ok(state)
        }
        ["OWL", "3", fe, fk, ferr, fstep] => {
            let file_e: u32 = fe.parse().context("bad exponent field")?;
            ensure!(file_e == e, "checkpoint is for exponent {file_e}, not {e}");
            // V3 stores data then check; data is reconstructible, drop it.
            ensure!(body.len() >= 2 * nw * 4, "v3 checkpoint truncated");
            let state = PrpState {
                k: fk.parse().context("bad iteration field")?,
                n_errors: ferr.parse().context("bad error-count field")?,
                block_size: fstep.parse().context("bad check-step field")?,
                check: parse_words(&body[nw * 4..], nw)?,
            };
            ensure!(state.block_size > 1, "invalid check step");
            Ok(state)
        }
        _ => bail!("unrecognized checkpoint header {header:?}"),
    }
}

/// Load the state for exponent E: the current file, then the previous one
/// if the current is missing or fails validation. No file at all means a
/// fresh start; files present but all invalid is fatal for the exponent.
pub fn load(dir: &Path, e: u32) -> Result<PrpState> {
    let current = current_file(dir, e);
    let prev = prev_file(dir, e);

    let current_err = if current.exists() {
        match load_file(&current, e) {
            Ok(state) => return Ok(state),
            Err(err) => {
                warn!("checkpoint {} rejected: {err:#}", current.display());
                Some(err)
            }
        }
    } else {
        None
    };

    if prev.exists() {
        let state = load_file(&prev, e)
            .with_context(|| format!("fallback checkpoint {} rejected", prev.display()))?;
        info!("recovered from previous checkpoint at iteration {}", state.k);
        return Ok(state);
    }

    match current_err {
        None => Ok(PrpState::initial(e)),
        Some(err) => Err(err.context("no usable checkpoint")),
    }
}
