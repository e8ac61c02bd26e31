//! # gpuowl — GPU PRP-3 Tester for Mersenne Numbers
//!
//! Decides whether M(E) = 2^E − 1 is a probable prime by checking
//! 3^(2^E) ≡ 9 (mod M(E)), squaring an IBDWT-represented residue on a GPU
//! with a Gerbicz-Li error check running alongside.
//!
//! ## Module Organization
//!
//! **Core pipeline** (leaves first):
//! - [`words`] — balanced/compact residue conversions, ÷3, res64
//! - [`tables`] — IBDWT weights and the three trig tables
//! - [`shape`] — FFT geometry selection from the exponent
//! - [`cl`] — OpenCL devices, program build, named-argument kernels
//! - [`gpu`] — the squaring engine: buffers, kernel sequences, primitives
//! - [`prp`] — the Gerbicz-Li outer loop: check cadence, rollback, stop
//!
//! **Infrastructure**:
//! - [`checkpoint`] — OWL files, checksums, atomic rotation
//! - [`worktodo`] / [`report`] — assignment queue in, JSON results out
//! - [`stop`] — SIGINT-driven cooperative stop flag
//! - [`stats`] — per-iteration timing windows
//!
//! ## Design Notes
//!
//! The GPU owns one in-order queue; all sequencing is enqueue order, and
//! the host only blocks on reads and block-boundary `finish`. Detected
//! compute errors roll the state back to the last verified block; only a
//! repeated identical failure aborts an exponent.

pub mod checkpoint;
pub mod cl;
pub mod gpu;
pub mod prp;
pub mod report;
pub mod shape;
pub mod stats;
pub mod stop;
pub mod tables;
pub mod words;
pub mod worktodo;

pub const PROGRAM: &str = "gpuowl";
pub const VERSION: &str = "2.2-rs";
