//! # Tables — IBDWT Weights and Trig Constants
//!
//! Host-side generation of the read-only tables the kernels consume: the
//! forward/inverse weight vectors, and the three trig tables (small FFT,
//! transpose twiddles, squaring twiddles). All tables are immutable for the
//! lifetime of a run; the weight vectors are the only ones large enough
//! (N entries, up to 16M doubles each) to be worth generating in parallel.

use ocl::prm::Double2;
use rayon::prelude::*;
use std::f64::consts::TAU;

use crate::shape::FftShape;
use crate::words::{bitlen, extra};

/// Forward and inverse IBDWT weight vectors, in GPU memory order.
///
/// The sign carries the extra-bit flag to the kernels: a negative weight
/// marks a coefficient one bit wider than the base width.
pub struct Weights {
    pub forward: Vec<f64>,
    pub inverse: Vec<f64>,
}

pub fn weights(shape: &FftShape, e: u32) -> Weights {
    let (w, h) = (shape.width, shape.height);
    let n = shape.n();
    let base_bits = e / n as u32;
    let inv_n = 1.0 / n as f64;

    let (forward, inverse) = (0..n)
        .into_par_iter()
        .map(|i| {
            // Memory slot i holds signal coefficient k; see words::word_pos.
            let rep = i & 1;
            let cell = i / 2;
            let line = cell / w;
            let col = cell % w;
            let k = (line + col * h) * 2 + rep;

            let bits = bitlen(n, e, k);
            debug_assert!(bits == base_bits || bits == base_bits + 1);
            let a = (extra(n, e, k) as f64 * inv_n).exp2();
            let ia = 1.0 / (4.0 * n as f64 * a);
            if bits == base_bits {
                (a, ia)
            } else {
                (-a, -ia)
            }
        })
        .unzip();

    Weights { forward, inverse }
}

/// e^(−i·τ·k/m), the order-m root of unity to the power k.
fn root1(m: u64, k: u64) -> Double2 {
    let angle = -TAU * (k % m) as f64 / m as f64;
    Double2::new(angle.cos(), angle.sin())
}

/// Small-FFT twiddle table: `radix` zero entries, then one block per radix
/// power w < size, each block holding (h − 1)·w roots of order w·h with
/// h = min(radix, size/w).
pub fn small_trig(size: usize, radix: usize) -> Vec<Double2> {
    let mut tab = vec![Double2::new(0.0, 0.0); size];
    let mut p = radix;
    let mut w = radix;
    while w < size {
        let h = radix.min(size / w);
        for line in 1..h {
            for col in 0..w {
                tab[p] = root1((w * h) as u64, (line * col) as u64);
                p += 1;
            }
        }
        w *= radix;
    }
    assert_eq!(p, size);
    tab
}

/// Transpose twiddles: a 2048-entry full circle followed by W·H/2048
/// entries at granularity τ/(W·H).
pub fn trans_trig(w: usize, h: usize) -> Vec<Double2> {
    let mut tab = Vec::with_capacity(2048 + w * h / 2048);
    tab.extend((0..2048).map(|i| root1(2048, i as u64)));
    tab.extend((0..w * h / 2048).map(|i| root1((w * h) as u64, i as u64)));
    tab
}

/// Squaring twiddles: an H/2 half-circle at granularity τ/(2H), then W
/// entries at granularity τ/(2·W·H).
pub fn square_trig(w: usize, h: usize) -> Vec<Double2> {
    let mut tab = Vec::with_capacity(h / 2 + w);
    tab.extend((0..h / 2).map(|i| root1(2 * h as u64, i as u64)));
    tab.extend((0..w).map(|i| root1(2 * (w * h) as u64, i as u64)));
    tab
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_shape() -> FftShape {
        FftShape {
            width: 8,
            height: 16,
        }
    }

    #[test]
    fn weight_signs_track_bitlen() {
        let shape = toy_shape();
        let e = 3217;
        let n = shape.n();
        let base = e / n as u32;
        let tab = weights(&shape, e);
        for i in 0..n {
            let rep = i & 1;
            let cell = i / 2;
            let k = (cell / shape.width + (cell % shape.width) * shape.height) * 2 + rep;
            let big = bitlen(n, e, k) == base + 1;
            assert_eq!(tab.forward[i] < 0.0, big, "slot {i}");
            assert_eq!(tab.inverse[i] < 0.0, big, "slot {i}");
        }
    }

    #[test]
    fn weight_product_is_quarter_inverse_n() {
        let shape = toy_shape();
        let tab = weights(&shape, 3217);
        let expect = 1.0 / (4.0 * shape.n() as f64);
        for i in 0..shape.n() {
            let prod = tab.forward[i] * tab.inverse[i];
            assert!((prod - expect).abs() < 1e-15, "slot {i}: {prod}");
        }
    }

    #[test]
    fn first_weight_is_one() {
        // extra(N, E, 0) = 0, so coefficient 0 always has unit weight
        // (negated when it carries the extra bit).
        let shape = toy_shape();
        let tab = weights(&shape, 3217);
        assert_eq!(tab.forward[0].abs(), 1.0);
    }

    #[test]
    fn small_trig_fills_exactly() {
        // Production widths: 2048 at radix 8, 4096 at radix 8 and 16.
        for (size, radix) in [(2048, 8), (4096, 8), (256, 8)] {
            let tab = small_trig(size, radix);
            assert_eq!(tab.len(), size);
            // The pad region stays zeroed; the body holds unit-circle points.
            assert_eq!(tab[0][0], 0.0);
            for t in &tab[radix..] {
                let norm = t[0] * t[0] + t[1] * t[1];
                assert!((norm - 1.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn trans_trig_layout() {
        let (w, h) = (2048, 2048);
        let tab = trans_trig(w, h);
        assert_eq!(tab.len(), 2048 + w * h / 2048);
        assert_eq!(tab[0][0], 1.0);
        // Entry 2048 restarts at angle 0 of the fine-granularity region.
        assert_eq!(tab[2048][0], 1.0);
    }

    #[test]
    fn square_trig_layout() {
        let (w, h) = (2048, 2048);
        let tab = square_trig(w, h);
        assert_eq!(tab.len(), h / 2 + w);
        assert_eq!(tab[0][0], 1.0);
        assert_eq!(tab[h / 2][0], 1.0);
        // Second entry of the half-circle is a τ/(2H) step clockwise.
        let step = -TAU / (2.0 * h as f64);
        assert!((tab[1][0] - step.cos()).abs() < 1e-12);
        assert!((tab[1][1] - step.sin()).abs() < 1e-12);
    }
}
