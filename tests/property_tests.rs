//! Property-based tests for the residue-representation primitives.
//!
//! These tests use `proptest` to verify the invariants of the balanced and
//! compact representations across randomly generated residues, with `rug`
//! as the arbitrary-precision oracle: every conversion and exact-division
//! result is cross-checked against straight bignum arithmetic mod 2^E − 1.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test property_tests
//!
//! # Increase case count for thorough testing (default is 256):
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! A toy FFT shape (W=8, H=16, N=256) keeps each case cheap while
//! exercising the same code paths as the production 8M/16M shapes.

use proptest::prelude::*;
use rug::integer::Order;
use rug::ops::RemRounding;
use rug::Integer;

use gpuowl::checkpoint::checksum;
use gpuowl::words::{
    bitlen, compact_bits, do_div3, do_div9, expand_bits, mod3, n_words, residue,
};

const W: usize = 8;
const H: usize = 16;
const N: usize = 2 * W * H;
const E: u32 = 3217;

fn mersenne(e: u32) -> Integer {
    (Integer::from(1) << e) - 1u32
}

fn to_integer(words: &[u32]) -> Integer {
    Integer::from_digits(words, Order::Lsf)
}

fn to_words(value: &Integer, e: u32) -> Vec<u32> {
    let mut v = value.to_digits::<u32>(Order::Lsf);
    v.resize(n_words(e), 0);
    v
}

/// Canonical compact residues: E bits, excluding the all-ones pattern
/// (2^E − 1 is represented as zero).
fn residue_words() -> impl Strategy<Value = Vec<u32>> {
    proptest::collection::vec(any::<u32>(), n_words(E))
        .prop_map(|mut v| {
            let last = v.len() - 1;
            v[last] &= ((1u64 << (E % 32)) - 1) as u32;
            v
        })
        .prop_filter("must be below 2^E − 1", |v| {
            to_integer(v) != mersenne(E)
        })
}

proptest! {
    /// compactBits is the exact inverse of balanced expandBits.
    #[test]
    fn prop_compact_inverts_balanced_expand(v in residue_words()) {
        let raw = expand_bits(&v, true, W, H, E);
        prop_assert_eq!(compact_bits(&raw, W, H, E), v);
    }

    /// Same round-trip without re-balancing.
    #[test]
    fn prop_compact_inverts_plain_expand(v in residue_words()) {
        let raw = expand_bits(&v, false, W, H, E);
        prop_assert_eq!(compact_bits(&raw, W, H, E), v);
    }

    /// The balanced signal evaluates to the original value mod 2^E − 1:
    /// Σ c_k·2^(offset_k) ≡ v, with offsets accumulated from bitlen.
    #[test]
    fn prop_balanced_signal_evaluates_to_value(v in residue_words()) {
        let raw = expand_bits(&v, true, W, H, E);
        let me = mersenne(E);
        let mut total = Integer::new();
        let mut offset = 0u32;
        for k in 0..N {
            let c = raw[gpuowl::words::word_pos(W, H, k)];
            total += Integer::from(c) << offset;
            offset += bitlen(N, E, k);
        }
        prop_assert_eq!(offset, E);
        let expected = to_integer(&v);
        prop_assert_eq!(total.rem_euc(&me), expected.rem_euc(&me));
    }

    /// res64 agrees with the bignum's low 64 bits.
    #[test]
    fn prop_residue_matches_low_bits(v in residue_words()) {
        let value = to_integer(&v);
        let low = value.keep_bits(64).to_u64().unwrap();
        prop_assert_eq!(residue(&v), low);
        let raw = expand_bits(&v, true, W, H, E);
        prop_assert_eq!(residue(&compact_bits(&raw, W, H, E)), low);
    }

    /// mod3 agrees with the bignum remainder.
    #[test]
    fn prop_mod3_matches_reference(v in residue_words()) {
        let r = to_integer(&v) % 3u32;
        prop_assert_eq!(mod3(&v), r.to_u32().unwrap());
    }

    /// doDiv3 exactly inverts multiplication by 3 mod 2^E − 1.
    #[test]
    fn prop_div3_inverts_triple(v in residue_words()) {
        let me = mersenne(E);
        let tripled = to_integer(&v) * 3u32 % &me;
        let mut words = to_words(&tripled, E);
        do_div3(E, &mut words);
        prop_assert_eq!(words, v);
    }

    /// doDiv9 exactly inverts multiplication by 9 mod 2^E − 1.
    #[test]
    fn prop_div9_inverts_ninefold(v in residue_words()) {
        let me = mersenne(E);
        let nine = to_integer(&v) * 9u32 % &me;
        let mut words = to_words(&nine, E);
        do_div9(E, &mut words);
        prop_assert_eq!(words, v);
    }

    /// Coefficient widths always partition the exponent.
    #[test]
    fn prop_bitlen_partitions_exponent(e in 300u32..100_000) {
        let base = e / N as u32;
        let mut sum = 0u64;
        for k in 0..N {
            let b = bitlen(N, e, k);
            prop_assert!(b == base || b == base + 1);
            sum += b as u64;
        }
        prop_assert_eq!(sum, e as u64);
    }

    /// The checkpoint checksum depends on word order: swapping two adjacent
    /// distinct words always changes the running pair.
    #[test]
    fn prop_checksum_is_order_sensitive(
        mut v in proptest::collection::vec(any::<u32>(), 2..64),
    ) {
        prop_assume!(v[0] != v[1]);
        let before = checksum(&v);
        v.swap(0, 1);
        prop_assert_ne!(before, checksum(&v));
    }
}
