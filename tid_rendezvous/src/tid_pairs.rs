/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! TID descriptor words and pair coalescing.
//!
//! The hardware describes each pinned page run with a 32-bit word packing a
//! page count, a control code, and a table index. The driver hands these out
//! in (first-half, second-half) couples sharing an index; `coalesce` merges
//! each couple into a single full-pair word when the combined run fits the
//! hardware ceiling, halving the descriptor count a CTS has to carry.

use serde::Deserialize;
use serde::Serialize;

const LEN_SHIFT: u32 = 0;
const LEN_MASK: u32 = 0x7FF;
const CTRL_SHIFT: u32 = 20;
const CTRL_MASK: u32 = 0x3;
const IDX_SHIFT: u32 = 22;
const IDX_MASK: u32 = 0x3FF;

/// Largest page run a single merged pair may describe (2 MB at 4 KB pages).
pub const MAX_PAIR_PAGES: u32 = 512;

/// Control code of a TID word.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TidCtrl {
    /// First half of a pair.
    First,
    /// Second half of a pair.
    Second,
    /// A merged full pair.
    Pair,
}

impl TidCtrl {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(TidCtrl::First),
            2 => Some(TidCtrl::Second),
            3 => Some(TidCtrl::Pair),
            _ => None,
        }
    }

    fn bits(self) -> u32 {
        match self {
            TidCtrl::First => 1,
            TidCtrl::Second => 2,
            TidCtrl::Pair => 3,
        }
    }
}

/// One packed hardware TID descriptor word.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TidWord(u32);

impl TidWord {
    /// Packs a word from its fields. `len_pages` saturates at the field
    /// width; callers never produce runs that large.
    pub fn new(len_pages: u32, ctrl: TidCtrl, idx: u32) -> Self {
        debug_assert!(len_pages <= LEN_MASK);
        debug_assert!(idx <= IDX_MASK);
        TidWord(
            ((len_pages & LEN_MASK) << LEN_SHIFT)
                | (ctrl.bits() << CTRL_SHIFT)
                | ((idx & IDX_MASK) << IDX_SHIFT),
        )
    }

    /// Reinterprets a raw word from the backend.
    pub fn from_raw(raw: u32) -> Self {
        TidWord(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Run length in pages.
    pub fn len_pages(self) -> u32 {
        (self.0 >> LEN_SHIFT) & LEN_MASK
    }

    /// Run length in bytes at the given page size.
    pub fn len_bytes(self, page_size: u64) -> u64 {
        u64::from(self.len_pages()) * page_size
    }

    /// Control code; a word with a reserved code is treated as unmergeable.
    pub fn ctrl(self) -> Option<TidCtrl> {
        TidCtrl::from_bits((self.0 >> CTRL_SHIFT) & CTRL_MASK)
    }

    /// Expected-receive table index.
    pub fn idx(self) -> u32 {
        (self.0 >> IDX_SHIFT) & IDX_MASK
    }
}

impl std::fmt::Debug for TidWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TidWord {{ idx: {}, ctrl: {:?}, len_pages: {} }}",
            self.idx(),
            self.ctrl(),
            self.len_pages()
        )
    }
}

/// Merges adjacent (first, second) couples of the same index into full
/// pairs, greedily and without backtracking. Stops once the accumulated run
/// length covers `total_length` bytes; trailing words past that point are
/// dropped.
pub fn coalesce(raw: &[TidWord], total_length: u64, page_size: u64) -> Vec<TidWord> {
    let mut out: Vec<TidWord> = Vec::with_capacity(raw.len());
    let mut accumulated: u64 = 0;

    for &word in raw {
        if accumulated >= total_length {
            break;
        }
        match out.last_mut() {
            Some(prev)
                if prev.ctrl() == Some(TidCtrl::First)
                    && word.ctrl() == Some(TidCtrl::Second)
                    && prev.idx() == word.idx()
                    && prev.len_pages() + word.len_pages() <= MAX_PAIR_PAGES =>
            {
                *prev = TidWord::new(
                    prev.len_pages() + word.len_pages(),
                    TidCtrl::Pair,
                    prev.idx(),
                );
            }
            _ => out.push(word),
        }
        accumulated += word.len_bytes(page_size);
    }
    out
}

/// Total bytes described by a run of words at the given page size.
pub fn covered_bytes(words: &[TidWord], page_size: u64) -> u64 {
    words.iter().map(|w| w.len_bytes(page_size)).sum()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn word(len: u32, ctrl: TidCtrl, idx: u32) -> TidWord {
        TidWord::new(len, ctrl, idx)
    }

    #[test]
    fn test_word_bit_layout() {
        let w = word(5, TidCtrl::First, 9);
        assert_eq!(w.raw(), 5 | (1 << 20) | (9 << 22));
        assert_eq!(w.len_pages(), 5);
        assert_eq!(w.ctrl(), Some(TidCtrl::First));
        assert_eq!(w.idx(), 9);

        let w = TidWord::from_raw((0x3FF << 22) | (3 << 20) | 0x7FF);
        assert_eq!(w.len_pages(), 0x7FF);
        assert_eq!(w.ctrl(), Some(TidCtrl::Pair));
        assert_eq!(w.idx(), 0x3FF);
    }

    #[test]
    fn test_merge_basic_couple() {
        let raw = [word(3, TidCtrl::First, 4), word(2, TidCtrl::Second, 4)];
        let out = coalesce(&raw, 5 * 4096, 4096);
        assert_eq!(out, vec![word(5, TidCtrl::Pair, 4)]);
    }

    #[test]
    fn test_no_merge_differing_idx() {
        let raw = [word(3, TidCtrl::First, 4), word(2, TidCtrl::Second, 5)];
        let out = coalesce(&raw, 5 * 4096, 4096);
        assert_eq!(out, raw.to_vec());
    }

    #[test]
    fn test_no_merge_over_ceiling() {
        let raw = [
            word(300, TidCtrl::First, 4),
            word(213, TidCtrl::Second, 4),
        ];
        let out = coalesce(&raw, 513 * 4096, 4096);
        assert_eq!(out, raw.to_vec());

        // Exactly at the ceiling still merges.
        let raw = [
            word(300, TidCtrl::First, 4),
            word(212, TidCtrl::Second, 4),
        ];
        let out = coalesce(&raw, 512 * 4096, 4096);
        assert_eq!(out, vec![word(512, TidCtrl::Pair, 4)]);
    }

    #[test]
    fn test_solitary_halves_pass_through() {
        let raw = [
            word(2, TidCtrl::Second, 1),
            word(4, TidCtrl::First, 2),
            word(1, TidCtrl::Pair, 3),
        ];
        let out = coalesce(&raw, 7 * 4096, 4096);
        assert_eq!(out, raw.to_vec());
    }

    #[test]
    fn test_stops_at_total_length() {
        let raw = [
            word(2, TidCtrl::First, 1),
            word(2, TidCtrl::Second, 1),
            word(2, TidCtrl::First, 2),
        ];
        // Two words already cover the requested four pages.
        let out = coalesce(&raw, 4 * 4096, 4096);
        assert_eq!(out, vec![word(4, TidCtrl::Pair, 1)]);
    }

    fn couple_strategy() -> impl Strategy<Value = Vec<TidWord>> {
        // Well-formed couples: each (first, second) shares an index and fits
        // the pair ceiling.
        prop::collection::vec((1u32..=255, 1u32..=255, 0u32..=0x3FF), 1..64).prop_map(|cs| {
            cs.into_iter()
                .flat_map(|(a, b, idx)| {
                    [
                        TidWord::new(a, TidCtrl::First, idx),
                        TidWord::new(b, TidCtrl::Second, idx),
                    ]
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn test_wellformed_couples_halve(raw in couple_strategy()) {
            let total = covered_bytes(&raw, 4096);
            let out = coalesce(&raw, total, 4096);
            prop_assert_eq!(out.len(), raw.len() / 2);
            prop_assert!(out.iter().all(|w| w.ctrl() == Some(TidCtrl::Pair)));
            prop_assert_eq!(covered_bytes(&out, 4096), total);
        }

        #[test]
        fn test_unmergeable_is_identity(
            words in prop::collection::vec((1u32..=511, 0u32..=0x3FF), 0..64)
        ) {
            // All-second-half input has nothing to merge into.
            let raw: Vec<TidWord> = words
                .into_iter()
                .map(|(len, idx)| TidWord::new(len, TidCtrl::Second, idx))
                .collect();
            let total = covered_bytes(&raw, 4096);
            let out = coalesce(&raw, total, 4096);
            prop_assert_eq!(out, raw);
        }

        #[test]
        fn test_coalesce_deterministic(raw in couple_strategy()) {
            let total = covered_bytes(&raw, 4096);
            prop_assert_eq!(
                coalesce(&raw, total, 4096),
                coalesce(&raw, total, 4096)
            );
        }
    }
}
