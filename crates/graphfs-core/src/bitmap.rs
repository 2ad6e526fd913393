//! Sparse id-allocation bitmap.
//!
//! Stored as 64-bit words keyed by word index so a partition with a few ids
//! spread over a large range stays small. Id 0 is the partition root and is
//! never handed out by [`SparseBitmap::allocate`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseBitmap {
    words: BTreeMap<u64, u64>,
}

impl SparseBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    fn split(id: u64) -> (u64, u64) {
        (id / 64, 1u64 << (id % 64))
    }

    /// Index of the word holding `id`.
    pub fn word_index(id: u64) -> u64 {
        id / 64
    }

    /// Bits of word `index`; 0 when none of its ids are allocated.
    pub fn word(&self, index: u64) -> u64 {
        self.words.get(&index).copied().unwrap_or(0)
    }

    /// Replace word `index` wholesale, as when restoring from storage.
    pub fn set_word(&mut self, index: u64, bits: u64) {
        if bits == 0 {
            self.words.remove(&index);
        } else {
            self.words.insert(index, bits);
        }
    }

    pub fn is_allocated(&self, id: u64) -> bool {
        let (word, mask) = Self::split(id);
        self.words.get(&word).map_or(false, |w| w & mask != 0)
    }

    /// Mark `id` used. Returns false if it already was.
    pub fn mark_allocated(&mut self, id: u64) -> bool {
        let (word, mask) = Self::split(id);
        let w = self.words.entry(word).or_insert(0);
        let fresh = *w & mask == 0;
        *w |= mask;
        fresh
    }

    /// Release `id`. Returns false if it was not allocated.
    pub fn free(&mut self, id: u64) -> bool {
        let (word, mask) = Self::split(id);
        let Some(w) = self.words.get_mut(&word) else {
            return false;
        };
        let was_set = *w & mask != 0;
        *w &= !mask;
        if *w == 0 {
            self.words.remove(&word);
        }
        was_set
    }

    /// Allocate the lowest free id >= 1.
    pub fn allocate(&mut self) -> u64 {
        let mut expected_word = 0u64;
        for (&index, &bits) in &self.words {
            if index != expected_word {
                break;
            }
            // Bit 0 of word 0 is the root and counts as taken.
            let bits = if index == 0 { bits | 1 } else { bits };
            if bits != u64::MAX {
                let id = index * 64 + (!bits).trailing_zeros() as u64;
                self.mark_allocated(id);
                return id;
            }
            expected_word += 1;
        }
        let id = if expected_word == 0 { 1 } else { expected_word * 64 };
        self.mark_allocated(id);
        id
    }

    /// Number of allocated ids.
    pub fn count(&self) -> u64 {
        self.words.values().map(|w| w.count_ones() as u64).sum()
    }

    /// Highest allocated id, if any.
    pub fn max_allocated(&self) -> Option<u64> {
        self.words
            .iter()
            .next_back()
            .map(|(&index, &bits)| index * 64 + 63 - bits.leading_zeros() as u64)
    }
}
