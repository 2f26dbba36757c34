// Seedable pseudo-random source for pattern generation and evolution.
//
// xoshiro256++ (Blackman & Vigna, 2019) expanded from a single `u64` via
// SplitMix64. Every random decision the engine makes (direction flips, tail
// lengths, placement draws, loop selection, fallback notes) is threaded
// through a `SeqRng` passed in explicitly, so tests can pin a seed and get
// the same loop contents back.
//
// The sequencer owns one master `SeqRng`. Each regeneration forks a child
// stream from it (`fork`), which gives every call a fresh seed while keeping
// the whole session reproducible from the master seed.
//
// The core generator uses integer arithmetic only. Float helpers are built on
// top of the integer output and are deterministic as well.

use serde::{Deserialize, Serialize};

/// Xoshiro256++ state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRng {
    s: [u64; 4],
}

impl SeqRng {
    /// Create a generator from a `u64` seed.
    ///
    /// Equal seeds produce equal streams.
    pub fn new(seed: u64) -> Self {
        let mut sm = seed;
        Self {
            s: [
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
            ],
        }
    }

    /// Derive an independent child stream, advancing this generator.
    pub fn fork(&mut self) -> Self {
        Self::new(self.next_u64())
    }

    pub fn next_u64(&mut self) -> u64 {
        let result = (self.s[0].wrapping_add(self.s[3]))
            .rotate_left(23)
            .wrapping_add(self.s[0]);

        let t = self.s[1] << 17;

        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];

        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);

        result
    }

    /// Uniform `f32` in [0, 1), from the top 24 bits.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Uniform `f64` in [0, 1), from the top 53 bits.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform `f32` in `[low, high)`. Panics if `low >= high`.
    pub fn range_f32(&mut self, low: f32, high: f32) -> f32 {
        assert!(low < high, "range_f32: low must be less than high");
        low + self.next_f32() * (high - low)
    }

    /// Uniform integer in `[low, high)` by rejection sampling (no modulo
    /// bias). Panics if `low >= high`.
    pub fn range_u64(&mut self, low: u64, high: u64) -> u64 {
        assert!(low < high, "range_u64: low must be less than high");
        let range = high - low;
        if range.is_power_of_two() {
            return low + (self.next_u64() & (range - 1));
        }
        let threshold = range.wrapping_neg() % range;
        loop {
            let r = self.next_u64();
            if r >= threshold {
                return low + (r % range);
            }
        }
    }

    /// Uniform `usize` in `[low, high)`. Panics if `low >= high`.
    pub fn range_usize(&mut self, low: usize, high: usize) -> usize {
        self.range_u64(low as u64, high as u64) as usize
    }

    /// Uniform `usize` in `[low, high]`. Panics if `low > high`.
    pub fn range_usize_inclusive(&mut self, low: usize, high: usize) -> usize {
        assert!(low <= high, "range_usize_inclusive: low must be <= high");
        self.range_u64(low as u64, high as u64 + 1) as usize
    }

    /// Uniform `i32` in `[low, high]`. Panics if `low > high`.
    pub fn range_i32_inclusive(&mut self, low: i32, high: i32) -> i32 {
        assert!(low <= high, "range_i32_inclusive: low must be <= high");
        let span = (high as i64 - low as i64) as u64 + 1;
        (low as i64 + self.range_u64(0, span) as i64) as i32
    }

    /// `true` with probability `p`. `p <= 0` is never, `p >= 1` is always.
    pub fn random_bool(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Pick one element uniformly, or `None` for an empty slice.
    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            None
        } else {
            Some(&items[self.range_usize(0, items.len())])
        }
    }

    /// Fisher-Yates shuffle in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.range_usize_inclusive(0, i);
            items.swap(i, j);
        }
    }

    /// Draw `count` distinct indices from `0..n` uniformly without
    /// replacement. `count` is capped at `n`. Output order is the draw order.
    pub fn sample_distinct(&mut self, n: usize, count: usize) -> Vec<usize> {
        let count = count.min(n);
        let mut pool: Vec<usize> = (0..n).collect();
        // Partial Fisher-Yates: only the first `count` slots are settled.
        for i in 0..count {
            let j = self.range_usize(i, n);
            pool.swap(i, j);
        }
        pool.truncate(count);
        pool
    }

    /// Pick an index with probability proportional to its weight.
    ///
    /// Negative and non-finite weights count as zero. Returns `None` when
    /// no weight is positive.
    pub fn weighted_index(&mut self, weights: &[f32]) -> Option<usize> {
        let clean = |w: f32| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        let total: f32 = weights.iter().map(|&w| clean(w)).sum();
        if total <= 0.0 {
            return None;
        }
        let mut r = self.next_f32() * total;
        let mut last_positive = None;
        for (i, &w) in weights.iter().enumerate() {
            let w = clean(w);
            if w <= 0.0 {
                continue;
            }
            last_positive = Some(i);
            if r < w {
                return Some(i);
            }
            r -= w;
        }
        // Float accumulation can leave `r` a hair above the last bucket.
        last_positive
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
