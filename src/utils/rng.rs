//! Seeded pseudo-random source.
//!
//! A small xorshift generator used for weight initialization, dropout masks
//! and epoch shuffling. Every consumer receives its own generator derived
//! from the model seed, so runs are reproducible.

/// Xorshift64 generator.
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

const FALLBACK_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

impl SimpleRng {
    /// A zero seed would lock xorshift at zero and is replaced.
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { FALLBACK_SEED } else { seed };
        Self { state }
    }

    /// Derives an independent generator, advancing this one.
    pub fn fork(&mut self) -> SimpleRng {
        let seed = (u64::from(self.next_u32()) << 32) | u64::from(self.next_u32());
        SimpleRng::new(seed ^ FALLBACK_SEED)
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }

    /// Uniform sample in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Uniform sample in [low, high).
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32()
    }

    /// Index in `0..bound`; `0` when `bound` is zero.
    pub fn below(&mut self, bound: usize) -> usize {
        match bound {
            0 => 0,
            n => self.next_u32() as usize % n,
        }
    }

    /// In-place Fisher-Yates permutation.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.below(i + 1);
            items.swap(i, j);
        }
    }
}
