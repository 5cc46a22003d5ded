// This module provides SplitRng, an explicit, context-passed pseudo-random
// generator replacing any global default random state. The core generator is
// xorshift64* (Marsaglia/Vigna family): fast, deterministic, and good enough
// for simulation noise and reproducible experiments; it is NOT cryptographically
// secure. The important operation is split(), which derives an independent
// child generator from the parent state via splitmix64-style mixing. Parallel
// replicas of a compiled program each receive a split child seeded from one
// base generator, never a shared mutable seed, so replica streams stay
// decorrelated and every run is reproducible from the base seed alone.

//! Explicit split-able random state.
//!
//! A [`SplitRng`] handle is threaded through calls instead of living in a
//! module-wide singleton. `split` produces independent children for parallel
//! replicas; each replica must also own its own StateCells.

use crate::tensor::TensorValue;

const MIX_GAMMA: u64 = 0x9E3779B97F4A7C15;

#[derive(Debug, Clone)]
pub struct SplitRng {
    state: u64,
}

impl SplitRng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let state = if seed == 0 { MIX_GAMMA } else { seed };
        Self { state }
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Derive an independent child generator. The parent advances, so
    /// repeated splits yield distinct children.
    pub fn split(&mut self) -> SplitRng {
        let raw = self.next_u64().wrapping_add(MIX_GAMMA);
        // splitmix64 finalizer decorrelates the child stream from the parent.
        let mut z = raw;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^= z >> 31;
        SplitRng::new(z)
    }

    /// Uniform draw in [0, 1).
    #[inline]
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    #[inline]
    pub fn gen_range_f64(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64()
    }

    /// Tensor of uniform [0, 1) draws with the given shape.
    pub fn fill_f64(&mut self, shape: &[usize]) -> TensorValue {
        let len: usize = shape.iter().product();
        let data: Vec<f64> = (0..len).map(|_| self.next_f64()).collect();
        // len matches shape by construction
        TensorValue::from_shape_f64(shape, data).expect("shape/product invariant")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_from_seed() {
        let mut a = SplitRng::new(42);
        let mut b = SplitRng::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn test_split_children_are_independent() {
        let mut base = SplitRng::new(7);
        let mut c1 = base.split();
        let mut c2 = base.split();
        let s1: Vec<u64> = (0..8).map(|_| c1.next_u64()).collect();
        let s2: Vec<u64> = (0..8).map(|_| c2.next_u64()).collect();
        assert_ne!(s1, s2);
    }

    #[test]
    fn test_split_is_reproducible() {
        let mut b1 = SplitRng::new(99);
        let mut b2 = SplitRng::new(99);
        let mut c1 = b1.split();
        let mut c2 = b2.split();
        assert_eq!(c1.next_u64(), c2.next_u64());
    }

    #[test]
    fn test_gen_range_stays_in_bounds() {
        let mut rng = SplitRng::new(11);
        for _ in 0..200 {
            let x = rng.gen_range_f64(-2.0, 3.0);
            assert!((-2.0..3.0).contains(&x));
        }
    }

    #[test]
    fn test_fill_shape_and_range() {
        let mut rng = SplitRng::new(3);
        let t = rng.fill_f64(&[4, 5]);
        assert_eq!(t.shape(), &[4, 5]);
        if let TensorValue::F64(a) = &t {
            assert!(a.iter().all(|&x| (0.0..1.0).contains(&x)));
        } else {
            panic!("expected f64 tensor");
        }
    }

    #[test]
    fn test_zero_seed_is_usable() {
        let mut rng = SplitRng::new(0);
        let x = rng.next_u64();
        let y = rng.next_u64();
        assert_ne!(x, y);
    }
}
