//! Rolling history of accepted states.
//!
//! The buffer feeds ensemble-style jump proposals and doubles as the
//! accepted-sample history that the effective-sample-size estimate is
//! computed from. It grows by doubling until a hard memory ceiling,
//! after which it thins itself: every second sample is dropped and the
//! accumulation interval doubles, keeping the spanned stretch of chain
//! per stored sample roughly constant.

use crate::params::ParameterVector;

#[derive(Debug)]
pub struct DiffEvolutionBuffer {
    points: Vec<Box<[f64]>>,
    capacity: usize,
    skip: u64,
    initial_skip: u64,
}

impl DiffEvolutionBuffer {
    /// An empty buffer accumulating every `skip` iterations.
    pub fn new(skip: u64) -> Self {
        assert!(skip > 0, "accumulation interval must be positive");
        Self {
            points: Vec::new(),
            capacity: 1,
            skip,
            initial_skip: skip,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Current iteration interval between accumulations. Always the
    /// initial interval times a power of two.
    pub fn skip(&self) -> u64 {
        self.skip
    }

    pub fn point(&self, index: usize) -> &[f64] {
        &self.points[index]
    }

    pub fn points(&self) -> impl Iterator<Item = &[f64]> {
        self.points.iter().map(|p| p.as_ref())
    }

    /// Record a value-copy of `params`.
    ///
    /// When full, the capacity doubles as long as that stays within
    /// `limit`; otherwise the buffer thins until there is room again.
    pub fn accumulate(&mut self, params: &ParameterVector, limit: usize) {
        while self.points.len() == self.capacity {
            let doubled = self.capacity * 2;
            if doubled <= limit {
                self.capacity = doubled;
            } else {
                self.thin();
            }
        }
        self.points.push(params.values().into());
    }

    /// Drop every sample at an even position and compact the survivors
    /// to the front. The accumulation interval doubles so the buffer
    /// keeps covering the same stretch of chain history.
    fn thin(&mut self) {
        let mut keep = true;
        self.points.retain(|_| {
            keep = !keep;
            keep
        });
        self.skip *= 2;
    }

    /// Empty the buffer and restore the initial accumulation interval.
    /// Called when adaptation ends, so only post-burn-in samples feed
    /// the ensemble proposals.
    pub fn reset(&mut self) {
        self.points.clear();
        self.points.shrink_to_fit();
        self.capacity = 1;
        self.skip = self.initial_skip;
    }
}
