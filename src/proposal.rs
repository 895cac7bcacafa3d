//! Jump proposals.
//!
//! The step engine only needs a candidate point and the log ratio of
//! backward to forward proposal density; everything else about a kernel
//! is its own business. The kernels shipped here cover the common case
//! (an adaptively scaled single-dimension random walk plus ensemble
//! jumps drawn from the differential-evolution buffer); callers with a
//! bespoke kernel implement [`Proposal`] themselves.

use anyhow::Result;
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;

use crate::de_buffer::DiffEvolutionBuffer;
use crate::params::ParameterVector;

/// Per-chain proposal bookkeeping, owned by the chain state.
///
/// `s_gamma` is the adaptation envelope published by the controller
/// while the chain is adapting; kernels that tune themselves read it in
/// [`Proposal::adapt`]. The trial counters are per varying dimension
/// and reset on every adaptation restart.
#[derive(Debug)]
pub struct ProposalState {
    /// Per-dimension jump scale.
    pub sigma: Vec<f64>,
    /// Accepted trials per dimension, counted for single-dimension jumps.
    pub accepted: Vec<u64>,
    /// Proposed trials per dimension.
    pub proposed: Vec<u64>,
    /// Adaptation envelope; `None` once adaptation is off.
    pub s_gamma: Option<f64>,
    /// Varying-dimension index of the last single-dimension jump.
    pub last_jump: Option<usize>,
}

impl ProposalState {
    pub fn new(n_varying: usize) -> Self {
        Self {
            sigma: vec![0.1; n_varying],
            accepted: vec![0; n_varying],
            proposed: vec![0; n_varying],
            s_gamma: None,
            last_jump: None,
        }
    }

    /// Zero the per-dimension trial counters.
    pub fn reset_counters(&mut self) {
        self.accepted.fill(0);
        self.proposed.fill(0);
    }

    /// Fraction of accepted trials for one dimension.
    pub fn acceptance_ratio(&self, dim: usize) -> f64 {
        let proposed = self.proposed[dim];
        if proposed == 0 {
            0.0
        } else {
            self.accepted[dim] as f64 / proposed as f64
        }
    }
}

/// A jump kernel.
///
/// `propose` fills `proposed` (pre-initialized to a copy of `current`)
/// and returns the log proposal-density ratio log(backward/forward).
/// `adapt` observes each trial's outcome; kernels without tunable state
/// leave the default no-op.
pub trait Proposal: Send {
    fn propose(
        &mut self,
        rng: &mut dyn RngCore,
        current: &ParameterVector,
        de_buffer: &DiffEvolutionBuffer,
        state: &mut ProposalState,
        proposed: &mut ParameterVector,
    ) -> Result<f64>;

    fn adapt(&self, _state: &mut ProposalState, _accepted: bool) {}

    /// Seed the proposal bookkeeping before the first trial.
    fn init(&self, _state: &mut ProposalState) {}
}

/// Gaussian random walk along one varying dimension per trial, with the
/// per-dimension scale driven towards the target acceptance rate by the
/// adaptation envelope.
#[derive(Debug, Clone)]
pub struct AdaptiveGaussianProposal {
    /// Prior width per varying dimension; bounds the jump scale and
    /// sets the adaptation step.
    widths: Vec<f64>,
    target_acceptance: f64,
}

impl AdaptiveGaussianProposal {
    pub fn new(widths: Vec<f64>) -> Self {
        Self {
            widths,
            target_acceptance: 0.234,
        }
    }

    pub fn with_target_acceptance(mut self, target: f64) -> Self {
        self.target_acceptance = target;
        self
    }
}

impl Proposal for AdaptiveGaussianProposal {
    fn propose(
        &mut self,
        rng: &mut dyn RngCore,
        current: &ParameterVector,
        _de_buffer: &DiffEvolutionBuffer,
        state: &mut ProposalState,
        proposed: &mut ParameterVector,
    ) -> Result<f64> {
        gaussian_jump(rng, current, state, proposed);
        Ok(0.0)
    }

    fn adapt(&self, state: &mut ProposalState, accepted: bool) {
        let (Some(s_gamma), Some(dim)) = (state.s_gamma, state.last_jump) else {
            return;
        };
        let width = self.widths[dim];
        let sigma = &mut state.sigma[dim];
        if accepted {
            *sigma += s_gamma * (width / 100.0) * (1.0 - self.target_acceptance);
        } else {
            *sigma -= s_gamma * (width / 100.0) * self.target_acceptance;
        }
        *sigma = sigma.clamp(0.0, width);
    }

    fn init(&self, state: &mut ProposalState) {
        state.sigma = self.widths.iter().map(|w| w / 10.0).collect();
    }
}

/// Jump along the difference of two distinct points from the
/// differential-evolution buffer. Falls back to a single-dimension
/// Gaussian jump until the buffer holds two points.
#[derive(Debug, Clone, Default)]
pub struct DifferentialEvolutionProposal;

impl Proposal for DifferentialEvolutionProposal {
    fn propose(
        &mut self,
        rng: &mut dyn RngCore,
        current: &ParameterVector,
        de_buffer: &DiffEvolutionBuffer,
        state: &mut ProposalState,
        proposed: &mut ParameterVector,
    ) -> Result<f64> {
        if de_buffer.len() < 2 {
            gaussian_jump(rng, current, state, proposed);
            return Ok(0.0);
        }

        let i = rng.random_range(0..de_buffer.len());
        let mut j = rng.random_range(0..de_buffer.len() - 1);
        if j >= i {
            j += 1;
        }
        let a = de_buffer.point(i);
        let b = de_buffer.point(j);

        let varying = current.schema().varying_indices();
        // Occasionally jump the full difference to hop between modes;
        // otherwise use the scale that is optimal for Gaussian targets.
        let gamma = if rng.random::<f64>() < 0.1 {
            1.0
        } else {
            2.38 / (2.0 * varying.len() as f64).sqrt()
        };
        for &dim in varying {
            let value = current.get(dim) + gamma * (a[dim] - b[dim]);
            proposed.set(dim, value);
        }
        state.last_jump = None;
        Ok(0.0)
    }
}

fn gaussian_jump(
    rng: &mut dyn RngCore,
    current: &ParameterVector,
    state: &mut ProposalState,
    proposed: &mut ParameterVector,
) {
    let varying = current.schema().varying_indices();
    let dim = rng.random_range(0..varying.len());
    let step: f64 = rng.sample(StandardNormal);
    let index = varying[dim];
    proposed.set(index, current.get(index) + state.sigma[dim] * step);
    state.last_jump = Some(dim);
}

/// A fixed weighted rotation over kernels, shuffled once at
/// construction so every chain walks the same mix in its own order.
pub struct ProposalCycle {
    kernels: Vec<Box<dyn Proposal>>,
    order: Vec<usize>,
    position: usize,
    last_used: usize,
}

impl ProposalCycle {
    pub fn new<R: Rng + ?Sized>(kernels: Vec<(Box<dyn Proposal>, usize)>, rng: &mut R) -> Self {
        use rand::seq::SliceRandom;

        let mut order = Vec::new();
        let mut flat = Vec::with_capacity(kernels.len());
        for (index, (kernel, weight)) in kernels.into_iter().enumerate() {
            assert!(weight > 0, "kernel weight must be positive");
            order.extend(std::iter::repeat(index).take(weight));
            flat.push(kernel);
        }
        assert!(!order.is_empty(), "proposal cycle needs at least one kernel");
        order.shuffle(rng);
        Self {
            kernels: flat,
            order,
            position: 0,
            last_used: 0,
        }
    }
}

impl Proposal for ProposalCycle {
    fn propose(
        &mut self,
        rng: &mut dyn RngCore,
        current: &ParameterVector,
        de_buffer: &DiffEvolutionBuffer,
        state: &mut ProposalState,
        proposed: &mut ParameterVector,
    ) -> Result<f64> {
        let kernel = self.order[self.position];
        self.position = (self.position + 1) % self.order.len();
        self.last_used = kernel;
        self.kernels[kernel].propose(rng, current, de_buffer, state, proposed)
    }

    fn adapt(&self, state: &mut ProposalState, accepted: bool) {
        self.kernels[self.last_used].adapt(state, accepted);
    }

    fn init(&self, state: &mut ProposalState) {
        for kernel in &self.kernels {
            kernel.init(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::params::{ParameterSchema, VaryType};
    use approx::assert_relative_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn point(values: &[f64]) -> ParameterVector {
        let mut schema = ParameterSchema::new();
        for i in 0..values.len() {
            schema.push(format!("p{i}"), VaryType::Varying);
        }
        ParameterVector::from_values(Arc::new(schema), values)
    }

    #[test]
    fn gaussian_proposal_moves_one_dimension() {
        let current = point(&[1.0, 2.0, 3.0]);
        let mut proposed = current.clone();
        let mut state = ProposalState::new(3);
        let de = DiffEvolutionBuffer::new(1);
        let mut kernel = AdaptiveGaussianProposal::new(vec![1.0, 1.0, 1.0]);
        kernel.init(&mut state);

        let mut rng = SmallRng::seed_from_u64(7);
        let ratio = kernel
            .propose(&mut rng, &current, &de, &mut state, &mut proposed)
            .unwrap();
        assert_relative_eq!(ratio, 0.0);

        let moved: Vec<usize> = (0..3)
            .filter(|&i| proposed.get(i) != current.get(i))
            .collect();
        assert_eq!(moved.len(), 1);
        assert_eq!(state.last_jump, Some(moved[0]));
    }

    #[test]
    fn scale_adapts_towards_target() {
        let mut state = ProposalState::new(1);
        let kernel = AdaptiveGaussianProposal::new(vec![10.0]);
        kernel.init(&mut state);
        state.s_gamma = Some(1.0);
        state.last_jump = Some(0);

        let before = state.sigma[0];
        kernel.adapt(&mut state, true);
        assert!(state.sigma[0] > before);

        let grown = state.sigma[0];
        kernel.adapt(&mut state, false);
        assert!(state.sigma[0] < grown);

        // Without an envelope the scale is frozen.
        state.s_gamma = None;
        let frozen = state.sigma[0];
        kernel.adapt(&mut state, true);
        assert_relative_eq!(state.sigma[0], frozen);
    }

    #[test]
    fn scale_stays_within_prior_width() {
        let mut state = ProposalState::new(1);
        let kernel = AdaptiveGaussianProposal::new(vec![1.0]);
        kernel.init(&mut state);
        state.s_gamma = Some(1e6);
        state.last_jump = Some(0);

        kernel.adapt(&mut state, true);
        assert_relative_eq!(state.sigma[0], 1.0);
        kernel.adapt(&mut state, false);
        assert_relative_eq!(state.sigma[0], 0.0);
    }

    #[test]
    fn de_proposal_uses_buffer_differences() {
        let current = point(&[0.0, 0.0]);
        let mut proposed = current.clone();
        let mut state = ProposalState::new(2);
        let mut de = DiffEvolutionBuffer::new(1);
        de.accumulate(&point(&[1.0, 2.0]), 64);
        de.accumulate(&point(&[3.0, 5.0]), 64);

        let mut kernel = DifferentialEvolutionProposal;
        let mut rng = SmallRng::seed_from_u64(3);
        kernel
            .propose(&mut rng, &current, &de, &mut state, &mut proposed)
            .unwrap();

        // The jump is proportional to the difference of the two buffer
        // points, so the per-dimension offsets keep their 2:3 ratio.
        let dx = proposed.get(0) - current.get(0);
        let dy = proposed.get(1) - current.get(1);
        assert_relative_eq!(dy / dx, 1.5, max_relative = 1e-12);
        assert_eq!(state.last_jump, None);
    }

    #[test]
    fn de_proposal_falls_back_on_short_buffer() {
        let current = point(&[0.0]);
        let mut proposed = current.clone();
        let mut state = ProposalState::new(1);
        state.sigma = vec![0.5];
        let de = DiffEvolutionBuffer::new(1);

        let mut kernel = DifferentialEvolutionProposal;
        let mut rng = SmallRng::seed_from_u64(5);
        kernel
            .propose(&mut rng, &current, &de, &mut state, &mut proposed)
            .unwrap();
        assert_eq!(state.last_jump, Some(0));
    }

    #[test]
    fn cycle_rotates_through_kernels() {
        struct Tagged(f64);
        impl Proposal for Tagged {
            fn propose(
                &mut self,
                _rng: &mut dyn RngCore,
                _current: &ParameterVector,
                _de: &DiffEvolutionBuffer,
                _state: &mut ProposalState,
                proposed: &mut ParameterVector,
            ) -> Result<f64> {
                proposed.set(0, self.0);
                Ok(0.0)
            }
        }

        let mut rng = SmallRng::seed_from_u64(11);
        let mut cycle = ProposalCycle::new(
            vec![
                (Box::new(Tagged(1.0)) as Box<dyn Proposal>, 2),
                (Box::new(Tagged(2.0)) as Box<dyn Proposal>, 1),
            ],
            &mut rng,
        );

        let current = point(&[0.0]);
        let de = DiffEvolutionBuffer::new(1);
        let mut state = ProposalState::new(1);
        let mut tags = Vec::new();
        for _ in 0..6 {
            let mut proposed = current.clone();
            cycle
                .propose(&mut rng, &current, &de, &mut state, &mut proposed)
                .unwrap();
            tags.push(proposed.get(0));
        }
        // Two full cycles: each walks the same shuffled order, with the
        // first kernel appearing twice per cycle.
        assert_eq!(&tags[..3], &tags[3..]);
        assert_eq!(tags[..3].iter().filter(|&&t| t == 1.0).count(), 2);
        assert_eq!(tags[..3].iter().filter(|&&t| t == 2.0).count(), 1);
    }
}
