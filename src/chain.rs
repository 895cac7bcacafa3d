//! Per-chain state and the Metropolis-Hastings trial.

use anyhow::{Context, Result};
use rand::Rng;

use crate::de_buffer::DiffEvolutionBuffer;
use crate::model::Density;
use crate::params::ParameterVector;
use crate::proposal::{Proposal, ProposalState};
use crate::transport::ChainSnapshot;

/// The mutable record of one tempered chain.
///
/// Exactly one task advances a chain at a time; the stored likelihood
/// and prior always describe `params`, never a pending proposal.
#[derive(Debug)]
pub struct ChainState {
    /// Global ladder index.
    pub id: usize,
    /// The chain's rung on the temperature ladder. Swaps move state
    /// between chains, never temperatures.
    pub temperature: f64,
    pub params: ParameterVector,
    pub log_likelihood: f64,
    pub log_prior: f64,
    /// Noise-only likelihood, subtracted in output rows.
    pub null_likelihood: f64,
    pub acceptance_count: u64,
    /// Outcome of the most recent trial.
    pub accepted: bool,
    pub proposal: ProposalState,
    pub de_buffer: DiffEvolutionBuffer,
    /// Per-detector log likelihoods of the current state.
    pub detector_log_likelihoods: Vec<f64>,
    /// Per-detector SNRs of the current state, when requested.
    pub detector_snrs: Vec<f64>,
    pub network_snr: f64,
}

impl ChainState {
    pub fn new(id: usize, temperature: f64, params: ParameterVector, de_skip: u64) -> Self {
        let n_varying = params.schema().varying_count();
        Self {
            id,
            temperature,
            params,
            log_likelihood: f64::NAN,
            log_prior: f64::NAN,
            null_likelihood: 0.0,
            acceptance_count: 0,
            accepted: false,
            proposal: ProposalState::new(n_varying),
            de_buffer: DiffEvolutionBuffer::new(de_skip),
            detector_log_likelihoods: Vec::new(),
            detector_snrs: Vec::new(),
            network_snr: 0.0,
        }
    }

    /// Evaluate the model at the current point and store the result.
    /// Fails if the point has an impossible prior, so callers can retry
    /// with a fresh starting position.
    pub fn init<D: Density>(&mut self, density: &mut D) -> Result<()> {
        let log_prior = density.log_prior(&self.params);
        if log_prior == f64::NEG_INFINITY {
            anyhow::bail!("chain {} starting point has zero prior support", self.id);
        }
        let log_likelihood = density
            .log_likelihood(&self.params)
            .context("evaluating the likelihood at the starting point")?;
        self.log_prior = log_prior;
        self.log_likelihood = log_likelihood;
        self.cache_detector_values(density);
        Ok(())
    }

    /// The state that moves during a tempering swap, as one unit.
    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            log_likelihood: self.log_likelihood,
            log_prior: self.log_prior,
            varying: self.params.copy_varying(),
        }
    }

    /// Replace the physical state from a peer's snapshot. Temperature
    /// and ladder identity stay put.
    pub fn apply_snapshot(&mut self, snapshot: &ChainSnapshot) {
        self.params.set_varying(&snapshot.varying);
        self.log_likelihood = snapshot.log_likelihood;
        self.log_prior = snapshot.log_prior;
    }

    fn cache_detector_values<D: Density>(&mut self, density: &D) {
        let per_detector = density.detector_log_likelihoods();
        self.detector_log_likelihoods.clear();
        self.detector_log_likelihoods.extend_from_slice(per_detector);
        if let Some((snrs, network)) = density.snr() {
            self.detector_snrs.clear();
            self.detector_snrs.extend_from_slice(snrs);
            self.network_snr = network;
        }
    }
}

/// Exchange the full physical state of two chains owned by the same
/// process. Each keeps its temperature and output file.
pub fn swap_states(a: &mut ChainState, b: &mut ChainState) {
    std::mem::swap(&mut a.params, &mut b.params);
    std::mem::swap(&mut a.log_likelihood, &mut b.log_likelihood);
    std::mem::swap(&mut a.log_prior, &mut b.log_prior);
}

/// The Metropolis-Hastings acceptance rule with an explicit uniform
/// draw, split out so the decision itself is testable.
pub fn accepts(log_acceptance: f64, uniform: f64) -> bool {
    log_acceptance > 0.0 || uniform.ln() < log_acceptance
}

/// Run one Metropolis-Hastings trial on `chain`.
///
/// The proposal supplies a candidate and the log ratio of backward to
/// forward proposal density. An impossible prior short-circuits the
/// likelihood evaluation; a likelihood error aborts the run. The trial
/// outcome is fed back into the per-dimension counters and the kernel's
/// scale rule whether or not the candidate is accepted.
pub fn metropolis_step<D, P, R>(
    chain: &mut ChainState,
    density: &mut D,
    proposal: &mut P,
    rng: &mut R,
) -> Result<()>
where
    D: Density,
    P: Proposal + ?Sized,
    R: Rng,
{
    let mut proposed = chain.params.clone();
    let log_ratio = proposal
        .propose(
            rng,
            &chain.params,
            &chain.de_buffer,
            &mut chain.proposal,
            &mut proposed,
        )
        .context("generating a proposal")?;

    let log_prior_proposed = density.log_prior(&proposed);
    let log_likelihood_proposed = if log_prior_proposed > f64::NEG_INFINITY {
        density
            .log_likelihood(&proposed)
            .context("evaluating the likelihood")?
    } else {
        f64::NEG_INFINITY
    };

    let log_acceptance = (log_likelihood_proposed - chain.log_likelihood) / chain.temperature
        + (log_prior_proposed - chain.log_prior)
        + log_ratio;

    let accepted = accepts(log_acceptance, rng.random::<f64>());
    if accepted {
        chain.params = proposed;
        chain.log_likelihood = log_likelihood_proposed;
        chain.log_prior = log_prior_proposed;
        chain.acceptance_count += 1;
        chain.cache_detector_values(density);
    }
    chain.accepted = accepted;

    if let Some(dim) = chain.proposal.last_jump {
        chain.proposal.proposed[dim] += 1;
        if accepted {
            chain.proposal.accepted[dim] += 1;
        }
    }
    proposal.adapt(&mut chain.proposal, accepted);

    Ok(())
}
