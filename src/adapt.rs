//! Proposal-scale adaptation control.
//!
//! Each chain owns one controller. While adapting, the controller
//! publishes an envelope value (`s_gamma`) into the chain's proposal
//! state every iteration; the jump kernels decide what to do with it.
//! Adaptation shuts off after a fixed number of iterations without a
//! restart, and restarts from scratch whenever the chain finds a region
//! whose likelihood beats the baseline by more than half the number of
//! varying dimensions.

use log::info;

use crate::chain::ChainState;

#[derive(Debug, Clone, Copy)]
pub struct AdaptOptions {
    /// Master switch; when false the controller never touches the chain.
    pub enabled: bool,
    /// Decay power of the envelope.
    pub tau: u64,
    /// Iterations of adaptation before shutting off.
    pub length: u64,
    /// Ramp-up window after a (re)start.
    pub reset_buffer: u64,
}

impl Default for AdaptOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            tau: 5,
            length: 100_000,
            reset_buffer: 100,
        }
    }
}

#[derive(Debug)]
pub struct AdaptationController {
    options: AdaptOptions,
    adapting: bool,
    start: u64,
    logl_at_start: f64,
}

impl AdaptationController {
    /// A controller in the `adapting` state (unless globally disabled),
    /// with the chain's initial likelihood as restart baseline.
    pub fn new(options: AdaptOptions, initial_log_likelihood: f64) -> Self {
        Self {
            options,
            adapting: options.enabled,
            start: 0,
            logl_at_start: initial_log_likelihood,
        }
    }

    pub fn is_adapting(&self) -> bool {
        self.adapting
    }

    /// Advance the state machine by one iteration.
    ///
    /// Restarts take priority over shutdown: a likelihood jump of more
    /// than `n_varying / 2` over the baseline re-learns the step sizes
    /// even if adaptation had already been switched off.
    pub fn update(&mut self, chain: &mut ChainState, cycle: u64) {
        if !self.options.enabled {
            return;
        }

        let n_varying = chain.params.schema().varying_count();
        if chain.log_likelihood > self.logl_at_start + n_varying as f64 / 2.0 {
            if !self.adapting {
                info!(
                    "chain {}: likelihood improved, restarting adaptation at iteration {cycle}",
                    chain.id
                );
            }
            self.restart(chain, cycle);
        } else if self.adapting {
            if cycle - self.start > self.options.length {
                self.adapting = false;
                chain.proposal.s_gamma = None;
                chain.de_buffer.reset();
                info!("chain {}: ending adaptation at iteration {cycle}", chain.id);
            } else {
                chain.proposal.s_gamma = Some(self.envelope(cycle));
            }
        }
    }

    /// Re-enter `adapting`: zero the trial counters, move the baseline
    /// to the current iteration and likelihood.
    pub fn restart(&mut self, chain: &mut ChainState, cycle: u64) {
        chain.proposal.reset_counters();
        self.adapting = true;
        self.start = cycle;
        self.logl_at_start = chain.log_likelihood;
        chain.proposal.s_gamma = Some(self.envelope(cycle));
    }

    fn envelope(&self, cycle: u64) -> f64 {
        adaptation_envelope(
            cycle,
            self.start,
            self.options.length,
            self.options.tau,
            self.options.reset_buffer,
        )
    }
}

/// The adaptation envelope.
///
/// Quadratic ramp over the first `reset` iterations after a start, then
/// a power-law decay until `length` iterations have passed, then zero.
pub fn adaptation_envelope(cycle: u64, start: u64, length: u64, tau: u64, reset: u64) -> f64 {
    let lag = cycle.saturating_sub(start);
    if lag <= reset {
        let ramp = lag as f64 / reset as f64;
        ramp * ramp
    } else if lag < length {
        10.0 * (-(1.0 / tau as f64) * (lag as f64).ln()).exp() - 1.0
    } else {
        0.0
    }
}
