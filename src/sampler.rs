//! The run orchestrator.
//!
//! One call to [`sample`] drives one process's share of a distributed
//! run: it owns the local chains, advances them in a fork-join per
//! iteration, runs the synchronized swap round, and coordinates
//! process-wide termination through the communicator. The iteration
//! counter lives here and is handed to each per-chain task by value;
//! nothing global is shared between chain tasks.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use itertools::Itertools;
use log::info;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use thiserror::Error;

use crate::adapt::{AdaptOptions, AdaptationController};
use crate::chain::{metropolis_step, ChainState};
use crate::ess::effective_sample_size;
use crate::ladder::Ladder;
use crate::model::Model;
use crate::params::ParameterVector;
use crate::proposal::Proposal;
use crate::storage::{
    chain_output_path, resume_read, stat_path, swap_path, ChainWriter, RunInfo, StatWriter,
    SwapWriter,
};
use crate::swap::swap_round;
use crate::transport::Communicator;

/// Setup problems, all detected before the first iteration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("temperature ladder is empty")]
    EmptyLadder,
    #[error("ladder of {n_temps} temperatures cannot be split into blocks of {chains_per_rank}")]
    UnevenLadder {
        n_temps: usize,
        chains_per_rank: usize,
    },
    #[error("temperatures must be non-decreasing along the ladder")]
    UnorderedLadder,
    #[error("temperatures must be positive and finite")]
    NonPositiveTemperature,
    #[error("{0} must be positive")]
    ZeroSetting(&'static str),
    #[error("ladder expects {expected} ranks but the communicator has {actual}")]
    RankMismatch { expected: usize, actual: usize },
    #[error("model has no varying dimensions")]
    NoVaryingDimensions,
}

/// Process-wide run parameters.
#[derive(Debug, Clone)]
pub struct PtSettings {
    /// Hard iteration ceiling; the run stops here no matter what.
    pub num_steps: u64,
    /// Target effective sample count on the coldest chain. Zero leaves
    /// the iteration ceiling as the only stopping rule.
    pub target_eff: u64,
    /// Iterations between retained output rows.
    pub output_skip: u64,
    /// Iterations between swap rounds.
    pub swap_skip: u64,
    /// Initial iterations between differential-evolution accumulations.
    pub de_skip: u64,
    /// Hard ceiling on the differential-evolution buffer length.
    pub de_buffer_limit: usize,
    pub adapt: AdaptOptions,
    pub seed: u64,
    /// Continue from existing output files instead of starting fresh.
    pub resume: bool,
    /// Add per-detector and network SNR columns to the output.
    pub output_snrs: bool,
    /// Add a wall-clock column to the output.
    pub record_timestamps: bool,
    /// Write one diagnostic row per swap attempt.
    pub temp_verbose: bool,
    /// Write one diagnostic row per retained adaptation step.
    pub adapt_verbose: bool,
}

impl Default for PtSettings {
    fn default() -> Self {
        Self {
            num_steps: 100_000,
            target_eff: 1_000,
            output_skip: 100,
            swap_skip: 100,
            de_skip: 1,
            de_buffer_limit: 1_000_000,
            adapt: AdaptOptions::default(),
            seed: 0,
            resume: false,
            output_snrs: false,
            record_timestamps: false,
            temp_verbose: false,
            adapt_verbose: false,
        }
    }
}

impl PtSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        for (value, name) in [
            (self.num_steps, "num_steps"),
            (self.output_skip, "output_skip"),
            (self.swap_skip, "swap_skip"),
            (self.de_skip, "de_skip"),
            (self.de_buffer_limit as u64, "de_buffer_limit"),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroSetting(name));
            }
        }
        if self.adapt.enabled {
            for (value, name) in [
                (self.adapt.tau, "adapt.tau"),
                (self.adapt.length, "adapt.length"),
                (self.adapt.reset_buffer, "adapt.reset_buffer"),
            ] {
                if value == 0 {
                    return Err(ConfigError::ZeroSetting(name));
                }
            }
        }
        Ok(())
    }
}

/// Observable state of one chain, for progress reporting.
#[derive(Debug, Clone)]
pub struct ChainProgress {
    pub id: usize,
    pub temperature: f64,
    pub acceptance_count: u64,
    pub adapting: bool,
    pub effective_samples: u64,
}

pub struct ProgressCallback {
    pub callback: Box<dyn FnMut(u64, &[ChainProgress]) + Send>,
    /// Invoke the callback every this many iterations.
    pub every: u64,
}

#[derive(Debug, Clone)]
pub struct ChainReport {
    pub id: usize,
    pub temperature: f64,
    pub acceptance_rate: f64,
    pub effective_samples: u64,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    /// Iteration the run stopped on; identical across ranks.
    pub steps: u64,
    /// One entry per locally-owned chain, in ladder order.
    pub chains: Vec<ChainReport>,
}

/// Everything one chain task needs besides the chain state itself.
struct ChainWorker<'model, M: Model + 'model, P> {
    density: M::Density<'model>,
    proposal: P,
    rng: SmallRng,
    adapter: AdaptationController,
    writer: ChainWriter,
    stats: Option<StatWriter>,
    /// Estimate produced this iteration, if the schedule hit.
    fresh_eff: Option<u64>,
    /// Most recent estimate, for progress reporting.
    last_eff: u64,
}

impl<'model, M: Model + 'model, P: Proposal> ChainWorker<'model, M, P> {
    /// One iteration of one chain: adaptation, the periodic effective
    /// sample estimate, the Metropolis-Hastings trial, and the periodic
    /// buffer/output/diagnostic writes.
    fn advance(
        &mut self,
        chain: &mut ChainState,
        step: u64,
        settings: &PtSettings,
        epoch: Instant,
    ) -> Result<()> {
        self.adapter.update(chain, step);

        if step % (100 * settings.output_skip) == 0 {
            let eff = if self.adapter.is_adapting() {
                0
            } else {
                effective_sample_size(&chain.de_buffer, chain.params.schema().varying_indices())
            };
            self.fresh_eff = Some(eff);
            self.last_eff = eff;
        }

        metropolis_step(chain, &mut self.density, &mut self.proposal, &mut self.rng)
            .with_context(|| format!("advancing chain {}", chain.id))?;

        if step % settings.output_skip == 0 {
            if step % chain.de_buffer.skip() == 0 {
                chain.de_buffer.accumulate(&chain.params, settings.de_buffer_limit);
            }
            let timestamp = settings
                .record_timestamps
                .then(|| epoch.elapsed().as_secs_f64());
            self.writer
                .record(chain, step, timestamp)
                .with_context(|| format!("writing output for chain {}", chain.id))?;
            if let Some(stats) = self.stats.as_mut() {
                stats
                    .record(step, chain)
                    .with_context(|| format!("writing statistics for chain {}", chain.id))?;
            }
        }
        Ok(())
    }

    fn progress(&self, chain: &ChainState) -> ChainProgress {
        ChainProgress {
            id: chain.id,
            temperature: chain.temperature,
            acceptance_count: chain.acceptance_count,
            adapting: self.adapter.is_adapting(),
            effective_samples: self.last_eff,
        }
    }
}

/// Drive this process's chains until the coldest chain of the
/// coordinator collects the target number of effective samples or the
/// iteration ceiling is hit.
///
/// Every rank of the run calls this with the same model, settings and
/// ladder, and its own communicator endpoint. The call blocks until the
/// whole run terminates; all ranks leave on the same iteration.
pub fn sample<M, P, C, F>(
    model: &M,
    settings: &PtSettings,
    ladder: &Ladder,
    comm: &mut C,
    output_dir: impl AsRef<Path>,
    make_proposal: F,
    mut callback: Option<ProgressCallback>,
) -> Result<RunReport>
where
    M: Model,
    P: Proposal,
    C: Communicator,
    F: Fn(usize) -> P,
{
    settings.validate()?;
    if ladder.n_ranks() != comm.size() {
        return Err(ConfigError::RankMismatch {
            expected: ladder.n_ranks(),
            actual: comm.size(),
        }
        .into());
    }
    let schema = model.schema();
    if schema.varying_count() == 0 {
        return Err(ConfigError::NoVaryingDimensions.into());
    }

    let rank = comm.rank();
    let output_dir = output_dir.as_ref();
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;

    let run_info = RunInfo {
        n_iter: settings.num_steps,
        seed: settings.seed,
        n_temps: ladder.len(),
        null_likelihood: model.null_log_likelihood(),
        detectors: model.detectors(),
        output_snrs: settings.output_snrs,
        record_timestamps: settings.record_timestamps,
    };

    let mut chains: Vec<ChainState> = Vec::with_capacity(ladder.chains_per_rank());
    let mut workers: Vec<ChainWorker<M, P>> = Vec::with_capacity(ladder.chains_per_rank());
    let mut resumed_step = None;

    for id in ladder.local_range(rank) {
        let mut seed_rng = ChaCha8Rng::seed_from_u64(settings.seed);
        seed_rng.set_stream(id as u64);
        let mut rng = SmallRng::from_rng(&mut seed_rng);

        let mut density = model.density().context("creating the model density")?;
        let params = ParameterVector::zeros(schema.clone());
        let mut chain = ChainState::new(id, ladder.temperature(id), params, settings.de_skip);
        chain.null_likelihood = run_info.null_likelihood;

        let path = chain_output_path(output_dir, settings.seed, id);
        let writer = if settings.resume && path.exists() {
            let cycle = resume_read(&path, &mut chain.params)
                .with_context(|| format!("resuming chain {id}"))?;
            chain
                .init(&mut density)
                .context("re-evaluating the resumed state")?;
            if resumed_step.is_none() {
                resumed_step = Some(cycle);
            }
            ChainWriter::append(&path, &run_info)?
        } else {
            let mut last_error = None;
            for _ in 0..500 {
                model
                    .init_position(&mut rng, &mut chain.params)
                    .context("drawing an initial position")?;
                match chain.init(&mut density) {
                    Ok(()) => {
                        last_error = None;
                        break;
                    }
                    Err(error) => last_error = Some(error),
                }
            }
            if let Some(error) = last_error {
                return Err(error.context("all initialization points failed"));
            }
            ChainWriter::create(&path, &run_info, &chain)?
        };

        let mut proposal = make_proposal(id);
        proposal.init(&mut chain.proposal);

        let stats = (settings.adapt_verbose && settings.adapt.enabled)
            .then(|| StatWriter::create(&stat_path(output_dir, settings.seed, id), &chain))
            .transpose()?;

        workers.push(ChainWorker {
            density,
            proposal,
            rng,
            adapter: AdaptationController::new(settings.adapt, chain.log_likelihood),
            writer,
            stats,
            fresh_eff: None,
            last_eff: 0,
        });
        chains.push(chain);
    }

    let mut swap_log = settings
        .temp_verbose
        .then(|| SwapWriter::create(&swap_path(output_dir, settings.seed, rank)))
        .transpose()?;

    // Shuffles and local swap decisions draw from a per-process stream
    // disjoint from every chain's stream.
    let mut process_rng = ChaCha8Rng::seed_from_u64(settings.seed);
    process_rng.set_stream((ladder.len() + rank) as u64);

    let pool = ThreadPoolBuilder::new()
        .num_threads(ladder.chains_per_rank())
        .thread_name(|i| format!("ptmcmc-worker-{i}"))
        .build()
        .context("could not start thread pool")?;

    if rank == 0 {
        if settings.adapt.enabled {
            info!(
                "adapting with decay power {} for {} iterations after max log(L) increases by {:.2}",
                settings.adapt.tau,
                settings.adapt.length,
                schema.varying_count() as f64 / 2.0
            );
        } else {
            info!("adaptation off");
        }
        if settings.target_eff > 0 {
            info!("collecting {} effective samples", settings.target_eff);
        }
    }

    let epoch = Instant::now();
    let mut step = resumed_step.unwrap_or(0);
    let mut run_complete = false;

    while !run_complete {
        step += 1;
        let current = step;

        pool.install(|| {
            chains
                .par_iter_mut()
                .zip(workers.par_iter_mut())
                .try_for_each(|(chain, worker)| worker.advance(chain, current, settings, epoch))
        })?;

        // Only the coordinator's coldest chain decides convergence.
        if rank == 0 && settings.target_eff > 0 {
            if let Some(eff) = workers[0].fresh_eff.take() {
                if eff >= settings.target_eff {
                    info!("chain 0 has {eff} effective samples, stopping");
                    run_complete = true;
                }
            }
        }

        if step % settings.swap_skip == 0 {
            swap_round(
                &mut chains,
                ladder,
                comm,
                &mut process_rng,
                step,
                swap_log.as_mut(),
            )
            .context("exchanging states between temperatures")?;
        }

        run_complete = comm
            .broadcast_complete(run_complete)
            .context("broadcasting the completion flag")?;
        if step >= settings.num_steps {
            run_complete = true;
        }

        if let Some(cb) = callback.as_mut() {
            if step % cb.every == 0 || run_complete {
                let progress = chains
                    .iter()
                    .zip(&workers)
                    .map(|(chain, worker)| worker.progress(chain))
                    .collect_vec();
                (cb.callback)(step, &progress);
            }
        }
    }

    let chains_report = chains
        .iter()
        .map(|chain| ChainReport {
            id: chain.id,
            temperature: chain.temperature,
            acceptance_rate: chain.acceptance_count as f64 / step.max(1) as f64,
            effective_samples: effective_sample_size(
                &chain.de_buffer,
                schema.varying_indices(),
            ),
        })
        .collect();

    Ok(RunReport {
        steps: step,
        chains: chains_report,
    })
}
