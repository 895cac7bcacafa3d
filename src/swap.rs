//! The parallel-tempering exchange.
//!
//! Once every swap interval, every adjacent pair of rungs attempts to
//! exchange physical state, in an order the coordinator shuffles anew
//! each round. Pairs are disjoint, so the order only affects which
//! random draws decide which pair, never the outcome of another pair.
//! Chains keep their temperature and their output file for the whole
//! run; only likelihood, prior and the varying parameters move.

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::chain::{accepts, swap_states, ChainState};
use crate::ladder::Ladder;
use crate::storage::SwapWriter;
use crate::transport::{ChainSnapshot, Communicator, Message, TransportError};

/// Log acceptance ratio for exchanging the states of two rungs.
///
/// Symmetric in the participants: both sides of a pair compute the
/// same value from the same four numbers.
pub fn swap_log_ratio(cold_temp: f64, hot_temp: f64, cold_ll: f64, hot_ll: f64) -> f64 {
    (1.0 / cold_temp - 1.0 / hot_temp) * (hot_ll - cold_ll)
}

/// Run one synchronized round of adjacent-pair swap attempts.
///
/// `chains` are this rank's rungs in ladder order. Every rank must call
/// this on the same iteration; the broadcast and the point-to-point
/// exchanges are the run's global synchronization points. A transport
/// failure leaves no partially swapped chain behind on the rank that
/// observes it, and aborts the run everywhere else by disconnection.
pub fn swap_round<C, R>(
    chains: &mut [ChainState],
    ladder: &Ladder,
    comm: &mut C,
    rng: &mut R,
    cycle: u64,
    mut swap_log: Option<&mut SwapWriter>,
) -> Result<()>
where
    C: Communicator,
    R: Rng + ?Sized,
{
    let n_temps = ladder.len();
    if n_temps < 2 {
        return Ok(());
    }

    let mut order: Vec<usize> = (0..n_temps - 1).collect();
    if comm.rank() == 0 {
        order.shuffle(rng);
    }
    comm.broadcast_order(&mut order)?;

    for &cold in &order {
        let hot = cold + 1;
        let cold_rank = ladder.rank_of(cold);
        let hot_rank = ladder.rank_of(hot);

        if cold_rank == hot_rank {
            if comm.rank() == cold_rank {
                let writer = swap_log.as_deref_mut();
                swap_local_pair(
                    chains,
                    ladder.local_slot(cold),
                    ladder.local_slot(hot),
                    rng,
                    cycle,
                    writer,
                )?;
            }
        } else if comm.rank() == cold_rank {
            let chain = &mut chains[ladder.local_slot(cold)];
            swap_as_cold(chain, hot_rank, comm)?;
        } else if comm.rank() == hot_rank {
            let chain = &mut chains[ladder.local_slot(hot)];
            let writer = swap_log.as_deref_mut();
            swap_as_hot(chain, cold_rank, comm, rng, cycle, writer)?;
        }
    }

    Ok(())
}

/// Both rungs live on this rank: decide and exchange in memory.
fn swap_local_pair<R: Rng + ?Sized>(
    chains: &mut [ChainState],
    cold_slot: usize,
    hot_slot: usize,
    rng: &mut R,
    cycle: u64,
    swap_log: Option<&mut SwapWriter>,
) -> Result<()> {
    let (head, tail) = chains.split_at_mut(hot_slot);
    let cold_chain = &mut head[cold_slot];
    let hot_chain = &mut tail[0];

    let log_swap = swap_log_ratio(
        cold_chain.temperature,
        hot_chain.temperature,
        cold_chain.log_likelihood,
        hot_chain.log_likelihood,
    );
    let accepted = accepts(log_swap, rng.random::<f64>());

    if let Some(writer) = swap_log {
        writer.record(
            cycle,
            cold_chain.temperature,
            hot_chain.temperature,
            log_swap,
            cold_chain.log_likelihood,
            hot_chain.log_likelihood,
            accepted,
        )?;
    }

    if accepted {
        swap_states(cold_chain, hot_chain);
    }
    Ok(())
}

/// Cold role of a cross-rank pair: announce, await the verdict, then
/// exchange snapshots (sending first, receiving second).
fn swap_as_cold<C: Communicator>(
    chain: &mut ChainState,
    hot_rank: usize,
    comm: &mut C,
) -> Result<()> {
    comm.send(
        hot_rank,
        Message::SwapProposal {
            temperature: chain.temperature,
            log_likelihood: chain.log_likelihood,
        },
    )?;

    let accepted = match comm.recv(hot_rank)? {
        Message::SwapDecision { accepted } => accepted,
        _ => {
            return Err(TransportError::Unexpected {
                from: hot_rank,
                expected: "swap decision",
            }
            .into())
        }
    };

    if accepted {
        comm.send(hot_rank, Message::Snapshot(chain.snapshot()))?;
        let theirs = match comm.recv(hot_rank)? {
            Message::Snapshot(snapshot) => snapshot,
            _ => {
                return Err(TransportError::Unexpected {
                    from: hot_rank,
                    expected: "snapshot",
                }
                .into())
            }
        };
        check_dimensions(chain, &theirs)?;
        chain.apply_snapshot(&theirs);
    }
    Ok(())
}

/// Hot role of a cross-rank pair: the hot side decides, reports, then
/// exchanges snapshots (receiving first, sending second).
fn swap_as_hot<C, R>(
    chain: &mut ChainState,
    cold_rank: usize,
    comm: &mut C,
    rng: &mut R,
    cycle: u64,
    swap_log: Option<&mut SwapWriter>,
) -> Result<()>
where
    C: Communicator,
    R: Rng + ?Sized,
{
    let (cold_temp, cold_ll) = match comm.recv(cold_rank)? {
        Message::SwapProposal {
            temperature,
            log_likelihood,
        } => (temperature, log_likelihood),
        _ => {
            return Err(TransportError::Unexpected {
                from: cold_rank,
                expected: "swap proposal",
            }
            .into())
        }
    };

    let log_swap = swap_log_ratio(cold_temp, chain.temperature, cold_ll, chain.log_likelihood);
    let accepted = accepts(log_swap, rng.random::<f64>());

    if let Some(writer) = swap_log {
        writer.record(
            cycle,
            cold_temp,
            chain.temperature,
            log_swap,
            cold_ll,
            chain.log_likelihood,
            accepted,
        )?;
    }

    comm.send(cold_rank, Message::SwapDecision { accepted })?;

    if accepted {
        let theirs = match comm.recv(cold_rank)? {
            Message::Snapshot(snapshot) => snapshot,
            _ => {
                return Err(TransportError::Unexpected {
                    from: cold_rank,
                    expected: "snapshot",
                }
                .into())
            }
        };
        check_dimensions(chain, &theirs)?;
        comm.send(cold_rank, Message::Snapshot(chain.snapshot()))?;
        chain.apply_snapshot(&theirs);
    }
    Ok(())
}

fn check_dimensions(chain: &ChainState, theirs: &ChainSnapshot) -> Result<(), TransportError> {
    let ours = chain.params.schema().varying_count();
    if theirs.varying.len() != ours {
        return Err(TransportError::DimensionMismatch {
            ours,
            theirs: theirs.varying.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::params::{ParameterSchema, ParameterVector, VaryType};
    use crate::transport::{ChannelCommunicator, SingleProcess};
    use approx::assert_relative_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn chain_at(id: usize, temperature: f64, value: f64, log_likelihood: f64) -> ChainState {
        let schema = Arc::new(ParameterSchema::new().with("x", VaryType::Varying));
        let params = ParameterVector::from_values(schema, &[value]);
        let mut chain = ChainState::new(id, temperature, params, 1);
        chain.log_likelihood = log_likelihood;
        chain.log_prior = 0.0;
        chain
    }

    #[test]
    fn ratio_is_role_symmetric() {
        // Whichever side computes it, the same four numbers give the
        // same ratio.
        let from_cold_side = swap_log_ratio(1.0, 2.0, -10.0, -5.0);
        let from_hot_side = swap_log_ratio(1.0, 2.0, -10.0, -5.0);
        assert_relative_eq!(from_cold_side, from_hot_side);
        assert_relative_eq!(from_cold_side, 2.5);
    }

    #[test]
    fn uphill_swap_exchanges_state_and_keeps_temperatures() {
        let mut chains = vec![
            chain_at(0, 1.0, 0.25, -10.0),
            chain_at(1, 2.0, 0.75, -5.0),
        ];
        let ladder = Ladder::single_rank(vec![1.0, 2.0]).unwrap();
        let mut comm = SingleProcess;
        let mut rng = SmallRng::seed_from_u64(0);

        // log_swap = (1 - 0.5) * (-5 - -10) = 2.5 > 0: always accepted.
        swap_round(&mut chains, &ladder, &mut comm, &mut rng, 1, None).unwrap();

        assert_relative_eq!(chains[0].params.get(0), 0.75);
        assert_relative_eq!(chains[1].params.get(0), 0.25);
        assert_relative_eq!(chains[0].log_likelihood, -5.0);
        assert_relative_eq!(chains[1].log_likelihood, -10.0);
        assert_relative_eq!(chains[0].temperature, 1.0);
        assert_relative_eq!(chains[1].temperature, 2.0);
    }

    #[test]
    fn single_rung_round_is_a_no_op() {
        let mut chains = vec![chain_at(0, 1.0, 0.5, -1.0)];
        let ladder = Ladder::single_rank(vec![1.0]).unwrap();
        let mut comm = SingleProcess;
        let mut rng = SmallRng::seed_from_u64(0);
        swap_round(&mut chains, &ladder, &mut comm, &mut rng, 1, None).unwrap();
        assert_relative_eq!(chains[0].params.get(0), 0.5);
    }

    #[test]
    fn cross_rank_swap_moves_state_both_ways() {
        let ladder = Ladder::new(vec![1.0, 4.0], 1).unwrap();
        let endpoints = ChannelCommunicator::mesh(2);

        let mut handles = Vec::new();
        for (rank, mut comm) in endpoints.into_iter().enumerate() {
            let ladder = ladder.clone();
            handles.push(thread::spawn(move || {
                let mut chains = if rank == 0 {
                    vec![chain_at(0, 1.0, 0.1, -20.0)]
                } else {
                    vec![chain_at(1, 4.0, 0.9, -2.0)]
                };
                let mut rng = SmallRng::seed_from_u64(rank as u64);
                // (1 - 0.25) * (-2 - -20) = 13.5 > 0: always accepted.
                swap_round(&mut chains, &ladder, &mut comm, &mut rng, 1, None).unwrap();
                chains.remove(0)
            }));
        }

        let cold = handles.remove(0).join().unwrap();
        let hot = handles.remove(0).join().unwrap();
        assert_relative_eq!(cold.params.get(0), 0.9);
        assert_relative_eq!(cold.log_likelihood, -2.0);
        assert_relative_eq!(cold.temperature, 1.0);
        assert_relative_eq!(hot.params.get(0), 0.1);
        assert_relative_eq!(hot.log_likelihood, -20.0);
        assert_relative_eq!(hot.temperature, 4.0);
    }

    #[test]
    fn mismatched_snapshots_abort_both_sides() {
        let ladder = Ladder::new(vec![1.0, 4.0], 1).unwrap();
        let endpoints = ChannelCommunicator::mesh(2);

        let mut handles = Vec::new();
        for (rank, mut comm) in endpoints.into_iter().enumerate() {
            let ladder = ladder.clone();
            handles.push(thread::spawn(move || {
                let mut chains = if rank == 0 {
                    vec![chain_at(0, 1.0, 0.1, -20.0)]
                } else {
                    // A second varying dimension the cold rank lacks.
                    let schema = Arc::new(
                        ParameterSchema::new()
                            .with("x", VaryType::Varying)
                            .with("y", VaryType::Varying),
                    );
                    let params = ParameterVector::from_values(schema, &[0.9, 0.4]);
                    let mut chain = ChainState::new(1, 4.0, params, 1);
                    chain.log_likelihood = -2.0;
                    chain.log_prior = 0.0;
                    vec![chain]
                };
                let mut rng = SmallRng::seed_from_u64(rank as u64);
                swap_round(&mut chains, &ladder, &mut comm, &mut rng, 1, None)
            }));
        }

        for handle in handles {
            assert!(handle.join().unwrap().is_err());
        }
    }
}
