//! The temperature ladder.
//!
//! One global, ordered list of temperatures shared by every process of
//! a run, with chain `i` pinned to rung `i` for the whole run. Ranks
//! own contiguous, equally-sized blocks of rungs.

use crate::sampler::ConfigError;

#[derive(Debug, Clone)]
pub struct Ladder {
    temperatures: Vec<f64>,
    chains_per_rank: usize,
}

impl Ladder {
    /// A ladder split into blocks of `chains_per_rank` consecutive
    /// rungs, one block per process.
    pub fn new(temperatures: Vec<f64>, chains_per_rank: usize) -> Result<Self, ConfigError> {
        if temperatures.is_empty() {
            return Err(ConfigError::EmptyLadder);
        }
        if chains_per_rank == 0 || temperatures.len() % chains_per_rank != 0 {
            return Err(ConfigError::UnevenLadder {
                n_temps: temperatures.len(),
                chains_per_rank,
            });
        }
        for pair in temperatures.windows(2) {
            if pair[1] < pair[0] {
                return Err(ConfigError::UnorderedLadder);
            }
        }
        if temperatures.iter().any(|&t| t <= 0.0 || !t.is_finite()) {
            return Err(ConfigError::NonPositiveTemperature);
        }
        Ok(Self {
            temperatures,
            chains_per_rank,
        })
    }

    /// A ladder owned entirely by one process.
    pub fn single_rank(temperatures: Vec<f64>) -> Result<Self, ConfigError> {
        let n = temperatures.len();
        Self::new(temperatures, n)
    }

    /// Geometrically spaced rungs from the target posterior (T = 1) up
    /// to `max_temperature`.
    pub fn geometric(n_temps: usize, max_temperature: f64) -> Vec<f64> {
        assert!(n_temps > 0);
        assert!(max_temperature >= 1.0);
        if n_temps == 1 {
            return vec![1.0];
        }
        (0..n_temps)
            .map(|i| {
                let frac = i as f64 / (n_temps - 1) as f64;
                max_temperature.powf(frac)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.temperatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.temperatures.is_empty()
    }

    pub fn chains_per_rank(&self) -> usize {
        self.chains_per_rank
    }

    pub fn n_ranks(&self) -> usize {
        self.temperatures.len() / self.chains_per_rank
    }

    pub fn temperature(&self, index: usize) -> f64 {
        self.temperatures[index]
    }

    pub fn temperatures(&self) -> &[f64] {
        &self.temperatures
    }

    /// The process owning rung `index`.
    pub fn rank_of(&self, index: usize) -> usize {
        index / self.chains_per_rank
    }

    /// Position of rung `index` within its owner's block.
    pub fn local_slot(&self, index: usize) -> usize {
        index % self.chains_per_rank
    }

    /// Global rung indices owned by `rank`.
    pub fn local_range(&self, rank: usize) -> std::ops::Range<usize> {
        let start = rank * self.chains_per_rank;
        start..start + self.chains_per_rank
    }
}
