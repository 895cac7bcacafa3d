//! Parallel-tempered Markov chain Monte Carlo.
//!
//! A ladder of chains at increasing temperatures explores a user
//! supplied posterior; adjacent rungs periodically exchange states so
//! the cold chain borrows mixing from the hot ones. The physical model
//! (log prior, log likelihood) and the jump kernels plug in through the
//! [`Model`], [`Density`] and [`Proposal`] traits; the engine supplies
//! the iteration loop, proposal-scale adaptation, convergence
//! monitoring, the distributed swap protocol and the output records.

pub(crate) mod adapt;
pub(crate) mod chain;
pub(crate) mod de_buffer;
pub(crate) mod ess;
pub(crate) mod ladder;
pub(crate) mod model;
pub(crate) mod params;
pub(crate) mod proposal;
pub(crate) mod sampler;
pub(crate) mod storage;
pub(crate) mod swap;
pub(crate) mod transport;

pub use adapt::{adaptation_envelope, AdaptOptions, AdaptationController};
pub use chain::{accepts, metropolis_step, ChainState};
pub use de_buffer::DiffEvolutionBuffer;
pub use ess::{effective_sample_size, integrated_autocorr_time};
pub use ladder::Ladder;
pub use model::{Density, DensityError, Detector, Model};
pub use params::{ParameterSchema, ParameterVector, VaryType};
pub use proposal::{
    AdaptiveGaussianProposal, DifferentialEvolutionProposal, Proposal, ProposalCycle,
    ProposalState,
};
pub use sampler::{
    sample, ChainProgress, ChainReport, ConfigError, ProgressCallback, PtSettings, RunReport,
};
pub use storage::{
    chain_output_path, resume_read, stat_path, swap_path, ChainWriter, RunInfo, StatWriter,
    SwapWriter,
};
pub use swap::{swap_log_ratio, swap_round};
pub use transport::{
    ChainSnapshot, ChannelCommunicator, Communicator, Message, SingleProcess, TransportError,
};
