//! The physical-model seam.
//!
//! The sampler never computes a likelihood itself. A [`Model`] describes
//! the parameter space and hands out per-chain [`Density`] evaluators;
//! everything behind those calls (templates, matched filters, data
//! conditioning) is the caller's business.

use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use thiserror::Error;

use crate::params::{ParameterSchema, ParameterVector};

#[derive(Error, Debug)]
pub enum DensityError {
    /// The likelihood could not be evaluated. This always aborts the run:
    /// a broken model cannot be sampled around.
    #[error("log-likelihood evaluation failed")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// One detector's metadata, echoed into every output-file header.
#[derive(Debug, Clone)]
pub struct Detector {
    pub name: String,
    pub snr: f64,
    pub null_log_likelihood: f64,
    pub f_low: f64,
    pub f_high: f64,
    pub sample_start: f64,
    pub sample_length: f64,
    pub sample_rate: f64,
}

/// Per-chain density evaluator.
///
/// One instance is created per chain, so implementations may keep
/// scratch buffers and cache per-detector results of the last
/// [`log_likelihood`](Density::log_likelihood) call without locking.
pub trait Density {
    /// Log prior density at `params`. `-inf` marks an impossible point;
    /// the sampler then skips the likelihood evaluation entirely.
    fn log_prior(&mut self, params: &ParameterVector) -> f64;

    /// Log likelihood at `params`. Only called when the prior is finite.
    fn log_likelihood(&mut self, params: &ParameterVector) -> Result<f64, DensityError>;

    /// Per-detector log likelihoods of the last evaluation, if the model
    /// decomposes over detectors. Must align with [`Model::detectors`].
    fn detector_log_likelihoods(&self) -> &[f64] {
        &[]
    }

    /// Per-detector and network SNR of the last evaluation.
    fn snr(&self) -> Option<(&[f64], f64)> {
        None
    }
}

/// A sampleable model: parameter schema, initial points, and a density
/// evaluator per chain.
pub trait Model: Send + Sync {
    type Density<'model>: Density + Send
    where
        Self: 'model;

    /// Create a density evaluator. Called once per chain.
    fn density(&self) -> Result<Self::Density<'_>>;

    /// The named dimensions of this model, shared by every chain.
    fn schema(&self) -> Arc<ParameterSchema>;

    /// Draw a starting point. May be called repeatedly until a point
    /// with finite prior and likelihood is found.
    fn init_position<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        position: &mut ParameterVector,
    ) -> Result<()>;

    /// The likelihood of the data under the noise-only hypothesis,
    /// subtracted from every reported log likelihood.
    fn null_log_likelihood(&self) -> f64 {
        0.0
    }

    fn detectors(&self) -> Vec<Detector> {
        Vec::new()
    }
}
