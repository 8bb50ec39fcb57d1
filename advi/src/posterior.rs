use std::sync::Arc;

use candle_core::Tensor;

use crate::distributions::MultivariateNormal;
use crate::error::{AdviError, Result};
use crate::reparam::{transform_tree, ApproxNormalPrior, BijectorMap};
use crate::seed::split_seed;
use crate::tree::{ParamTree, TreeSpec};

/// Fitted approximate posterior.
///
/// The surrogate lives in the flat unconstrained space; `transform` and
/// `sample_constrained` map draws back onto the model's parameter supports.
/// Nothing here is attached to the autodiff graph.
pub struct Posterior {
    surrogate: Box<dyn MultivariateNormal>,
    prior: Arc<ApproxNormalPrior>,
    bijector: BijectorMap,
    unravel: TreeSpec,
}

impl Posterior {
    pub fn new(
        surrogate: Box<dyn MultivariateNormal>,
        prior: Arc<ApproxNormalPrior>,
        bijector: BijectorMap,
        unravel: TreeSpec,
    ) -> Self {
        Self {
            surrogate,
            prior,
            bijector,
            unravel,
        }
    }

    pub fn surrogate(&self) -> &dyn MultivariateNormal {
        self.surrogate.as_ref()
    }

    /// Length of the flat latent vector
    pub fn dim(&self) -> usize {
        self.unravel.dim()
    }

    /// Unconstrained draws `(n, D)`; the same `(n, seed)` always gives the
    /// same draws
    pub fn sample(&self, num_samples: usize, seed: u64) -> Result<Tensor> {
        if num_samples == 0 {
            return Err(AdviError::InvalidArgument("num_samples must be positive".into()));
        }
        Ok(self.surrogate.sample_seeded(&split_seed(seed, num_samples))?)
    }

    /// Surrogate log density of flat draws `(..., D)`
    pub fn log_prob(&self, z: &Tensor) -> Result<Tensor> {
        Ok(self.surrogate.log_prob(z)?)
    }

    pub fn mean(&self) -> Tensor {
        self.surrogate.loc().clone()
    }

    pub fn covariance(&self) -> Result<Tensor> {
        Ok(self.surrogate.covariance()?)
    }

    /// Split flat draws into unconstrained leaves
    pub fn unravel(&self, z: &Tensor) -> Result<ParamTree> {
        self.unravel.unravel(z)
    }

    /// Flat unconstrained draws → constrained parameter tree
    pub fn transform(&self, z: &Tensor) -> Result<ParamTree> {
        transform_tree(&self.unravel.unravel(z)?, &self.bijector)
    }

    pub fn sample_constrained(&self, num_samples: usize, seed: u64) -> Result<ParamTree> {
        self.transform(&self.sample(num_samples, seed)?)
    }

    /// The prior in unconstrained space
    pub fn prior(&self) -> &ApproxNormalPrior {
        &self.prior
    }

    pub fn bijector(&self) -> &BijectorMap {
        &self.bijector
    }

    pub fn tree_spec(&self) -> &TreeSpec {
        &self.unravel
    }
}
