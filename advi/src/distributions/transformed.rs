use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;

use super::Distribution;
use crate::bijectors::Bijector;

/// Distribution of `Y = bijector.forward(X)` with `X ~ base`
///
/// log p(y) = log p_X(f⁻¹(y)) + log |det ∂f⁻¹/∂y|
///
/// Only shape-preserving bijectors are supported here, so batch and event
/// shapes are those of `base`.
#[derive(Clone)]
pub struct TransformedDistribution {
    base: Arc<dyn Distribution>,
    bijector: Arc<dyn Bijector>,
}

impl TransformedDistribution {
    pub fn new(base: Arc<dyn Distribution>, bijector: Arc<dyn Bijector>) -> Self {
        Self { base, bijector }
    }

    pub fn base(&self) -> &Arc<dyn Distribution> {
        &self.base
    }

    pub fn bijector(&self) -> &Arc<dyn Bijector> {
        &self.bijector
    }
}

impl Distribution for TransformedDistribution {
    fn batch_shape(&self) -> Vec<usize> {
        self.base.batch_shape()
    }

    fn event_shape(&self) -> Vec<usize> {
        self.base.event_shape()
    }

    fn device(&self) -> &Device {
        self.base.device()
    }

    fn dtype(&self) -> DType {
        self.base.dtype()
    }

    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor> {
        self.bijector.forward(&self.base.sample(num_samples, rng)?)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let event_ndims = self.base.event_shape().len();
        let x = self.bijector.inverse(value)?;
        let ildj = self.bijector.inverse_log_det_jacobian(value, event_ndims)?;
        self.base.log_prob(&x)? + ildj
    }
}
