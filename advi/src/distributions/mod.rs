//! Distributions over candle tensors.
//!
//! Shapes follow one convention throughout: draws carry a leading sample axis,
//! so `sample(S, ..)` returns `(S, *batch_shape, *event_shape)` and `log_prob`
//! maps `(..., *batch_shape, *event_shape)` to `(..., *batch_shape)`.
//!
//! Univariate families keep their parameters as tensors whose shape is the
//! batch shape; wrap them in [`Independent`] to turn batch dims into event dims.

mod beta;
mod gamma;
mod independent;
mod multivariate;
mod normal;
mod transformed;
mod uniform;

use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

pub use beta::Beta;
pub use gamma::{Exponential, Gamma};
pub use independent::Independent;
pub use multivariate::{
    MultivariateNormal, MultivariateNormalDiag, MultivariateNormalDiagPlusLowRank,
    MultivariateNormalTriL,
};
pub use normal::{HalfNormal, LogNormal, Normal};
pub use transformed::TransformedDistribution;
pub use uniform::Uniform;

pub trait Distribution: Send + Sync {
    fn batch_shape(&self) -> Vec<usize>;

    fn event_shape(&self) -> Vec<usize>;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;

    /// Draw `num_samples` values, shape `(S, *batch_shape, *event_shape)`
    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor>;

    /// Log density, `(..., *batch_shape, *event_shape)` → `(..., *batch_shape)`
    fn log_prob(&self, value: &Tensor) -> Result<Tensor>;

    /// One draw per seed, stacked along the sample axis
    fn sample_seeded(&self, seeds: &[u64]) -> Result<Tensor> {
        if seeds.is_empty() {
            candle_core::bail!("sample_seeded needs at least one seed");
        }
        let draws = seeds
            .iter()
            .map(|&seed| {
                let mut rng = StdRng::seed_from_u64(seed);
                self.sample(1, &mut rng)
            })
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&draws, 0)
    }
}

/// Check that all parameter tensors share one shape; returns it
fn common_shape(params: &[&Tensor]) -> Result<Vec<usize>> {
    let shape = params[0].dims().to_vec();
    for p in params.iter().skip(1) {
        if p.dims() != shape.as_slice() {
            candle_core::bail!(
                "distribution parameters disagree in shape: {:?} vs {:?}",
                shape,
                p.dims()
            );
        }
    }
    Ok(shape)
}

/// Scalar parameter tensor (F32, zero batch rank)
fn scalar_param(value: f64, device: &Device) -> Result<Tensor> {
    Tensor::new(value as f32, device)
}

fn check_positive(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.0) {
        candle_core::bail!("{} must be positive and finite, got {}", name, value);
    }
    Ok(())
}
