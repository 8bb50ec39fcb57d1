//! Invertible, differentiable transforms between spaces.
//!
//! A bijector's `forward` maps unconstrained values onto the support of a
//! distribution (e.g. `Exp` onto the positive reals) and `inverse` maps them
//! back. Both directions are built from candle ops, so gradients flow through
//! either one.

mod elementwise;
mod fill_scale_tril;

use std::sync::Arc;

use candle_core::{Result, Tensor};

pub use elementwise::{Exp, Identity, Sigmoid, Softplus};
pub use fill_scale_tril::FillScaleTriL;

pub trait Bijector: Send + Sync {
    fn name(&self) -> String;

    /// y = f(x)
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// x = f⁻¹(y)
    fn inverse(&self, y: &Tensor) -> Result<Tensor>;

    /// log |det ∂f/∂x| at `x`, summed over the last `event_ndims` dims of `x`
    fn forward_log_det_jacobian(&self, x: &Tensor, event_ndims: usize) -> Result<Tensor>;

    /// log |det ∂f⁻¹/∂y| at `y`, summed over the last `event_ndims` dims of `y`
    fn inverse_log_det_jacobian(&self, y: &Tensor, event_ndims: usize) -> Result<Tensor> {
        self.forward_log_det_jacobian(&self.inverse(y)?, event_ndims)?
            .neg()
    }
}

/// Swaps the roles of `forward` and `inverse`.
///
/// The unconstrained surrogate of a prior is the pushforward of the prior
/// through the inverse of its bijector, i.e. through `Invert(bijector)`.
#[derive(Clone)]
pub struct Invert {
    inner: Arc<dyn Bijector>,
}

impl Invert {
    pub fn new(inner: Arc<dyn Bijector>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<dyn Bijector> {
        &self.inner
    }
}

impl Bijector for Invert {
    fn name(&self) -> String {
        format!("invert({})", self.inner.name())
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.inner.inverse(x)
    }

    fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        self.inner.forward(y)
    }

    fn forward_log_det_jacobian(&self, x: &Tensor, event_ndims: usize) -> Result<Tensor> {
        self.inner.inverse_log_det_jacobian(x, event_ndims)
    }

    fn inverse_log_det_jacobian(&self, y: &Tensor, event_ndims: usize) -> Result<Tensor> {
        self.inner.forward_log_det_jacobian(y, event_ndims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn invert_swaps_directions() -> Result<()> {
        let exp: Arc<dyn Bijector> = Arc::new(Exp);
        let log = Invert::new(exp.clone());
        let y = Tensor::new(&[0.5f64, 1.0, 3.0], &Device::Cpu)?;

        let x = log.forward(&y)?.to_vec1::<f64>()?;
        assert!((x[1] - 0.0).abs() < 1e-12);
        assert!((x[2] - 3f64.ln()).abs() < 1e-12);

        // d log(y)/dy = 1/y
        let ldj = log.forward_log_det_jacobian(&y, 0)?.to_vec1::<f64>()?;
        assert!((ldj[0] - 2f64.ln()).abs() < 1e-12);
        assert!((ldj[2] + 3f64.ln()).abs() < 1e-12);

        let ildj = log.inverse_log_det_jacobian(&y, 1)?.to_scalar::<f64>()?;
        assert!((ildj - 4.5).abs() < 1e-12);
        assert_eq!(log.name(), "invert(exp)");
        Ok(())
    }
}
