use candle_core::{Result, Tensor};

use super::Bijector;
use crate::ops::{sigmoid, softplus, softplus_inverse, sum_trailing};

/// f(x) = x
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl Bijector for Identity {
    fn name(&self) -> String {
        "identity".into()
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.clone())
    }

    fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        Ok(y.clone())
    }

    fn forward_log_det_jacobian(&self, x: &Tensor, event_ndims: usize) -> Result<Tensor> {
        sum_trailing(&x.zeros_like()?, event_ndims)
    }
}

/// f(x) = exp(x), onto (0, ∞)
#[derive(Clone, Copy, Debug, Default)]
pub struct Exp;

impl Bijector for Exp {
    fn name(&self) -> String {
        "exp".into()
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.exp()
    }

    fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        y.log()
    }

    fn forward_log_det_jacobian(&self, x: &Tensor, event_ndims: usize) -> Result<Tensor> {
        sum_trailing(x, event_ndims)
    }
}

/// f(x) = log(1 + exp(x)), onto (0, ∞)
#[derive(Clone, Copy, Debug, Default)]
pub struct Softplus;

impl Bijector for Softplus {
    fn name(&self) -> String {
        "softplus".into()
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        softplus(x)
    }

    fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        softplus_inverse(y)
    }

    /// log σ(x) = -softplus(-x)
    fn forward_log_det_jacobian(&self, x: &Tensor, event_ndims: usize) -> Result<Tensor> {
        sum_trailing(&softplus(&x.neg()?)?.neg()?, event_ndims)
    }
}

/// f(x) = low + (high - low) σ(x), onto (low, high)
#[derive(Clone, Copy, Debug)]
pub struct Sigmoid {
    low: f64,
    high: f64,
}

impl Default for Sigmoid {
    fn default() -> Self {
        Self { low: 0.0, high: 1.0 }
    }
}

impl Sigmoid {
    pub fn new(low: f64, high: f64) -> Result<Self> {
        if low.is_nan() || high.is_nan() || low >= high {
            candle_core::bail!("sigmoid bounds must satisfy low < high, got ({}, {})", low, high);
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }
}

impl Bijector for Sigmoid {
    fn name(&self) -> String {
        format!("sigmoid({}, {})", self.low, self.high)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        sigmoid(x)?.affine(self.high - self.low, self.low)
    }

    /// x = log(p) - log(1 - p) where p = (y - low) / (high - low)
    fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        let width = self.high - self.low;
        let p = y.affine(1.0 / width, -self.low / width)?;
        p.log()? - p.affine(-1.0, 1.0)?.log()?
    }

    /// log(high - low) + log σ(x) + log σ(-x)
    fn forward_log_det_jacobian(&self, x: &Tensor, event_ndims: usize) -> Result<Tensor> {
        let ln_width = (self.high - self.low).ln();
        let ldj = (softplus(x)? + softplus(&x.neg()?)?)?.affine(-1.0, ln_width)?;
        sum_trailing(&ldj, event_ndims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn check_round_trip(bij: &dyn Bijector, xs: &[f64]) -> Result<()> {
        let x = Tensor::new(xs, &Device::Cpu)?;
        let back = bij.inverse(&bij.forward(&x)?)?.to_vec1::<f64>()?;
        for (a, b) in xs.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-8, "{}: {} vs {}", bij.name(), a, b);
        }
        Ok(())
    }

    /// compare against a central finite difference of forward
    fn check_log_det(bij: &dyn Bijector, xs: &[f64]) -> Result<()> {
        let h = 1e-5;
        let x = Tensor::new(xs, &Device::Cpu)?;
        let ldj = bij.forward_log_det_jacobian(&x, 0)?.to_vec1::<f64>()?;
        let hi = bij.forward(&x.affine(1.0, h)?)?.to_vec1::<f64>()?;
        let lo = bij.forward(&x.affine(1.0, -h)?)?.to_vec1::<f64>()?;
        for i in 0..xs.len() {
            let numeric = ((hi[i] - lo[i]) / (2.0 * h)).abs().ln();
            assert!(
                (numeric - ldj[i]).abs() < 1e-5,
                "{} at {}: {} vs {}",
                bij.name(),
                xs[i],
                numeric,
                ldj[i]
            );
        }
        Ok(())
    }

    #[test]
    fn round_trips() -> Result<()> {
        let xs = [-3.0, -0.7, 0.0, 0.2, 2.5];
        check_round_trip(&Identity, &xs)?;
        check_round_trip(&Exp, &xs)?;
        check_round_trip(&Softplus, &xs)?;
        check_round_trip(&Sigmoid::default(), &xs)?;
        check_round_trip(&Sigmoid::new(-2.0, 5.0)?, &xs)?;
        Ok(())
    }

    #[test]
    fn log_det_jacobians() -> Result<()> {
        let xs = [-2.0, -0.4, 0.0, 0.9, 1.7];
        check_log_det(&Exp, &xs)?;
        check_log_det(&Softplus, &xs)?;
        check_log_det(&Sigmoid::default(), &xs)?;
        check_log_det(&Sigmoid::new(1.0, 4.0)?, &xs)?;

        let x = Tensor::new(&[[1.0f64, 2.0], [3.0, 4.0]], &Device::Cpu)?;
        let ldj = Identity.forward_log_det_jacobian(&x, 1)?;
        assert_eq!(ldj.to_vec1::<f64>()?, vec![0.0, 0.0]);
        let ldj = Exp.forward_log_det_jacobian(&x, 2)?;
        assert_eq!(ldj.to_scalar::<f64>()?, 10.0);
        Ok(())
    }

    #[test]
    fn sigmoid_stays_in_bounds() -> Result<()> {
        let bij = Sigmoid::new(-1.0, 3.0)?;
        let y = bij.forward(&Tensor::new(&[-10.0f64, 0.0, 10.0], &Device::Cpu)?)?;
        let y = y.to_vec1::<f64>()?;
        assert!(y.iter().all(|v| *v > -1.0 && *v < 3.0));
        assert!((y[1] - 1.0).abs() < 1e-12);
        assert!(Sigmoid::new(2.0, 2.0).is_err());
        Ok(())
    }
}
