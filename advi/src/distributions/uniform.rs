use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

use super::{common_shape, scalar_param, Distribution};
use crate::ops::{align, host_tensor, sample_shape};

/// Uniform(low, high)
#[derive(Clone, Debug)]
pub struct Uniform {
    low: Tensor,
    high: Tensor,
}

impl Uniform {
    pub fn new(low: f64, high: f64, device: &Device) -> Result<Self> {
        if low.is_nan() || high.is_nan() || low >= high {
            candle_core::bail!("uniform bounds must satisfy low < high, got ({}, {})", low, high);
        }
        Self::from_tensors(scalar_param(low, device)?, scalar_param(high, device)?)
    }

    pub fn from_tensors(low: Tensor, high: Tensor) -> Result<Self> {
        common_shape(&[&low, &high])?;
        Ok(Self { low, high })
    }
}

impl Distribution for Uniform {
    fn batch_shape(&self) -> Vec<usize> {
        self.low.dims().to_vec()
    }

    fn event_shape(&self) -> Vec<usize> {
        vec![]
    }

    fn device(&self) -> &Device {
        self.low.device()
    }

    fn dtype(&self) -> DType {
        self.low.dtype()
    }

    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor> {
        let shape = sample_shape(num_samples, self.low.dims());
        let n: usize = shape.iter().product();
        let u: Vec<f64> = (0..n).map(|_| rng.random::<f64>()).collect();
        let u = host_tensor(u, &shape, self.device(), self.dtype())?;
        let width = (&self.high - &self.low)?;
        u.broadcast_mul(&width)?.broadcast_add(&self.low)
    }

    /// -ln(high - low) on the support, -∞ outside
    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let low = align(&self.low, value)?.broadcast_as(value.shape())?;
        let high = align(&self.high, value)?.broadcast_as(value.shape())?;
        let inside = value.ge(&low)?.mul(&value.le(&high)?)?;
        let density = (&high - &low)?.log()?.neg()?;
        let outside = Tensor::full(f32::NEG_INFINITY, value.shape(), value.device())?
            .to_dtype(value.dtype())?;
        inside.where_cond(&density, &outside)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn uniform_density_and_support() -> Result<()> {
        let dist = Uniform::new(-1.0, 3.0, &Device::Cpu)?;
        let lp = dist
            .log_prob(&Tensor::new(&[0.0f32, 2.5, 4.0], &Device::Cpu)?)?
            .to_vec1::<f32>()?;
        assert!((lp[0] as f64 + 4f64.ln()).abs() < 1e-6);
        assert!((lp[1] as f64 + 4f64.ln()).abs() < 1e-6);
        assert!(lp[2].is_infinite() && lp[2] < 0.0);

        let mut rng = StdRng::seed_from_u64(9);
        let draws = dist.sample(100, &mut rng)?.to_vec1::<f32>()?;
        assert!(draws.iter().all(|v| *v >= -1.0 && *v < 3.0));
        Ok(())
    }
}
