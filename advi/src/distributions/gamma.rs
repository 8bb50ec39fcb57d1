use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand_distr::Distribution as RandDistribution;
use special::Gamma as SpecialGamma;

use super::{check_positive, common_shape, scalar_param, Distribution};
use crate::ops::{align, host_tensor, host_values, sample_shape, sampler_error};

/// Gamma(concentration α, rate β), density ∝ x^(α-1) exp(-β x)
#[derive(Clone, Debug)]
pub struct Gamma {
    concentration: Tensor,
    rate: Tensor,
    /// α ln β - lnΓ(α)
    log_norm: Tensor,
}

impl Gamma {
    pub fn new(concentration: f64, rate: f64, device: &Device) -> Result<Self> {
        check_positive("gamma concentration", concentration)?;
        check_positive("gamma rate", rate)?;
        Self::from_tensors(scalar_param(concentration, device)?, scalar_param(rate, device)?)
    }

    pub fn from_tensors(concentration: Tensor, rate: Tensor) -> Result<Self> {
        let shape = common_shape(&[&concentration, &rate])?;
        let alpha = host_values(&concentration)?;
        let beta = host_values(&rate)?;
        let log_norm: Vec<f64> = alpha
            .iter()
            .zip(beta.iter())
            .map(|(&a, &b)| a * b.ln() - SpecialGamma::ln_gamma(a).0)
            .collect();
        let log_norm = host_tensor(
            log_norm,
            &shape,
            concentration.device(),
            concentration.dtype(),
        )?;
        Ok(Self {
            concentration,
            rate,
            log_norm,
        })
    }
}

impl Distribution for Gamma {
    fn batch_shape(&self) -> Vec<usize> {
        self.concentration.dims().to_vec()
    }

    fn event_shape(&self) -> Vec<usize> {
        vec![]
    }

    fn device(&self) -> &Device {
        self.concentration.device()
    }

    fn dtype(&self) -> DType {
        self.concentration.dtype()
    }

    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor> {
        let alpha = host_values(&self.concentration)?;
        let beta = host_values(&self.rate)?;
        let samplers = alpha
            .iter()
            .zip(beta.iter())
            .map(|(&a, &b)| rand_distr::Gamma::new(a, 1.0 / b).map_err(sampler_error))
            .collect::<Result<Vec<_>>>()?;
        let mut values = Vec::with_capacity(num_samples * samplers.len());
        for _ in 0..num_samples {
            values.extend(samplers.iter().map(|g| g.sample(rng)));
        }
        let shape = sample_shape(num_samples, self.concentration.dims());
        host_tensor(values, &shape, self.device(), self.dtype())
    }

    /// α ln β - lnΓ(α) + (α - 1) ln x - β x
    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let alpha = align(&self.concentration, value)?;
        let rate = align(&self.rate, value)?;
        let log_norm = align(&self.log_norm, value)?;
        value
            .log()?
            .broadcast_mul(&(alpha - 1.0)?)?
            .broadcast_sub(&value.broadcast_mul(&rate)?)?
            .broadcast_add(&log_norm)
    }
}

/// Exponential(rate λ), density λ exp(-λ x)
#[derive(Clone, Debug)]
pub struct Exponential {
    rate: Tensor,
}

impl Exponential {
    pub fn new(rate: f64, device: &Device) -> Result<Self> {
        check_positive("exponential rate", rate)?;
        Ok(Self {
            rate: scalar_param(rate, device)?,
        })
    }

    pub fn from_tensor(rate: Tensor) -> Self {
        Self { rate }
    }
}

impl Distribution for Exponential {
    fn batch_shape(&self) -> Vec<usize> {
        self.rate.dims().to_vec()
    }

    fn event_shape(&self) -> Vec<usize> {
        vec![]
    }

    fn device(&self) -> &Device {
        self.rate.device()
    }

    fn dtype(&self) -> DType {
        self.rate.dtype()
    }

    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor> {
        let samplers = host_values(&self.rate)?
            .into_iter()
            .map(|l| rand_distr::Exp::new(l).map_err(sampler_error))
            .collect::<Result<Vec<_>>>()?;
        let mut values = Vec::with_capacity(num_samples * samplers.len());
        for _ in 0..num_samples {
            values.extend(samplers.iter().map(|e| e.sample(rng)));
        }
        let shape = sample_shape(num_samples, self.rate.dims());
        host_tensor(values, &shape, self.device(), self.dtype())
    }

    /// ln λ - λ x
    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let rate = align(&self.rate, value)?;
        value.broadcast_mul(&rate)?.neg()?.broadcast_add(&rate.log()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn gamma_log_prob() -> Result<()> {
        // Gamma(2, 3) at x = 0.5: 2 ln 3 - lnΓ(2) + ln 0.5 - 1.5
        let dist = Gamma::new(2.0, 3.0, &Device::Cpu)?;
        let lp = dist.log_prob(&Tensor::new(&[0.5f32], &Device::Cpu)?)?.to_vec1::<f32>()?;
        let want = 2.0 * 3f64.ln() + 0.5f64.ln() - 1.5;
        assert!((lp[0] as f64 - want).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn gamma_sample_mean() -> Result<()> {
        let dist = Gamma::new(4.0, 2.0, &Device::Cpu)?;
        let mut rng = StdRng::seed_from_u64(11);
        let draws = dist.sample(4000, &mut rng)?;
        assert_eq!(draws.dims(), &[4000]);
        let mean = draws.mean_all()?.to_scalar::<f32>()?;
        assert!((mean - 2.0).abs() < 0.1, "mean {}", mean);
        Ok(())
    }

    #[test]
    fn exponential_log_prob_and_support() -> Result<()> {
        let dist = Exponential::new(2.0, &Device::Cpu)?;
        let lp = dist.log_prob(&Tensor::new(&[0.0f32, 1.0], &Device::Cpu)?)?.to_vec1::<f32>()?;
        assert!((lp[0] as f64 - 2f64.ln()).abs() < 1e-5);
        assert!((lp[1] as f64 - (2f64.ln() - 2.0)).abs() < 1e-5);

        let mut rng = StdRng::seed_from_u64(5);
        let draws = dist.sample(50, &mut rng)?.to_vec1::<f32>()?;
        assert!(draws.iter().all(|v| *v >= 0.0));
        assert!(Exponential::new(0.0, &Device::Cpu).is_err());
        Ok(())
    }
}
