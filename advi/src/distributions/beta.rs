use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand_distr::Distribution as RandDistribution;
use special::Gamma as SpecialGamma;

use super::{check_positive, common_shape, scalar_param, Distribution};
use crate::ops::{align, host_tensor, host_values, sample_shape, sampler_error};

/// Beta(α, β) on (0, 1)
#[derive(Clone, Debug)]
pub struct Beta {
    alpha: Tensor,
    beta: Tensor,
    /// lnΓ(α + β) - lnΓ(α) - lnΓ(β)
    log_norm: Tensor,
}

impl Beta {
    pub fn new(alpha: f64, beta: f64, device: &Device) -> Result<Self> {
        check_positive("beta alpha", alpha)?;
        check_positive("beta beta", beta)?;
        Self::from_tensors(scalar_param(alpha, device)?, scalar_param(beta, device)?)
    }

    pub fn from_tensors(alpha: Tensor, beta: Tensor) -> Result<Self> {
        let shape = common_shape(&[&alpha, &beta])?;
        let a = host_values(&alpha)?;
        let b = host_values(&beta)?;
        let log_norm: Vec<f64> = a
            .iter()
            .zip(b.iter())
            .map(|(&a, &b)| {
                SpecialGamma::ln_gamma(a + b).0
                    - SpecialGamma::ln_gamma(a).0
                    - SpecialGamma::ln_gamma(b).0
            })
            .collect();
        let log_norm = host_tensor(log_norm, &shape, alpha.device(), alpha.dtype())?;
        Ok(Self {
            alpha,
            beta,
            log_norm,
        })
    }
}

impl Distribution for Beta {
    fn batch_shape(&self) -> Vec<usize> {
        self.alpha.dims().to_vec()
    }

    fn event_shape(&self) -> Vec<usize> {
        vec![]
    }

    fn device(&self) -> &Device {
        self.alpha.device()
    }

    fn dtype(&self) -> DType {
        self.alpha.dtype()
    }

    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor> {
        let a = host_values(&self.alpha)?;
        let b = host_values(&self.beta)?;
        let samplers = a
            .iter()
            .zip(b.iter())
            .map(|(&a, &b)| rand_distr::Beta::new(a, b).map_err(sampler_error))
            .collect::<Result<Vec<_>>>()?;
        let mut values = Vec::with_capacity(num_samples * samplers.len());
        for _ in 0..num_samples {
            values.extend(samplers.iter().map(|s| s.sample(rng)));
        }
        let shape = sample_shape(num_samples, self.alpha.dims());
        host_tensor(values, &shape, self.device(), self.dtype())
    }

    /// (α - 1) ln x + (β - 1) ln(1 - x) - ln B(α, β)
    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let alpha = align(&self.alpha, value)?;
        let beta = align(&self.beta, value)?;
        let log_norm = align(&self.log_norm, value)?;
        let ln_x = value.log()?.broadcast_mul(&(alpha - 1.0)?)?;
        let ln_1mx = value.affine(-1.0, 1.0)?.log()?.broadcast_mul(&(beta - 1.0)?)?;
        (ln_x + ln_1mx)?.broadcast_add(&log_norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn beta_log_prob() -> Result<()> {
        // Beta(2, 3) at 0.25: ln 12 + ln 0.25 + 2 ln 0.75
        let dist = Beta::new(2.0, 3.0, &Device::Cpu)?;
        let lp = dist.log_prob(&Tensor::new(&[0.25f32], &Device::Cpu)?)?.to_vec1::<f32>()?;
        let want = 12f64.ln() + 0.25f64.ln() + 2.0 * 0.75f64.ln();
        assert!((lp[0] as f64 - want).abs() < 1e-5);

        // uniform special case
        let flat = Beta::new(1.0, 1.0, &Device::Cpu)?;
        let lp = flat.log_prob(&Tensor::new(&[0.1f32, 0.9], &Device::Cpu)?)?.to_vec1::<f32>()?;
        assert!(lp.iter().all(|v| v.abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn beta_samples_in_unit_interval() -> Result<()> {
        let dist = Beta::new(0.5, 0.5, &Device::Cpu)?;
        let mut rng = StdRng::seed_from_u64(2);
        let draws = dist.sample(200, &mut rng)?.to_vec1::<f32>()?;
        assert!(draws.iter().all(|v| *v >= 0.0 && *v <= 1.0));
        Ok(())
    }
}
