use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;

use super::{check_positive, common_shape, scalar_param, Distribution};
use crate::ops::{align, sample_shape, standard_normal, HALF_LN_2PI};

/// N(loc, scale²)
#[derive(Clone, Debug)]
pub struct Normal {
    loc: Tensor,
    scale: Tensor,
}

impl Normal {
    pub fn new(loc: f64, scale: f64, device: &Device) -> Result<Self> {
        check_positive("normal scale", scale)?;
        Self::from_tensors(scalar_param(loc, device)?, scalar_param(scale, device)?)
    }

    /// Elementwise normals; the parameter shape becomes the batch shape
    pub fn from_tensors(loc: Tensor, scale: Tensor) -> Result<Self> {
        common_shape(&[&loc, &scale])?;
        Ok(Self { loc, scale })
    }

    pub fn loc(&self) -> &Tensor {
        &self.loc
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }
}

impl Distribution for Normal {
    fn batch_shape(&self) -> Vec<usize> {
        self.loc.dims().to_vec()
    }

    fn event_shape(&self) -> Vec<usize> {
        vec![]
    }

    fn device(&self) -> &Device {
        self.loc.device()
    }

    fn dtype(&self) -> DType {
        self.loc.dtype()
    }

    /// loc + scale * ε
    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor> {
        let shape = sample_shape(num_samples, self.loc.dims());
        let eps = standard_normal(rng, &shape, self.device(), self.dtype())?;
        eps.broadcast_mul(&self.scale)?.broadcast_add(&self.loc)
    }

    /// -0.5 ((x - μ)/σ)² - ln σ - 0.5 ln 2π
    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let loc = align(&self.loc, value)?;
        let scale = align(&self.scale, value)?;
        let z = value.broadcast_sub(&loc)?.broadcast_div(&scale)?;
        let log_norm = (scale.log()? + HALF_LN_2PI)?;
        (z.sqr()? * -0.5)?.broadcast_sub(&log_norm)
    }
}

/// exp(X) with X ~ N(loc, scale²)
#[derive(Clone, Debug)]
pub struct LogNormal {
    normal: Normal,
}

impl LogNormal {
    pub fn new(loc: f64, scale: f64, device: &Device) -> Result<Self> {
        Ok(Self {
            normal: Normal::new(loc, scale, device)?,
        })
    }

    pub fn from_tensors(loc: Tensor, scale: Tensor) -> Result<Self> {
        Ok(Self {
            normal: Normal::from_tensors(loc, scale)?,
        })
    }
}

impl Distribution for LogNormal {
    fn batch_shape(&self) -> Vec<usize> {
        self.normal.batch_shape()
    }

    fn event_shape(&self) -> Vec<usize> {
        vec![]
    }

    fn device(&self) -> &Device {
        self.normal.device()
    }

    fn dtype(&self) -> DType {
        self.normal.dtype()
    }

    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor> {
        self.normal.sample(num_samples, rng)?.exp()
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let ln_x = value.log()?;
        self.normal.log_prob(&ln_x)? - ln_x
    }
}

/// |X| with X ~ N(0, scale²)
#[derive(Clone, Debug)]
pub struct HalfNormal {
    scale: Tensor,
}

impl HalfNormal {
    pub fn new(scale: f64, device: &Device) -> Result<Self> {
        check_positive("half-normal scale", scale)?;
        Ok(Self {
            scale: scalar_param(scale, device)?,
        })
    }

    pub fn from_tensor(scale: Tensor) -> Self {
        Self { scale }
    }
}

impl Distribution for HalfNormal {
    fn batch_shape(&self) -> Vec<usize> {
        self.scale.dims().to_vec()
    }

    fn event_shape(&self) -> Vec<usize> {
        vec![]
    }

    fn device(&self) -> &Device {
        self.scale.device()
    }

    fn dtype(&self) -> DType {
        self.scale.dtype()
    }

    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor> {
        let shape = sample_shape(num_samples, self.scale.dims());
        let eps = standard_normal(rng, &shape, self.device(), self.dtype())?;
        eps.abs()?.broadcast_mul(&self.scale)
    }

    /// 0.5 ln(2/π) - ln σ - x² / (2σ²), for x ≥ 0
    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let scale = align(&self.scale, value)?;
        let z = value.broadcast_div(&scale)?;
        let log_norm = (scale.log()? + (HALF_LN_2PI - std::f64::consts::LN_2))?;
        (z.sqr()? * -0.5)?.broadcast_sub(&log_norm)
    }
}
