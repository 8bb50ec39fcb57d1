//! Multivariate normal surrogates over a flat latent vector of length `D`.
//!
//! Draws use the reparameterization `z = loc + A ε` with ε drawn from a
//! seeded host RNG, so `z` stays a differentiable function of the parameters.

use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;

use super::Distribution;
use crate::linalg::{cholesky, diag_part, solve_lower_triangular};
use crate::ops::{standard_normal, HALF_LN_2PI};

pub trait MultivariateNormal: Distribution {
    /// Mean vector (D)
    fn loc(&self) -> &Tensor;

    /// Dense covariance (D, D)
    fn covariance(&self) -> Result<Tensor>;

    fn dim(&self) -> usize {
        self.loc().dims()[0]
    }
}

/// Flatten `(..., D)` to `(N, D)`, remembering the leading dims
fn flatten_leading(value: &Tensor, dim: usize) -> Result<(Tensor, Vec<usize>)> {
    let dims = value.dims();
    if dims.last() != Some(&dim) {
        candle_core::bail!("expected trailing dimension {}, got shape {:?}", dim, dims);
    }
    let lead = dims[..dims.len() - 1].to_vec();
    let n: usize = lead.iter().product();
    Ok((value.reshape((n, dim))?, lead))
}

/// -0.5 (mahalanobis + D ln 2π) - half_logdet, reshaped to the leading dims
fn gaussian_log_prob(
    mahalanobis_n: &Tensor,
    half_logdet: &Tensor,
    dim: usize,
    lead: &[usize],
) -> Result<Tensor> {
    let lp = mahalanobis_n
        .affine(-0.5, -(dim as f64) * HALF_LN_2PI)?
        .broadcast_sub(half_logdet)?;
    lp.reshape(lead.to_vec())
}

fn check_loc(loc: &Tensor) -> Result<usize> {
    match loc.dims() {
        [d] => Ok(*d),
        dims => candle_core::bail!(
            "multivariate normal loc must be a vector, got shape {:?}",
            dims
        ),
    }
}

/// N(loc, diag(scale_diag²))
#[derive(Clone, Debug)]
pub struct MultivariateNormalDiag {
    loc: Tensor,
    scale_diag: Tensor,
}

impl MultivariateNormalDiag {
    pub fn new(loc: Tensor, scale_diag: Tensor) -> Result<Self> {
        let d = check_loc(&loc)?;
        if scale_diag.dims() != [d] {
            candle_core::bail!("scale_diag {:?} does not match loc ({})", scale_diag.dims(), d);
        }
        Ok(Self { loc, scale_diag })
    }

    pub fn scale_diag(&self) -> &Tensor {
        &self.scale_diag
    }
}

impl Distribution for MultivariateNormalDiag {
    fn batch_shape(&self) -> Vec<usize> {
        vec![]
    }

    fn event_shape(&self) -> Vec<usize> {
        self.loc.dims().to_vec()
    }

    fn device(&self) -> &Device {
        self.loc.device()
    }

    fn dtype(&self) -> DType {
        self.loc.dtype()
    }

    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor> {
        let eps = standard_normal(rng, &[num_samples, self.dim()], self.device(), self.dtype())?;
        eps.broadcast_mul(&self.scale_diag)?.broadcast_add(&self.loc)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let (value_nd, lead) = flatten_leading(value, self.dim())?;
        let z_nd = value_nd.broadcast_sub(&self.loc)?.broadcast_div(&self.scale_diag)?;
        let mahalanobis_n = z_nd.sqr()?.sum(1)?;
        let half_logdet = self.scale_diag.log()?.sum_keepdim(0)?;
        gaussian_log_prob(&mahalanobis_n, &half_logdet, self.dim(), &lead)
    }
}

impl MultivariateNormal for MultivariateNormalDiag {
    fn loc(&self) -> &Tensor {
        &self.loc
    }

    fn covariance(&self) -> Result<Tensor> {
        let eye = Tensor::eye(self.dim(), self.dtype(), self.device())?;
        eye.broadcast_mul(&self.scale_diag.sqr()?)
    }
}

/// N(loc, L Lᵀ) with a lower-triangular `scale_tril` L
#[derive(Clone, Debug)]
pub struct MultivariateNormalTriL {
    loc: Tensor,
    scale_tril: Tensor,
}

impl MultivariateNormalTriL {
    pub fn new(loc: Tensor, scale_tril: Tensor) -> Result<Self> {
        let d = check_loc(&loc)?;
        if scale_tril.dims() != [d, d] {
            candle_core::bail!("scale_tril {:?} does not match loc ({})", scale_tril.dims(), d);
        }
        Ok(Self { loc, scale_tril })
    }

    pub fn scale_tril(&self) -> &Tensor {
        &self.scale_tril
    }
}

impl Distribution for MultivariateNormalTriL {
    fn batch_shape(&self) -> Vec<usize> {
        vec![]
    }

    fn event_shape(&self) -> Vec<usize> {
        self.loc.dims().to_vec()
    }

    fn device(&self) -> &Device {
        self.loc.device()
    }

    fn dtype(&self) -> DType {
        self.loc.dtype()
    }

    /// loc + ε Lᵀ
    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor> {
        let shape = [num_samples, self.dim()];
        let eps = standard_normal(rng, &shape, self.device(), self.dtype())?;
        eps.matmul(&self.scale_tril.t()?.contiguous()?)?
            .broadcast_add(&self.loc)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let (value_nd, lead) = flatten_leading(value, self.dim())?;
        let diff_nd = value_nd.broadcast_sub(&self.loc)?;
        let white_nd = solve_lower_triangular(&self.scale_tril, &diff_nd)?;
        let mahalanobis_n = white_nd.sqr()?.sum(1)?;
        let half_logdet = diag_part(&self.scale_tril)?.abs()?.log()?.sum_keepdim(0)?;
        gaussian_log_prob(&mahalanobis_n, &half_logdet, self.dim(), &lead)
    }
}

impl MultivariateNormal for MultivariateNormalTriL {
    fn loc(&self) -> &Tensor {
        &self.loc
    }

    fn covariance(&self) -> Result<Tensor> {
        self.scale_tril.matmul(&self.scale_tril.t()?.contiguous()?)
    }
}

/// N(loc, diag(scale_diag²) + W Wᵀ) with a `(D, rank)` perturbation factor W
#[derive(Clone, Debug)]
pub struct MultivariateNormalDiagPlusLowRank {
    loc: Tensor,
    scale_diag: Tensor,
    cov_perturb_factor: Tensor,
}

impl MultivariateNormalDiagPlusLowRank {
    pub fn new(loc: Tensor, scale_diag: Tensor, cov_perturb_factor: Tensor) -> Result<Self> {
        let d = check_loc(&loc)?;
        if scale_diag.dims() != [d] {
            candle_core::bail!("scale_diag {:?} does not match loc ({})", scale_diag.dims(), d);
        }
        match cov_perturb_factor.dims() {
            [rows, _] if *rows == d => {}
            dims => candle_core::bail!("cov_perturb_factor {:?} does not match loc ({})", dims, d),
        }
        Ok(Self {
            loc,
            scale_diag,
            cov_perturb_factor,
        })
    }

    pub fn rank(&self) -> usize {
        self.cov_perturb_factor.dims()[1]
    }

    pub fn scale_diag(&self) -> &Tensor {
        &self.scale_diag
    }

    pub fn cov_perturb_factor(&self) -> &Tensor {
        &self.cov_perturb_factor
    }
}

impl Distribution for MultivariateNormalDiagPlusLowRank {
    fn batch_shape(&self) -> Vec<usize> {
        vec![]
    }

    fn event_shape(&self) -> Vec<usize> {
        self.loc.dims().to_vec()
    }

    fn device(&self) -> &Device {
        self.loc.device()
    }

    fn dtype(&self) -> DType {
        self.loc.dtype()
    }

    /// loc + scale_diag ⊙ ε₁ + ε₂ Wᵀ
    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor> {
        let (d, r) = (self.dim(), self.rank());
        let eps = standard_normal(rng, &[num_samples, d + r], self.device(), self.dtype())?;
        let diag_part = eps.narrow(1, 0, d)?.broadcast_mul(&self.scale_diag)?;
        let low_rank_part = eps
            .narrow(1, d, r)?
            .contiguous()?
            .matmul(&self.cov_perturb_factor.t()?.contiguous()?)?;
        (diag_part + low_rank_part)?.broadcast_add(&self.loc)
    }

    /// Woodbury identity with capacitance C = I + Wᵀ D⁻¹ W:
    ///
    /// xᵀ Σ⁻¹ x = xᵀ D⁻¹ x - |L_C⁻¹ Wᵀ D⁻¹ x|²
    /// ln |Σ| = ln |D| + ln |C|
    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let (value_nd, lead) = flatten_leading(value, self.dim())?;
        let diff_nd = value_nd.broadcast_sub(&self.loc)?;
        let inv_var_d = self.scale_diag.sqr()?.recip()?;
        let w_dr = &self.cov_perturb_factor;

        let scaled_nd = diff_nd.broadcast_mul(&inv_var_d)?;
        let diag_term_n = (&scaled_nd * &diff_nd)?.sum(1)?;

        let eye_r = Tensor::eye(self.rank(), self.dtype(), self.device())?;
        let scaled_w_rd = w_dr
            .broadcast_mul(&inv_var_d.unsqueeze(1)?)?
            .t()?
            .contiguous()?;
        let capacitance = (scaled_w_rd.matmul(w_dr)? + eye_r)?;
        let chol = cholesky(&capacitance)?;

        let proj_nr = scaled_nd.matmul(w_dr)?;
        let white_nr = solve_lower_triangular(&chol, &proj_nr)?;
        let mahalanobis_n = (diag_term_n - white_nr.sqr()?.sum(1)?)?;

        let half_logdet = (self.scale_diag.log()?.sum_keepdim(0)?
            + diag_part(&chol)?.log()?.sum_keepdim(0)?)?;
        gaussian_log_prob(&mahalanobis_n, &half_logdet, self.dim(), &lead)
    }
}

impl MultivariateNormal for MultivariateNormalDiagPlusLowRank {
    fn loc(&self) -> &Tensor {
        &self.loc
    }

    fn covariance(&self) -> Result<Tensor> {
        let eye = Tensor::eye(self.dim(), self.dtype(), self.device())?;
        let w = &self.cov_perturb_factor;
        eye.broadcast_mul(&self.scale_diag.sqr()?)? + w.matmul(&w.t()?.contiguous()?)?
    }
}
