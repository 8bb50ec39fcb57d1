use candle_core::{Result, Tensor, D};

use super::Bijector;
use crate::linalg::{diag_positions, diag_part, fill_indices, tril_indices, tril_len};
use crate::ops::{softplus, softplus_inverse, sum_trailing};

const DEFAULT_DIAG_SHIFT: f64 = 1e-5;

/// Packed vector `(..., D(D+1)/2)` → lower-triangular scale `(..., D, D)`
///
/// Entries fill the lower triangle in row-major order; the diagonal goes
/// through `softplus(x) + diag_shift` so that it is strictly positive.
#[derive(Clone, Copy, Debug)]
pub struct FillScaleTriL {
    dim: usize,
    diag_shift: f64,
}

impl FillScaleTriL {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            diag_shift: DEFAULT_DIAG_SHIFT,
        }
    }

    pub fn with_diag_shift(dim: usize, diag_shift: f64) -> Self {
        Self { dim, diag_shift }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn check_packed(&self, x: &Tensor) -> Result<()> {
        let m = x.dim(D::Minus1)?;
        if m != tril_len(self.dim) {
            candle_core::bail!(
                "fill_scale_tril({}) expects {} packed entries, got shape {:?}",
                self.dim,
                tril_len(self.dim),
                x.dims()
            );
        }
        Ok(())
    }

    fn index_tensor(&self, ids: Vec<u32>, x: &Tensor) -> Result<Tensor> {
        let n = ids.len();
        Tensor::from_vec(ids, n, x.device())
    }
}

impl Bijector for FillScaleTriL {
    fn name(&self) -> String {
        format!("fill_scale_tril({})", self.dim)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.check_packed(x)?;
        let d = self.dim;
        let last = x.rank() - 1;
        let lead = &x.dims()[..last];

        let mut pad_shape = lead.to_vec();
        pad_shape.push(1);
        let pad = Tensor::zeros(pad_shape, x.dtype(), x.device())?;
        let padded = Tensor::cat(&[x.clone(), pad], last)?;

        let mut mat_shape = lead.to_vec();
        mat_shape.extend([d, d]);
        let dense = padded
            .index_select(&self.index_tensor(fill_indices(d), x)?, last)?
            .reshape(mat_shape)?;

        let eye = Tensor::eye(d, x.dtype(), x.device())?;
        let off_diag = dense.broadcast_mul(&eye.affine(-1.0, 1.0)?)?;
        let diag = (softplus(&dense)? + self.diag_shift)?.broadcast_mul(&eye)?;
        off_diag + diag
    }

    fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        let d = self.dim;
        let dims = y.dims();
        if dims.len() < 2 || dims[dims.len() - 2..] != [d, d] {
            candle_core::bail!("fill_scale_tril({}) cannot invert shape {:?}", d, dims);
        }
        let lead = &dims[..dims.len() - 2];

        let eye = Tensor::eye(d, y.dtype(), y.device())?;
        let raw_diag = softplus_inverse(&(diag_part(y)? - self.diag_shift)?)?;
        let raw_diag = raw_diag.unsqueeze(raw_diag.rank())?.broadcast_mul(&eye)?;
        let dense = (y.broadcast_mul(&eye.affine(-1.0, 1.0)?)? + raw_diag)?;

        let mut flat_shape = lead.to_vec();
        flat_shape.push(d * d);
        let flat = dense.reshape(flat_shape)?;
        let last = flat.rank() - 1;
        flat.index_select(&self.index_tensor(tril_indices(d), y)?, last)
    }

    /// Σ_i log σ(x_ii): only the diagonal is transformed
    fn forward_log_det_jacobian(&self, x: &Tensor, event_ndims: usize) -> Result<Tensor> {
        self.check_packed(x)?;
        if event_ndims == 0 {
            candle_core::bail!(
                "fill_scale_tril has a vector event; event_ndims must be at least 1"
            );
        }
        let last = x.rank() - 1;
        let diag = x.index_select(&self.index_tensor(diag_positions(self.dim), x)?, last)?;
        let ldj = softplus(&diag.neg()?)?.neg()?.sum(D::Minus1)?;
        sum_trailing(&ldj, event_ndims - 1)
    }

    fn inverse_log_det_jacobian(&self, y: &Tensor, event_ndims: usize) -> Result<Tensor> {
        if event_ndims < 2 {
            candle_core::bail!(
                "fill_scale_tril has a matrix image; event_ndims must be at least 2"
            );
        }
        self.forward_log_det_jacobian(&self.inverse(y)?, event_ndims - 1)?
            .neg()
    }
}
