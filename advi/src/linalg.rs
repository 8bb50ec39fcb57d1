//! Small dense linear algebra built from candle ops, so that gradients flow
//! through factorizations of the surrogate covariance.
//!
//! Loops run over one matrix dimension and each step is a vectorized tensor op;
//! this is meant for the modest latent dimensions of a variational surrogate.

use candle_core::{Result, Tensor, D};

/// Number of entries in a `dim × dim` lower triangle
pub fn tril_len(dim: usize) -> usize {
    dim * (dim + 1) / 2
}

/// Position of the lower-triangular entry `(i, j)`, `j <= i`, in row-major
/// packed order: (0,0), (1,0), (1,1), (2,0), ...
pub fn packed_position(i: usize, j: usize) -> usize {
    i * (i + 1) / 2 + j
}

/// Flat `i * dim + j` offsets of the lower triangle in packed order
pub fn tril_indices(dim: usize) -> Vec<u32> {
    (0..dim)
        .flat_map(|i| (0..=i).map(move |j| (i * dim + j) as u32))
        .collect()
}

/// For every entry of a `dim × dim` matrix, the packed position it is filled
/// from; upper entries point one past the packed vector (a zero pad).
pub fn fill_indices(dim: usize) -> Vec<u32> {
    let pad = tril_len(dim) as u32;
    (0..dim)
        .flat_map(|i| {
            (0..dim).map(move |j| {
                if j <= i {
                    packed_position(i, j) as u32
                } else {
                    pad
                }
            })
        })
        .collect()
}

/// Packed positions of the diagonal entries
pub fn diag_positions(dim: usize) -> Vec<u32> {
    (0..dim).map(|i| packed_position(i, i) as u32).collect()
}

/// Diagonal of the trailing two dims
pub fn diag_part(a: &Tensor) -> Result<Tensor> {
    let n = a.dim(D::Minus1)?;
    let eye = Tensor::eye(n, a.dtype(), a.device())?;
    a.broadcast_mul(&eye)?.sum(D::Minus1)
}

/// Lower-triangular `L` with `L Lᵀ = a` for a symmetric positive definite
/// `n × n` matrix, built column by column.
pub fn cholesky(a: &Tensor) -> Result<Tensor> {
    let (n, m) = a.dims2()?;
    if n != m {
        candle_core::bail!("cholesky needs a square matrix, got {} x {}", n, m);
    }
    let mut cols: Vec<Tensor> = Vec::with_capacity(n);
    for j in 0..n {
        // v = a[:, j] - Σ_{k<j} L[:, k] L[j, k]
        let mut v = a.narrow(1, j, 1)?.squeeze(1)?;
        for col in cols.iter() {
            let l_jk = col.narrow(0, j, 1)?;
            v = (v - col.broadcast_mul(&l_jk)?)?;
        }
        let pivot = v.narrow(0, j, 1)?.sqrt()?;
        let below: Vec<f64> = (0..n).map(|i| if i >= j { 1.0 } else { 0.0 }).collect();
        let mask = Tensor::from_vec(below, n, &candle_core::Device::Cpu)?
            .to_dtype(a.dtype())?
            .to_device(a.device())?;
        cols.push((v.broadcast_div(&pivot)? * mask)?);
    }
    Tensor::stack(&cols, 1)
}

/// Solve `L x = b` for every row `b` of `b_mn` with a lower-triangular
/// `n × n` matrix `l`, by forward substitution.
///
/// * `l` - lower-triangular matrix (n, n)
/// * `b_mn` - right-hand sides, one per row (m, n)
///
/// Returns `x` (m, n)
pub fn solve_lower_triangular(l: &Tensor, b_mn: &Tensor) -> Result<Tensor> {
    let n = l.dim(0)?;
    if b_mn.dim(1)? != n {
        candle_core::bail!("triangular solve: {:?} against {:?}", b_mn.dims(), l.dims());
    }
    let mut cols: Vec<Tensor> = Vec::with_capacity(n);
    for i in 0..n {
        let b_i = b_mn.narrow(1, i, 1)?;
        let acc = if i == 0 {
            b_i
        } else {
            let x_prev = Tensor::cat(&cols, 1)?;
            let l_row = l.narrow(0, i, 1)?.narrow(1, 0, i)?;
            (b_i - x_prev.broadcast_mul(&l_row)?.sum_keepdim(1)?)?
        };
        let l_ii = l.narrow(0, i, 1)?.narrow(1, i, 1)?;
        cols.push(acc.broadcast_div(&l_ii)?);
    }
    Tensor::cat(&cols, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};

    #[test]
    fn index_maps() {
        assert_eq!(tril_len(3), 6);
        assert_eq!(tril_indices(3), vec![0, 3, 4, 6, 7, 8]);
        assert_eq!(fill_indices(2), vec![0, 3, 1, 2]);
        assert_eq!(diag_positions(3), vec![0, 2, 5]);
    }

    #[test]
    fn cholesky_reconstructs() -> Result<()> {
        let a = Tensor::new(&[[4.0f64, 2.0, 0.4], [2.0, 5.0, 1.0], [0.4, 1.0, 3.0]], &Device::Cpu)?;
        let l = cholesky(&a)?;
        let back = l.matmul(&l.t()?)?.to_vec2::<f64>()?;
        let want = a.to_vec2::<f64>()?;
        for i in 0..3 {
            for j in 0..3 {
                assert!((back[i][j] - want[i][j]).abs() < 1e-10);
            }
        }
        let l = l.to_vec2::<f64>()?;
        assert_eq!(l[0][1], 0.0);
        assert_eq!(l[1][2], 0.0);
        assert!((l[0][0] - 2.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn forward_substitution() -> Result<()> {
        let l = Tensor::new(
            &[[2.0f64, 0.0, 0.0], [1.0, 3.0, 0.0], [-1.0, 0.5, 1.5]],
            &Device::Cpu,
        )?;
        let x = Tensor::new(&[[1.0f64, -2.0, 0.5], [0.0, 1.0, 2.0]], &Device::Cpu)?;
        // b = x Lᵀ, row by row
        let b = x.matmul(&l.t()?)?;
        let solved = solve_lower_triangular(&l, &b)?.to_vec2::<f64>()?;
        let want = x.to_vec2::<f64>()?;
        for r in 0..2 {
            for c in 0..3 {
                assert!((solved[r][c] - want[r][c]).abs() < 1e-10);
            }
        }
        Ok(())
    }

    #[test]
    fn gradients_flow_through_cholesky() -> Result<()> {
        let w = Var::from_tensor(&Tensor::new(&[[1.0f32, 0.3], [0.3, 2.0]], &Device::Cpu)?)?;
        let l = cholesky(w.as_tensor())?;
        let logdet = diag_part(&l)?.log()?.sum_all()?;
        let grads = logdet.backward()?;
        assert!(grads.get(w.as_tensor()).is_some());
        assert_eq!(diag_part(&Tensor::eye(3, DType::F32, &Device::Cpu)?)?.dims(), &[3]);
        Ok(())
    }
}
