use candle_core::{DType, Device, Result, Tensor, D};
use rand::rngs::StdRng;
use rand_distr::{Distribution as RandDistribution, StandardNormal};

pub const HALF_LN_2PI: f64 = 0.918_938_533_204_672_7;

/// softplus(x) = log(1 + exp(x)), computed as relu(x) + log1p(exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    x.relu()? + tail
}

/// Inverse of softplus for y > 0
///
/// x = y + log(1 - exp(-y))
pub fn softplus_inverse(y: &Tensor) -> Result<Tensor> {
    let tail = y.neg()?.exp()?.affine(-1.0, 1.0)?.log()?;
    y + tail
}

/// σ(x) = 1 / (1 + exp(-x))
pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    x.neg()?.exp()?.affine(1.0, 1.0)?.recip()
}

/// Sum out the last `n` dimensions
pub fn sum_trailing(x: &Tensor, n: usize) -> Result<Tensor> {
    if n > x.rank() {
        candle_core::bail!("cannot reduce {} trailing dims of a rank {} tensor", n, x.rank());
    }
    let mut out = x.clone();
    for _ in 0..n {
        out = out.sum(D::Minus1)?;
    }
    Ok(out)
}

/// Cast a parameter tensor to the dtype and device of `value`
pub fn align(param: &Tensor, value: &Tensor) -> Result<Tensor> {
    param.to_dtype(value.dtype())?.to_device(value.device())
}

/// Copy all elements to the host as f64 (row-major)
pub fn host_values(x: &Tensor) -> Result<Vec<f64>> {
    // Metal has no f64, so move to CPU before conversion
    x.to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()
}

/// Build a tensor from host f64 values
pub fn host_tensor(
    values: Vec<f64>,
    shape: &[usize],
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    Tensor::from_vec(values, shape.to_vec(), &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)
}

/// ε ~ N(0, I) drawn from `rng`
pub fn standard_normal(
    rng: &mut StdRng,
    shape: &[usize],
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    let values: Vec<f64> = (0..n).map(|_| StandardNormal.sample(rng)).collect();
    host_tensor(values, shape, device, dtype)
}

/// `[num_samples, *shape]`
pub fn sample_shape(num_samples: usize, shape: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(shape.len() + 1);
    out.push(num_samples);
    out.extend_from_slice(shape);
    out
}

pub(crate) fn sampler_error<E: std::fmt::Display>(err: E) -> candle_core::Error {
    candle_core::Error::Msg(format!("sampler: {}", err))
}
