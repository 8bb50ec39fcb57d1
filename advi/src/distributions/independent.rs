use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;

use super::Distribution;
use crate::ops::sum_trailing;

/// Reinterprets the last `reinterpreted_batch_ndims` batch dims of `base` as
/// event dims, so that `log_prob` sums over them.
#[derive(Clone)]
pub struct Independent {
    base: Arc<dyn Distribution>,
    reinterpreted_batch_ndims: usize,
}

impl Independent {
    pub fn new(base: Arc<dyn Distribution>, reinterpreted_batch_ndims: usize) -> Result<Self> {
        let batch_rank = base.batch_shape().len();
        if reinterpreted_batch_ndims > batch_rank {
            candle_core::bail!(
                "cannot reinterpret {} batch dims of a distribution with batch rank {}",
                reinterpreted_batch_ndims,
                batch_rank
            );
        }
        Ok(Self {
            base,
            reinterpreted_batch_ndims,
        })
    }

    /// All batch dims become event dims
    pub fn all(base: Arc<dyn Distribution>) -> Self {
        let reinterpreted_batch_ndims = base.batch_shape().len();
        Self {
            base,
            reinterpreted_batch_ndims,
        }
    }
}

impl Distribution for Independent {
    fn batch_shape(&self) -> Vec<usize> {
        let batch = self.base.batch_shape();
        batch[..batch.len() - self.reinterpreted_batch_ndims].to_vec()
    }

    fn event_shape(&self) -> Vec<usize> {
        let batch = self.base.batch_shape();
        let mut event = batch[batch.len() - self.reinterpreted_batch_ndims..].to_vec();
        event.extend(self.base.event_shape());
        event
    }

    fn device(&self) -> &Device {
        self.base.device()
    }

    fn dtype(&self) -> DType {
        self.base.dtype()
    }

    fn sample(&self, num_samples: usize, rng: &mut StdRng) -> Result<Tensor> {
        self.base.sample(num_samples, rng)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        sum_trailing(&self.base.log_prob(value)?, self.reinterpreted_batch_ndims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Normal;
    use rand::SeedableRng;

    #[test]
    fn batch_becomes_event() -> Result<()> {
        let loc = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        let scale = Tensor::ones((2, 3), DType::F32, &Device::Cpu)?;
        let base: Arc<dyn Distribution> = Arc::new(Normal::from_tensors(loc, scale)?);

        let one = Independent::new(base.clone(), 1)?;
        assert_eq!(one.batch_shape(), vec![2]);
        assert_eq!(one.event_shape(), vec![3]);

        let all = Independent::all(base.clone());
        assert!(all.batch_shape().is_empty());
        assert_eq!(all.event_shape(), vec![2, 3]);

        let mut rng = StdRng::seed_from_u64(0);
        let x = all.sample(4, &mut rng)?;
        assert_eq!(x.dims(), &[4, 2, 3]);
        let lp = all.log_prob(&x)?;
        assert_eq!(lp.dims(), &[4]);
        let by_hand = base.log_prob(&x)?.sum(2)?.sum(1)?;
        assert_eq!(lp.to_vec1::<f32>()?, by_hand.to_vec1::<f32>()?);

        assert!(Independent::new(base, 3).is_err());
        Ok(())
    }
}
