//! The ADVI estimator: surrogate construction, initialization, the
//! reparameterized negative-ELBO loss and posterior materialization.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use log::{debug, log_enabled, trace, Level};

use crate::bijectors::Bijector;
use crate::distributions::MultivariateNormal;
use crate::error::{AdviError, Result};
use crate::family::{build_posterior, PosteriorParamsBijector, VariationalFamily, ViType};
use crate::ops::host_tensor;
use crate::params::{Initializer, Params};
use crate::posterior::Posterior;
use crate::reparam::{
    inverse_transform_dist, transform_tree, ApproxNormalPrior, BijectorMap, Prior,
};
use crate::seed::split_seed;
use crate::tree::{ParamTree, TreeSpec};

/// Construction options for [`Advi`]
#[derive(Clone)]
pub struct AdviConfig {
    pub vi_type: ViType,
    /// Number of covariance factors; required by, and only by, `LowRank`
    pub rank: Option<usize>,
    /// Replaces the family's default raw-parameter bijectors, positionally
    pub ordered_posterior_bijectors: Option<Vec<Arc<dyn Bijector>>>,
    pub dtype: DType,
    pub device: Device,
    /// Rank the likelihood output must have, when known
    pub likelihood_rank: Option<usize>,
}

impl Default for AdviConfig {
    fn default() -> Self {
        Self {
            vi_type: ViType::MeanField,
            rank: None,
            ordered_posterior_bijectors: None,
            dtype: DType::F32,
            device: Device::Cpu,
            likelihood_rank: None,
        }
    }
}

impl AdviConfig {
    pub fn mean_field() -> Self {
        Self::default()
    }

    pub fn full_rank() -> Self {
        Self {
            vi_type: ViType::FullRank,
            ..Self::default()
        }
    }

    pub fn low_rank(rank: usize) -> Self {
        Self {
            vi_type: ViType::LowRank,
            rank: Some(rank),
            ..Self::default()
        }
    }

    pub fn with_posterior_bijectors(mut self, bijectors: Vec<Arc<dyn Bijector>>) -> Self {
        self.ordered_posterior_bijectors = Some(bijectors);
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Reject likelihood outputs whose rank differs from `rank`, e.g. `2`
    /// for a per-draw, per-datum `(S, n)` result
    pub fn with_likelihood_rank(mut self, rank: usize) -> Self {
        self.likelihood_rank = Some(rank);
        self
    }
}

/// Log-likelihood of a data batch given constrained parameter draws.
///
/// # Arguments
/// * `tree` - constrained parameters, leaves `(S, *event_shape)`
/// * `aux` - user data passed through unchanged
/// * `batch` - data batch; axis 0 is the batch axis
/// * `params` - trainable state, for likelihoods with their own variables
///
/// # Returns
/// `(S,)` or `(S, ...)`; trailing dims are summed by the estimator.
///
/// Axis 0 must be the draw axis. A per-datum `(n,)` result with
/// `n == S` cannot be told apart from a per-draw one and is read as
/// per-draw; set [`AdviConfig::with_likelihood_rank`] to catch that.
pub trait LogLikelihood<A>: Send + Sync {
    fn log_likelihood(
        &self,
        tree: &ParamTree,
        aux: &A,
        batch: &Tensor,
        params: &Params,
    ) -> candle_core::Result<Tensor>;
}

impl<A, F> LogLikelihood<A> for F
where
    F: Fn(&ParamTree, &A, &Tensor, &Params) -> candle_core::Result<Tensor> + Send + Sync,
{
    fn log_likelihood(
        &self,
        tree: &ParamTree,
        aux: &A,
        batch: &Tensor,
        params: &Params,
    ) -> candle_core::Result<Tensor> {
        self(tree, aux, batch, params)
    }
}

/// Automatic differentiation variational inference for one model.
///
/// Holds the model (prior, bijectors, likelihood) and the surrogate family
/// fixed at construction. Trainable state lives in [`Params`]; the estimator
/// itself is immutable.
pub struct Advi<A = ()> {
    prior: Prior,
    bijector: BijectorMap,
    approx: Arc<ApproxNormalPrior>,
    family: Box<dyn VariationalFamily>,
    unravel: TreeSpec,
    params_bijector: PosteriorParamsBijector,
    log_likelihood: Box<dyn LogLikelihood<A>>,
    likelihood_rank: Option<usize>,
    dtype: DType,
    device: Device,
}

impl<A> Advi<A> {
    /// # Arguments
    /// * `prior` - parameter name → prior distribution (zero batch rank)
    /// * `bijector` - parameter name → bijector onto the prior's support
    /// * `log_likelihood` - see [`LogLikelihood`]
    /// * `config` - surrogate family and tensor placement
    pub fn new<L>(
        prior: Prior,
        bijector: BijectorMap,
        log_likelihood: L,
        config: AdviConfig,
    ) -> Result<Self>
    where
        L: LogLikelihood<A> + 'static,
    {
        let approx = inverse_transform_dist(&prior, &bijector)?;
        if prior.is_empty() {
            return Err(AdviError::InvalidArgument("the prior has no parameters".into()));
        }
        let build = build_posterior(
            config.vi_type,
            config.rank,
            &approx,
            config.ordered_posterior_bijectors,
        )?;

        debug!(
            "advi: {} parameters [{}] → {} latent dims, {} surrogate",
            prior.len(),
            prior.keys().cloned().collect::<Vec<_>>().join(", "),
            build.unravel.dim(),
            build.family.vi_type()
        );

        Ok(Self {
            prior,
            bijector,
            approx: Arc::new(approx),
            family: build.family,
            unravel: build.unravel,
            params_bijector: build.params_bijector,
            log_likelihood: Box::new(log_likelihood),
            likelihood_rank: config.likelihood_rank,
            dtype: config.dtype,
            device: config.device,
        })
    }

    /// Fresh trainable state; `seed` is split into one sub-seed per raw
    /// surrogate parameter.
    pub fn init(&self, seed: u64, initializer: &dyn Initializer) -> Result<Params> {
        let specs = self.family.raw_params();
        let seeds = split_seed(seed, specs.len());
        let mut values = Vec::with_capacity(specs.len());
        for (spec, s) in specs.iter().zip(seeds) {
            let init = initializer.initialize(s, &spec.raw_shape);
            let expected: usize = spec.raw_shape.iter().product();
            if init.len() != expected {
                return Err(AdviError::InvalidArgument(format!(
                    "initializer gave {} values for '{}' of shape {:?}",
                    init.len(),
                    spec.name,
                    spec.raw_shape
                )));
            }
            let value = host_tensor(init, &spec.raw_shape, &self.device, self.dtype)?;
            values.push((spec.name, value));
        }
        let params = Params::from_posterior(values, self.dtype, &self.device)?;
        debug!("advi: initialized {:?}", params.posterior_names());
        Ok(params)
    }

    /// Monte-Carlo negative ELBO per datum, averaged over `n_samples` draws.
    ///
    /// The returned scalar is differentiable with respect to every variable
    /// in `params`; the same `(params, batch, seed, n_samples)` always give
    /// the same value.
    ///
    /// # Arguments
    /// * `params` - trainable state from [`Advi::init`]
    /// * `batch` - data batch; `batch.dim(0)` is the batch size
    /// * `aux` - passed through to the likelihood
    /// * `data_size` - number of data points in the full data set
    /// * `seed` - randomness for this evaluation
    /// * `n_samples` - number of Monte-Carlo draws S
    pub fn loss_fn(
        &self,
        params: &Params,
        batch: &Tensor,
        aux: &A,
        data_size: usize,
        seed: u64,
        n_samples: usize,
    ) -> Result<Tensor> {
        let per_sample = self.per_sample_loss(params, batch, aux, data_size, seed, n_samples)?;
        let loss = per_sample.mean(0)?;

        if log_enabled!(Level::Trace) {
            trace!(
                "advi: loss {:.6} over {} draws, batch {} of {}",
                loss.to_dtype(DType::F64)?.to_scalar::<f64>()?,
                n_samples,
                batch.dim(0)?,
                data_size
            );
        }
        Ok(loss)
    }

    /// Detached ELBO estimate for the full data set, `-loss · data_size`
    pub fn elbo(
        &self,
        params: &Params,
        batch: &Tensor,
        aux: &A,
        data_size: usize,
        seed: u64,
        n_samples: usize,
    ) -> Result<f64> {
        let loss = self
            .loss_fn(params, batch, aux, data_size, seed, n_samples)?
            .detach()
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;
        Ok(-loss * data_size as f64)
    }

    fn per_sample_loss(
        &self,
        params: &Params,
        batch: &Tensor,
        aux: &A,
        data_size: usize,
        seed: u64,
        n_samples: usize,
    ) -> Result<Tensor> {
        if n_samples == 0 {
            return Err(AdviError::InvalidArgument("n_samples must be positive".into()));
        }
        if data_size == 0 {
            return Err(AdviError::InvalidArgument("data_size must be positive".into()));
        }
        let batch_size = match batch.dims().first() {
            Some(&n) if n > 0 => n,
            _ => {
                return Err(AdviError::InvalidArgument(format!(
                    "batch of shape {:?} has no data along axis 0",
                    batch.dims()
                )))
            }
        };

        let surrogate = self.surrogate(&params.posterior())?;
        let z = surrogate.sample_seeded(&split_seed(seed, n_samples))?;
        let q_log_prob = surrogate.log_prob(&z)?;

        let tree = self.unravel.unravel(&z)?;
        let p_log_prob = self.approx.log_prob(&tree)?;

        let constrained = transform_tree(&tree, &self.bijector)?;
        let llik = self
            .log_likelihood
            .log_likelihood(&constrained, aux, batch, params)?;
        let llik = reduce_log_likelihood(llik, n_samples, self.likelihood_rank)?
            .to_dtype(z.dtype())?;
        let llik_scaled = ((llik / batch_size as f64)? * data_size as f64)?;

        let per_sample = ((q_log_prob - p_log_prob)? - llik_scaled)?;
        Ok((per_sample / data_size as f64)?)
    }

    /// Realize the surrogate from raw parameters
    fn surrogate(&self, raw: &[Tensor]) -> Result<Box<dyn MultivariateNormal>> {
        let specs = self.family.raw_params();
        if raw.len() != specs.len() {
            return Err(AdviError::ShapeMismatch(format!(
                "{} raw posterior parameters, {} expected",
                raw.len(),
                specs.len()
            )));
        }
        for (spec, x) in specs.iter().zip(raw.iter()) {
            if x.dims() != spec.raw_shape.as_slice() {
                return Err(AdviError::ShapeMismatch(format!(
                    "raw '{}' has shape {:?}, expected {:?}",
                    spec.name,
                    x.dims(),
                    spec.raw_shape
                )));
            }
        }
        let realized = self.params_bijector.forward(raw)?;
        Ok(self.family.realize(&realized)?)
    }

    /// Materialize the fitted posterior from the current parameters
    pub fn apply(&self, params: &Params) -> Result<Posterior> {
        let raw: Vec<Tensor> = params.posterior().iter().map(|t| t.detach()).collect();
        let surrogate = self.surrogate(&raw)?;
        Ok(Posterior::new(
            surrogate,
            self.approx.clone(),
            self.bijector.clone(),
            self.unravel.clone(),
        ))
    }

    pub fn prior(&self) -> &Prior {
        &self.prior
    }

    pub fn bijector(&self) -> &BijectorMap {
        &self.bijector
    }

    pub fn approx_prior(&self) -> &ApproxNormalPrior {
        &self.approx
    }

    pub fn family(&self) -> &dyn VariationalFamily {
        self.family.as_ref()
    }

    pub fn vi_type(&self) -> ViType {
        self.family.vi_type()
    }

    pub fn tree_spec(&self) -> &TreeSpec {
        &self.unravel
    }

    pub fn params_bijector(&self) -> &PosteriorParamsBijector {
        &self.params_bijector
    }

    /// Length of the flat latent vector
    pub fn dim(&self) -> usize {
        self.unravel.dim()
    }
}

/// `(S,)` or `(S, ...)` → `(S,)`; a scalar is accepted for a single draw
fn reduce_log_likelihood(
    llik: Tensor,
    n_samples: usize,
    expected_rank: Option<usize>,
) -> Result<Tensor> {
    if let Some(rank) = expected_rank {
        if llik.rank() != rank {
            return Err(AdviError::ShapeMismatch(format!(
                "log-likelihood of shape {:?}, rank {} expected",
                llik.dims(),
                rank
            )));
        }
    }
    match llik.dims() {
        [] if n_samples == 1 => Ok(llik.reshape(1)?),
        [s, ..] if *s == n_samples => {
            if llik.rank() > 1 {
                Ok(llik.flatten_from(1)?.sum(1)?)
            } else {
                Ok(llik)
            }
        }
        dims => Err(AdviError::ShapeMismatch(format!(
            "log-likelihood of shape {:?} for {} draws",
            dims, n_samples
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bijectors::{Exp, Identity};
    use crate::distributions::{Gamma, Normal};
    use crate::params::{ConstantInitializer, NormalInitializer};

    fn advi(config: AdviConfig) -> Result<Advi> {
        let dev = Device::Cpu;
        let mut prior = Prior::new();
        prior.insert("mu".into(), Arc::new(Normal::new(0.0, 1.0, &dev)?));
        prior.insert("tau".into(), Arc::new(Gamma::new(2.0, 1.0, &dev)?));
        let mut bijector = BijectorMap::new();
        bijector.insert("mu".into(), Arc::new(Identity));
        bijector.insert("tau".into(), Arc::new(Exp));

        let llik = |tree: &ParamTree, _aux: &(), batch: &Tensor, _params: &Params| {
            // y ~ N(mu, 1/tau), summed over the batch
            let mu = tree["mu"].unsqueeze(1)?;
            let tau = tree["tau"].unsqueeze(1)?;
            let sq = batch.unsqueeze(0)?.broadcast_sub(&mu)?.sqr()?.broadcast_mul(&tau)?;
            let lp = ((tau.log()?.broadcast_sub(&sq)? * 0.5)? - crate::ops::HALF_LN_2PI)?;
            lp.sum(1)
        };
        Advi::new(prior, bijector, llik, config)
    }

    #[test]
    fn loss_is_a_deterministic_scalar() -> Result<()> {
        let model = advi(AdviConfig::default())?;
        let params = model.init(0, &NormalInitializer::default())?;
        let y = Tensor::new(&[0.5f32, -0.2, 1.1], &Device::Cpu)?;

        let a = model.loss_fn(&params, &y, &(), 10, 7, 4)?;
        assert!(a.dims().is_empty());
        let b = model.loss_fn(&params, &y, &(), 10, 7, 4)?;
        assert_eq!(a.to_scalar::<f32>()?, b.to_scalar::<f32>()?);
        let c = model.loss_fn(&params, &y, &(), 10, 8, 4)?;
        assert_ne!(a.to_scalar::<f32>()?, c.to_scalar::<f32>()?);

        let elbo = model.elbo(&params, &y, &(), 10, 7, 4)?;
        assert!((elbo + 10.0 * a.to_scalar::<f32>()? as f64).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn counts_must_be_positive() -> Result<()> {
        let model = advi(AdviConfig::default())?;
        let params = model.init(0, &ConstantInitializer(0.0))?;
        let y = Tensor::new(&[0.5f32], &Device::Cpu)?;
        let empty = Tensor::zeros(0, DType::F32, &Device::Cpu)?;
        for result in [
            model.loss_fn(&params, &y, &(), 1, 0, 0),
            model.loss_fn(&params, &y, &(), 0, 0, 1),
            model.loss_fn(&params, &empty, &(), 1, 0, 1),
        ] {
            assert!(matches!(result, Err(AdviError::InvalidArgument(_))));
        }
        Ok(())
    }

    #[test]
    fn init_splits_the_seed() -> Result<()> {
        let model = advi(AdviConfig::low_rank(1))?;
        let params = model.init(3, &NormalInitializer::new(0.0, 1.0))?;
        let raw = params.posterior();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw[2].dims(), &[2, 1]);
        // loc and scale_diag have the same shape but independent streams
        assert_ne!(raw[0].to_vec1::<f32>()?, raw[1].to_vec1::<f32>()?);

        let again = model.init(3, &NormalInitializer::new(0.0, 1.0))?;
        assert_eq!(raw[0].to_vec1::<f32>()?, again.posterior()[0].to_vec1::<f32>()?);

        let short = |_s: u64, _shape: &[usize]| -> Vec<f64> { vec![0.0] };
        assert!(matches!(model.init(0, &short), Err(AdviError::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn likelihood_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let per_datum = Tensor::ones((3, 4), DType::F32, &dev)?;
        let reduced = reduce_log_likelihood(per_datum.clone(), 3, None)?;
        assert_eq!(reduced.to_vec1::<f32>()?, vec![4.0; 3]);
        let scalar = Tensor::new(2.0f32, &dev)?;
        assert_eq!(reduce_log_likelihood(scalar.clone(), 1, None)?.dims(), &[1]);
        assert!(reduce_log_likelihood(scalar, 2, None).is_err());
        assert!(reduce_log_likelihood(Tensor::ones(5, DType::F32, &dev)?, 3, None).is_err());

        // a declared rank catches a result missing its draw axis
        let no_draw_axis = Tensor::ones(3, DType::F32, &dev)?;
        assert_eq!(reduce_log_likelihood(no_draw_axis.clone(), 3, None)?.dims(), &[3]);
        assert!(matches!(
            reduce_log_likelihood(no_draw_axis, 3, Some(2)),
            Err(AdviError::ShapeMismatch(_))
        ));
        assert_eq!(reduce_log_likelihood(per_datum, 3, Some(2))?.dims(), &[3]);
        Ok(())
    }

    #[test]
    fn declared_likelihood_rank_is_enforced() -> Result<()> {
        // the test model sums over the batch, so its output is (S,)
        let y = Tensor::new(&[0.5f32, -0.2, 1.1], &Device::Cpu)?;
        let strict = advi(AdviConfig::default().with_likelihood_rank(2))?;
        let params = strict.init(0, &ConstantInitializer(0.0))?;
        let result = strict.loss_fn(&params, &y, &(), 3, 0, 3);
        assert!(matches!(result, Err(AdviError::ShapeMismatch(_))));

        let matching = advi(AdviConfig::default().with_likelihood_rank(1))?;
        assert!(matching.loss_fn(&params, &y, &(), 3, 0, 3).is_ok());
        Ok(())
    }

    #[test]
    fn foreign_params_are_rejected() -> Result<()> {
        let mean_field = advi(AdviConfig::default())?;
        let full_rank = advi(AdviConfig::full_rank())?;
        let params = full_rank.init(0, &ConstantInitializer(0.0))?;
        assert!(matches!(mean_field.apply(&params), Err(AdviError::ShapeMismatch(_))));
        Ok(())
    }
}
