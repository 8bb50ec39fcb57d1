//! Variational families over the flat unconstrained latent vector.
//!
//! Each builder returns the same three things: a family that turns realized
//! parameters into a surrogate distribution, the flat layout used to unravel
//! surrogate draws, and the bijectors applied to the raw trainable parameters.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use log::debug;

use crate::bijectors::{Bijector, Exp, FillScaleTriL, Identity};
use crate::distributions::{
    MultivariateNormal, MultivariateNormalDiag, MultivariateNormalDiagPlusLowRank,
    MultivariateNormalTriL,
};
use crate::error::{AdviError, Result};
use crate::linalg::tril_len;
use crate::reparam::ApproxNormalPrior;
use crate::tree::TreeSpec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ViType {
    #[default]
    MeanField,
    FullRank,
    LowRank,
}

impl ViType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViType::MeanField => "mean_field",
            ViType::FullRank => "full_rank",
            ViType::LowRank => "low_rank",
        }
    }
}

impl fmt::Display for ViType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViType {
    type Err = AdviError;

    fn from_str(s: &str) -> Result<Self> {
        match s.replace('-', "_").as_str() {
            "mean_field" => Ok(ViType::MeanField),
            "full_rank" => Ok(ViType::FullRank),
            "low_rank" => Ok(ViType::LowRank),
            _ => Err(AdviError::InvalidArgument(format!("unknown vi_type '{}'", s))),
        }
    }
}

/// One raw trainable parameter of a family, before and after its bijector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawParamSpec {
    pub name: &'static str,
    pub raw_shape: Vec<usize>,
    pub realized_shape: Vec<usize>,
}

impl RawParamSpec {
    fn new(name: &'static str, raw_shape: Vec<usize>, realized_shape: Vec<usize>) -> Self {
        Self {
            name,
            raw_shape,
            realized_shape,
        }
    }
}

pub trait VariationalFamily: Send + Sync {
    fn vi_type(&self) -> ViType;

    /// Length of the flat latent vector
    fn dim(&self) -> usize;

    /// Raw parameters in canonical order
    fn raw_params(&self) -> Vec<RawParamSpec>;

    /// Bijectors applied to the raw parameters unless overridden
    fn default_bijectors(&self) -> Vec<Arc<dyn Bijector>>;

    /// Surrogate distribution from realized (post-bijector) parameters
    fn realize(&self, params: &[Tensor]) -> candle_core::Result<Box<dyn MultivariateNormal>>;
}

fn check_count(family: &dyn VariationalFamily, params: &[Tensor]) -> candle_core::Result<()> {
    let expected = family.raw_params().len();
    if params.len() != expected {
        candle_core::bail!(
            "{} takes {} parameters, got {}",
            family.vi_type(),
            expected,
            params.len()
        );
    }
    Ok(())
}

/// Diagonal covariance: `(loc, scale_diag)`
#[derive(Clone, Copy, Debug)]
pub struct MeanField {
    dim: usize,
}

impl VariationalFamily for MeanField {
    fn vi_type(&self) -> ViType {
        ViType::MeanField
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn raw_params(&self) -> Vec<RawParamSpec> {
        let d = self.dim;
        vec![
            RawParamSpec::new("loc", vec![d], vec![d]),
            RawParamSpec::new("scale_diag", vec![d], vec![d]),
        ]
    }

    fn default_bijectors(&self) -> Vec<Arc<dyn Bijector>> {
        vec![Arc::new(Identity), Arc::new(Exp)]
    }

    fn realize(&self, params: &[Tensor]) -> candle_core::Result<Box<dyn MultivariateNormal>> {
        check_count(self, params)?;
        let dist = MultivariateNormalDiag::new(params[0].clone(), params[1].clone())?;
        Ok(Box::new(dist))
    }
}

/// Dense covariance through a Cholesky factor: `(loc, scale_tril)`
#[derive(Clone, Copy, Debug)]
pub struct FullRank {
    dim: usize,
}

impl VariationalFamily for FullRank {
    fn vi_type(&self) -> ViType {
        ViType::FullRank
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn raw_params(&self) -> Vec<RawParamSpec> {
        let d = self.dim;
        vec![
            RawParamSpec::new("loc", vec![d], vec![d]),
            RawParamSpec::new("scale_tril", vec![tril_len(d)], vec![d, d]),
        ]
    }

    fn default_bijectors(&self) -> Vec<Arc<dyn Bijector>> {
        vec![Arc::new(Identity), Arc::new(FillScaleTriL::new(self.dim))]
    }

    fn realize(&self, params: &[Tensor]) -> candle_core::Result<Box<dyn MultivariateNormal>> {
        check_count(self, params)?;
        let dist = MultivariateNormalTriL::new(params[0].clone(), params[1].clone())?;
        Ok(Box::new(dist))
    }
}

/// Diagonal plus rank-`rank` covariance: `(loc, scale_diag, cov_perturb_factor)`
#[derive(Clone, Copy, Debug)]
pub struct LowRank {
    dim: usize,
    rank: usize,
}

impl LowRank {
    pub fn rank(&self) -> usize {
        self.rank
    }
}

impl VariationalFamily for LowRank {
    fn vi_type(&self) -> ViType {
        ViType::LowRank
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn raw_params(&self) -> Vec<RawParamSpec> {
        let (d, r) = (self.dim, self.rank);
        vec![
            RawParamSpec::new("loc", vec![d], vec![d]),
            RawParamSpec::new("scale_diag", vec![d], vec![d]),
            RawParamSpec::new("cov_perturb_factor", vec![d, r], vec![d, r]),
        ]
    }

    fn default_bijectors(&self) -> Vec<Arc<dyn Bijector>> {
        vec![Arc::new(Identity), Arc::new(Exp), Arc::new(Identity)]
    }

    fn realize(&self, params: &[Tensor]) -> candle_core::Result<Box<dyn MultivariateNormal>> {
        check_count(self, params)?;
        let dist = MultivariateNormalDiagPlusLowRank::new(
            params[0].clone(),
            params[1].clone(),
            params[2].clone(),
        )?;
        Ok(Box::new(dist))
    }
}

/// Bijectors for the raw surrogate parameters, in canonical parameter order
#[derive(Clone)]
pub struct PosteriorParamsBijector {
    bijectors: Vec<Arc<dyn Bijector>>,
}

impl PosteriorParamsBijector {
    pub fn new(bijectors: Vec<Arc<dyn Bijector>>) -> Self {
        Self { bijectors }
    }

    pub fn len(&self) -> usize {
        self.bijectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bijectors.is_empty()
    }

    pub fn bijectors(&self) -> &[Arc<dyn Bijector>] {
        &self.bijectors
    }

    /// raw → realized
    pub fn forward(&self, raw: &[Tensor]) -> Result<Vec<Tensor>> {
        self.check_len(raw.len())?;
        Ok(self
            .bijectors
            .iter()
            .zip(raw.iter())
            .map(|(b, x)| b.forward(x))
            .collect::<candle_core::Result<Vec<_>>>()?)
    }

    /// realized → raw
    pub fn inverse(&self, realized: &[Tensor]) -> Result<Vec<Tensor>> {
        self.check_len(realized.len())?;
        Ok(self
            .bijectors
            .iter()
            .zip(realized.iter())
            .map(|(b, y)| b.inverse(y))
            .collect::<candle_core::Result<Vec<_>>>()?)
    }

    fn check_len(&self, n: usize) -> Result<()> {
        if n != self.bijectors.len() {
            return Err(AdviError::BijectorArity(format!(
                "{} bijectors for {} parameters",
                self.bijectors.len(),
                n
            )));
        }
        Ok(())
    }
}

/// Output of a family builder
pub struct PosteriorBuild {
    pub family: Box<dyn VariationalFamily>,
    pub unravel: TreeSpec,
    pub params_bijector: PosteriorParamsBijector,
}

/// Each override must map its raw shape onto the realized shape
fn check_overrides(specs: &[RawParamSpec], bijectors: &[Arc<dyn Bijector>]) -> Result<()> {
    if specs.len() != bijectors.len() {
        return Err(AdviError::BijectorArity(format!(
            "expected {} bijectors ({}), got {}",
            specs.len(),
            specs.iter().map(|s| s.name).collect::<Vec<_>>().join(", "),
            bijectors.len()
        )));
    }
    for (spec, bij) in specs.iter().zip(bijectors.iter()) {
        let probe = Tensor::zeros(spec.raw_shape.clone(), DType::F32, &Device::Cpu)?;
        let image = bij.forward(&probe).map_err(|e| {
            AdviError::BijectorArity(format!("{} on '{}': {}", bij.name(), spec.name, e))
        })?;
        if image.dims() != spec.realized_shape.as_slice() {
            return Err(AdviError::BijectorArity(format!(
                "{} maps '{}' of shape {:?} to {:?}, expected {:?}",
                bij.name(),
                spec.name,
                spec.raw_shape,
                image.dims(),
                spec.realized_shape
            )));
        }
    }
    Ok(())
}

fn assemble(
    family: Box<dyn VariationalFamily>,
    prior: &ApproxNormalPrior,
    ordered_posterior_bijectors: Option<Vec<Arc<dyn Bijector>>>,
) -> Result<PosteriorBuild> {
    let bijectors = match ordered_posterior_bijectors {
        Some(bijectors) => {
            check_overrides(&family.raw_params(), &bijectors)?;
            bijectors
        }
        None => family.default_bijectors(),
    };
    debug!(
        "{} surrogate over {} latent dims: {}",
        family.vi_type(),
        family.dim(),
        family
            .raw_params()
            .iter()
            .zip(bijectors.iter())
            .map(|(s, b)| format!("{}{:?} <- {}", s.name, s.raw_shape, b.name()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(PosteriorBuild {
        family,
        unravel: TreeSpec::from_prior(prior),
        params_bijector: PosteriorParamsBijector::new(bijectors),
    })
}

fn latent_dim(prior: &ApproxNormalPrior) -> Result<usize> {
    match prior.tree_spec().dim() {
        0 => Err(AdviError::InvalidArgument("the prior has no latent dimensions".into())),
        d => Ok(d),
    }
}

pub fn build_mean_field(
    prior: &ApproxNormalPrior,
    ordered_posterior_bijectors: Option<Vec<Arc<dyn Bijector>>>,
) -> Result<PosteriorBuild> {
    let family = MeanField {
        dim: latent_dim(prior)?,
    };
    assemble(Box::new(family), prior, ordered_posterior_bijectors)
}

pub fn build_full_rank(
    prior: &ApproxNormalPrior,
    ordered_posterior_bijectors: Option<Vec<Arc<dyn Bijector>>>,
) -> Result<PosteriorBuild> {
    let family = FullRank {
        dim: latent_dim(prior)?,
    };
    assemble(Box::new(family), prior, ordered_posterior_bijectors)
}

pub fn build_low_rank(
    prior: &ApproxNormalPrior,
    rank: usize,
    ordered_posterior_bijectors: Option<Vec<Arc<dyn Bijector>>>,
) -> Result<PosteriorBuild> {
    if rank == 0 {
        return Err(AdviError::RankSpecification("rank must be a positive integer".into()));
    }
    let family = LowRank {
        dim: latent_dim(prior)?,
        rank,
    };
    assemble(Box::new(family), prior, ordered_posterior_bijectors)
}

/// Pick the builder for `vi_type`; `rank` must be given iff `vi_type` is low-rank
pub fn build_posterior(
    vi_type: ViType,
    rank: Option<usize>,
    prior: &ApproxNormalPrior,
    ordered_posterior_bijectors: Option<Vec<Arc<dyn Bijector>>>,
) -> Result<PosteriorBuild> {
    match (vi_type, rank) {
        (ViType::MeanField, None) => build_mean_field(prior, ordered_posterior_bijectors),
        (ViType::FullRank, None) => build_full_rank(prior, ordered_posterior_bijectors),
        (ViType::LowRank, Some(rank)) => build_low_rank(prior, rank, ordered_posterior_bijectors),
        (ViType::LowRank, None) => Err(AdviError::RankSpecification(
            "low_rank needs a rank".into(),
        )),
        (other, Some(rank)) => Err(AdviError::RankSpecification(format!(
            "rank {} given for {}; rank is only meaningful for low_rank",
            rank, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bijectors::Softplus;
    use crate::distributions::{Distribution, Normal};
    use crate::reparam::{inverse_transform_dist, BijectorMap, Prior};

    fn prior(n: usize) -> Result<ApproxNormalPrior> {
        let mut prior = Prior::new();
        let mut bijector = BijectorMap::new();
        for i in 0..n {
            prior.insert(format!("x{}", i), Arc::new(Normal::new(0.0, 1.0, &Device::Cpu)?));
            bijector.insert(format!("x{}", i), Arc::new(Identity));
        }
        inverse_transform_dist(&prior, &bijector)
    }

    #[test]
    fn raw_parameter_layouts() -> Result<()> {
        let p = prior(3)?;
        let mf = build_mean_field(&p, None)?;
        assert_eq!(mf.family.raw_params().len(), 2);
        assert_eq!(mf.unravel.dim(), 3);

        let fr = build_full_rank(&p, None)?;
        let specs = fr.family.raw_params();
        assert_eq!(specs[1].raw_shape, vec![6]);
        assert_eq!(specs[1].realized_shape, vec![3, 3]);

        let lr = build_low_rank(&p, 2, None)?;
        let specs = lr.family.raw_params();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[2].raw_shape, vec![3, 2]);
        Ok(())
    }

    #[test]
    fn rank_must_match_vi_type() -> Result<()> {
        let p = prior(2)?;
        assert!(build_posterior(ViType::LowRank, Some(1), &p, None).is_ok());
        for (vi, rank) in [
            (ViType::LowRank, None),
            (ViType::LowRank, Some(0)),
            (ViType::MeanField, Some(1)),
            (ViType::FullRank, Some(2)),
        ] {
            assert!(matches!(
                build_posterior(vi, rank, &p, None),
                Err(AdviError::RankSpecification(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn overrides_are_checked() -> Result<()> {
        let p = prior(2)?;
        let ok: Vec<Arc<dyn Bijector>> = vec![Arc::new(Identity), Arc::new(Softplus)];
        let build = build_mean_field(&p, Some(ok))?;
        assert_eq!(build.params_bijector.bijectors()[1].name(), "softplus");

        let too_few: Vec<Arc<dyn Bijector>> = vec![Arc::new(Identity)];
        assert!(matches!(build_mean_field(&p, Some(too_few)), Err(AdviError::BijectorArity(_))));

        // scale_tril needs a bijector onto a matrix
        let wrong_shape: Vec<Arc<dyn Bijector>> = vec![Arc::new(Identity), Arc::new(Exp)];
        assert!(matches!(build_full_rank(&p, Some(wrong_shape)), Err(AdviError::BijectorArity(_))));
        Ok(())
    }

    #[test]
    fn realized_surrogates() -> Result<()> {
        let p = prior(3)?;
        let lr = build_low_rank(&p, 1, None)?;
        let raw = vec![
            Tensor::zeros(3, DType::F32, &Device::Cpu)?,
            Tensor::zeros(3, DType::F32, &Device::Cpu)?,
            Tensor::ones((3, 1), DType::F32, &Device::Cpu)?,
        ];
        let realized = lr.params_bijector.forward(&raw)?;
        let q = lr.family.realize(&realized)?;
        assert_eq!(q.event_shape(), vec![3]);
        let cov = q.covariance()?.to_vec2::<f32>()?;
        assert!((cov[0][0] - 2.0).abs() < 1e-6);
        assert!((cov[0][1] - 1.0).abs() < 1e-6);

        let back = lr.params_bijector.inverse(&realized)?;
        assert_eq!(back[1].to_vec1::<f32>()?, vec![0.0, 0.0, 0.0]);
        assert!(lr.family.realize(&realized[..2]).is_err());
        Ok(())
    }

    #[test]
    fn vi_type_names() -> Result<()> {
        assert_eq!("mean_field".parse::<ViType>()?, ViType::MeanField);
        assert_eq!("full-rank".parse::<ViType>()?, ViType::FullRank);
        assert_eq!(ViType::LowRank.to_string(), "low_rank");
        assert!("dense".parse::<ViType>().is_err());
        Ok(())
    }
}
