//! Moving priors between constrained model space and unconstrained space.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::bijectors::{Bijector, Invert};
use crate::distributions::{Distribution, TransformedDistribution};
use crate::error::{AdviError, Result};
use crate::seed::split_seed;
use crate::tree::{ParamTree, TreeSpec};

/// Parameter name → prior distribution in model space
pub type Prior = BTreeMap<String, Arc<dyn Distribution>>;

/// Parameter name → bijector from unconstrained space onto the prior's support
pub type BijectorMap = BTreeMap<String, Arc<dyn Bijector>>;

/// The prior re-expressed in unconstrained space: for every key, the law of
/// `bijector⁻¹(X)` with `X ~ prior`.
#[derive(Clone)]
pub struct ApproxNormalPrior {
    dists: BTreeMap<String, TransformedDistribution>,
    spec: TreeSpec,
}

impl ApproxNormalPrior {
    pub fn get(&self, key: &str) -> Option<&TransformedDistribution> {
        self.dists.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TransformedDistribution)> {
        self.dists.iter()
    }

    pub fn len(&self) -> usize {
        self.dists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dists.is_empty()
    }

    /// Flat layout of the unconstrained parameters
    pub fn tree_spec(&self) -> &TreeSpec {
        &self.spec
    }

    /// Σ_k log q_k(tree[k]), shape `(S,)` for leaves `(S, *event)`
    pub fn log_prob(&self, tree: &ParamTree) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for (key, dist) in self.dists.iter() {
            let leaf = tree.get(key).ok_or_else(|| {
                AdviError::ShapeMismatch(format!("tree has no leaf for '{}'", key))
            })?;
            let lp = dist.log_prob(leaf)?;
            total = Some(match total {
                Some(acc) => acc.broadcast_add(&lp)?,
                None => lp,
            });
        }
        total.ok_or_else(|| AdviError::InvalidArgument("empty prior".into()))
    }

    /// Unconstrained draws, one independent stream per key
    pub fn sample(&self, num_samples: usize, seed: u64) -> Result<ParamTree> {
        let seeds = split_seed(seed, self.dists.len());
        let mut tree = ParamTree::new();
        for ((key, dist), s) in self.dists.iter().zip(seeds) {
            let mut rng = StdRng::seed_from_u64(s);
            tree.insert(key.clone(), dist.sample(num_samples, &mut rng)?);
        }
        Ok(tree)
    }
}

/// Fails unless `prior` and `bijector` share exactly the same keys
pub fn check_keys(prior: &Prior, bijector: &BijectorMap) -> Result<()> {
    let p: BTreeSet<&String> = prior.keys().collect();
    let b: BTreeSet<&String> = bijector.keys().collect();
    if p == b {
        return Ok(());
    }
    Err(AdviError::KeyMismatch {
        only_prior: p.difference(&b).map(|k| k.to_string()).collect(),
        only_bijector: b.difference(&p).map(|k| k.to_string()).collect(),
    })
}

/// Fails when the batch rank summed over all prior leaves is non-zero
pub fn check_zero_batch(prior: &Prior) -> Result<()> {
    let batched: Vec<(String, usize)> = prior
        .iter()
        .map(|(k, d)| (k.clone(), d.batch_shape().len()))
        .filter(|(_, rank)| *rank > 0)
        .collect();
    let batch_rank: usize = batched.iter().map(|(_, r)| r).sum();
    if batch_rank == 0 {
        return Ok(());
    }
    Err(AdviError::ZeroBatchViolation {
        batch_rank,
        keys: batched.into_iter().map(|(k, _)| k).collect(),
    })
}

/// Push every prior through the inverse of its bijector
pub fn inverse_transform_dist(prior: &Prior, bijector: &BijectorMap) -> Result<ApproxNormalPrior> {
    check_keys(prior, bijector)?;
    check_zero_batch(prior)?;

    let dists: BTreeMap<String, TransformedDistribution> = prior
        .iter()
        .map(|(key, dist)| {
            let inverse: Arc<dyn Bijector> = Arc::new(Invert::new(bijector[key].clone()));
            (key.clone(), TransformedDistribution::new(dist.clone(), inverse))
        })
        .collect();

    let spec = TreeSpec::new(
        dists
            .iter()
            .map(|(k, d)| (k.clone(), d.event_shape()))
            .collect(),
    );
    Ok(ApproxNormalPrior { dists, spec })
}

fn map_tree<F>(tree: &ParamTree, bijector: &BijectorMap, f: F) -> Result<ParamTree>
where
    F: Fn(&dyn Bijector, &Tensor) -> candle_core::Result<Tensor>,
{
    let mut out = ParamTree::new();
    for (key, leaf) in tree.iter() {
        let bij = bijector.get(key).ok_or_else(|| AdviError::KeyMismatch {
            only_prior: vec![key.clone()],
            only_bijector: vec![],
        })?;
        out.insert(key.clone(), f(bij.as_ref(), leaf)?);
    }
    Ok(out)
}

/// Unconstrained → constrained, leaf by leaf
pub fn transform_tree(tree: &ParamTree, bijector: &BijectorMap) -> Result<ParamTree> {
    map_tree(tree, bijector, |b, x| b.forward(x))
}

/// Constrained → unconstrained, leaf by leaf
pub fn inverse_transform_tree(tree: &ParamTree, bijector: &BijectorMap) -> Result<ParamTree> {
    map_tree(tree, bijector, |b, y| b.inverse(y))
}

/// Draw a model-space tree from the prior, one independent stream per key
pub fn sample_tree(prior: &Prior, num_samples: usize, seed: u64) -> Result<ParamTree> {
    let seeds = split_seed(seed, prior.len());
    let mut tree = ParamTree::new();
    for ((key, dist), s) in prior.iter().zip(seeds) {
        let mut rng = StdRng::seed_from_u64(s);
        tree.insert(key.clone(), dist.sample(num_samples, &mut rng)?);
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bijectors::{Exp, Identity, Sigmoid};
    use crate::distributions::{Beta, Gamma, Independent, Normal};
    use candle_core::{DType, Device};

    fn model() -> candle_core::Result<(Prior, BijectorMap)> {
        let dev = Device::Cpu;
        let mut prior = Prior::new();
        prior.insert("mu".into(), Arc::new(Normal::new(0.0, 1.0, &dev)?));
        prior.insert("p".into(), Arc::new(Beta::new(2.0, 2.0, &dev)?));
        prior.insert("tau".into(), Arc::new(Gamma::new(2.0, 1.0, &dev)?));

        let mut bijector = BijectorMap::new();
        bijector.insert("mu".into(), Arc::new(Identity));
        bijector.insert("p".into(), Arc::new(Sigmoid::default()));
        bijector.insert("tau".into(), Arc::new(Exp));
        Ok((prior, bijector))
    }

    #[test]
    fn approx_prior_layout() -> Result<()> {
        let (prior, bijector) = model()?;
        let approx = inverse_transform_dist(&prior, &bijector)?;
        assert_eq!(approx.len(), 3);
        assert_eq!(approx.tree_spec().dim(), 3);

        let tree = approx.sample(4, 0)?;
        assert_eq!(tree["p"].dims(), &[4]);
        assert_eq!(approx.log_prob(&tree)?.dims(), &[4]);

        let constrained = transform_tree(&tree, &bijector)?;
        let p = constrained["p"].to_vec1::<f32>()?;
        assert!(p.iter().all(|v| *v > 0.0 && *v < 1.0));
        let tau = constrained["tau"].to_vec1::<f32>()?;
        assert!(tau.iter().all(|v| *v > 0.0));
        Ok(())
    }

    #[test]
    fn change_of_variables() -> Result<()> {
        // log q(u) = log Gamma(e^u) + u
        let (prior, bijector) = model()?;
        let approx = inverse_transform_dist(&prior, &bijector)?;
        let u = Tensor::new(&[0.4f32], &Device::Cpu)?;
        let got = approx.get("tau").expect("tau").log_prob(&u)?.to_vec1::<f32>()?;
        let lp = prior["tau"].log_prob(&u.exp()?)?;
        let want = (lp + &u)?.to_vec1::<f32>()?;
        assert!((got[0] - want[0]).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn round_trip_through_bijectors() -> Result<()> {
        let (prior, bijector) = model()?;
        let x = sample_tree(&prior, 10, 3)?;
        let back = transform_tree(&inverse_transform_tree(&x, &bijector)?, &bijector)?;
        for (key, leaf) in x.iter() {
            let a = leaf.to_vec1::<f32>()?;
            let b = back[key].to_vec1::<f32>()?;
            for (u, v) in a.iter().zip(b.iter()) {
                assert!((u - v).abs() < 1e-4, "{}: {} vs {}", key, u, v);
            }
        }
        Ok(())
    }

    #[test]
    fn key_mismatch() -> Result<()> {
        let (prior, mut bijector) = model()?;
        bijector.remove("tau");
        bijector.insert("sigma".into(), Arc::new(Exp));
        match inverse_transform_dist(&prior, &bijector) {
            Err(AdviError::KeyMismatch {
                only_prior,
                only_bijector,
            }) => {
                assert_eq!(only_prior, vec!["tau".to_string()]);
                assert_eq!(only_bijector, vec!["sigma".to_string()]);
            }
            _ => panic!("expected a key mismatch"),
        }
        Ok(())
    }

    #[test]
    fn batched_prior_is_rejected() -> Result<()> {
        let (mut prior, bijector) = model()?;
        let loc = Tensor::zeros(3, DType::F32, &Device::Cpu)?;
        let scale = Tensor::ones(3, DType::F32, &Device::Cpu)?;
        let batched: Arc<dyn Distribution> = Arc::new(Normal::from_tensors(loc, scale)?);
        prior.insert("mu".into(), batched.clone());
        assert!(matches!(
            inverse_transform_dist(&prior, &bijector),
            Err(AdviError::ZeroBatchViolation { batch_rank: 1, .. })
        ));

        // the same vector as a single event is fine
        prior.insert("mu".into(), Arc::new(Independent::all(batched)));
        let approx = inverse_transform_dist(&prior, &bijector)?;
        assert_eq!(approx.tree_spec().shape_of("mu"), Some(&[3usize][..]));
        assert_eq!(approx.tree_spec().dim(), 5);
        Ok(())
    }
}
