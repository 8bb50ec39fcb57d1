//! Trainable parameters and their initialization.

use std::collections::HashMap;
use std::sync::MutexGuard;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{AdviError, Result};

/// Prefix of the surrogate's raw variables inside the [`VarMap`]
pub const POSTERIOR_PREFIX: &str = "posterior";

/// Produces initial values for one raw parameter leaf.
///
/// Values are laid out row-major; their count must equal the product of
/// `shape`.
pub trait Initializer {
    fn initialize(&self, seed: u64, shape: &[usize]) -> Vec<f64>;
}

impl<F> Initializer for F
where
    F: Fn(u64, &[usize]) -> Vec<f64>,
{
    fn initialize(&self, seed: u64, shape: &[usize]) -> Vec<f64> {
        self(seed, shape)
    }
}

/// i.i.d. `N(mean, stddev²)` values
#[derive(Debug, Clone, Copy)]
pub struct NormalInitializer {
    pub mean: f64,
    pub stddev: f64,
}

impl Default for NormalInitializer {
    fn default() -> Self {
        Self {
            mean: 0.0,
            stddev: 0.01,
        }
    }
}

impl NormalInitializer {
    pub fn new(mean: f64, stddev: f64) -> Self {
        Self { mean, stddev }
    }
}

impl Initializer for NormalInitializer {
    fn initialize(&self, seed: u64, shape: &[usize]) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let n: usize = shape.iter().product();
        (0..n)
            .map(|_| self.mean + self.stddev * rng.sample::<f64, _>(StandardNormal))
            .collect()
    }
}

/// Every value set to the same constant
#[derive(Debug, Clone, Copy)]
pub struct ConstantInitializer(pub f64);

impl Initializer for ConstantInitializer {
    fn initialize(&self, _seed: u64, shape: &[usize]) -> Vec<f64> {
        vec![self.0; shape.iter().product()]
    }
}

/// Trainable state handed to the estimator and the optimizer.
///
/// Raw surrogate parameters are `Var`s named `posterior.<name>` in canonical
/// order. Further variables (for example likelihood parameters) can be
/// registered in the same map through [`Params::var_builder`].
pub struct Params {
    varmap: VarMap,
    posterior: Vec<(String, Var)>,
    dtype: DType,
    device: Device,
}

impl Params {
    /// Register `(name, value)` pairs as surrogate variables under
    /// [`POSTERIOR_PREFIX`], keeping their order.
    pub fn from_posterior(
        values: Vec<(&str, Tensor)>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let mut posterior = Vec::with_capacity(values.len());
        {
            let mut data = lock(&varmap)?;
            for (name, value) in values {
                let path = format!("{}.{}", POSTERIOR_PREFIX, name);
                if data.contains_key(&path) {
                    let msg = format!("duplicate variable '{}'", path);
                    return Err(AdviError::InvalidArgument(msg));
                }
                let var = Var::from_tensor(&value.to_dtype(dtype)?.to_device(device)?)?;
                data.insert(path.clone(), var.clone());
                posterior.push((path, var));
            }
        }
        Ok(Self {
            varmap,
            posterior,
            dtype,
            device: device.clone(),
        })
    }

    /// Raw surrogate parameters, canonical order
    pub fn posterior(&self) -> Vec<Tensor> {
        self.posterior.iter().map(|(_, v)| v.as_tensor().clone()).collect()
    }

    /// Full variable paths of the raw surrogate parameters
    pub fn posterior_names(&self) -> Vec<&str> {
        self.posterior.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Overwrite the raw surrogate parameters in place; shapes must not change
    pub fn set_posterior(&self, values: &[Tensor]) -> Result<()> {
        if values.len() != self.posterior.len() {
            return Err(AdviError::ShapeMismatch(format!(
                "{} values for {} posterior variables",
                values.len(),
                self.posterior.len()
            )));
        }
        for ((name, var), value) in self.posterior.iter().zip(values.iter()) {
            if var.dims() != value.dims() {
                return Err(AdviError::ShapeMismatch(format!(
                    "'{}' has shape {:?}, got {:?}",
                    name,
                    var.dims(),
                    value.dims()
                )));
            }
            var.set(&value.to_dtype(self.dtype)?.to_device(&self.device)?)?;
        }
        Ok(())
    }

    /// Any variable of the map by its full path
    pub fn get(&self, path: &str) -> Result<Option<Tensor>> {
        let data = lock(&self.varmap)?;
        Ok(data.get(path).map(|v| v.as_tensor().clone()))
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Every trainable variable, surrogate ones included
    pub fn all_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Builder over the same map; variables created through it become
    /// trainable alongside the surrogate
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

fn lock(varmap: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|e| AdviError::InvalidArgument(format!("variable map is poisoned: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_initializer_is_seeded() {
        let init = NormalInitializer::default();
        let a = init.initialize(3, &[2, 3]);
        assert_eq!(a.len(), 6);
        assert_eq!(a, init.initialize(3, &[2, 3]));
        assert_ne!(a, init.initialize(4, &[2, 3]));
        assert!(a.iter().all(|v| v.abs() < 0.1));
    }

    #[test]
    fn closures_are_initializers() {
        let ramp = |_seed: u64, shape: &[usize]| -> Vec<f64> {
            (0..shape.iter().product::<usize>()).map(|i| i as f64).collect()
        };
        assert_eq!(ramp.initialize(0, &[3]), vec![0.0, 1.0, 2.0]);
        assert_eq!(ConstantInitializer(0.5).initialize(0, &[]), vec![0.5]);
    }

    #[test]
    fn posterior_variables() -> Result<()> {
        let dev = Device::Cpu;
        let params = Params::from_posterior(
            vec![
                ("loc", Tensor::new(&[1.0f64, 2.0], &dev)?),
                ("scale_diag", Tensor::zeros(2, DType::F64, &dev)?),
            ],
            DType::F32,
            &dev,
        )?;
        assert_eq!(params.posterior_names(), vec!["posterior.loc", "posterior.scale_diag"]);
        assert_eq!(params.posterior()[0].dtype(), DType::F32);
        assert_eq!(params.all_vars().len(), 2);

        params.set_posterior(&[
            Tensor::new(&[3.0f32, 4.0], &dev)?,
            Tensor::ones(2, DType::F32, &dev)?,
        ])?;
        let loc = params.get("posterior.loc")?.map(|t| t.to_vec1::<f32>());
        assert_eq!(loc.transpose()?, Some(vec![3.0, 4.0]));
        assert!(params.get("posterior.missing")?.is_none());
        assert!(params.set_posterior(&[Tensor::zeros(3, DType::F32, &dev)?]).is_err());

        // likelihood variables join the same map
        let noise = params
            .var_builder()
            .pp("likelihood")
            .get_with_hints(1, "ln_sigma", candle_nn::Init::Const(0.0))?;
        assert_eq!(noise.dims(), &[1]);
        assert_eq!(params.all_vars().len(), 3);
        assert!(params.get("likelihood.ln_sigma")?.is_some());
        Ok(())
    }

    #[test]
    fn poisoned_map_is_an_error() -> Result<()> {
        let dev = Device::Cpu;
        let params = Params::from_posterior(
            vec![("loc", Tensor::zeros(2, DType::F32, &dev)?)],
            DType::F32,
            &dev,
        )?;
        let varmap = params.varmap().clone();
        let _ = std::thread::spawn(move || {
            let _guard = varmap.data().lock();
            panic!("poison the variable map");
        })
        .join();
        assert!(matches!(params.get("posterior.loc"), Err(AdviError::InvalidArgument(_))));
        Ok(())
    }
}
