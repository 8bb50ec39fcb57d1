use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use clap::{Args, ValueEnum};
use log::info;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution as _, Normal as NormalSampler};

use crate::advi::{Advi, AdviConfig};
use crate::bijectors::{Exp, Identity, Sigmoid};
use crate::distributions::{Beta, HalfNormal, Normal};
use crate::family::ViType;
use crate::ops::{host_values, HALF_LN_2PI};
use crate::params::{NormalInitializer, Params};
use crate::reparam::{BijectorMap, Prior};
use crate::tree::ParamTree;

//
// CLI types
//

#[derive(Clone, Debug, ValueEnum)]
pub enum ModelType {
    /// y ~ Bernoulli(p), p ~ Beta(2, 2)
    CoinToss,
    /// y ~ N(mu, sigma²), mu ~ N(0, 10²), sigma ~ HalfNormal(2)
    GaussianMean,
}

#[derive(Clone, Debug, ValueEnum)]
pub enum VariationalType {
    MeanField,
    FullRank,
    LowRank,
}

impl From<&VariationalType> for ViType {
    fn from(v: &VariationalType) -> Self {
        match v {
            VariationalType::MeanField => ViType::MeanField,
            VariationalType::FullRank => ViType::FullRank,
            VariationalType::LowRank => ViType::LowRank,
        }
    }
}

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(short, long, default_value = "coin-toss")]
    pub model: ModelType,

    #[arg(long, default_value = "mean-field")]
    pub vi_type: VariationalType,

    #[arg(long, help = "Number of covariance factors (low-rank only)")]
    pub rank: Option<usize>,

    #[arg(short, long, default_value = "200", help = "Number of simulated data points")]
    pub n: usize,

    #[arg(long, default_value = "1000")]
    pub iters: usize,

    #[arg(long, default_value = "0.05")]
    pub lr: f64,

    #[arg(long, default_value = "10")]
    pub n_samples: usize,

    #[arg(long, help = "Minibatch size (default: full data)")]
    pub batch_size: Option<usize>,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(long, default_value = "1000", help = "Posterior draws for the summary")]
    pub summary_samples: usize,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

//
// Toy models
//

struct ToyModel {
    prior: Prior,
    bijector: BijectorMap,
    data: Tensor,
}

type ToyLikelihood = fn(&ParamTree, &(), &Tensor, &Params) -> candle_core::Result<Tensor>;

fn coin_toss(n: usize, rng: &mut StdRng, device: &Device) -> Result<ToyModel> {
    let p_true = 0.3;
    let flips: Vec<f32> = (0..n)
        .map(|_| if rng.random::<f64>() < p_true { 1.0 } else { 0.0 })
        .collect();
    info!("Coin toss: {} flips, {} heads (p = {})", n, flips.iter().sum::<f32>(), p_true);

    let mut prior = Prior::new();
    prior.insert("p".into(), Arc::new(Beta::new(2.0, 2.0, device)?));
    let mut bijector = BijectorMap::new();
    bijector.insert("p".into(), Arc::new(Sigmoid::default()));

    Ok(ToyModel {
        prior,
        bijector,
        data: Tensor::from_vec(flips, n, device)?,
    })
}

/// Σ_i y_i log p + (1 - y_i) log(1 - p), per draw and datum
fn coin_toss_llik(
    tree: &ParamTree,
    _aux: &(),
    batch: &Tensor,
    _params: &Params,
) -> candle_core::Result<Tensor> {
    let p = tree["p"].unsqueeze(1)?;
    let log_p = p.log()?;
    let log_q = p.affine(-1.0, 1.0)?.log()?;
    let heads = batch.unsqueeze(0)?.to_dtype(p.dtype())?;
    let tails = heads.affine(-1.0, 1.0)?;
    heads.broadcast_mul(&log_p)? + tails.broadcast_mul(&log_q)?
}

fn gaussian_mean(n: usize, rng: &mut StdRng, device: &Device) -> Result<ToyModel> {
    let (mu_true, sigma_true) = (1.5, 0.7);
    let sampler = NormalSampler::new(mu_true, sigma_true)?;
    let y: Vec<f32> = (0..n).map(|_| sampler.sample(rng) as f32).collect();
    info!("Gaussian mean: {} points (mu = {}, sigma = {})", n, mu_true, sigma_true);

    let mut prior = Prior::new();
    prior.insert("mu".into(), Arc::new(Normal::new(0.0, 10.0, device)?));
    prior.insert("sigma".into(), Arc::new(HalfNormal::new(2.0, device)?));
    let mut bijector = BijectorMap::new();
    bijector.insert("mu".into(), Arc::new(Identity));
    bijector.insert("sigma".into(), Arc::new(Exp));

    Ok(ToyModel {
        prior,
        bijector,
        data: Tensor::from_vec(y, n, device)?,
    })
}

/// log N(y_i; mu, sigma²), per draw and datum
fn gaussian_mean_llik(
    tree: &ParamTree,
    _aux: &(),
    batch: &Tensor,
    _params: &Params,
) -> candle_core::Result<Tensor> {
    let mu = tree["mu"].unsqueeze(1)?;
    let sigma = tree["sigma"].unsqueeze(1)?;
    let y = batch.unsqueeze(0)?.to_dtype(mu.dtype())?;
    let z = y.broadcast_sub(&mu)?.broadcast_div(&sigma)?;
    let lp = (z.sqr()? * -0.5)?.broadcast_sub(&sigma.log()?)?;
    lp - HALF_LN_2PI
}

//
// Training
//

fn minibatch(data: &Tensor, batch_size: usize, rng: &mut StdRng) -> Result<Tensor> {
    let n = data.dim(0)?;
    if batch_size >= n {
        return Ok(data.clone());
    }
    let ids: Vec<u32> = index::sample(rng, n, batch_size)
        .into_iter()
        .map(|i| i as u32)
        .collect();
    let ids = Tensor::from_vec(ids, batch_size, data.device())?;
    Ok(data.index_select(&ids, 0)?)
}

fn train(args: &FitArgs, advi: &Advi, params: &Params, data: &Tensor) -> Result<()> {
    let n = data.dim(0)?;
    let batch_size = args.batch_size.unwrap_or(n).clamp(1, n);
    let mut optimizer = AdamW::new(
        params.all_vars(),
        ParamsAdamW {
            lr: args.lr,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    info!(
        "Training for {} iterations ({} draws, batch {} of {})",
        args.iters, args.n_samples, batch_size, n
    );
    for i in 0..args.iters {
        let batch = minibatch(data, batch_size, &mut rng)?;
        let loss = advi.loss_fn(params, &batch, &(), n, rng.random(), args.n_samples)?;
        optimizer.backward_step(&loss)?;

        if i % 50 == 0 || i == args.iters - 1 {
            if args.verbose {
                let elbo = advi.elbo(params, data, &(), n, rng.random(), 100)?;
                info!(
                    "iter {:4}: loss = {:10.4}, ELBO = {:10.4}",
                    i,
                    loss.to_dtype(DType::F32)?.to_scalar::<f32>()?,
                    elbo
                );
            } else {
                info!("iter {:4}/{}", i, args.iters);
            }
        }
    }
    Ok(())
}

fn summarize(advi: &Advi, params: &Params, num_samples: usize, seed: u64) -> Result<()> {
    let posterior = advi.apply(params)?;
    info!("Posterior mean (unconstrained): {:?}", host_values(&posterior.mean())?);

    let draws = posterior.sample_constrained(num_samples, seed)?;
    println!("{:<12} {:>10} {:>10}", "parameter", "mean", "sd");
    for (key, leaf) in draws.iter() {
        let mean = host_values(&leaf.mean(0)?)?;
        let sd = host_values(&leaf.var(0)?.sqrt()?)?;
        for (j, (m, s)) in mean.iter().zip(sd.iter()).enumerate() {
            let name = if mean.len() > 1 {
                format!("{}[{}]", key, j)
            } else {
                key.clone()
            };
            println!("{:<12} {:>10.4} {:>10.4}", name, m, s);
        }
    }
    Ok(())
}

pub fn run(args: &FitArgs) -> Result<()> {
    let device = if args.gpu {
        #[cfg(target_os = "macos")]
        { Device::new_metal(0).unwrap_or(Device::Cpu) }
        #[cfg(target_os = "linux")]
        { Device::new_cuda(0).unwrap_or(Device::Cpu) }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        { Device::Cpu }
    } else {
        Device::Cpu
    };
    info!("Using device: {:?}", device);

    if args.n == 0 || args.iters == 0 || args.n_samples == 0 {
        anyhow::bail!("--n, --iters and --n-samples must be positive");
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let (model, llik): (ToyModel, ToyLikelihood) = match args.model {
        ModelType::CoinToss => (coin_toss(args.n, &mut rng, &device)?, coin_toss_llik),
        ModelType::GaussianMean => (
            gaussian_mean(args.n, &mut rng, &device)?,
            gaussian_mean_llik,
        ),
    };

    let config = AdviConfig {
        vi_type: ViType::from(&args.vi_type),
        rank: args.rank,
        device: device.clone(),
        ..AdviConfig::default()
    };
    info!("Variational family: {}", config.vi_type);

    let advi = Advi::new(model.prior, model.bijector, llik, config)?;
    let params = advi.init(rng.random(), &NormalInitializer::default())?;

    train(args, &advi, &params, &model.data)?;
    summarize(&advi, &params, args.summary_samples, rng.random())
}
