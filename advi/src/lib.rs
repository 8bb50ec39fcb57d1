pub mod advi;
pub mod bijectors;
pub mod cli;
pub mod distributions;
pub mod error;
pub mod family;
pub mod linalg;
pub mod ops;
pub mod params;
pub mod posterior;
pub mod reparam;
pub mod seed;
pub mod tree;

pub use advi::{Advi, AdviConfig, LogLikelihood};
pub use error::{AdviError, Result};
pub use family::ViType;
pub use params::{ConstantInitializer, Initializer, NormalInitializer, Params};
pub use posterior::Posterior;
pub use reparam::{inverse_transform_dist, ApproxNormalPrior, BijectorMap, Prior};
pub use tree::{ParamTree, TreeSpec};

pub use candle_core;
pub use candle_nn;
