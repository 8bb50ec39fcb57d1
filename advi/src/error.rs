use thiserror::Error;

/// Errors raised while building or evaluating an ADVI model.
///
/// Everything except `Candle` is a configuration or programming error
/// surfaced at the point of violation; nothing is retried internally.
#[derive(Debug, Error)]
pub enum AdviError {
    #[error(
        "prior and bijector keys differ \
         (only in prior: {only_prior:?}, only in bijector: {only_bijector:?})"
    )]
    KeyMismatch {
        only_prior: Vec<String>,
        only_bijector: Vec<String>,
    },

    #[error(
        "prior distributions must have no batch dimension: \
         total batch rank {batch_rank} from {keys:?}"
    )]
    ZeroBatchViolation { batch_rank: usize, keys: Vec<String> },

    #[error("rank specification: {0}")]
    RankSpecification(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("posterior bijectors: {0}")]
    BijectorArity(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, AdviError>;
