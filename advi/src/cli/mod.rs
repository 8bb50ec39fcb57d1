pub mod fit;

use clap::{Parser, Subcommand};

pub use fit::{FitArgs, ModelType, VariationalType};

#[derive(Parser)]
#[command(name = "advi")]
#[command(about = "Automatic differentiation variational inference on synthetic models")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Simulate data from a toy model and fit its posterior
    Fit(FitArgs),
}
