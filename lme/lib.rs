#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

//! Loss, gradient and drop-penalty oracles for linear mixed-effects models
//! with sparsity-inducing selection of fixed and random effects.

pub mod cache;
pub mod config;
pub mod drop;
pub mod generate;
pub mod oracle;
pub mod problem;
pub mod weighted;

pub use drop::{DropPenalties, LossEvaluator};
pub use generate::{GenerationConfig, TrueParameters};
pub use oracle::{LinearLmeOracle, NumericalError, OracleError};
pub use problem::{ConfigurationError, FeatureLabel, Group, LinearLmeProblem};
pub use weighted::{LinearLmeOracleW, SelectionSettings};
