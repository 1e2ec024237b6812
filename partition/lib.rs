#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

#[path = "../model/mod.rs"]
pub mod model;

#[path = "../shared/inputs.rs"]
pub mod inputs;

pub mod chunk;
pub mod decompose;
pub mod executor;
pub mod iter;
pub mod orchestrate;
pub mod progress;
pub mod run;
pub mod types;
pub mod validate;
pub mod weights;

pub use executor::WorkerPool;
pub use inputs::{CoreInputs, DenseInput, InputAdapter, TsvInput, WeightedExpression};
pub use model::formula::Formula;
pub use model::solver::{LinearMixedSolver, ModelSolver, SolverControl};
pub use run::{PartitionError, PartitionOptions, fit_all, fit_and_decompose, fit_each};
pub use types::{FitCollection, VarPartTable};
