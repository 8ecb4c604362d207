pub mod data;
pub mod error;
pub mod evaluate;
pub mod experiment;
pub mod inference;
pub mod lockfile;
pub mod logger;
pub mod model;
pub mod observability;
pub mod operators;
pub mod packaging;
pub mod pipeline;
pub mod presets;
pub mod recipe;
pub mod registry;
#[cfg(feature = "serve")]
pub mod serve;
pub mod serialiser;
pub mod type_checker;
pub mod validation;

pub use data::{Data, DataSet, DataSetSource};
pub use error::{PypeError, Result};
pub use experiment::{Experiment, ExperimentBuilder};
pub use inference::{InferenceInput, Inferencer};
pub use model::Model;
pub use pipeline::{Node, ParameterTree, Pipe, Pipeline};
pub use recipe::Recipe;
pub use registry::Registry;
