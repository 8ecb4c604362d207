use std::fmt;

use serde_json::Value;

use crate::data::Data;
use crate::error::Result;

/// The fit/transform contract implemented by every pipeline stage.
///
/// `fit` receives the values at the pipe's input keys followed by its
/// fit-only keys. `transform` receives the input values only and returns
/// one value per output key.
pub trait Operator: Send + Sync + fmt::Debug {
    fn fit(&mut self, inputs: &[&Data]) -> Result<()>;

    fn transform(&self, inputs: &[&Data]) -> Result<Vec<Data>>;

    /// Learned state for persistence. Stateless operators keep the default.
    fn state(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    fn restore(&mut self, state: Value) -> Result<()> {
        let _ = state;
        Ok(())
    }
}
