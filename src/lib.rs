pub mod error;
pub mod model;

pub use error::Error;
pub use model::{EvolvedConfig, EvolvedTransformer, ModelOutput};
