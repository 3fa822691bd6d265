pub mod evaluation;
pub mod model;
pub mod parsing;
pub mod topology;

// Convenience re-exports
pub use evaluation::{evaluate, Evaluation, DEFAULT_THRESHOLD};
pub use model::neural_net::{DenseEngine, DenseModel};
pub use model::{Engine, EngineError};
pub use parsing::mnist::MnistReader;
pub use parsing::{Batch, DatasetError, DatasetReader};
pub use topology::lenet::build_topology;
pub use topology::Topology;
