use ndarray::{Array2, ArrayView1, ArrayView4};
use thiserror::Error;

use crate::topology::{LayerId, Topology};

pub mod neural_net;

/// Training and prediction capability the driver hands its tensors to.
/// Tensors are only borrowed for the duration of a call
pub trait Engine {
    type Model;

    fn train(
        &self,
        topology: &Topology,
        data: ArrayView4<f64>,
        labels: ArrayView1<f64>,
        batch_size: usize,
        learning_rate: f64,
    ) -> Result<Self::Model, EngineError>;

    /// Per-object, per-class scores for every object in `data`
    fn predict(
        &self,
        model: &Self::Model,
        data: ArrayView4<f64>,
    ) -> Result<Array2<f64>, EngineError>;
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("the topology has no layers")]
    EmptyTopology,

    #[error("the topology is not a single chain of layers")]
    NotAChain,

    #[error("the topology does not end with a loss layer")]
    MissingLoss,

    #[error("loss layer {0} is not the last layer")]
    MisplacedLoss(LayerId),

    #[error("activation layer {0} does not follow a fully connected layer")]
    DanglingActivation(LayerId),

    #[error("the topology has no fully connected layers")]
    NoTrainableLayers,

    #[error("invalid uniform initializer range [{a}, {b}]")]
    InvalidInitializer { a: f64, b: f64 },

    #[error("batch size must be positive")]
    InvalidBatchSize,

    #[error("expected {expected} {what}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("label {value} of object {index} is not a class in 0..{n_classes}")]
    InvalidLabel {
        index: usize,
        value: f64,
        n_classes: usize,
    },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}
