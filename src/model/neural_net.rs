use crate::topology::{ActivationFunction, Initializer, LayerKind, LossFunction, Topology};
use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, ArrayView4, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use super::{Engine, EngineError};

/// One dense layer: a weight matrix, a bias vector and an optional activation
#[derive(Debug)]
pub struct DenseLayer {
    pub weights: Array2<f64>,
    pub biases: Array1<f64>,
    pub activation: Option<ActivationFunction>,
}

/// Trained parameters produced by `DenseEngine`
#[derive(Debug)]
pub struct DenseModel {
    layers: Vec<DenseLayer>,
}

/// SGD multilayer perceptron engine.
///
/// Images are flattened and only the fully connected, activation and loss
/// layers of a topology are executed. Convolution and pooling layers are
/// passed through unchanged.
pub struct DenseEngine {
    pub num_epochs: usize,
    pub seed: Option<u64>,
}

/// A fully connected layer as read off the topology, before any weights exist
#[derive(Debug, PartialEq)]
struct LayerPlan {
    n_outputs: usize,
    weights_initializer: Initializer,
    biases_initializer: Initializer,
    activation: Option<ActivationFunction>,
}

impl Default for DenseEngine {
    fn default() -> Self {
        DenseEngine::new(1)
    }
}

impl DenseEngine {
    pub fn new(num_epochs: usize) -> DenseEngine {
        DenseEngine {
            num_epochs,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> DenseEngine {
        self.seed = Some(seed);
        self
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

impl DenseModel {
    pub fn layers(&self) -> &[DenseLayer] {
        &self.layers
    }

    pub fn num_inputs(&self) -> usize {
        self.layers.first().map_or(0, |layer| layer.weights.nrows())
    }

    pub fn num_classes(&self) -> usize {
        self.layers.last().map_or(0, |layer| layer.biases.len())
    }

    fn init(
        plans: &[LayerPlan],
        num_inputs: usize,
        rng: &mut StdRng,
    ) -> Result<DenseModel, EngineError> {
        let mut layers = vec![];
        let mut fan_in = num_inputs;

        for plan in plans {
            let fan_out = plan.n_outputs;

            let dist = distribution(plan.weights_initializer, fan_in, fan_out)?;
            let weights = Array::zeros((fan_in, fan_out)).map(|_: &f64| dist.sample(&mut *rng));

            let dist = distribution(plan.biases_initializer, fan_in, fan_out)?;
            let biases = Array::zeros(fan_out).map(|_: &f64| dist.sample(&mut *rng));

            layers.push(DenseLayer {
                weights,
                biases,
                activation: plan.activation,
            });
            fan_in = fan_out;
        }

        Ok(DenseModel { layers })
    }

    // Perform a forward pass of the network on some input.
    // Returns the outputs of every layer (the input first),
    // and the non-activated outputs (used for backprop)
    fn forward(&self, inputs: &ArrayView2<f64>) -> (Vec<Array2<f64>>, Vec<Array2<f64>>) {
        let mut hidden = vec![inputs.to_owned()];
        let mut hidden_linear = vec![];

        for layer in &self.layers {
            let lin_output = hidden[hidden.len() - 1].dot(&layer.weights) + &layer.biases;
            let real_output = match layer.activation {
                Some(function) => lin_output.mapv(|x| activation(function, x)),
                None => lin_output.clone(),
            };

            hidden.push(real_output);
            hidden_linear.push(lin_output);
        }

        (hidden, hidden_linear)
    }

    /// Calculate the gradients using backprop and perform a GD step
    fn backward_and_update(
        &mut self,
        hidden: Vec<Array2<f64>>,
        hidden_linear: Vec<Array2<f64>>,
        grad: Array2<f64>,
        learning_rate: f64,
    ) {
        let batch_size = grad.nrows() as f64;
        // The gradient WRT the output of the current layer
        let mut grad_help = grad;

        for idx in (0..self.layers.len()).rev() {
            let layer = &mut self.layers[idx];

            if let Some(function) = layer.activation {
                let step_mat = hidden_linear[idx].mapv(|x| delta_activation(function, x));
                grad_help = grad_help * step_mat;
            }

            let weight_grad = hidden[idx].t().dot(&grad_help) / batch_size;
            let bias_grad = grad_help.sum_axis(Axis(0)) / batch_size;

            // Propagate through the weights as they were before this step
            let next_grad = grad_help.dot(&layer.weights.t());

            layer.weights.scaled_add(-learning_rate, &weight_grad);
            layer.biases.scaled_add(-learning_rate, &bias_grad);

            grad_help = next_grad;
        }
    }

    fn scores(&self, inputs: &ArrayView2<f64>) -> Array2<f64> {
        let (mut hidden, _) = self.forward(inputs);
        let mut scores = hidden.pop().unwrap_or_else(|| inputs.to_owned());
        softmax_rows(&mut scores);
        scores
    }
}

impl Engine for DenseEngine {
    type Model = DenseModel;

    fn train(
        &self,
        topology: &Topology,
        data: ArrayView4<f64>,
        labels: ArrayView1<f64>,
        batch_size: usize,
        learning_rate: f64,
    ) -> Result<DenseModel, EngineError> {
        if batch_size == 0 {
            return Err(EngineError::InvalidBatchSize);
        }

        let plans = plan(topology)?;
        let inputs = flatten(data)?;

        if labels.len() != inputs.nrows() {
            return Err(EngineError::ShapeMismatch {
                what: "labels",
                expected: inputs.nrows(),
                found: labels.len(),
            });
        }

        let n_classes = plans.last().map_or(0, |plan| plan.n_outputs);
        let target = one_hot(labels, n_classes)?;

        let mut rng = self.rng();
        let mut model = DenseModel::init(&plans, inputs.ncols(), &mut rng)?;
        info!(
            "training {} dense layers on {} objects of {} features",
            model.layers.len(),
            inputs.nrows(),
            inputs.ncols()
        );

        for num_epoch in 0..self.num_epochs {
            let mut loss = 0f64;
            let mut num_batches = 0usize;

            // Get a batch of instances and their targets
            for (input_batch, target_batch) in inputs
                .axis_chunks_iter(Axis(0), batch_size)
                .zip(target.axis_chunks_iter(Axis(0), batch_size))
            {
                let (hidden, hidden_linear) = model.forward(&input_batch);

                let mut predictions = hidden[hidden.len() - 1].clone();
                softmax_rows(&mut predictions);
                loss += cross_entropy(&predictions, target_batch);
                num_batches += 1;

                // Gradient is initialized to the gradient of the loss WRT the output layer
                let grad = predictions - target_batch;

                model.backward_and_update(hidden, hidden_linear, grad, learning_rate);
            }

            if num_batches > 0 {
                debug!("epoch {} mean batch loss {:.6}", num_epoch, loss / num_batches as f64);
            }
        }

        Ok(model)
    }

    fn predict(
        &self,
        model: &DenseModel,
        data: ArrayView4<f64>,
    ) -> Result<Array2<f64>, EngineError> {
        let inputs = flatten(data)?;

        if inputs.ncols() != model.num_inputs() {
            return Err(EngineError::ShapeMismatch {
                what: "features per object",
                expected: model.num_inputs(),
                found: inputs.ncols(),
            });
        }

        Ok(model.scores(&inputs.view()))
    }
}

/// Read the dense layers off a chain topology ending in a softmax cross-entropy loss
fn plan(topology: &Topology) -> Result<Vec<LayerPlan>, EngineError> {
    if topology.is_empty() {
        return Err(EngineError::EmptyTopology);
    }

    let chain = topology.chain().ok_or(EngineError::NotAChain)?;
    let last = chain[chain.len() - 1];
    let mut plans: Vec<LayerPlan> = vec![];
    let mut passed_through = 0;

    for layer in chain.iter().filter_map(|&id| topology.get(id)) {
        match &layer.kind {
            LayerKind::Convolution2d { .. } | LayerKind::MaxPooling2d { .. } => {
                passed_through += 1;
            }
            LayerKind::FullyConnected {
                n_outputs,
                weights_initializer,
                biases_initializer,
            } => plans.push(LayerPlan {
                n_outputs: *n_outputs,
                weights_initializer: *weights_initializer,
                biases_initializer: *biases_initializer,
                activation: None,
            }),
            LayerKind::Activation(function) => match plans.last_mut() {
                Some(plan) if plan.activation.is_none() => plan.activation = Some(*function),
                _ => return Err(EngineError::DanglingActivation(layer.id)),
            },
            LayerKind::Loss(LossFunction::SoftmaxCrossEntropy) => {
                if layer.id != last {
                    return Err(EngineError::MisplacedLoss(layer.id));
                }
            }
        }
    }

    if !matches!(
        topology.get(last).map(|layer| &layer.kind),
        Some(LayerKind::Loss(_))
    ) {
        return Err(EngineError::MissingLoss);
    }
    if plans.is_empty() {
        return Err(EngineError::NoTrainableLayers);
    }
    if passed_through > 0 {
        warn!(
            "{} convolution and pooling layers are passed through by the dense engine",
            passed_through
        );
    }

    Ok(plans)
}

fn distribution(
    initializer: Initializer,
    fan_in: usize,
    fan_out: usize,
) -> Result<Uniform<f64>, EngineError> {
    let (a, b) = match initializer {
        Initializer::Xavier => {
            let boundary = (6f64 / (fan_in + fan_out) as f64).sqrt();
            (-boundary, boundary)
        }
        Initializer::Uniform { a, b } => (a, b),
    };

    if !(a.is_finite() && b.is_finite() && a <= b) {
        return Err(EngineError::InvalidInitializer { a, b });
    }

    Ok(Uniform::new_inclusive(a, b))
}

/// Lay every object out as one row of `channels * height * width` features
fn flatten(data: ArrayView4<f64>) -> Result<Array2<f64>, EngineError> {
    let (n, channels, height, width) = data.dim();
    let features = data
        .as_standard_layout()
        .into_owned()
        .into_shape((n, channels * height * width))?;

    Ok(features)
}

fn one_hot(labels: ArrayView1<f64>, n_classes: usize) -> Result<Array2<f64>, EngineError> {
    let mut target = Array2::zeros((labels.len(), n_classes));

    for (index, &value) in labels.iter().enumerate() {
        if value < 0f64 || value.fract() != 0f64 || value >= n_classes as f64 {
            return Err(EngineError::InvalidLabel {
                index,
                value,
                n_classes,
            });
        }
        target[[index, value as usize]] = 1f64;
    }

    Ok(target)
}

fn activation(function: ActivationFunction, z: f64) -> f64 {
    match function {
        ActivationFunction::ReLU => z.max(0f64),
    }
}

fn delta_activation(function: ActivationFunction, z: f64) -> f64 {
    match function {
        ActivationFunction::ReLU => {
            if z > 0f64 {
                1f64
            } else {
                0f64
            }
        }
    }
}

/// Softmax over every row, in place
fn softmax_rows(scores: &mut Array2<f64>) {
    for mut row in scores.axis_iter_mut(Axis(0)) {
        // Shift by the max so exp() can't overflow
        let max = row.fold(f64::NEG_INFINITY, |m, &x| m.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
}

/// Mean cross-entropy loss of a batch
fn cross_entropy(predictions: &Array2<f64>, target: ArrayView2<f64>) -> f64 {
    let total: f64 = predictions
        .iter()
        .zip(target.iter())
        .map(|(p, t)| t * p.max(f64::MIN_POSITIVE).ln())
        .sum();

    -total / predictions.nrows().max(1) as f64
}
