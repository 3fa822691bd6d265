use super::{ActivationFunction, Initializer, LayerKind, LossFunction, Topology};

const ZERO: Initializer = Initializer::Uniform { a: 0.0, b: 0.0 };

fn convolution(kernel: usize, n_kernels: usize) -> LayerKind {
    LayerKind::Convolution2d {
        kernel_sizes: (kernel, kernel),
        strides: (1, 1),
        paddings: (0, 0),
        n_kernels,
        weights_initializer: Initializer::Xavier,
        biases_initializer: ZERO,
    }
}

fn max_pooling() -> LayerKind {
    LayerKind::MaxPooling2d {
        kernel_sizes: (2, 2),
        strides: (2, 2),
        paddings: (0, 0),
    }
}

fn fully_connected(n_outputs: usize) -> LayerKind {
    LayerKind::FullyConnected {
        n_outputs,
        weights_initializer: Initializer::Xavier,
        biases_initializer: ZERO,
    }
}

/// The LeNet chain: two convolution + pooling stages, then a two layer
/// classifier with a softmax cross-entropy loss over 10 classes
pub fn build_topology() -> Topology {
    let layers = [
        convolution(3, 32),
        max_pooling(),
        convolution(5, 64),
        max_pooling(),
        fully_connected(256),
        LayerKind::Activation(ActivationFunction::ReLU),
        fully_connected(10),
        LayerKind::Loss(LossFunction::SoftmaxCrossEntropy),
    ];

    let mut topology = Topology::new();
    for kind in layers {
        topology.push_next(kind);
    }

    topology
}
