use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

pub mod lenet;

/// Index of a layer inside its topology, assigned in insertion order
pub type LayerId = usize;

/// How the engine should fill a parameter tensor when training starts
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Initializer {
    /// Uniform on +-sqrt(6 / (fan_in + fan_out))
    Xavier,
    /// Uniform on [a, b]. `a == b` gives a constant
    Uniform { a: f64, b: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationFunction {
    ReLU,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossFunction {
    SoftmaxCrossEntropy,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LayerKind {
    Convolution2d {
        kernel_sizes: (usize, usize),
        strides: (usize, usize),
        paddings: (usize, usize),
        n_kernels: usize,
        weights_initializer: Initializer,
        biases_initializer: Initializer,
    },
    MaxPooling2d {
        kernel_sizes: (usize, usize),
        strides: (usize, usize),
        paddings: (usize, usize),
    },
    FullyConnected {
        n_outputs: usize,
        weights_initializer: Initializer,
        biases_initializer: Initializer,
    },
    Activation(ActivationFunction),
    Loss(LossFunction),
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Convolution2d { .. } => "convolution2d",
            LayerKind::MaxPooling2d { .. } => "maximum_pooling2d",
            LayerKind::FullyConnected { .. } => "fullyconnected",
            LayerKind::Activation(ActivationFunction::ReLU) => "relu",
            LayerKind::Loss(LossFunction::SoftmaxCrossEntropy) => "softmax_cross",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Convolution2d {
                kernel_sizes,
                strides,
                paddings,
                n_kernels,
                ..
            } => write!(
                f,
                "{} kernel {}x{} stride {}x{} padding {}x{} kernels {}",
                self.name(),
                kernel_sizes.0,
                kernel_sizes.1,
                strides.0,
                strides.1,
                paddings.0,
                paddings.1,
                n_kernels
            ),
            LayerKind::MaxPooling2d {
                kernel_sizes,
                strides,
                paddings,
            } => write!(
                f,
                "{} kernel {}x{} stride {}x{} padding {}x{}",
                self.name(),
                kernel_sizes.0,
                kernel_sizes.1,
                strides.0,
                strides.1,
                paddings.0,
                paddings.1
            ),
            LayerKind::FullyConnected { n_outputs, .. } => {
                write!(f, "{} outputs {}", self.name(), n_outputs)
            }
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// A node of the topology. Immutable once added
#[derive(Clone, Debug, PartialEq)]
pub struct LayerDescriptor {
    pub id: LayerId,
    pub kind: LayerKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("layer {0} is not part of the topology")]
    UnknownLayer(LayerId),

    #[error("layer {0} cannot feed into itself")]
    SelfLoop(LayerId),

    #[error("connecting layer {from} to layer {to} would create a cycle")]
    Cycle { from: LayerId, to: LayerId },
}

/// Directed acyclic graph of layers, stored as a node list plus a successor
/// list per node
#[derive(Clone, Debug, Default)]
pub struct Topology {
    layers: Vec<LayerDescriptor>,
    next: Vec<Vec<LayerId>>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Insert a layer with no edges and return its id
    pub fn add(&mut self, kind: LayerKind) -> LayerId {
        let id = self.layers.len();
        self.layers.push(LayerDescriptor { id, kind });
        self.next.push(vec![]);
        id
    }

    /// Insert a layer fed by the last inserted one and return its id.
    /// The first layer of a topology gets no predecessor
    pub fn push_next(&mut self, kind: LayerKind) -> LayerId {
        let previous = self.layers.len().checked_sub(1);
        let id = self.add(kind);

        if let Some(previous) = previous {
            self.next[previous].push(id);
        }

        id
    }

    /// Make `to` a successor of `from`
    pub fn add_next(&mut self, from: LayerId, to: LayerId) -> Result<(), TopologyError> {
        self.check(from)?;
        self.check(to)?;

        if from == to {
            return Err(TopologyError::SelfLoop(from));
        }
        if self.next[from].contains(&to) {
            return Ok(());
        }
        if self.reaches(to, from) {
            return Err(TopologyError::Cycle { from, to });
        }

        self.next[from].push(to);
        Ok(())
    }

    pub fn get(&self, id: LayerId) -> Option<&LayerDescriptor> {
        self.layers.get(id)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerDescriptor> {
        self.layers.iter()
    }

    pub fn successors(&self, id: LayerId) -> &[LayerId] {
        self.next.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: LayerId) -> Vec<LayerId> {
        (0..self.layers.len())
            .filter(|&from| self.next[from].contains(&id))
            .collect()
    }

    /// Layers nothing feeds into
    pub fn inputs(&self) -> Vec<LayerId> {
        let mut has_predecessor = vec![false; self.layers.len()];
        for &to in self.next.iter().flatten() {
            has_predecessor[to] = true;
        }

        (0..self.layers.len())
            .filter(|&id| !has_predecessor[id])
            .collect()
    }

    /// Layers that feed into nothing
    pub fn outputs(&self) -> Vec<LayerId> {
        (0..self.layers.len())
            .filter(|&id| self.next[id].is_empty())
            .collect()
    }

    /// Layer ids ordered so every layer comes after all of its predecessors.
    /// Ties are broken by insertion order
    pub fn topological_order(&self) -> Vec<LayerId> {
        let mut in_degree = vec![0usize; self.layers.len()];
        for &to in self.next.iter().flatten() {
            in_degree[to] += 1;
        }

        let mut ready: VecDeque<LayerId> = (0..self.layers.len())
            .filter(|&id| in_degree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.layers.len());

        while let Some(id) = ready.pop_front() {
            order.push(id);
            for &to in &self.next[id] {
                in_degree[to] -= 1;
                if in_degree[to] == 0 {
                    ready.push_back(to);
                }
            }
        }

        order
    }

    /// If the topology is a single chain, its layers from input to output
    pub fn chain(&self) -> Option<Vec<LayerId>> {
        let inputs = self.inputs();
        if inputs.len() != 1 {
            return None;
        }

        let mut chain = vec![inputs[0]];
        let mut current = inputs[0];
        loop {
            match self.next[current].as_slice() {
                [] => break,
                [next] => {
                    current = *next;
                    chain.push(current);
                }
                _ => return None,
            }
        }

        (chain.len() == self.layers.len()).then_some(chain)
    }

    fn check(&self, id: LayerId) -> Result<(), TopologyError> {
        if id < self.layers.len() {
            Ok(())
        } else {
            Err(TopologyError::UnknownLayer(id))
        }
    }

    /// Whether `target` can be reached from `start` by following successor edges
    fn reaches(&self, start: LayerId, target: LayerId) -> bool {
        let mut visited = vec![false; self.layers.len()];
        let mut stack = vec![start];

        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited[id] {
                visited[id] = true;
                stack.extend(self.next[id].iter().copied());
            }
        }

        false
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for layer in &self.layers {
            write!(f, "[{}] {}", layer.id, layer.kind)?;
            let next = &self.next[layer.id];
            if !next.is_empty() {
                write!(f, " -> {:?}", next)?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}
