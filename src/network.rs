//! Numeric trainer abstraction and the built-in feed-forward network.
//!
//! The training lifecycle in [`model`](crate::model) treats the network as an
//! opaque trainable function behind [`Network`]. New network kinds plug in
//! through a [`NetworkFactory`] registered under a string id (see
//! [`NetworkRegistry`](crate::traits::NetworkRegistry)).
//!
//! [`FeedForwardNetwork`] is a plain multilayer perceptron trained with
//! backpropagation and momentum, one pattern at a time.

use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::models::TrainingExample;

/// Activation function applied by every non-input layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Activation {
    #[default]
    Sigmoid,
    Relu,
    LeakyRelu,
    Tanh,
}

impl Activation {
    fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    0.01 * x
                }
            }
            Activation::Tanh => x.tanh(),
        }
    }

    /// Derivative expressed in terms of the activation's output.
    fn derivative(self, out: f64) -> f64 {
        match self {
            Activation::Sigmoid => out * (1.0 - out),
            Activation::Relu => {
                if out > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu => {
                if out > 0.0 {
                    1.0
                } else {
                    0.01
                }
            }
            Activation::Tanh => 1.0 - out * out,
        }
    }
}

/// Shape of the network. Serialized into every model snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    /// Output threshold above which a prediction counts as positive.
    pub binary_thresh: f64,
    pub hidden_layers: Vec<usize>,
    pub activation: Activation,
    /// Seed for weight initialization. Random when unset.
    pub seed: Option<u64>,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            binary_thresh: 0.5,
            hidden_layers: vec![10, 5],
            activation: Activation::Sigmoid,
            seed: None,
        }
    }
}

/// Training loop settings. Serialized into every model snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingOptions {
    /// Maximum passes over the training data.
    pub iterations: usize,
    /// Stop once the mean squared error drops below this.
    pub error_thresh: f64,
    pub learning_rate: f64,
    pub momentum: f64,
    /// Passes between progress callbacks.
    pub callback_period: usize,
    /// Wall-clock budget for one training call.
    pub timeout_secs: Option<u64>,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            iterations: 10_000,
            error_thresh: 0.005,
            learning_rate: 0.3,
            momentum: 0.1,
            callback_period: 100,
            timeout_secs: None,
        }
    }
}

/// Progress of a training call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainingStatus {
    pub iterations: usize,
    pub error: f64,
}

/// An opaque trainable function.
pub trait Network: Send + Sync {
    /// Train further on `data`, starting from the current weights.
    ///
    /// `progress` is called every `options.callback_period` passes.
    fn train(
        &mut self,
        data: &[TrainingExample],
        options: &TrainingOptions,
        progress: &mut dyn FnMut(&TrainingStatus),
    ) -> Result<TrainingStatus>;

    /// Evaluate the network on one input vector.
    fn run(&self, input: &[f64]) -> Result<Vec<f64>>;

    /// Serialize structure and weights.
    fn to_json(&self) -> Result<Value>;
}

/// Creates and restores networks of one kind.
pub trait NetworkFactory: Send + Sync {
    /// Stable identifier stored in snapshots (e.g. `"feedforward"`).
    fn id(&self) -> &str;

    fn create(&self, options: &NetworkOptions) -> Box<dyn Network>;

    /// Rebuild a network from the output of [`Network::to_json`].
    fn restore(&self, state: &Value) -> Result<Box<dyn Network>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Layer {
    /// `weights[node][input]`
    weights: Vec<Vec<f64>>,
    biases: Vec<f64>,
}

/// Fully connected feed-forward network.
///
/// Layer sizes are fixed on the first training call from the shape of the
/// training data. Later calls keep the learned weights unless the data shape
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedForwardNetwork {
    options: NetworkOptions,
    input_size: usize,
    layers: Vec<Layer>,
}

impl FeedForwardNetwork {
    pub fn new(options: NetworkOptions) -> Self {
        Self {
            options,
            input_size: 0,
            layers: Vec::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.layers.is_empty()
    }

    fn output_size(&self) -> usize {
        self.layers.last().map(|l| l.biases.len()).unwrap_or(0)
    }

    fn initialize(&mut self, input_size: usize, output_size: usize) {
        let mut rng = match self.options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut sizes = vec![input_size];
        sizes.extend(self.options.hidden_layers.iter().copied());
        sizes.push(output_size);

        self.input_size = input_size;
        self.layers = sizes
            .windows(2)
            .map(|pair| {
                let (inputs, nodes) = (pair[0], pair[1]);
                Layer {
                    weights: (0..nodes)
                        .map(|_| (0..inputs).map(|_| rng.gen_range(-0.2..0.2)).collect())
                        .collect(),
                    biases: (0..nodes).map(|_| rng.gen_range(-0.2..0.2)).collect(),
                }
            })
            .collect();
    }

    /// Outputs of every layer, input layer first.
    fn forward(&self, input: &[f64]) -> Vec<Vec<f64>> {
        let activation = self.options.activation;
        let mut outputs = Vec::with_capacity(self.layers.len() + 1);
        outputs.push(input.to_vec());
        for layer in &self.layers {
            let prev = outputs.last().map(Vec::as_slice).unwrap_or(&[]);
            let next = layer
                .weights
                .iter()
                .zip(&layer.biases)
                .map(|(w, b)| {
                    let sum: f64 = w.iter().zip(prev).map(|(w, x)| w * x).sum::<f64>() + b;
                    activation.apply(sum)
                })
                .collect();
            outputs.push(next);
        }
        outputs
    }

    /// One backpropagation step; returns the pattern's mean squared error.
    fn train_pattern(
        &mut self,
        example: &TrainingExample,
        changes: &mut [Vec<Vec<f64>>],
        learning_rate: f64,
        momentum: f64,
    ) -> f64 {
        let activation = self.options.activation;
        let outputs = self.forward(&example.input);
        let depth = self.layers.len();

        let mut deltas: Vec<Vec<f64>> = vec![Vec::new(); depth];
        let mut output_error = 0.0;
        for l in (0..depth).rev() {
            let out = &outputs[l + 1];
            deltas[l] = (0..out.len())
                .map(|node| {
                    let error = if l == depth - 1 {
                        let e = example.output[node] - out[node];
                        output_error += e * e;
                        e
                    } else {
                        let next = &self.layers[l + 1];
                        deltas[l + 1]
                            .iter()
                            .zip(&next.weights)
                            .map(|(d, w)| d * w[node])
                            .sum()
                    };
                    error * activation.derivative(out[node])
                })
                .collect();
        }

        for (l, layer) in self.layers.iter_mut().enumerate() {
            let prev = &outputs[l];
            for (node, delta) in deltas[l].iter().enumerate() {
                for (k, x) in prev.iter().enumerate() {
                    let change = learning_rate * delta * x + momentum * changes[l][node][k];
                    changes[l][node][k] = change;
                    layer.weights[node][k] += change;
                }
                layer.biases[node] += learning_rate * delta;
            }
        }

        output_error / example.output.len().max(1) as f64
    }
}

impl Network for FeedForwardNetwork {
    fn train(
        &mut self,
        data: &[TrainingExample],
        options: &TrainingOptions,
        progress: &mut dyn FnMut(&TrainingStatus),
    ) -> Result<TrainingStatus> {
        let first = match data.first() {
            Some(first) => first,
            None => bail!("no training data"),
        };
        let (input_size, output_size) = (first.input.len(), first.output.len());
        if input_size == 0 || output_size == 0 {
            bail!("training examples must have non-empty input and output");
        }
        if let Some(bad) = data
            .iter()
            .position(|ex| ex.input.len() != input_size || ex.output.len() != output_size)
        {
            bail!(
                "training example {} has shape {}x{}, expected {}x{}",
                bad,
                data[bad].input.len(),
                data[bad].output.len(),
                input_size,
                output_size
            );
        }

        if self.input_size != input_size || self.output_size() != output_size {
            if self.is_initialized() {
                warn!(
                    from_inputs = self.input_size,
                    to_inputs = input_size,
                    "training data shape changed, reinitializing network weights"
                );
            }
            self.initialize(input_size, output_size);
        }

        let mut changes: Vec<Vec<Vec<f64>>> = self
            .layers
            .iter()
            .map(|l| l.weights.iter().map(|w| vec![0.0; w.len()]).collect())
            .collect();

        let started = Instant::now();
        let timeout = options.timeout_secs.map(Duration::from_secs);
        let mut status = TrainingStatus {
            iterations: 0,
            error: 1.0,
        };

        while status.iterations < options.iterations && status.error > options.error_thresh {
            if timeout.is_some_and(|t| started.elapsed() >= t) {
                warn!(iterations = status.iterations, "training timed out");
                break;
            }

            let mut sum = 0.0;
            for example in data {
                sum += self.train_pattern(
                    example,
                    &mut changes,
                    options.learning_rate,
                    options.momentum,
                );
            }
            status.iterations += 1;
            status.error = sum / data.len() as f64;

            if options.callback_period > 0 && status.iterations % options.callback_period == 0 {
                progress(&status);
            }
        }

        Ok(status)
    }

    fn run(&self, input: &[f64]) -> Result<Vec<f64>> {
        if !self.is_initialized() {
            bail!("network has not been trained");
        }
        if input.len() != self.input_size {
            bail!(
                "input has {} values, network expects {}",
                input.len(),
                self.input_size
            );
        }
        Ok(self.forward(input).pop().unwrap_or_default())
    }

    fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Factory for [`FeedForwardNetwork`].
pub struct FeedForwardFactory;

impl NetworkFactory for FeedForwardFactory {
    fn id(&self) -> &str {
        "feedforward"
    }

    fn create(&self, options: &NetworkOptions) -> Box<dyn Network> {
        Box::new(FeedForwardNetwork::new(options.clone()))
    }

    fn restore(&self, state: &Value) -> Result<Box<dyn Network>> {
        let network: FeedForwardNetwork = serde_json::from_value(state.clone())?;
        Ok(Box::new(network))
    }
}
