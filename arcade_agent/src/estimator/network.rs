//! Small fully-connected Q-network: ReLU hidden layers, linear output,
//! mean-squared-error loss, Adam optimizer.

use anyhow::{anyhow, Result};
use ndarray::{Array, Array1, Array2, ArrayView1, Axis, Dimension, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPSILON: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Dense {
    /// `(inputs, outputs)`
    weights: Array2<f64>,
    bias: Array1<f64>,
}

/// First and second moment estimates for one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Moments {
    m_weights: Array2<f64>,
    v_weights: Array2<f64>,
    m_bias: Array1<f64>,
    v_bias: Array1<f64>,
}

impl Moments {
    fn zeros_like(layer: &Dense) -> Self {
        Self {
            m_weights: Array2::zeros(layer.weights.raw_dim()),
            v_weights: Array2::zeros(layer.weights.raw_dim()),
            m_bias: Array1::zeros(layer.bias.raw_dim()),
            v_bias: Array1::zeros(layer.bias.raw_dim()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QNetwork {
    layers: Vec<Dense>,
    moments: Vec<Moments>,
    learning_rate: f64,
    /// Adam time step.
    step: u64,
}

impl QNetwork {
    /// He-uniform initialised network `input -> hidden... -> output`.
    pub fn new<R: Rng>(
        input_size: usize,
        hidden_sizes: &[usize],
        output_size: usize,
        learning_rate: f64,
        rng: &mut R,
    ) -> Self {
        let mut dims = Vec::with_capacity(hidden_sizes.len() + 2);
        dims.push(input_size);
        dims.extend_from_slice(hidden_sizes);
        dims.push(output_size);

        let layers: Vec<Dense> = dims
            .windows(2)
            .map(|pair| {
                let (fan_in, fan_out) = (pair[0], pair[1]);
                let limit = (6.0 / fan_in.max(1) as f64).sqrt();
                Dense {
                    weights: Array2::from_shape_fn((fan_in, fan_out), |_| {
                        rng.gen_range(-limit..limit)
                    }),
                    bias: Array1::zeros(fan_out),
                }
            })
            .collect();
        let moments = layers.iter().map(Moments::zeros_like).collect();

        Self {
            layers,
            moments,
            learning_rate,
            step: 0,
        }
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map_or(0, |l| l.weights.nrows())
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map_or(0, |l| l.weights.ncols())
    }

    pub fn hidden_sizes(&self) -> Vec<usize> {
        let n = self.layers.len();
        self.layers
            .iter()
            .take(n.saturating_sub(1))
            .map(|l| l.weights.ncols())
            .collect()
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Change the Adam step size. Moments and the step counter are kept.
    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// Number of optimizer steps taken so far.
    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Single-sample forward pass.
    pub fn predict(&self, input: ArrayView1<f64>) -> Array1<f64> {
        let last = self.layers.len().saturating_sub(1);
        let mut activation = input.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            activation = activation.dot(&layer.weights) + &layer.bias;
            if i < last {
                activation.mapv_inplace(relu);
            }
        }
        activation
    }

    /// Forward pass over a `(batch, inputs)` matrix.
    pub fn predict_batch(&self, inputs: &Array2<f64>) -> Array2<f64> {
        let (_, activations) = self.forward(inputs);
        activations
            .last()
            .cloned()
            .unwrap_or_else(|| inputs.clone())
    }

    /// Pre-activations and activations of every layer; `activations[0]` is the input.
    fn forward(&self, inputs: &Array2<f64>) -> (Vec<Array2<f64>>, Vec<Array2<f64>>) {
        let last = self.layers.len().saturating_sub(1);
        let mut pre = Vec::with_capacity(self.layers.len());
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(inputs.clone());

        for (i, layer) in self.layers.iter().enumerate() {
            let z = activations[i].dot(&layer.weights) + &layer.bias;
            let a = if i < last { z.mapv(relu) } else { z.clone() };
            pre.push(z);
            activations.push(a);
        }
        (pre, activations)
    }

    /// One Adam step on the mean squared error between the network output
    /// and `targets`. Returns the loss measured before the step.
    pub fn fit_batch(&mut self, inputs: &Array2<f64>, targets: &Array2<f64>) -> Result<f64> {
        if inputs.ncols() != self.input_size() {
            return Err(anyhow!(
                "Input width {} does not match network input size {}",
                inputs.ncols(),
                self.input_size()
            ));
        }
        if targets.dim() != (inputs.nrows(), self.output_size()) {
            return Err(anyhow!(
                "Target shape {:?} does not match ({}, {})",
                targets.dim(),
                inputs.nrows(),
                self.output_size()
            ));
        }
        if inputs.nrows() == 0 {
            return Err(anyhow!("Cannot fit an empty batch"));
        }

        let (pre, activations) = self.forward(inputs);
        let output = &activations[self.layers.len()];
        let error = output - targets;
        let count = error.len() as f64;
        let loss = error.mapv(|e| e * e).sum() / count;

        // dL/dy for L = mean((y - t)^2)
        let mut delta = error * (2.0 / count);
        let mut gradients = Vec::with_capacity(self.layers.len());
        for i in (0..self.layers.len()).rev() {
            let grad_weights = activations[i].t().dot(&delta);
            let grad_bias = delta.sum_axis(Axis(0));
            if i > 0 {
                let mask = pre[i - 1].mapv(|z| if z > 0.0 { 1.0 } else { 0.0 });
                delta = delta.dot(&self.layers[i].weights.t()) * &mask;
            }
            gradients.push((grad_weights, grad_bias));
        }
        gradients.reverse();

        self.step += 1;
        let t = self.step as f64;
        let lr_t = self.learning_rate * (1.0 - BETA2.powf(t)).sqrt() / (1.0 - BETA1.powf(t));
        for ((layer, moments), (grad_weights, grad_bias)) in self
            .layers
            .iter_mut()
            .zip(self.moments.iter_mut())
            .zip(gradients.iter())
        {
            adam_update(
                &mut layer.weights,
                grad_weights,
                &mut moments.m_weights,
                &mut moments.v_weights,
                lr_t,
            );
            adam_update(
                &mut layer.bias,
                grad_bias,
                &mut moments.m_bias,
                &mut moments.v_bias,
                lr_t,
            );
        }

        Ok(loss)
    }
}

fn relu(x: f64) -> f64 {
    x.max(0.0)
}

fn adam_update<D: Dimension>(
    param: &mut Array<f64, D>,
    grad: &Array<f64, D>,
    m: &mut Array<f64, D>,
    v: &mut Array<f64, D>,
    lr_t: f64,
) {
    Zip::from(param)
        .and(grad)
        .and(m)
        .and(v)
        .for_each(|p, &g, m, v| {
            *m = BETA1 * *m + (1.0 - BETA1) * g;
            *v = BETA2 * *v + (1.0 - BETA2) * g * g;
            *p -= lr_t * *m / (v.sqrt() + EPSILON);
        });
}
