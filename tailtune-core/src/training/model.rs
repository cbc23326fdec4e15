//! The `Model` contract and the built-in probe heads.
//!
//! Heavy feature extraction happens upstream; the heads here train on
//! pre-extracted feature vectors so runs and studies work end to end
//! without a tensor runtime.

use crate::error::{Result, TuneError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Dense row-major tensor used for persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Named tensors plus scalar bookkeeping. Used for model, optimizer and
/// scheduler state alike.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    #[serde(default)]
    pub tensors: BTreeMap<String, Tensor>,
    #[serde(default)]
    pub scalars: BTreeMap<String, f64>,
}

impl StateDict {
    pub fn scalar(&self, key: &str) -> Option<f64> {
        self.scalars.get(key).copied()
    }

    pub fn require_scalar(&self, key: &str) -> Result<f64> {
        self.scalar(key)
            .ok_or_else(|| TuneError::resume_mismatch(format!("state is missing scalar '{key}'")))
    }
}

/// A trainable parameter and its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub shape: Vec<usize>,
    pub value: Vec<f32>,
    pub grad: Vec<f32>,
}

impl Parameter {
    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            value: vec![0.0; len],
            grad: vec![0.0; len],
        }
    }

    /// Uniform init in `±1/sqrt(fan_in)`.
    pub fn uniform(name: impl Into<String>, shape: Vec<usize>, fan_in: usize, rng: &mut ChaCha8Rng) -> Self {
        let mut p = Self::zeros(name, shape);
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        for v in &mut p.value {
            *v = rng.gen_range(-bound..bound);
        }
        p
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// Class scores for a batch, row-major `[batch, num_classes]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    pub batch: usize,
    pub num_classes: usize,
    pub values: Vec<f32>,
}

impl Logits {
    pub fn zeros(batch: usize, num_classes: usize) -> Self {
        Self {
            batch,
            num_classes,
            values: vec![0.0; batch * num_classes],
        }
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.values[i * self.num_classes..(i + 1) * self.num_classes]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.values[i * self.num_classes..(i + 1) * self.num_classes]
    }

    /// Index of the highest score in row `i`.
    pub fn argmax(&self, i: usize) -> usize {
        self.row(i)
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(bi, bv), (j, v)| {
                if *v > bv { (j, *v) } else { (bi, bv) }
            })
            .0
    }
}

/// A trainable classifier.
///
/// `forward` caches whatever `backward` needs; `backward` adds into the
/// parameter gradients, which the caller zeroes between batches.
pub trait Model: Send {
    type Input;

    fn name(&self) -> &str;

    fn num_classes(&self) -> usize;

    fn forward(&mut self, inputs: &[Self::Input]) -> Result<Logits>;

    fn backward(&mut self, grad: &Logits) -> Result<()>;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn set_training(&mut self, _training: bool) {}

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    fn state_dict(&self) -> StateDict {
        let tensors = self
            .parameters()
            .into_iter()
            .map(|p| {
                (
                    p.name.clone(),
                    Tensor {
                        shape: p.shape.clone(),
                        data: p.value.clone(),
                    },
                )
            })
            .collect();
        StateDict {
            tensors,
            scalars: BTreeMap::new(),
        }
    }

    /// Restore parameters. Names and shapes must match exactly.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let expected = self.parameters().len();
        if state.tensors.len() != expected {
            return Err(TuneError::resume_mismatch(format!(
                "checkpoint has {} tensors, model '{}' has {expected}",
                state.tensors.len(),
                self.name()
            )));
        }
        let model_name = self.name().to_string();
        for p in self.parameters_mut() {
            let tensor = state.tensors.get(&p.name).ok_or_else(|| {
                TuneError::resume_mismatch(format!(
                    "checkpoint has no tensor '{}' for model '{model_name}'",
                    p.name
                ))
            })?;
            if tensor.shape != p.shape || tensor.data.len() != p.value.len() {
                return Err(TuneError::resume_mismatch(format!(
                    "tensor '{}' has shape {:?} in checkpoint but {:?} in model '{model_name}'",
                    p.name, tensor.shape, p.shape
                )));
            }
            p.value.copy_from_slice(&tensor.data);
        }
        Ok(())
    }

    /// Stable hash of the model name and every parameter's name and shape.
    fn architecture_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name().as_bytes());
        for p in self.parameters() {
            hasher.update(p.name.as_bytes());
            for d in &p.shape {
                hasher.update((*d as u64).to_le_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Boxed model over feature vectors, as produced by the registry.
pub type FeatureModel = Box<dyn Model<Input = Vec<f32>>>;

fn check_inputs(inputs: &[Vec<f32>], dim: usize, model: &str) -> Result<()> {
    for (i, x) in inputs.iter().enumerate() {
        if x.len() != dim {
            return Err(TuneError::dataset(format!(
                "{model}: input {i} has {} features, expected {dim}",
                x.len()
            )));
        }
    }
    Ok(())
}

fn affine(x: &[f32], weight: &Parameter, bias: &Parameter, out: &mut [f32]) {
    let fan_in = x.len();
    for (o, slot) in out.iter_mut().enumerate() {
        let row = &weight.value[o * fan_in..(o + 1) * fan_in];
        *slot = bias.value[o] + row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>();
    }
}

/// Accumulate gradients of `y = W x + b` and return `dL/dx`.
fn affine_backward(x: &[f32], grad_out: &[f32], weight: &mut Parameter, bias: &mut Parameter) -> Vec<f32> {
    let fan_in = x.len();
    let mut grad_in = vec![0.0; fan_in];
    for (o, g) in grad_out.iter().enumerate() {
        bias.grad[o] += g;
        let base = o * fan_in;
        for j in 0..fan_in {
            weight.grad[base + j] += g * x[j];
            grad_in[j] += g * weight.value[base + j];
        }
    }
    grad_in
}

/// Single affine layer on top of frozen features.
pub struct LinearProbe {
    input_dim: usize,
    num_classes: usize,
    weight: Parameter,
    bias: Parameter,
    cache: Vec<Vec<f32>>,
}

impl LinearProbe {
    pub fn new(input_dim: usize, num_classes: usize, seed: u64) -> Result<Self> {
        if input_dim == 0 || num_classes == 0 {
            return Err(TuneError::config(
                "linear_probe needs a positive input dimension and class count",
            ));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Ok(Self {
            input_dim,
            num_classes,
            weight: Parameter::uniform("fc.weight", vec![num_classes, input_dim], input_dim, &mut rng),
            bias: Parameter::uniform("fc.bias", vec![num_classes], input_dim, &mut rng),
            cache: Vec::new(),
        })
    }
}

impl Model for LinearProbe {
    type Input = Vec<f32>;

    fn name(&self) -> &str {
        "linear_probe"
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(&mut self, inputs: &[Vec<f32>]) -> Result<Logits> {
        check_inputs(inputs, self.input_dim, self.name())?;
        let mut logits = Logits::zeros(inputs.len(), self.num_classes);
        for (i, x) in inputs.iter().enumerate() {
            affine(x, &self.weight, &self.bias, logits.row_mut(i));
        }
        self.cache = inputs.to_vec();
        Ok(logits)
    }

    fn backward(&mut self, grad: &Logits) -> Result<()> {
        if grad.batch != self.cache.len() {
            return Err(TuneError::training("backward called without a matching forward pass"));
        }
        for (i, x) in self.cache.iter().enumerate() {
            affine_backward(x, grad.row(i), &mut self.weight, &mut self.bias);
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// Two-layer ReLU head.
pub struct MlpProbe {
    input_dim: usize,
    hidden_dim: usize,
    num_classes: usize,
    fc1_weight: Parameter,
    fc1_bias: Parameter,
    fc2_weight: Parameter,
    fc2_bias: Parameter,
    cache: Vec<(Vec<f32>, Vec<f32>)>,
}

impl MlpProbe {
    pub fn new(input_dim: usize, hidden_dim: usize, num_classes: usize, seed: u64) -> Result<Self> {
        if input_dim == 0 || hidden_dim == 0 || num_classes == 0 {
            return Err(TuneError::config(
                "mlp_probe needs positive input, hidden and class dimensions",
            ));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Ok(Self {
            input_dim,
            hidden_dim,
            num_classes,
            fc1_weight: Parameter::uniform("fc1.weight", vec![hidden_dim, input_dim], input_dim, &mut rng),
            fc1_bias: Parameter::uniform("fc1.bias", vec![hidden_dim], input_dim, &mut rng),
            fc2_weight: Parameter::uniform("fc2.weight", vec![num_classes, hidden_dim], hidden_dim, &mut rng),
            fc2_bias: Parameter::uniform("fc2.bias", vec![num_classes], hidden_dim, &mut rng),
            cache: Vec::new(),
        })
    }
}

impl Model for MlpProbe {
    type Input = Vec<f32>;

    fn name(&self) -> &str {
        "mlp_probe"
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(&mut self, inputs: &[Vec<f32>]) -> Result<Logits> {
        check_inputs(inputs, self.input_dim, self.name())?;
        let mut logits = Logits::zeros(inputs.len(), self.num_classes);
        self.cache.clear();
        for (i, x) in inputs.iter().enumerate() {
            let mut hidden = vec![0.0; self.hidden_dim];
            affine(x, &self.fc1_weight, &self.fc1_bias, &mut hidden);
            hidden.iter_mut().for_each(|h| *h = h.max(0.0));
            affine(&hidden, &self.fc2_weight, &self.fc2_bias, logits.row_mut(i));
            self.cache.push((x.clone(), hidden));
        }
        Ok(logits)
    }

    fn backward(&mut self, grad: &Logits) -> Result<()> {
        if grad.batch != self.cache.len() {
            return Err(TuneError::training("backward called without a matching forward pass"));
        }
        for (i, (x, hidden)) in self.cache.iter().enumerate() {
            let mut grad_hidden =
                affine_backward(hidden, grad.row(i), &mut self.fc2_weight, &mut self.fc2_bias);
            // ReLU: no gradient through inactive units.
            for (g, h) in grad_hidden.iter_mut().zip(hidden) {
                if *h <= 0.0 {
                    *g = 0.0;
                }
            }
            affine_backward(x, &grad_hidden, &mut self.fc1_weight, &mut self.fc1_bias);
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.fc1_weight, &self.fc1_bias, &self.fc2_weight, &self.fc2_bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![
            &mut self.fc1_weight,
            &mut self.fc1_bias,
            &mut self.fc2_weight,
            &mut self.fc2_bias,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_forward_shape_and_determinism() {
        let mut a = LinearProbe::new(3, 2, 11).unwrap();
        let mut b = LinearProbe::new(3, 2, 11).unwrap();
        let x = vec![vec![1.0, 0.0, -1.0], vec![0.5, 0.5, 0.5]];
        let la = a.forward(&x).unwrap();
        assert_eq!(la.batch, 2);
        assert_eq!(la.num_classes, 2);
        assert_eq!(la, b.forward(&x).unwrap());
    }

    #[test]
    fn test_wrong_input_dim_is_rejected() {
        let mut model = LinearProbe::new(3, 2, 0).unwrap();
        assert!(model.forward(&[vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_linear_backward_accumulates_weight_gradients() {
        let mut model = LinearProbe::new(2, 2, 5).unwrap();
        let x = vec![vec![0.3, -0.7]];
        // Loss = sum of logits row 0 weighted by [1, 0], so dL/dW[0][j] = x[j].
        model.forward(&x).unwrap();
        let mut grad = Logits::zeros(1, 2);
        grad.row_mut(0)[0] = 1.0;
        model.backward(&grad).unwrap();
        assert_eq!(model.weight.grad, vec![0.3, -0.7, 0.0, 0.0]);
        assert_eq!(model.bias.grad, vec![1.0, 0.0]);
    }

    #[test]
    fn test_state_dict_roundtrip_and_shape_mismatch() {
        let source = MlpProbe::new(4, 8, 3, 1).unwrap();
        let mut target = MlpProbe::new(4, 8, 3, 2).unwrap();
        target.load_state_dict(&source.state_dict()).unwrap();
        assert_eq!(target.state_dict(), source.state_dict());

        let mut wider = MlpProbe::new(4, 16, 3, 2).unwrap();
        let err = wider.load_state_dict(&source.state_dict()).unwrap_err();
        assert!(matches!(err, TuneError::ResumeMismatch(_)));
    }

    #[test]
    fn test_architecture_fingerprint_tracks_shapes() {
        let a = MlpProbe::new(4, 8, 3, 1).unwrap();
        let b = MlpProbe::new(4, 8, 3, 99).unwrap();
        let c = MlpProbe::new(4, 9, 3, 1).unwrap();
        let d = LinearProbe::new(4, 3, 1).unwrap();
        assert_eq!(a.architecture_fingerprint(), b.architecture_fingerprint());
        assert_ne!(a.architecture_fingerprint(), c.architecture_fingerprint());
        assert_ne!(a.architecture_fingerprint(), d.architecture_fingerprint());
    }

    #[test]
    fn test_argmax() {
        let logits = Logits {
            batch: 1,
            num_classes: 3,
            values: vec![0.1, 2.0, -1.0],
        };
        assert_eq!(logits.argmax(0), 1);
    }
}
