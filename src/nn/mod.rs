use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::Error;

///
/// Loss kinds a caller can configure. Only
/// [`Loss::CategoricalCrossEntropySoftmax`] and [`Loss::MeanSquaredError`]
/// are supported by the gradient pipeline: both reduce the output-layer
/// gradient to the residual `predictions - labels`, which is the property
/// the sensitivity analysis relies on. The remaining kinds are recognized so
/// that configuration errors surface as [`Error::UnsupportedLoss`] instead
/// of a panic.
///
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Loss {
    /// categorical cross-entropy composed with a softmax output activation;
    /// the softmax is fused into the loss and never applied as a layer
    /// activation
    CategoricalCrossEntropySoftmax,
    /// mean squared error; note that its residual is unbounded, so callers
    /// must account for clipping or noise scale themselves (this crate does
    /// not clip)
    MeanSquaredError,
    BinaryCrossEntropy,
    Hinge,
}

impl Loss {
    pub fn is_supported(&self) -> bool {
        matches!(self, Loss::CategoricalCrossEntropySoftmax | Loss::MeanSquaredError)
    }

    ///
    /// Whether predictions under this loss are the softmax of the final
    /// layer's pre-activation output.
    ///
    pub fn uses_softmax_output(&self) -> bool {
        matches!(self, Loss::CategoricalCrossEntropySoftmax)
    }

    ///
    /// The output-layer gradient `dJ/dz = predictions - labels`, valid for
    /// exactly the two supported loss kinds.
    ///
    pub fn residual(&self, predictions: &Array2<f64>, labels: &Array2<f64>) -> Result<Array2<f64>, Error> {
        match self {
            Loss::CategoricalCrossEntropySoftmax | Loss::MeanSquaredError => {
                if predictions.shape() != labels.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: predictions.shape().to_vec(),
                        actual: labels.shape().to_vec(),
                    });
                }
                return Ok(predictions - labels);
            }
            other => Err(Error::UnsupportedLoss { loss: *other }),
        }
    }
}

///
/// Numerically stable row-wise softmax.
///
pub fn softmax(logits: &Array2<f64>) -> Array2<f64> {
    let mut result = logits.clone();
    for mut row in result.rows_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    return result;
}

pub fn one_hot(class: usize, num_classes: usize) -> Array1<f64> {
    let mut row = Array1::zeros(num_classes);
    row[class] = 1.0;
    return row;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Linear,
    Relu,
}

impl Activation {
    fn apply(&self, pre_activation: &Array2<f64>) -> Array2<f64> {
        match self {
            Activation::Linear => pre_activation.clone(),
            Activation::Relu => pre_activation.mapv(|v| v.max(0.0)),
        }
    }

    fn grad_through(&self, pre_activation: &Array2<f64>, grad_out: &Array2<f64>) -> Array2<f64> {
        match self {
            Activation::Linear => grad_out.clone(),
            Activation::Relu => grad_out * &pre_activation.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
        }
    }
}

///
/// A batch-reduced gradient for one trainable weight tensor.
///
#[derive(Clone, Debug, PartialEq)]
pub enum WeightGrad {
    Matrix(Array2<f64>),
    Vector(Array1<f64>),
}

impl WeightGrad {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            WeightGrad::Matrix(g) => g.shape().to_vec(),
            WeightGrad::Vector(g) => g.shape().to_vec(),
        }
    }

    pub fn map_values<F: Fn(f64) -> f64>(&self, f: F) -> WeightGrad {
        match self {
            WeightGrad::Matrix(g) => WeightGrad::Matrix(g.mapv(|v| f(v))),
            WeightGrad::Vector(g) => WeightGrad::Vector(g.mapv(|v| f(v))),
        }
    }
}

///
/// The intermediate a layer caches during the forward pass for use by its
/// backward pass: its input batch and its pre-activation output.
///
pub struct LayerCache {
    pub input: Array2<f64>,
    pub pre_activation: Array2<f64>,
}

///
/// Result of one layer's backward step.
///
/// `per_example_sq_norm[i]` is the squared L2 norm of the gradient example
/// `i` alone contributes to this layer's trainable weights. The pipeline
/// never materializes a dense per-example weight-gradient tensor; for a
/// dense layer the per-example weight gradient is the outer product
/// `x_i ⊗ dz_i`, whose squared Frobenius norm is `|x_i|^2 * |dz_i|^2`, so
/// the scalar can be accumulated directly.
///
pub struct LayerBackward {
    /// batch-reduced gradients, one per trainable weight of this layer
    pub weight_grads: Vec<WeightGrad>,
    pub input_grad: Array2<f64>,
    pub per_example_sq_norm: Array1<f64>,
}

///
/// Gradient contract of a network layer. Layers are stateless across calls:
/// the forward pass returns its cache instead of storing it, so shards on
/// different devices can traverse the same layers concurrently with
/// shard-local tapes.
///
pub trait Layer: Send + Sync {
    fn forward(&self, device: &Device, input: &Array2<f64>) -> (Array2<f64>, LayerCache);

    fn backward(&self, device: &Device, cache: &LayerCache, grad_out: &Array2<f64>) -> LayerBackward;

    ///
    /// Like [`Layer::backward`], but only produces the per-example squared
    /// gradient norms and the input gradient. The sensitivity analysis calls
    /// this once per candidate label, so skipping the batch-reduced weight
    /// gradients saves one matrix product per layer per class.
    ///
    fn backward_sq_norm(&self, device: &Device, cache: &LayerCache, grad_out: &Array2<f64>) -> (Array1<f64>, Array2<f64>);

    fn weight_shapes(&self) -> Vec<Vec<usize>>;
}

///
/// A fully connected layer `y = act(x W + b)` with weights of shape
/// `[in_features, out_features]`.
///
pub struct Dense {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
    pub activation: Activation,
}

impl Dense {
    pub fn new(weights: Array2<f64>, bias: Array1<f64>, activation: Activation) -> Self {
        assert_eq!(weights.shape()[1], bias.len());
        Dense { weights, bias, activation }
    }

    fn pre_activation_grad(&self, cache: &LayerCache, grad_out: &Array2<f64>) -> Array2<f64> {
        self.activation.grad_through(&cache.pre_activation, grad_out)
    }

    fn sq_norm_contribution(cache: &LayerCache, dz: &Array2<f64>) -> Array1<f64> {
        let input_sq = cache.input.mapv(|v| v * v).sum_axis(Axis(1));
        let dz_sq = dz.mapv(|v| v * v).sum_axis(Axis(1));
        // weight grad norm |x_i|^2 |dz_i|^2 plus bias grad norm |dz_i|^2
        return &input_sq * &dz_sq + &dz_sq;
    }
}

impl Layer for Dense {
    fn forward(&self, _device: &Device, input: &Array2<f64>) -> (Array2<f64>, LayerCache) {
        let pre_activation = input.dot(&self.weights) + &self.bias;
        let output = self.activation.apply(&pre_activation);
        return (output, LayerCache { input: input.clone(), pre_activation });
    }

    fn backward(&self, _device: &Device, cache: &LayerCache, grad_out: &Array2<f64>) -> LayerBackward {
        let dz = self.pre_activation_grad(cache, grad_out);
        let dweights = cache.input.t().dot(&dz);
        let dbias = dz.sum_axis(Axis(0));
        let input_grad = dz.dot(&self.weights.t());
        let per_example_sq_norm = Self::sq_norm_contribution(cache, &dz);
        return LayerBackward {
            weight_grads: vec![WeightGrad::Matrix(dweights), WeightGrad::Vector(dbias)],
            input_grad,
            per_example_sq_norm,
        };
    }

    fn backward_sq_norm(&self, _device: &Device, cache: &LayerCache, grad_out: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
        let dz = self.pre_activation_grad(cache, grad_out);
        let input_grad = dz.dot(&self.weights.t());
        return (Self::sq_norm_contribution(cache, &dz), input_grad);
    }

    fn weight_shapes(&self) -> Vec<Vec<usize>> {
        vec![self.weights.shape().to_vec(), vec![self.bias.len()]]
    }
}

///
/// The forward-pass record of one shard: one [`LayerCache`] per layer, in
/// layer order.
///
pub struct Tape {
    pub caches: Vec<LayerCache>,
}

impl Tape {
    ///
    /// Drops the last `pad` rows from every cached intermediate. Used by the
    /// orchestrator to exclude synthetic padding rows of the final shard
    /// before gradients are computed.
    ///
    pub fn trim_end(&mut self, pad: usize) {
        if pad == 0 {
            return;
        }
        for cache in &mut self.caches {
            let rows = cache.input.shape()[0] - pad;
            cache.input = cache.input.slice(ndarray::s![..rows, ..]).to_owned();
            cache.pre_activation = cache.pre_activation.slice(ndarray::s![..rows, ..]).to_owned();
        }
    }

    ///
    /// Stacks per-shard tapes back into one tape for the whole batch,
    /// preserving shard order.
    ///
    pub fn concat(tapes: Vec<Tape>) -> Tape {
        assert!(!tapes.is_empty());
        let num_layers = tapes[0].caches.len();
        let mut caches = Vec::with_capacity(num_layers);
        for layer_i in 0..num_layers {
            let inputs: Vec<_> = tapes.iter().map(|t| t.caches[layer_i].input.view()).collect();
            let pre_activations: Vec<_> = tapes.iter().map(|t| t.caches[layer_i].pre_activation.view()).collect();
            caches.push(LayerCache {
                input: ndarray::concatenate(Axis(0), &inputs).unwrap(),
                pre_activation: ndarray::concatenate(Axis(0), &pre_activations).unwrap(),
            });
        }
        return Tape { caches };
    }
}

///
/// Aggregated result of a full backward pass: batch-reduced gradients in
/// forward layer order, plus the per-example squared gradient norms summed
/// over all layers.
///
pub struct ModelBackward {
    pub weight_grads: Vec<WeightGrad>,
    pub per_example_sq_norm: Array1<f64>,
}

///
/// An ordered chain of layers. Holds no per-batch state; all intermediates
/// live in the [`Tape`] returned by [`Sequential::forward`].
///
pub struct Sequential {
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Self {
        assert!(!layers.is_empty());
        Sequential { layers }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn weight_shapes(&self) -> Vec<Vec<usize>> {
        self.layers.iter().flat_map(|l| l.weight_shapes()).collect()
    }

    ///
    /// Forward pass over the whole layer chain. The returned output is the
    /// final layer's activation output without any softmax; the caller fuses
    /// the softmax into the loss when appropriate.
    ///
    pub fn forward(&self, device: &Device, input: &Array2<f64>) -> (Array2<f64>, Tape) {
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut current = input.clone();
        for layer in &self.layers {
            let (output, cache) = layer.forward(device, &current);
            caches.push(cache);
            current = output;
        }
        return (current, Tape { caches });
    }

    ///
    /// Full backward pass from the output-layer gradient `dJ_dz`, in reverse
    /// layer order. Gradients are returned in forward layer order, one per
    /// trainable weight.
    ///
    pub fn backward(&self, device: &Device, tape: &Tape, dJ_dz: &Array2<f64>) -> ModelBackward {
        assert_eq!(self.layers.len(), tape.caches.len());
        let mut grads_reversed = Vec::new();
        let mut per_example_sq_norm = Array1::zeros(dJ_dz.shape()[0]);
        let mut grad = dJ_dz.clone();
        for (layer, cache) in self.layers.iter().rev().zip(tape.caches.iter().rev()) {
            let step = layer.backward(device, cache, &grad);
            grads_reversed.extend(step.weight_grads.into_iter().rev());
            per_example_sq_norm = per_example_sq_norm + step.per_example_sq_norm;
            grad = step.input_grad;
        }
        grads_reversed.reverse();
        return ModelBackward { weight_grads: grads_reversed, per_example_sq_norm };
    }

    ///
    /// Per-example squared gradient norms for the given output-layer
    /// gradient, without materializing any weight gradients. This is the
    /// backward function the sensitivity analysis enumerates labels with.
    ///
    pub fn backward_sq_norms(&self, device: &Device, tape: &Tape, dJ_dz: &Array2<f64>) -> Array1<f64> {
        assert_eq!(self.layers.len(), tape.caches.len());
        let mut per_example_sq_norm = Array1::zeros(dJ_dz.shape()[0]);
        let mut grad = dJ_dz.clone();
        for (layer, cache) in self.layers.iter().rev().zip(tape.caches.iter().rev()) {
            let (sq_norm, input_grad) = layer.backward_sq_norm(device, cache, &grad);
            per_example_sq_norm = per_example_sq_norm + sq_norm;
            grad = input_grad;
        }
        return per_example_sq_norm;
    }
}

#[cfg(test)]
use ndarray::array;

#[cfg(test)]
fn two_layer_model(in_features: usize, hidden: usize, out_classes: usize, seed: u128) -> Sequential {
    let mut rng = oorandom::Rand64::new(seed);
    let mut next = move || rng.rand_float() - 0.5;
    let w1 = Array2::from_shape_fn((in_features, hidden), |_| next());
    let b1 = Array1::from_shape_fn(hidden, |_| next());
    let w2 = Array2::from_shape_fn((hidden, out_classes), |_| next());
    let b2 = Array1::from_shape_fn(out_classes, |_| next());
    Sequential::new(vec![
        Box::new(Dense::new(w1, b1, Activation::Relu)),
        Box::new(Dense::new(w2, b2, Activation::Linear)),
    ])
}

#[cfg(test)]
fn mse_loss(model: &Sequential, device: &Device, x: &Array2<f64>, y: &Array2<f64>) -> f64 {
    let (pred, _) = model.forward(device, x);
    (&pred - y).mapv(|v| v * v).sum() / 2.0
}

#[test]
fn test_softmax_rows_sum_to_one() {
    let logits = array![[1.0, 2.0, 3.0], [-5.0, 0.0, 5.0]];
    let probs = softmax(&logits);
    for row in probs.rows() {
        assert!((row.sum() - 1.0).abs() < 1e-12);
        assert!(row.iter().all(|p| *p > 0.0 && *p < 1.0));
    }
    // invariant under shifting the logits
    let shifted = softmax(&logits.mapv(|v| v + 100.0));
    assert!((&probs - &shifted).mapv(f64::abs).sum() < 1e-9);
}

#[test]
fn test_residual_shape_mismatch() {
    let predictions = Array2::zeros((4, 3));
    let labels = Array2::zeros((4, 2));
    assert!(matches!(
        Loss::CategoricalCrossEntropySoftmax.residual(&predictions, &labels),
        Err(Error::ShapeMismatch { .. })
    ));
    assert!(matches!(
        Loss::Hinge.residual(&predictions, &predictions.clone()),
        Err(Error::UnsupportedLoss { loss: Loss::Hinge })
    ));
}

#[test]
fn test_dense_backward_matches_finite_differences() {
    let device = Device::cpu(0);
    let mut rng = oorandom::Rand64::new(7);
    let mut next = move || rng.rand_float() - 0.5;
    let w1 = Array2::from_shape_fn((3, 4), |_| next());
    let b1 = Array1::from_shape_fn(4, |_| next());
    let w2 = Array2::from_shape_fn((4, 2), |_| next());
    let b2 = Array1::from_shape_fn(2, |_| next());
    let build = |w1: Array2<f64>, b1: Array1<f64>, w2: Array2<f64>, b2: Array1<f64>| {
        Sequential::new(vec![
            Box::new(Dense::new(w1, b1, Activation::Relu)) as Box<dyn Layer>,
            Box::new(Dense::new(w2, b2, Activation::Linear)),
        ])
    };
    let x = array![[0.3, -0.8, 0.5], [1.2, 0.1, -0.4], [-0.7, 0.9, 0.2]];
    let y = array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0]];

    let model = build(w1.clone(), b1.clone(), w2.clone(), b2.clone());
    let (pred, tape) = model.forward(&device, &x);
    let dJ_dz = &pred - &y;
    let backward = model.backward(&device, &tape, &dJ_dz);

    let eps = 1e-6;
    // check every weight coordinate of the first dense layer
    let analytic = match &backward.weight_grads[0] {
        WeightGrad::Matrix(g) => g.clone(),
        _ => unreachable!(),
    };
    for i in 0..3 {
        for j in 0..4 {
            let mut w_plus = w1.clone();
            w_plus[[i, j]] += eps;
            let plus = mse_loss(&build(w_plus, b1.clone(), w2.clone(), b2.clone()), &device, &x, &y);
            let mut w_minus = w1.clone();
            w_minus[[i, j]] -= eps;
            let minus = mse_loss(&build(w_minus, b1.clone(), w2.clone(), b2.clone()), &device, &x, &y);
            let numeric = (plus - minus) / (2.0 * eps);
            assert!(
                (numeric - analytic[[i, j]]).abs() < 1e-5,
                "grad mismatch at ({}, {}): numeric {} vs analytic {}",
                i, j, numeric, analytic[[i, j]]
            );
        }
    }
}

#[test]
fn test_per_example_norms_match_single_row_backward() {
    let device = Device::cpu(0);
    let model = two_layer_model(3, 5, 4, 11);
    let x = array![[0.3, -0.8, 0.5], [1.2, 0.1, -0.4], [-0.7, 0.9, 0.2]];
    let y = array![
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 1.0, 0.0, 0.0]
    ];

    let (pred, tape) = model.forward(&device, &x);
    let dJ_dz = &pred - &y;
    let batched_norms = model.backward_sq_norms(&device, &tape, &dJ_dz);

    for i in 0..3 {
        let xi = x.slice(ndarray::s![i..i + 1, ..]).to_owned();
        let (pred_i, tape_i) = model.forward(&device, &xi);
        let dJ_dz_i = &pred_i - &y.slice(ndarray::s![i..i + 1, ..]);
        let single = model.backward(&device, &tape_i, &dJ_dz_i);
        let direct_sq_norm: f64 = single
            .weight_grads
            .iter()
            .map(|g| match g {
                WeightGrad::Matrix(m) => m.mapv(|v| v * v).sum(),
                WeightGrad::Vector(v) => v.mapv(|c| c * c).sum(),
            })
            .sum();
        assert!(
            (batched_norms[i] - direct_sq_norm).abs() < 1e-9,
            "example {}: accumulated {} vs direct {}",
            i, batched_norms[i], direct_sq_norm
        );
    }
}

#[test]
fn test_tape_concat_and_trim() {
    let device = Device::cpu(0);
    let model = two_layer_model(3, 4, 2, 3);
    let x1 = Array2::from_elem((2, 3), 0.5);
    let x2 = Array2::from_elem((3, 3), -0.25);

    let (_, t1) = model.forward(&device, &x1);
    let (_, mut t2) = model.forward(&device, &x2);
    t2.trim_end(1);
    let combined = Tape::concat(vec![t1, t2]);
    assert_eq!(2, combined.caches.len());
    assert_eq!(&[4, 3], combined.caches[0].input.shape());
    assert_eq!(&[4, 4], combined.caches[0].pre_activation.shape());
}
