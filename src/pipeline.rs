use ndarray::{concatenate, s, Array2, Axis};
use rayon::prelude::*;
use tracing::instrument;

use crate::device::Device;
use crate::error::Error;
use crate::nn::{softmax, Loss, Sequential, Tape, WeightGrad};
use crate::sensitivity::worst_case_sensitivity;

///
/// Successful result of [`GradientPipeline::compute_gradients`].
///
pub struct GradientComputation {
    /// batch-reduced gradients, one per trainable weight, in forward layer
    /// order and with shapes matching the weights
    pub gradients: Vec<WeightGrad>,
    /// upper bound on the L2 norm of the gradient any single (non-padded)
    /// example could have produced, for any possible label; computed
    /// entirely independent of the true labels
    pub sensitivity_bound: f64,
    /// predictions for the original batch, in original order and without
    /// padding rows; softmax-activated when the loss fuses a softmax
    pub predictions: Array2<f64>,
}

///
/// Drives the data-parallel gradient computation: shard the batch across the
/// configured devices, run forward pass and sensitivity analysis per shard,
/// combine the per-shard bounds, and run the true backward pass once.
///
/// The devices list is fixed at construction; the orchestrator owns the
/// shard-to-device assignment and components below it never infer placement.
///
pub struct GradientPipeline {
    devices: Vec<Device>,
    loss: Loss,
}

impl GradientPipeline {
    pub fn new(devices: Vec<Device>, loss: Loss) -> Self {
        assert!(!devices.is_empty());
        GradientPipeline { devices, loss }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    ///
    /// Splits `features` along the batch dimension into `num_shards`
    /// equally sized shards, zero-padding the end of the batch if its size
    /// does not divide evenly. Returns the shards and `end_pad`, the number
    /// of synthetic rows appended to the final shard.
    ///
    pub fn split_with_padding(features: &Array2<f64>, num_shards: usize) -> (Vec<Array2<f64>>, usize) {
        let batch = features.shape()[0];
        let columns = features.shape()[1];
        assert!(batch > 0);
        let shard_size = batch.div_ceil(num_shards);
        let end_pad = shard_size * num_shards - batch;

        let mut padded = Array2::zeros((batch + end_pad, columns));
        padded.slice_mut(s![..batch, ..]).assign(features);
        let shards = (0..num_shards)
            .map(|i| padded.slice(s![i * shard_size..(i + 1) * shard_size, ..]).to_owned())
            .collect();
        return (shards, end_pad);
    }

    ///
    /// Computes `(gradients, sensitivity bound, predictions)` for one batch.
    ///
    /// `scaling_factor` is the fixed-point scaling factor of the label
    /// encoding, used for the worst-case rounding in the sensitivity
    /// analysis; pass `f64::INFINITY` when the labels are not fixed-point
    /// encoded.
    ///
    /// The per-shard forward passes and sensitivity analyses run in parallel
    /// (one task per device); they share the layer weights read-only and
    /// write only shard-local tapes, and are joined before predictions are
    /// reassembled in original batch order. The sensitivity bound is the
    /// maximum over all shards, and because the analysis enumerates every
    /// possible label it is `>=` the per-example norm of the true backward
    /// pass under the supported loss/activation pairings.
    ///
    #[instrument(skip_all)]
    pub fn compute_gradients(
        &self,
        model: &Sequential,
        features: &Array2<f64>,
        labels: &Array2<f64>,
        scaling_factor: f64,
    ) -> Result<GradientComputation, Error> {
        if !self.loss.is_supported() {
            return Err(Error::UnsupportedLoss { loss: self.loss });
        }

        let num_shards = self.devices.len();
        let batch = features.shape()[0];
        let (shards, _end_pad) = Self::split_with_padding(features, num_shards);
        let shard_size = shards[0].shape()[0];

        let shard_results: Result<Vec<(Array2<f64>, f64, Tape)>, Error> = shards
            .par_iter()
            .enumerate()
            .map(|(i, shard)| {
                let device = &self.devices[i];
                let (output, mut tape) = model.forward(device, shard);
                let prediction = if self.loss.uses_softmax_output() { softmax(&output) } else { output };

                // padding rows sit at the end of the batch; usually that is
                // only the final shard, but for very small batches a whole
                // trailing shard can be synthetic
                let valid = shard_size.min(batch.saturating_sub(i * shard_size));
                let pad = shard_size - valid;
                let num_classes = prediction.shape()[1];
                let bound = worst_case_sensitivity(
                    &prediction,
                    self.loss,
                    scaling_factor,
                    num_classes,
                    pad,
                    |residual| model.backward_sq_norms(device, &tape, residual),
                )?;

                tape.trim_end(pad);
                let valid_rows = prediction.shape()[0] - pad;
                let prediction = prediction.slice(s![..valid_rows, ..]).to_owned();
                return Ok((prediction, bound, tape));
            })
            .collect();
        let shard_results = shard_results?;

        let predictions = concatenate(
            Axis(0),
            &shard_results.iter().map(|(p, _, _)| p.view()).collect::<Vec<_>>(),
        )
        .unwrap();
        let sensitivity_bound = shard_results.iter().map(|(_, b, _)| *b).fold(0.0_f64, f64::max);

        if predictions.shape() != labels.shape() {
            return Err(Error::ShapeMismatch {
                expected: predictions.shape().to_vec(),
                actual: labels.shape().to_vec(),
            });
        }
        let dJ_dz = self.loss.residual(&predictions, labels)?;

        let tape = Tape::concat(shard_results.into_iter().map(|(_, _, t)| t).collect());
        let backward = model.backward(&self.devices[0], &tape, &dJ_dz);

        return Ok(GradientComputation {
            gradients: backward.weight_grads,
            sensitivity_bound,
            predictions,
        });
    }
}

#[cfg(test)]
use crate::nn::{Activation, Dense};
#[cfg(test)]
use ndarray::Array1;

#[cfg(test)]
fn init_test_tracing() {
    use tracing_subscriber::prelude::*;
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
fn classifier_model(in_features: usize, hidden: usize, out_classes: usize, seed: u128) -> Sequential {
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
fn random_batch(rows: usize, columns: usize, seed: u128) -> Array2<f64> {
    let mut rng = oorandom::Rand64::new(seed);
    Array2::from_shape_fn((rows, columns), |_| rng.rand_float() * 2.0 - 1.0)
}

#[cfg(test)]
fn one_hot_labels(classes: &[usize], num_classes: usize) -> Array2<f64> {
    let mut labels = Array2::zeros((classes.len(), num_classes));
    for (i, c) in classes.iter().enumerate() {
        labels[[i, *c]] = 1.0;
    }
    labels
}

#[test]
fn test_split_with_padding() {
    let features = random_batch(10, 4, 1);
    let (shards, end_pad) = GradientPipeline::split_with_padding(&features, 3);
    assert_eq!(3, shards.len());
    assert_eq!(2, end_pad);
    for shard in &shards {
        assert_eq!(&[4, 4], shard.shape());
    }
    // padding rows are zero
    assert!(shards[2].slice(s![2.., ..]).iter().all(|v| *v == 0.0));

    let (shards, end_pad) = GradientPipeline::split_with_padding(&features, 2);
    assert_eq!(0, end_pad);
    assert_eq!(&[5, 4], shards[0].shape());
}

#[test]
fn test_end_to_end_classification() {
    // makes the spans of the instrumented pipeline stages visible under
    // `cargo test -- --nocapture`
    init_test_tracing();
    let devices = vec![Device::cpu(0), Device::cpu(1)];
    let pipeline = GradientPipeline::new(devices, Loss::CategoricalCrossEntropySoftmax);
    let model = classifier_model(12, 16, 10, 5);
    let features = random_batch(8, 12, 2);
    let labels = one_hot_labels(&[0, 3, 1, 9, 5, 5, 2, 7], 10);

    let result = pipeline.compute_gradients(&model, &features, &labels, 64.0).unwrap();

    assert_eq!(&[8, 10], result.predictions.shape());
    for row in result.predictions.rows() {
        assert!((row.sum() - 1.0).abs() < 1e-9);
    }
    assert!(result.sensitivity_bound >= 0.0);

    let expected_shapes = model.weight_shapes();
    assert_eq!(expected_shapes.len(), result.gradients.len());
    for (grad, shape) in result.gradients.iter().zip(expected_shapes) {
        assert_eq!(shape, grad.shape());
    }
}

#[test]
fn test_padding_rows_do_not_leak_into_results() {
    // batch of 10 over 3 devices: shards of 4/4/2 plus 2 padding rows
    let devices = vec![Device::cpu(0), Device::cpu(1), Device::cpu(2)];
    let pipeline = GradientPipeline::new(devices, Loss::CategoricalCrossEntropySoftmax);
    let model = classifier_model(6, 8, 4, 9);
    let features = random_batch(10, 6, 4);
    let labels = one_hot_labels(&[0, 1, 2, 3, 0, 1, 2, 3, 0, 1], 4);

    let result = pipeline.compute_gradients(&model, &features, &labels, f64::INFINITY).unwrap();
    assert_eq!(&[10, 4], result.predictions.shape());

    // same batch on a single device must produce the same predictions,
    // gradients and bound
    let single = GradientPipeline::new(vec![Device::cpu(0)], Loss::CategoricalCrossEntropySoftmax);
    let reference = single.compute_gradients(&model, &features, &labels, f64::INFINITY).unwrap();
    assert!((&result.predictions - &reference.predictions).mapv(f64::abs).sum() < 1e-9);
    assert!((result.sensitivity_bound - reference.sensitivity_bound).abs() < 1e-9);
    assert_eq!(reference.gradients.len(), result.gradients.len());
    for (a, b) in result.gradients.iter().zip(reference.gradients.iter()) {
        match (a, b) {
            (WeightGrad::Matrix(x), WeightGrad::Matrix(y)) => {
                assert!((x - y).mapv(f64::abs).sum() < 1e-9)
            }
            (WeightGrad::Vector(x), WeightGrad::Vector(y)) => {
                assert!((x - y).mapv(f64::abs).sum() < 1e-9)
            }
            _ => panic!("gradient kinds diverge"),
        }
    }
}

#[test]
fn test_padding_spanning_multiple_shards() {
    // batch of 5 over 4 devices: shards of 2, with 3 synthetic rows, one
    // of which fills a whole trailing shard
    let devices = (0..4).map(Device::cpu).collect();
    let pipeline = GradientPipeline::new(devices, Loss::CategoricalCrossEntropySoftmax);
    let model = classifier_model(3, 6, 2, 17);
    let features = random_batch(5, 3, 21);
    let labels = one_hot_labels(&[0, 1, 0, 1, 0], 2);

    let result = pipeline.compute_gradients(&model, &features, &labels, f64::INFINITY).unwrap();
    assert_eq!(&[5, 2], result.predictions.shape());
    assert!(result.sensitivity_bound >= 0.0);
}

#[test]
fn test_sensitivity_bound_dominates_true_backward() {
    let devices = vec![Device::cpu(0), Device::cpu(1)];
    let pipeline = GradientPipeline::new(devices, Loss::CategoricalCrossEntropySoftmax);
    let model = classifier_model(5, 7, 3, 13);
    let features = random_batch(6, 5, 8);
    let labels = one_hot_labels(&[2, 0, 1, 1, 2, 0], 3);

    let result = pipeline.compute_gradients(&model, &features, &labels, f64::INFINITY).unwrap();

    // recompute the true per-example norms directly
    let device = Device::cpu(0);
    let (output, tape) = model.forward(&device, &features);
    let predictions = softmax(&output);
    let dJ_dz = &predictions - &labels;
    let backward = model.backward(&device, &tape, &dJ_dz);
    let true_max_norm = backward
        .per_example_sq_norm
        .iter()
        .fold(0.0_f64, |max, sq| max.max(sq.sqrt()));

    assert!(
        result.sensitivity_bound >= true_max_norm - 1e-12,
        "bound {} is below the true norm {}",
        result.sensitivity_bound, true_max_norm
    );
}

#[test]
fn test_unsupported_loss_never_produces_gradients() {
    let pipeline = GradientPipeline::new(vec![Device::cpu(0)], Loss::BinaryCrossEntropy);
    let model = classifier_model(4, 4, 2, 1);
    let features = random_batch(4, 4, 1);
    let labels = one_hot_labels(&[0, 1, 0, 1], 2);
    assert_eq!(
        Err(Error::UnsupportedLoss { loss: Loss::BinaryCrossEntropy }),
        pipeline.compute_gradients(&model, &features, &labels, 64.0).map(|_| ())
    );
}

#[test]
fn test_label_shape_mismatch_rejected() {
    let pipeline = GradientPipeline::new(vec![Device::cpu(0)], Loss::MeanSquaredError);
    let model = classifier_model(4, 4, 3, 1);
    let features = random_batch(4, 4, 6);
    let labels = one_hot_labels(&[0, 1], 3);
    assert!(matches!(
        pipeline.compute_gradients(&model, &features, &labels, 64.0),
        Err(Error::ShapeMismatch { .. })
    ));
}
