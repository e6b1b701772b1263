use ndarray::{Array1, Array2};
use tracing::instrument;

use crate::error::Error;
use crate::nn::{one_hot, Loss};

///
/// Deterministic worst-case rounding of `values` to the fixed-point grid
/// `1 / scaling_factor`: every value is rounded away from zero to the next
/// grid point, which models the maximum quantization error a fixed-point
/// scaled encoding could introduce. A non-finite scaling factor means the
/// values were never fixed-point encoded, and the input is returned as-is.
///
pub fn worst_case_rounding(values: &Array2<f64>, scaling_factor: f64) -> Array2<f64> {
    if !scaling_factor.is_finite() {
        return values.clone();
    }
    return values.mapv(|v| {
        if v >= 0.0 {
            (v * scaling_factor).ceil() / scaling_factor
        } else {
            (v * scaling_factor).floor() / scaling_factor
        }
    });
}

///
/// Upper-bounds the per-example gradient L2 norm of a prediction batch
/// without access to the true label, by exhaustively enumerating every
/// possible one-hot label.
///
/// For each class `c` in `0..num_classes` the residual
/// `worst_case_rounding(prediction) - onehot(c)` is pushed through
/// `backward_sq_norms`, which must return the per-example squared gradient
/// norms aggregated over all trainable weights (see
/// [`crate::nn::Sequential::backward_sq_norms`]). The result is the maximum
/// per-example norm over all classes and all non-padded examples, and is
/// therefore valid whichever label is the true one.
///
/// The enumeration is a strictly sequential bounded loop over exactly
/// `num_classes` steps; no early exit is possible since any class could be
/// the true label. The final `end_pad` rows of the batch are synthetic
/// padding and are excluded before the per-batch maximum is taken.
///
/// Fails with [`Error::UnsupportedLoss`] unless the loss is one of the two
/// kinds whose output-layer gradient is the plain residual. For
/// [`Loss::MeanSquaredError`] the residual is in principle unbounded; the
/// bound is still computed from the residual, and accounting for that (by
/// clipping or by scaling the noise) is the caller's responsibility.
///
#[instrument(skip_all)]
pub fn worst_case_sensitivity<F>(
    prediction: &Array2<f64>,
    loss: Loss,
    scaling_factor: f64,
    num_classes: usize,
    end_pad: usize,
    mut backward_sq_norms: F,
) -> Result<f64, Error>
where
    F: FnMut(&Array2<f64>) -> Array1<f64>,
{
    if !loss.is_supported() {
        return Err(Error::UnsupportedLoss { loss });
    }
    if prediction.shape()[1] != num_classes {
        return Err(Error::ShapeMismatch {
            expected: vec![prediction.shape()[0], num_classes],
            actual: prediction.shape().to_vec(),
        });
    }
    let rounded_prediction = worst_case_rounding(prediction, scaling_factor);
    let valid_rows = prediction.shape()[0].saturating_sub(end_pad);

    let mut sensitivity = 0.0_f64;
    for class in 0..num_classes {
        let possible_label = one_hot(class, num_classes);
        let residual = &rounded_prediction - &possible_label;
        let sq_norms = backward_sq_norms(&residual);
        let max_norm = sq_norms
            .iter()
            .take(valid_rows)
            .fold(0.0_f64, |max, sq| max.max(sq.sqrt()));
        sensitivity = sensitivity.max(max_norm);
    }
    return Ok(sensitivity);
}

#[cfg(test)]
use ndarray::{array, Axis};

#[cfg(test)]
fn identity_model_sq_norms(residual: &Array2<f64>) -> Array1<f64> {
    residual.mapv(|v| v * v).sum_axis(Axis(1))
}

#[test]
fn test_worst_case_rounding_moves_away_from_zero() {
    let values = array![[0.1, -0.1, 0.0], [1.0, 0.015625, -0.999]];
    let rounded = worst_case_rounding(&values, 64.0);
    for (v, r) in values.iter().zip(rounded.iter()) {
        assert!(r.abs() >= v.abs());
        assert!((r - v).abs() <= 1.0 / 64.0 + 1e-12);
        // already on the grid stays put
        assert_eq!(*r, worst_case_rounding(&array![[*r]], 64.0)[[0, 0]]);
    }
    assert_eq!(7.0 / 64.0, rounded[[0, 0]]);
    assert_eq!(-7.0 / 64.0, rounded[[0, 1]]);
    assert_eq!(0.0, rounded[[0, 2]]);
    assert_eq!(1.0, rounded[[1, 0]]);
}

#[test]
fn test_infinite_scaling_factor_is_identity() {
    let values = array![[0.123, -0.456], [0.789, -0.012]];
    assert_eq!(values, worst_case_rounding(&values, f64::INFINITY));
}

#[test]
fn test_unsupported_loss_rejected() {
    let prediction = Array2::zeros((2, 3));
    let result = worst_case_sensitivity(&prediction, Loss::Hinge, 64.0, 3, 0, identity_model_sq_norms);
    assert_eq!(Err(Error::UnsupportedLoss { loss: Loss::Hinge }), result);
}

#[test]
fn test_bound_dominates_every_concrete_label() {
    let prediction = array![
        [0.7, 0.2, 0.1],
        [0.1, 0.8, 0.1],
        [0.3, 0.3, 0.4]
    ];
    let bound = worst_case_sensitivity(
        &prediction,
        Loss::CategoricalCrossEntropySoftmax,
        64.0,
        3,
        0,
        identity_model_sq_norms,
    )
    .unwrap();

    // the true gradient norm for any concrete one-hot labeling stays below
    // the worst-case bound
    for class in 0..3 {
        let labels = one_hot(class, 3);
        let residual = &prediction - &labels;
        let true_max_norm = identity_model_sq_norms(&residual)
            .iter()
            .fold(0.0_f64, |max, sq| max.max(sq.sqrt()));
        assert!(
            true_max_norm <= bound,
            "class {}: true norm {} exceeds bound {}",
            class, true_max_norm, bound
        );
    }
}

#[test]
fn test_padded_rows_excluded() {
    // the padded row would dominate the maximum if it were counted
    let prediction = array![[0.5, 0.5], [100.0, -100.0]];
    let bound = worst_case_sensitivity(
        &prediction,
        Loss::CategoricalCrossEntropySoftmax,
        f64::INFINITY,
        2,
        1,
        identity_model_sq_norms,
    )
    .unwrap();
    // max residual over class 0/1 for row 0 only: (0.5 - 1, 0.5) -> sqrt(0.5)
    assert!((bound - 0.5_f64.sqrt()).abs() < 1e-12);
}

#[test]
fn test_every_class_evaluated_exactly_once() {
    let prediction = Array2::from_elem((2, 5), 0.2);
    let mut calls = 0usize;
    let bound = worst_case_sensitivity(
        &prediction,
        Loss::MeanSquaredError,
        f64::INFINITY,
        5,
        0,
        |residual| {
            calls += 1;
            identity_model_sq_norms(residual)
        },
    )
    .unwrap();
    assert_eq!(5, calls);
    assert!(bound > 0.0);
}

#[test]
fn test_class_count_shape_checked() {
    let prediction = Array2::zeros((2, 3));
    assert!(matches!(
        worst_case_sensitivity(&prediction, Loss::MeanSquaredError, 64.0, 4, 0, identity_model_sq_norms),
        Err(Error::ShapeMismatch { .. })
    ));
}
