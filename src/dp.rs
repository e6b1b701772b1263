use rand::{CryptoRng, Rng};
use rand_distr::StandardNormal;
use tracing::instrument;

use crate::nn::WeightGrad;

///
/// The standard deviation of the Gaussian mechanism for a gradient whose
/// per-example L2 norm is bounded by `sensitivity` (as produced by the
/// sensitivity analysis) and a caller-chosen noise multiplier.
///
pub fn gaussian_noise_stddev(sensitivity: f64, noise_multiplier: f64) -> f64 {
    sensitivity * noise_multiplier
}

///
/// Adds independent Gaussian noise `N(0, (sensitivity * noise_multiplier)^2)`
/// to every coordinate of the batch-reduced gradients, which is the step
/// that makes the released gradients differentially private. Must run on the
/// party that holds the gradients before they leave it.
///
/// Note that under [`crate::nn::Loss::MeanSquaredError`] the sensitivity
/// bound does not account for the unbounded residual; in that case the
/// caller must clip or scale before relying on this mechanism.
///
#[instrument(skip_all)]
pub fn noise_gradients<R: Rng + CryptoRng>(
    mut rng: R,
    gradients: &[WeightGrad],
    sensitivity: f64,
    noise_multiplier: f64,
) -> Vec<WeightGrad> {
    let stddev = gaussian_noise_stddev(sensitivity, noise_multiplier);
    return gradients
        .iter()
        .map(|grad| match grad {
            WeightGrad::Matrix(g) => {
                WeightGrad::Matrix(g.mapv(|v| v + stddev * rng.sample::<f64, _>(StandardNormal)))
            }
            WeightGrad::Vector(g) => {
                WeightGrad::Vector(g.mapv(|v| v + stddev * rng.sample::<f64, _>(StandardNormal)))
            }
        })
        .collect();
}

#[cfg(test)]
use ndarray::{Array1, Array2};
#[cfg(test)]
use rand::rngs::StdRng;
#[cfg(test)]
use rand::SeedableRng;

#[cfg(test)]
fn sample_grads() -> Vec<WeightGrad> {
    vec![
        WeightGrad::Matrix(Array2::from_elem((3, 2), 1.0)),
        WeightGrad::Vector(Array1::from_elem(2, -0.5)),
    ]
}

#[test]
fn test_zero_multiplier_leaves_gradients_unchanged() {
    let grads = sample_grads();
    let noised = noise_gradients(StdRng::seed_from_u64(1), &grads, 2.5, 0.0);
    assert_eq!(grads, noised);
}

#[test]
fn test_noise_is_deterministic_under_seeded_rng() {
    let grads = sample_grads();
    let a = noise_gradients(StdRng::seed_from_u64(7), &grads, 1.0, 1.1);
    let b = noise_gradients(StdRng::seed_from_u64(7), &grads, 1.0, 1.1);
    let c = noise_gradients(StdRng::seed_from_u64(8), &grads, 1.0, 1.1);
    assert_eq!(a, b);
    assert_ne!(a, c);
    for (orig, noised) in grads.iter().zip(a.iter()) {
        assert_eq!(orig.shape(), noised.shape());
        assert_ne!(orig, noised);
    }
}

#[test]
fn test_noise_scale_tracks_sensitivity() {
    let grads = vec![WeightGrad::Matrix(Array2::zeros((100, 100)))];
    let noised = noise_gradients(StdRng::seed_from_u64(3), &grads, 2.0, 0.5);
    let values = match &noised[0] {
        WeightGrad::Matrix(g) => g,
        _ => unreachable!(),
    };
    let n = values.len() as f64;
    let mean = values.sum() / n;
    let var = values.mapv(|v| (v - mean) * (v - mean)).sum() / n;
    // stddev should be about sensitivity * multiplier = 1.0
    assert!(mean.abs() < 0.05, "sample mean {} too far from 0", mean);
    assert!((var.sqrt() - 1.0).abs() < 0.05, "sample stddev {} too far from 1", var.sqrt());
}
