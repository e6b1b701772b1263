#![allow(non_snake_case)]

#![doc = include_str!("../Readme.md")]

pub use error::Error;

///
/// The typed failure taxonomy of this crate. Every error is a deterministic
/// input-validation failure; none are transient, and none are ever worked
/// around by substituting a nearby valid input.
///
pub mod error;

///
/// [`context::LevelContext`] and [`context::ContextChain`]: the per-level
/// parameter sets of a leveled-HE modulus chain.
///
pub mod context;

///
/// The [`primitives::HePrimitives`] capability trait through which an
/// external HE library supplies key generation, key modulus reduction and
/// rotation-key generation, plus a deterministic seeded stand-in.
///
pub mod primitives;

///
/// Per-level key chains: secret keys at every level, rotation keys at every
/// non-skipped level, fast-rotation keys at every level.
///
pub mod keychain;

///
/// Explicit compute targets for batch shards.
///
pub mod device;

///
/// Gradient contracts of the network layers: forward passes with tapes,
/// batch-reduced backward passes, per-example gradient norms.
///
pub mod nn;

///
/// Worst-case-label sensitivity analysis bounding the per-example gradient
/// norm independently of the true label.
///
pub mod sensitivity;

///
/// The gradient pipeline orchestrator: device sharding, sensitivity
/// analysis, true backward pass.
///
pub mod pipeline;

///
/// Gaussian noise sized from a sensitivity bound and a noise multiplier.
///
pub mod dp;
