use oorandom::Rand64;

use crate::context::LevelContext;
use crate::error::Error;

///
/// The substitution power generating rotations by one slot; rotating by `k`
/// slots uses the power `5^k mod 2N`. This method of rotation only permutes
/// within each half of the slots, so a shift of at most `N/2 - 1` is
/// expressible.
///
pub const ROTATION_BASE_POWER: usize = 5;

///
/// Capability interface to an external HE primitive provider.
///
/// This crate never implements ciphertext or key arithmetic itself; it only
/// organizes the key material a provider produces into per-level chains (see
/// [`crate::keychain`]). A production implementation would wrap an RLWE
/// library; [`SeededPrimitives`] is a deterministic, insecure stand-in used
/// by the tests of this crate.
///
/// All operations take the context of the level they operate at explicitly;
/// there is no implicit "current level" anywhere in this interface.
///
pub trait HePrimitives {
    type Key;
    type RotationKey;
    type FastRotationKey;

    ///
    /// Generates a fresh secret key valid at `context.level()`.
    ///
    fn key_gen(&self, context: &LevelContext) -> Result<Self::Key, Error>;

    ///
    /// Derives from a key at `context.level()` the matching key at
    /// `context.level() - 1`, by dropping one modulus from the key material.
    ///
    fn modulus_reduce_key(&self, context: &LevelContext, key: &Self::Key) -> Result<Self::Key, Error>;

    ///
    /// Generates the rotation (Galois) key material enabling cyclic slot
    /// rotation of ciphertexts at `context.level()`. This is by far the most
    /// expensive key-generation step.
    ///
    fn rotation_key_gen(&self, context: &LevelContext, key: &Self::Key) -> Result<Self::RotationKey, Error>;

    ///
    /// Generates the key material for decrypting fast-rotated ciphertexts at
    /// `context.level()`. Fast rotation is only valid for degree-1
    /// ciphertexts (i.e. not immediately after a multiplication), and its
    /// decryption key is much cheaper to produce than a full rotation key.
    ///
    fn fast_rotation_key_gen(&self, context: &LevelContext, key: &Self::Key) -> Result<Self::FastRotationKey, Error>;
}

///
/// Secret key of [`SeededPrimitives`]: a ternary coefficient vector plus the
/// level it is valid at. As in RLWE schemes, modulus reduction keeps the
/// secret coefficients and only drops a modulus, so the coefficient vector is
/// shared along the whole key chain while the level changes.
///
#[derive(Clone, Debug, PartialEq)]
pub struct SeededKey {
    pub level: usize,
    pub coeffs: Vec<i8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SeededRotationKey {
    pub level: usize,
    /// one entry per expressible shift, as `(substitution_power, masks)` with
    /// one mask per main modulus
    pub entries: Vec<(usize, Vec<u64>)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SeededFastRotationKey {
    pub level: usize,
    pub component: Vec<u64>,
}

///
/// Deterministic, insecure reference implementation of [`HePrimitives`].
///
/// Key material is a function of `(context.seed, level)` only, which makes
/// the provider suitable for testing the key-chain invariants (in particular
/// the equivalence of the two generation strategies) without pulling in a
/// real RLWE backend. Do not use outside of tests and examples.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct SeededPrimitives;

const KEYGEN_TAG: u64 = 0x6b657967;
const ROTKEY_TAG: u64 = 0x726f746b;
const FASTROT_TAG: u64 = 0x66726f74;

impl SeededPrimitives {
    fn rng_for(context: &LevelContext, tag: u64) -> Rand64 {
        let seed = ((context.seed as u128) << 64) | ((tag ^ (context.level() as u64)) as u128);
        return Rand64::new(seed);
    }

    fn check_key_level(context: &LevelContext, key: &SeededKey) -> Result<(), Error> {
        if key.level != context.level() {
            return Err(Error::invalid_context(format!(
                "key at level {} cannot be used with a context at level {}",
                key.level,
                context.level()
            )));
        }
        return Ok(());
    }
}

impl HePrimitives for SeededPrimitives {
    type Key = SeededKey;
    type RotationKey = SeededRotationKey;
    type FastRotationKey = SeededFastRotationKey;

    fn key_gen(&self, context: &LevelContext) -> Result<SeededKey, Error> {
        context.validate()?;
        let mut rng = Self::rng_for(context, KEYGEN_TAG);
        // uniform ternary secret
        let coeffs = (0..context.ring_degree()).map(|_| (rng.rand_u64() % 3) as i8 - 1).collect();
        return Ok(SeededKey { level: context.level(), coeffs });
    }

    fn modulus_reduce_key(&self, context: &LevelContext, key: &SeededKey) -> Result<SeededKey, Error> {
        context.validate()?;
        Self::check_key_level(context, key)?;
        if context.level() == 1 {
            return Err(Error::invalid_context("cannot modulus-reduce a key below level 1"));
        }
        return Ok(SeededKey { level: key.level - 1, coeffs: key.coeffs.clone() });
    }

    fn rotation_key_gen(&self, context: &LevelContext, key: &SeededKey) -> Result<SeededRotationKey, Error> {
        context.validate()?;
        Self::check_key_level(context, key)?;
        let mut rng = Self::rng_for(context, ROTKEY_TAG);
        let num_keys = context.ring_degree() / 2;
        let two_n = 2 * context.ring_degree();
        let mut entries = Vec::with_capacity(num_keys.saturating_sub(1));
        let mut sub_power = ROTATION_BASE_POWER;
        for _ in 1..num_keys {
            let masks = context
                .main_moduli
                .iter()
                .map(|q| {
                    let s = key.coeffs.iter().map(|c| *c as i64).sum::<i64>();
                    (rng.rand_u64() ^ s as u64) % *q
                })
                .collect();
            entries.push((sub_power, masks));
            sub_power = sub_power * ROTATION_BASE_POWER % two_n;
        }
        return Ok(SeededRotationKey { level: context.level(), entries });
    }

    fn fast_rotation_key_gen(&self, context: &LevelContext, key: &SeededKey) -> Result<SeededFastRotationKey, Error> {
        context.validate()?;
        Self::check_key_level(context, key)?;
        let mut rng = Self::rng_for(context, FASTROT_TAG);
        let component = (0..context.main_moduli.len()).map(|_| rng.rand_u64()).collect();
        return Ok(SeededFastRotationKey { level: context.level(), component });
    }
}

#[cfg(test)]
use crate::context::test_context;

#[test]
fn test_key_gen_deterministic_in_seed_and_level() {
    let ctx = test_context(3);
    let provider = SeededPrimitives;
    assert_eq!(provider.key_gen(&ctx).unwrap(), provider.key_gen(&ctx).unwrap());

    let mut other_seed = ctx.clone();
    other_seed.seed += 1;
    assert_ne!(provider.key_gen(&ctx).unwrap(), provider.key_gen(&other_seed).unwrap());
}

#[test]
fn test_modulus_reduce_keeps_secret_coefficients() {
    let ctx = test_context(3);
    let provider = SeededPrimitives;
    let key = provider.key_gen(&ctx).unwrap();
    let reduced = provider.modulus_reduce_key(&ctx, &key).unwrap();
    assert_eq!(2, reduced.level);
    assert_eq!(key.coeffs, reduced.coeffs);
}

#[test]
fn test_wrong_level_key_rejected() {
    let chain_top = test_context(3);
    let provider = SeededPrimitives;
    let key = provider.key_gen(&chain_top).unwrap();
    let reduced_ctx = chain_top.derive_reduced().unwrap();
    // key is at level 3, context at level 2
    assert!(provider.rotation_key_gen(&reduced_ctx, &key).is_err());
    assert!(provider.modulus_reduce_key(&reduced_ctx, &key).is_err());
}

#[test]
fn test_rotation_key_substitution_power_chain() {
    let ctx = test_context(2);
    let provider = SeededPrimitives;
    let key = provider.key_gen(&ctx).unwrap();
    let rot = provider.rotation_key_gen(&ctx, &key).unwrap();

    let two_n = 2 * ctx.ring_degree();
    let mut expected_power = ROTATION_BASE_POWER;
    assert_eq!(ctx.ring_degree() / 2 - 1, rot.entries.len());
    for (power, masks) in &rot.entries {
        assert_eq!(expected_power, *power);
        assert_eq!(ctx.main_moduli.len(), masks.len());
        expected_power = expected_power * ROTATION_BASE_POWER % two_n;
    }
}
