use std::collections::BTreeSet;

use tracing::instrument;

use crate::context::{ContextChain, LevelContext};
use crate::error::Error;
use crate::primitives::HePrimitives;

///
/// Derives, from the context and secret key at some level `l >= 2`, the
/// context and key at level `l - 1` by one modulus reduction each.
///
/// Both key-chain generation strategies are repeated applications of this
/// function, which is what makes them produce identical chains for the same
/// inputs and seed.
///
pub fn derive_next_level<P: HePrimitives>(
    provider: &P,
    context: &LevelContext,
    key: &P::Key,
) -> Result<(LevelContext, P::Key), Error> {
    let reduced_key = provider.modulus_reduce_key(context, key)?;
    let reduced_context = context.derive_reduced()?;
    return Ok((reduced_context, reduced_key));
}

///
/// The dense secret-key array of a context chain: exactly one key per level
/// `1..=L`, generated strictly top-down since the key at level `l - 1` is the
/// modulus reduction of the key at level `l`.
///
pub struct KeyChain<P: HePrimitives> {
    /// key for level `l` at index `l - 1`
    keys: Vec<P::Key>,
}

impl<P: HePrimitives> KeyChain<P> {
    ///
    /// Generates the key chain below the given top-level context.
    ///
    /// This is the strategy for level counts known only at run time (e.g.
    /// produced by parameter autotuning): a bounded iterative loop over an
    /// opaque level counter, filling level-indexed slots top-down.
    ///
    #[instrument(skip_all)]
    pub fn generate(provider: &P, top_context: &LevelContext) -> Result<KeyChain<P>, Error> {
        top_context.validate()?;
        let L = top_context.level();
        let mut slots: Vec<Option<P::Key>> = (0..L).map(|_| None).collect();

        let mut current_context = top_context.clone();
        let mut current_key = provider.key_gen(&current_context)?;
        while current_context.level() > 1 {
            let (next_context, next_key) = derive_next_level(provider, &current_context, &current_key)?;
            slots[current_context.level() - 1] = Some(current_key);
            current_context = next_context;
            current_key = next_key;
        }
        slots[0] = Some(current_key);

        return Ok(KeyChain {
            keys: slots.into_iter().map(|k| k.unwrap()).collect(),
        });
    }

    ///
    /// Generates the key chain for a context chain fixed at setup time: a
    /// plain reverse iteration over the levels, building the key list
    /// front-to-back and reversing it at the end.
    ///
    /// Produces a chain element-wise equal to [`KeyChain::generate`] for the
    /// same top context and seed.
    ///
    #[instrument(skip_all)]
    pub fn generate_static(provider: &P, chain: &ContextChain) -> Result<KeyChain<P>, Error> {
        let L = chain.len();
        let mut keys_top_down = Vec::with_capacity(L);
        keys_top_down.push(provider.key_gen(chain.top_context())?);
        for level in (2..=L).rev() {
            let context = chain.context_at_level(level)?;
            let (_, reduced) = derive_next_level(provider, context, keys_top_down.last().unwrap())?;
            keys_top_down.push(reduced);
        }
        keys_top_down.reverse();
        return Ok(KeyChain { keys: keys_top_down });
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_at_level(&self, level: usize) -> Result<&P::Key, Error> {
        if level < 1 || level > self.keys.len() {
            return Err(Error::LevelOutOfRange { level, chain_len: self.keys.len() });
        }
        return Ok(&self.keys[level - 1]);
    }
}

///
/// Per-level rotation keys. Entries exist only at levels that were not in the
/// skip set passed to [`RotationKeyChain::generate`]; looking up a skipped
/// level fails with [`Error::MissingRotationKey`] instead of silently
/// substituting a key from a nearby level.
///
pub struct RotationKeyChain<P: HePrimitives> {
    keys: Vec<Option<P::RotationKey>>,
}

impl<P: HePrimitives> RotationKeyChain<P> {
    ///
    /// Generates rotation keys for every level of the chain except those in
    /// `skip_levels`.
    ///
    /// Rotation-key generation is the most expensive key-generation step, so
    /// callers that know no rotation happens at certain depths (e.g. interior
    /// layers of a forward pass that never rotate) pass those levels here to
    /// save setup time.
    ///
    #[instrument(skip_all)]
    pub fn generate(
        provider: &P,
        chain: &ContextChain,
        keys: &KeyChain<P>,
        skip_levels: &BTreeSet<usize>,
    ) -> Result<RotationKeyChain<P>, Error> {
        if chain.len() != keys.len() {
            return Err(Error::invalid_context(format!(
                "context chain has {} levels but key chain has {}",
                chain.len(),
                keys.len()
            )));
        }
        let mut slots: Vec<Option<P::RotationKey>> = (0..chain.len()).map(|_| None).collect();
        for level in (1..=chain.len()).rev() {
            if skip_levels.contains(&level) {
                continue;
            }
            let context = chain.context_at_level(level)?;
            slots[level - 1] = Some(provider.rotation_key_gen(context, keys.key_at_level(level)?)?);
        }
        return Ok(RotationKeyChain { keys: slots });
    }

    pub fn rotation_key_at_level(&self, level: usize) -> Result<&P::RotationKey, Error> {
        if level < 1 || level > self.keys.len() {
            return Err(Error::LevelOutOfRange { level, chain_len: self.keys.len() });
        }
        return self.keys[level - 1].as_ref().ok_or(Error::MissingRotationKey { level });
    }
}

///
/// Per-level fast-rotation keys, generated unconditionally for every level:
/// they are only needed to decrypt already-fast-rotated degree-1 ciphertexts
/// and are cheap to produce, so there is no skip set.
///
pub struct FastRotationKeyChain<P: HePrimitives> {
    keys: Vec<P::FastRotationKey>,
}

impl<P: HePrimitives> FastRotationKeyChain<P> {
    #[instrument(skip_all)]
    pub fn generate(provider: &P, chain: &ContextChain, keys: &KeyChain<P>) -> Result<FastRotationKeyChain<P>, Error> {
        if chain.len() != keys.len() {
            return Err(Error::invalid_context(format!(
                "context chain has {} levels but key chain has {}",
                chain.len(),
                keys.len()
            )));
        }
        let mut generated = Vec::with_capacity(chain.len());
        for level in (1..=chain.len()).rev() {
            let context = chain.context_at_level(level)?;
            generated.push(provider.fast_rotation_key_gen(context, keys.key_at_level(level)?)?);
        }
        generated.reverse();
        return Ok(FastRotationKeyChain { keys: generated });
    }

    pub fn fast_rotation_key_at_level(&self, level: usize) -> Result<&P::FastRotationKey, Error> {
        if level < 1 || level > self.keys.len() {
            return Err(Error::LevelOutOfRange { level, chain_len: self.keys.len() });
        }
        return Ok(&self.keys[level - 1]);
    }
}

#[cfg(test)]
use crate::context::test_context;
#[cfg(test)]
use crate::primitives::SeededPrimitives;

#[test]
fn test_key_chain_completeness() {
    let provider = SeededPrimitives;
    for L in 1..=5 {
        let chain = KeyChain::generate(&provider, &test_context(L)).unwrap();
        assert_eq!(L, chain.len());
        for level in 1..=L {
            assert_eq!(level, chain.key_at_level(level).unwrap().level);
        }
        assert!(matches!(chain.key_at_level(0), Err(Error::LevelOutOfRange { .. })));
        assert!(matches!(chain.key_at_level(L + 1), Err(Error::LevelOutOfRange { .. })));
    }
}

#[test]
fn test_chain_derivation_consistency() {
    let provider = SeededPrimitives;
    let contexts = ContextChain::new(test_context(4)).unwrap();
    let keys = KeyChain::generate(&provider, contexts.top_context()).unwrap();
    for level in 2..=4 {
        let direct = provider
            .modulus_reduce_key(contexts.context_at_level(level).unwrap(), keys.key_at_level(level).unwrap())
            .unwrap();
        assert_eq!(&direct, keys.key_at_level(level - 1).unwrap());
    }
}

#[test]
fn test_generation_strategies_equivalent() {
    let provider = SeededPrimitives;
    let contexts = ContextChain::new(test_context(4)).unwrap();
    let dynamic = KeyChain::generate(&provider, contexts.top_context()).unwrap();
    let fixed = KeyChain::generate_static(&provider, &contexts).unwrap();
    assert_eq!(dynamic.len(), fixed.len());
    for level in 1..=4 {
        assert_eq!(dynamic.key_at_level(level).unwrap(), fixed.key_at_level(level).unwrap());
    }
}

#[test]
fn test_rotation_key_skip_respected() {
    let provider = SeededPrimitives;
    let contexts = ContextChain::new(test_context(4)).unwrap();
    let keys = KeyChain::generate(&provider, contexts.top_context()).unwrap();

    let skip: BTreeSet<usize> = [2, 3].into_iter().collect();
    let rotation_keys = RotationKeyChain::generate(&provider, &contexts, &keys, &skip).unwrap();
    for level in [1, 4] {
        assert_eq!(level, rotation_keys.rotation_key_at_level(level).unwrap().level);
    }
    for level in [2, 3] {
        assert_eq!(
            Err(Error::MissingRotationKey { level }),
            rotation_keys.rotation_key_at_level(level).map(|_| ())
        );
    }
    assert!(matches!(rotation_keys.rotation_key_at_level(5), Err(Error::LevelOutOfRange { .. })));
}

#[test]
fn test_fast_rotation_keys_every_level() {
    let provider = SeededPrimitives;
    let contexts = ContextChain::new(test_context(3)).unwrap();
    let keys = KeyChain::generate(&provider, contexts.top_context()).unwrap();
    let fast = FastRotationKeyChain::generate(&provider, &contexts, &keys).unwrap();
    for level in 1..=3 {
        assert_eq!(level, fast.fast_rotation_key_at_level(level).unwrap().level);
    }
    assert!(matches!(fast.fast_rotation_key_at_level(0), Err(Error::LevelOutOfRange { .. })));
}

#[test]
fn test_invalid_top_context_rejected() {
    let provider = SeededPrimitives;
    let mut ctx = test_context(2);
    ctx.main_moduli.clear();
    assert!(matches!(KeyChain::generate(&provider, &ctx), Err(Error::InvalidContext { .. })));
}
