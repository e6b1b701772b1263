use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::Error;

///
/// An immutable parameter set for one level of a leveled-HE modulus chain.
///
/// Contexts at adjacent levels differ only in the main-moduli list: deriving
/// the context one level down drops the last main modulus. The level of a
/// context is the number of its main moduli, so level `L` has the most
/// remaining multiplicative depth and level `1` is the shallowest usable
/// context.
///
/// Note that this struct only describes parameters; all arithmetic over them
/// is performed by an exchangeable [`crate::primitives::HePrimitives`]
/// implementation.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelContext {
    /// log2 of the polynomial ring degree
    pub log_n: usize,
    /// ordered main moduli; one is dropped per modulus reduction
    pub main_moduli: Vec<u64>,
    /// auxiliary moduli, unchanged across reductions
    pub aux_moduli: Vec<u64>,
    pub plaintext_modulus: u64,
    pub noise_variance: f64,
    /// fixed-point scaling factor of the plaintext encoding
    pub scaling_factor: f64,
    /// PRNG seed; key generation at a given level is deterministic in
    /// `(seed, level)`
    pub seed: u64,
}

impl LevelContext {
    ///
    /// The level of this context, i.e. its position in the modulus chain.
    ///
    pub fn level(&self) -> usize {
        self.main_moduli.len()
    }

    ///
    /// The polynomial ring degree `N = 2^log_n`. Note that the number of
    /// plaintext slot halves is `N / 2`, not `N`.
    ///
    pub fn ring_degree(&self) -> usize {
        1 << self.log_n
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.main_moduli.is_empty() {
            return Err(Error::invalid_context("the main-moduli list is empty (level < 1)"));
        }
        if self.main_moduli.iter().any(|q| *q < 2) {
            return Err(Error::invalid_context("main moduli must be >= 2"));
        }
        if self.plaintext_modulus < 2 {
            return Err(Error::invalid_context("plaintext modulus must be >= 2"));
        }
        if !(self.noise_variance > 0.0) {
            return Err(Error::invalid_context("noise variance must be positive"));
        }
        return Ok(());
    }

    ///
    /// Derives the context one level down by dropping the last main modulus.
    ///
    /// Fails with [`Error::InvalidContext`] if `self` is already at level 1,
    /// since a context with an empty modulus chain is not usable.
    ///
    pub fn derive_reduced(&self) -> Result<LevelContext, Error> {
        self.validate()?;
        if self.level() == 1 {
            return Err(Error::invalid_context("cannot modulus-reduce a level-1 context"));
        }
        let mut reduced = self.clone();
        reduced.main_moduli.pop();
        return Ok(reduced);
    }
}

///
/// An ordered chain of [`LevelContext`]s, one per level `1..=L`, where each
/// level's context is derived from the next-higher level's by modulus
/// reduction. Constructed once from the top-level (deepest) context and
/// immutable afterwards; every key and rotation operation reads from it.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextChain {
    /// contexts stored with level `l` at index `l - 1`
    contexts: Vec<LevelContext>,
}

impl ContextChain {
    ///
    /// Builds the full chain below (and including) the given top-level
    /// context.
    ///
    #[instrument(skip_all)]
    pub fn new(top_context: LevelContext) -> Result<ContextChain, Error> {
        top_context.validate()?;
        let L = top_context.level();
        let mut contexts = Vec::with_capacity(L);
        contexts.push(top_context);
        for _ in 1..L {
            let next = contexts.last().unwrap().derive_reduced()?;
            contexts.push(next);
        }
        contexts.reverse();
        return Ok(ContextChain { contexts });
    }

    ///
    /// The number of levels in this chain, i.e. the level of the top context.
    ///
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn top_context(&self) -> &LevelContext {
        // a chain always has at least one level
        self.contexts.last().unwrap()
    }

    ///
    /// Bounds-checked lookup of the context at the given level; there is no
    /// implicit "current level", callers always name the level explicitly.
    ///
    pub fn context_at_level(&self, level: usize) -> Result<&LevelContext, Error> {
        if level < 1 || level > self.contexts.len() {
            return Err(Error::LevelOutOfRange { level, chain_len: self.contexts.len() });
        }
        return Ok(&self.contexts[level - 1]);
    }
}

#[cfg(test)]
pub(crate) fn test_context(levels: usize) -> LevelContext {
    LevelContext {
        log_n: 4,
        main_moduli: (0..levels as u64).map(|i| 65537 + 2 * 16 * i).collect(),
        aux_moduli: vec![786433],
        plaintext_modulus: 257,
        noise_variance: 8.0,
        scaling_factor: 64.0,
        seed: 42,
    }
}

#[test]
fn test_chain_construction_and_lookup() {
    let chain = ContextChain::new(test_context(3)).unwrap();
    assert_eq!(3, chain.len());
    for l in 1..=3 {
        let ctx = chain.context_at_level(l).unwrap();
        assert_eq!(l, ctx.level());
        assert_eq!(16, ctx.ring_degree());
    }
    assert_eq!(3, chain.top_context().level());

    assert_eq!(
        Err(Error::LevelOutOfRange { level: 0, chain_len: 3 }),
        chain.context_at_level(0).map(|_| ())
    );
    assert_eq!(
        Err(Error::LevelOutOfRange { level: 4, chain_len: 3 }),
        chain.context_at_level(4).map(|_| ())
    );
}

#[test]
fn test_adjacent_levels_differ_by_one_modulus() {
    let chain = ContextChain::new(test_context(4)).unwrap();
    for l in 2..=4 {
        let upper = chain.context_at_level(l).unwrap();
        let lower = chain.context_at_level(l - 1).unwrap();
        assert_eq!(&upper.main_moduli[..l - 1], &lower.main_moduli[..]);
        assert_eq!(upper.aux_moduli, lower.aux_moduli);
        assert_eq!(upper.plaintext_modulus, lower.plaintext_modulus);
        assert_eq!(upper.seed, lower.seed);
    }
}

#[test]
fn test_invalid_context_rejected() {
    let mut ctx = test_context(2);
    ctx.main_moduli.clear();
    assert!(matches!(ContextChain::new(ctx), Err(Error::InvalidContext { .. })));

    let mut ctx = test_context(2);
    ctx.noise_variance = 0.0;
    assert!(matches!(ContextChain::new(ctx), Err(Error::InvalidContext { .. })));

    let ctx = test_context(1);
    assert!(matches!(ctx.derive_reduced(), Err(Error::InvalidContext { .. })));
}

#[test]
fn test_chain_serde_roundtrip() {
    let chain = ContextChain::new(test_context(3)).unwrap();
    let json = serde_json::to_string(&chain).unwrap();
    let restored: ContextChain = serde_json::from_str(&json).unwrap();
    assert_eq!(chain, restored);
}
