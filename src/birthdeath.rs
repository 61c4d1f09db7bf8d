use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::comb::BinomialCache;
use crate::matrix::SquareMatrix;
use crate::tree::{FamilySizeRange, PhyloTree};

/// Transition probability P(c members after time t | s members), linear
/// birth-death process. `mu` of -1 selects the no-death special case.
///
/// P(c|s) = sum_{j=0}^{min(s,c)} C(s,j) C(s+c-j-1, s-1)
///          alpha^(s-j) beta^(c-j) (1-alpha-beta)^j
/// with alpha = mu(e-1)/(lambda e - mu), beta = lambda(e-1)/(lambda e - mu),
/// e = exp((lambda-mu) t); alpha = beta = lambda t / (1 + lambda t) when the
/// rates coincide or death is disabled. Terms are accumulated in log space.
pub fn transition_matrix(
    t: f64,
    lambda: f64,
    mu: f64,
    max_family_size: usize,
    comb: &BinomialCache,
) -> SquareMatrix {
    let size = max_family_size + 1;
    if t <= 0.0 {
        return SquareMatrix::identity(size);
    }

    let (alpha, beta) = if mu < 0.0 || (lambda - mu).abs() < 1e-10 {
        let a = lambda * t / (1.0 + lambda * t);
        (a, a)
    } else {
        let e = (t * (lambda - mu)).exp();
        let denom = lambda * e - mu;
        (mu * (e - 1.0) / denom, lambda * (e - 1.0) / denom)
    };
    if !(alpha > 0.0 && alpha < 1.0) || !(beta > 0.0 && beta < 1.0) {
        return SquareMatrix::identity(size);
    }
    let coeff = 1.0 - alpha - beta;
    let log_alpha = alpha.ln();
    let log_beta = beta.ln();

    let mut matrix = SquareMatrix::zeros(size);
    // Zero is absorbing: an extinct family stays extinct.
    matrix.set(0, 0, 1.0);
    for s in 1..=max_family_size {
        for c in 0..=max_family_size {
            matrix.set(s, c, transition_rate(s, c, log_alpha, log_beta, coeff, comb));
        }
    }
    matrix
}

fn transition_rate(
    s: usize,
    c: usize,
    log_alpha: f64,
    log_beta: f64,
    coeff: f64,
    comb: &BinomialCache,
) -> f64 {
    let mut p = 0.0;
    let mut coeff_pow = 1.0;
    for j in 0..=s.min(c) {
        let log_term = comb.ln_choose(s, j)
            + comb.ln_choose(s + c - j - 1, s - 1)
            + (s - j) as f64 * log_alpha
            + (c - j) as f64 * log_beta;
        p += log_term.exp() * coeff_pow;
        coeff_pow *= coeff;
    }
    p.clamp(0.0, 1.0)
}

/// Cache key: branch lengths are truncated to whole units, deliberately
/// collapsing fractional lengths onto one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransitionKey {
    branch_length: i64,
    lambda_bits: u64,
    mu_bits: u64,
}

impl TransitionKey {
    pub fn new(branch_length: f64, lambda: f64, mu: f64) -> Self {
        Self {
            branch_length: branch_length as i64,
            lambda_bits: lambda.to_bits(),
            mu_bits: mu.to_bits(),
        }
    }

    pub fn branch_length(&self) -> f64 {
        self.branch_length as f64
    }

    pub fn lambda(&self) -> f64 {
        f64::from_bits(self.lambda_bits)
    }

    pub fn mu(&self) -> f64 {
        f64::from_bits(self.mu_bits)
    }
}

/// Memoized transition matrices shared across every family that scores
/// against the same tree. Entries are append-only within a reset cycle;
/// the first writer for a key wins.
#[derive(Debug)]
pub struct TransitionCache {
    max_family_size: usize,
    comb: BinomialCache,
    matrices: HashMap<TransitionKey, Arc<SquareMatrix>>,
    keys: Vec<TransitionKey>,
}

impl TransitionCache {
    pub fn new(max_family_size: usize) -> Self {
        Self {
            max_family_size,
            comb: BinomialCache::new(max_family_size),
            matrices: HashMap::new(),
            keys: Vec::new(),
        }
    }

    pub fn max_family_size(&self) -> usize {
        self.max_family_size
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> &[TransitionKey] {
        &self.keys
    }

    /// Shared matrix for (trunc(branch length), lambda, mu), built on the
    /// first request. The truncated length is also what the matrix is
    /// computed from, so 68.0 and 68.7105 return the same entry.
    pub fn get_matrix(&mut self, branch_length: f64, lambda: f64, mu: f64) -> Arc<SquareMatrix> {
        let key = TransitionKey::new(branch_length, lambda, mu);
        if let Some(matrix) = self.matrices.get(&key) {
            return Arc::clone(matrix);
        }
        let matrix = Arc::new(transition_matrix(
            key.branch_length(),
            lambda,
            mu,
            self.max_family_size,
            &self.comb,
        ));
        self.keys.push(key);
        self.matrices.insert(key, Arc::clone(&matrix));
        matrix
    }
}

/// Rebuild the cache when absent or too small for the range, then walk the
/// tree assigning every node its shared matrix (or its per-component list
/// when `num_components` > 0 and the node carries component rates).
pub fn reset_transition_cache(
    cache: &mut Option<TransitionCache>,
    tree: &mut PhyloTree,
    num_components: usize,
    range: &FamilySizeRange,
) -> Result<()> {
    let needed = range.required_size();
    let rebuild = match cache {
        None => true,
        Some(c) => c.max_family_size() < needed,
    };
    if rebuild {
        *cache = Some(TransitionCache::new(needed));
    }
    if let Some(cache) = cache.as_mut() {
        assign_node_matrices(tree, cache, num_components)?;
    }
    Ok(())
}

/// Assign each node's transition matrix from the cache. Nodes without a
/// usable branch length are left untouched.
pub fn assign_node_matrices(
    tree: &mut PhyloTree,
    cache: &mut TransitionCache,
    num_components: usize,
) -> Result<()> {
    for id in 0..tree.len() {
        let branch_length = tree.node(id).branch_length;
        if branch_length <= 0.0 {
            continue;
        }
        let rates = tree.node(id).rates.clone();
        match (&rates.lambdas, num_components) {
            (Some(lambdas), k) if k > 0 => {
                if lambdas.len() < k {
                    bail!(
                        "node {id} has {} component birth rates but {k} components were requested",
                        lambdas.len()
                    );
                }
                let mut k_bd = Vec::with_capacity(k);
                for component in 0..k {
                    let lambda = lambdas[component];
                    let mu = rates
                        .mus
                        .as_ref()
                        .and_then(|mus| mus.get(component).copied())
                        .unwrap_or(rates.mu);
                    k_bd.push(cache.get_matrix(branch_length, lambda, mu));
                }
                let node = tree.node_mut(id);
                node.k_bd = k_bd;
                node.transition = None;
            }
            (Some(lambdas), _) => {
                let lambda = lambdas.first().copied().unwrap_or(rates.lambda);
                let mu = rates
                    .mus
                    .as_ref()
                    .and_then(|mus| mus.first().copied())
                    .unwrap_or(rates.mu);
                let matrix = cache.get_matrix(branch_length, lambda, mu);
                tree.node_mut(id).transition = Some(matrix);
            }
            (None, _) => {
                let matrix = cache.get_matrix(branch_length, rates.lambda, rates.mu);
                tree.node_mut(id).transition = Some(matrix);
            }
        }
    }
    Ok(())
}
