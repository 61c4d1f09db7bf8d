//! Postorder dynamic-programming likelihood over the phylogeny: each node's
//! vector holds, per candidate family size, the probability of everything
//! observed beneath it. Leaves start from their observed size (or an
//! error-model distribution over true sizes); internal nodes multiply the
//! ranged matrix-vector products of their children.

use anyhow::{bail, Context, Result};

use crate::error_model::ErrorModelSet;
use crate::family::FamilyTable;
use crate::tree::PhyloTree;

/// Root prior vectors run to this many sizes by convention.
pub const FAMILY_SIZE_MAX: usize = 1000;

/// Fill every node's likelihood vector bottom-up. Leaves use their
/// `family_size` (all ones when unset, the attached error-model column
/// when one is referenced through `errors`); internal nodes combine
/// children through their shared transition matrices.
pub fn compute_tree_likelihoods(tree: &mut PhyloTree, errors: &ErrorModelSet) -> Result<()> {
    let range = tree.range;
    let root = tree.root_id();
    let mut factor = vec![0.0; tree.size_of_factor()];

    for id in tree.postorder() {
        if tree.node(id).is_leaf() {
            initialize_leaf(tree, errors, id)?;
            continue;
        }
        let (from, to) = if id == root {
            (range.root_min, range.root_max)
        } else {
            (range.min, range.max)
        };
        let span = to - from + 1;

        let children: Vec<usize> = tree.node(id).children().to_vec();
        let mut likelihoods = vec![1.0; span];
        for child_id in children {
            let child = tree.node(child_id);
            let matrix = child.transition.as_ref().with_context(|| {
                format!("node {child_id} has no transition matrix; reset the cache first")
            })?;
            matrix.multiply(
                &child.likelihoods,
                from,
                to,
                range.min,
                range.max,
                &mut factor,
            );
            for (lk, f) in likelihoods.iter_mut().zip(factor.iter()) {
                *lk *= f;
            }
        }
        let node = tree.node_mut(id);
        node.likelihoods.fill(0.0);
        node.likelihoods[..span].copy_from_slice(&likelihoods);
    }
    Ok(())
}

fn initialize_leaf(tree: &mut PhyloTree, errors: &ErrorModelSet, id: usize) -> Result<()> {
    let range = tree.range;
    let node = tree.node_mut(id);
    node.likelihoods.fill(0.0);
    if node.family_size < 0 {
        // Missing observation: every size is equally consistent.
        for slot in &mut node.likelihoods[..range.span()] {
            *slot = 1.0;
        }
        return Ok(());
    }
    let observed = node.family_size as usize;
    match node.error_model {
        Some(model_index) => {
            if model_index >= errors.len() {
                bail!("node {id} references error model {model_index} which is not loaded");
            }
            let model = errors.get(model_index);
            for true_size in range.min..=range.max {
                node.likelihoods[true_size - range.min] = model.probability(observed, true_size);
            }
        }
        None => {
            if observed < range.min || observed > range.max {
                bail!(
                    "observed family size {observed} outside the range {}..={}",
                    range.min,
                    range.max
                );
            }
            node.likelihoods[observed - range.min] = 1.0;
        }
    }
    Ok(())
}

/// Root likelihoods indexed by candidate root size minus root_min.
pub fn root_likelihoods(tree: &PhyloTree) -> &[f64] {
    let root = tree.node(tree.root_id());
    &root.likelihoods[..tree.range.root_span()]
}

/// Clustered (mixture) variant: the same recursion runs once per component
/// using each node's `k_bd` matrices, and the component root vectors are
/// combined with the cluster weights. The combined vector is also written
/// back onto the root node.
pub fn compute_tree_likelihoods_clustered(
    tree: &mut PhyloTree,
    errors: &ErrorModelSet,
    k_weights: &[f64],
) -> Result<Vec<f64>> {
    let k = k_weights.len();
    if k == 0 {
        bail!("clustered likelihood needs at least one component weight");
    }
    let range = tree.range;
    let root = tree.root_id();
    let len = tree.size_of_factor();
    let mut factor = vec![0.0; len];

    for id in tree.postorder() {
        tree.node_mut(id).reset_k_likelihoods(k, len);
        if tree.node(id).is_leaf() {
            initialize_leaf(tree, errors, id)?;
            let node = tree.node_mut(id);
            let base = node.likelihoods.clone();
            for component in &mut node.k_likelihoods {
                component.copy_from_slice(&base);
            }
            continue;
        }
        let (from, to) = if id == root {
            (range.root_min, range.root_max)
        } else {
            (range.min, range.max)
        };
        let span = to - from + 1;
        let children: Vec<usize> = tree.node(id).children().to_vec();

        for component in 0..k {
            let mut likelihoods = vec![1.0; span];
            for &child_id in &children {
                let child = tree.node(child_id);
                let matrix = child.k_bd.get(component).with_context(|| {
                    format!("node {child_id} has no transition matrix for component {component}")
                })?;
                matrix.multiply(
                    &child.k_likelihoods[component],
                    from,
                    to,
                    range.min,
                    range.max,
                    &mut factor,
                );
                for (lk, f) in likelihoods.iter_mut().zip(factor.iter()) {
                    *lk *= f;
                }
            }
            let node = tree.node_mut(id);
            node.k_likelihoods[component][..span].copy_from_slice(&likelihoods);
        }
    }

    let root_span = range.root_span();
    let mut combined = vec![0.0; root_span];
    {
        let node = tree.node(root);
        for (component, &weight) in k_weights.iter().enumerate() {
            for (slot, &lk) in combined
                .iter_mut()
                .zip(node.k_likelihoods[component][..root_span].iter())
            {
                *slot += weight * lk;
            }
        }
    }
    let node = tree.node_mut(root);
    node.likelihoods.fill(0.0);
    node.likelihoods[..root_span].copy_from_slice(&combined);
    Ok(combined)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Posterior {
    pub max_likelihood: f64,
    pub max_posterior: f64,
    /// Root size with the highest posterior mass.
    pub ml_root_size: usize,
}

/// Combine the root likelihoods with a prior over root sizes (indexed by
/// absolute size) and report the maxima.
pub fn compute_posterior(tree: &PhyloTree, prior: &[f64]) -> Result<Posterior> {
    let likelihoods = root_likelihoods(tree);
    if likelihoods.is_empty() {
        bail!("tree has no root likelihoods");
    }
    let root_min = tree.range.root_min;
    let mut max_likelihood = 0.0f64;
    let mut max_posterior = 0.0f64;
    let mut ml_root_size = root_min;
    for (offset, &likelihood) in likelihoods.iter().enumerate() {
        let size = root_min + offset;
        max_likelihood = max_likelihood.max(likelihood);
        let posterior = likelihood * prior.get(size).copied().unwrap_or(0.0);
        if posterior > max_posterior {
            max_posterior = posterior;
            ml_root_size = size;
        }
    }
    Ok(Posterior {
        max_likelihood,
        max_posterior,
        ml_root_size,
    })
}

/// Poisson prior over root family sizes, computed in log space.
pub fn poisson_prior(lambda: f64, len: usize) -> Vec<f64> {
    let log_lambda = lambda.ln();
    let mut ln_fact = 0.0;
    (0..len)
        .map(|size| {
            if size > 0 {
                ln_fact += (size as f64).ln();
            }
            (size as f64 * log_lambda - lambda - ln_fact).exp()
        })
        .collect()
}

/// Empirical root prior: a Poisson fit to the observed counts shifted by
/// one, since a family present in the data must have existed at the root.
/// prior[0] is zero; prior[i] = Poisson(i - 1; mean - 1).
pub fn empirical_prior(table: &FamilyTable, len: usize) -> Result<Vec<f64>> {
    let mut total = 0u64;
    let mut n = 0u64;
    for family in &table.families {
        for &count in &family.counts {
            total += count;
            n += 1;
        }
    }
    if n == 0 {
        bail!("cannot fit an empirical prior to an empty family table");
    }
    let mean = total as f64 / n as f64;
    let lambda = (mean - 1.0).max(1e-9);
    let shifted = poisson_prior(lambda, len.saturating_sub(1));
    let mut prior = Vec::with_capacity(len);
    prior.push(0.0);
    prior.extend(shifted);
    Ok(prior)
}

/// Most-likely ancestral sizes: the root takes its maximum-likelihood
/// size, then each child takes argmax over transition x subtree
/// likelihood given its parent's assignment. Observed leaves keep their
/// sizes. Returns the per-node assignment indexed by node id.
pub fn viterbi_reconstruct(tree: &mut PhyloTree) -> Result<Vec<i64>> {
    let range = tree.range;
    let root = tree.root_id();
    let root_lik = root_likelihoods(tree);
    if root_lik.iter().all(|&v| v == 0.0) {
        bail!("root likelihoods are all zero; compute likelihoods first");
    }
    let root_size = range.root_min
        + root_lik
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
    tree.node_mut(root).family_size = root_size as i64;

    for id in tree.preorder() {
        if id == root {
            continue;
        }
        let node = tree.node(id);
        if node.is_leaf() && node.family_size >= 0 {
            continue;
        }
        let parent = node
            .parent()
            .with_context(|| format!("non-root node {id} has no parent"))?;
        let parent_size = tree.node(parent).family_size;
        if parent_size < 0 {
            bail!("parent of node {id} has no assigned size");
        }
        let matrix = tree
            .node(id)
            .transition
            .as_ref()
            .with_context(|| format!("node {id} has no transition matrix"))?;
        let mut best_size = range.min;
        let mut best_value = f64::NEG_INFINITY;
        for size in range.min..=range.max {
            let value =
                matrix.get(parent_size as usize, size) * tree.node(id).likelihoods[size - range.min];
            if value > best_value {
                best_value = value;
                best_size = size;
            }
        }
        tree.node_mut(id).family_size = best_size as i64;
    }
    Ok(tree.nodes().map(|n| n.family_size).collect())
}
