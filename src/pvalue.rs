//! Significance of an observed family against the birth-death null: a
//! conditional distribution of root likelihoods is simulated by sampling
//! family sizes down the tree, and observed likelihoods are ranked
//! against it.

use anyhow::{bail, Context, Result};
use rand::rngs::SmallRng;
use rand::Rng;

use crate::error_model::ErrorModelSet;
use crate::family::FamilyTable;
use crate::likelihood::{compute_tree_likelihoods, root_likelihoods};
use crate::progress;
use crate::tree::{FamilySizeRange, PhyloTree};

/// Draw an index from a row of transition probabilities by CDF inversion.
/// Falls through to the last admissible index when the row mass runs out,
/// so sampled sizes stay strictly below `limit`.
fn sample_index(row: impl Iterator<Item = f64>, limit: usize, draw: f64) -> usize {
    let mut cumulative = 0.0;
    for (index, p) in row.take(limit).enumerate() {
        cumulative += p;
        if cumulative >= draw {
            return index;
        }
    }
    limit.saturating_sub(1)
}

/// Sample every node's family size top-down from `root_size`, each node
/// drawing from its transition row given the parent's sampled size.
/// Returns the largest size drawn anywhere in the tree.
pub fn random_family_size(
    tree: &mut PhyloTree,
    root_size: usize,
    max_family_size: usize,
    rng: &mut SmallRng,
) -> Result<usize> {
    let root = tree.root_id();
    tree.node_mut(root).family_size = root_size as i64;
    let mut max_seen = root_size;
    for id in tree.preorder() {
        if id == root {
            continue;
        }
        let parent = tree
            .node(id)
            .parent()
            .with_context(|| format!("non-root node {id} has no parent"))?;
        let parent_size = tree.node(parent).family_size;
        if parent_size < 0 {
            bail!("parent of node {id} has no sampled size");
        }
        let draw: f64 = rng.gen();
        let size = {
            let matrix = tree
                .node(id)
                .transition
                .as_ref()
                .with_context(|| format!("node {id} has no transition matrix"))?;
            if parent_size as usize >= matrix.size() {
                bail!(
                    "sampled parent size {parent_size} exceeds the transition matrix bound {}",
                    matrix.size()
                );
            }
            let limit = max_family_size.min(matrix.size());
            let row = (0..matrix.size()).map(|c| matrix.get(parent_size as usize, c));
            sample_index(row, limit, draw)
        };
        tree.node_mut(id).family_size = size as i64;
        max_seen = max_seen.max(size);
    }
    Ok(max_seen)
}

/// Per-root-size distributions of simulated likelihoods, sorted ascending.
#[derive(Debug, Clone)]
pub struct ConditionalDistribution {
    root_min: usize,
    matrix: Vec<Vec<f64>>,
}

impl ConditionalDistribution {
    /// Simulate `trials` sampled trees per candidate root size and collect
    /// each trial's likelihood of that root size.
    pub fn simulate(
        tree: &mut PhyloTree,
        errors: &ErrorModelSet,
        range: &FamilySizeRange,
        trials: usize,
        rng: &mut SmallRng,
        show_progress: bool,
    ) -> Result<Self> {
        // Keep sampled leaf sizes inside the observable range.
        let size_limit = range.max + 1;
        let bar = show_progress.then(|| {
            progress::bar(
                (range.root_span() * trials) as u64,
                "conddist",
                "simulating",
            )
        });
        let mut matrix = Vec::with_capacity(range.root_span());
        for root_size in range.root_min..=range.root_max {
            let mut row = Vec::with_capacity(trials);
            for _ in 0..trials {
                random_family_size(tree, root_size, size_limit, rng)?;
                compute_tree_likelihoods(tree, errors)?;
                row.push(root_likelihoods(tree)[root_size - range.root_min]);
                if let Some(bar) = &bar {
                    bar.inc(1);
                }
            }
            row.sort_by(f64::total_cmp);
            matrix.push(row);
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        Ok(Self {
            root_min: range.root_min,
            matrix,
        })
    }

    pub fn root_min(&self) -> usize {
        self.root_min
    }

    pub fn trials(&self, root_size: usize) -> &[f64] {
        &self.matrix[root_size - self.root_min]
    }

    pub fn len(&self) -> usize {
        self.matrix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.is_empty()
    }
}

/// Fraction of the sorted reference distribution at or below `value`.
pub fn pvalue(value: f64, distribution: &[f64]) -> f64 {
    if distribution.is_empty() {
        return 0.0;
    }
    let below = distribution.partition_point(|&x| x <= value);
    below as f64 / distribution.len() as f64
}

/// Score one observed family and rank each candidate root size's
/// likelihood against its conditional distribution.
pub fn pvalues_for_family(
    tree: &mut PhyloTree,
    table: &FamilyTable,
    item: usize,
    distribution: &ConditionalDistribution,
) -> Result<Vec<f64>> {
    table.set_family_sizes(item, tree)?;
    compute_tree_likelihoods(tree, &table.errors)?;
    let likelihoods = root_likelihoods(tree).to_vec();
    let root_min = tree.range.root_min;
    likelihoods
        .iter()
        .enumerate()
        .map(|(offset, &likelihood)| {
            let size = root_min + offset;
            if size < distribution.root_min
                || size - distribution.root_min >= distribution.matrix.len()
            {
                bail!("no conditional distribution for root size {size}");
            }
            Ok(pvalue(likelihood, distribution.trials(size)))
        })
        .collect()
}
