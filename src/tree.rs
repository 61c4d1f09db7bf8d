use anyhow::{bail, Context, Result};
use std::sync::Arc;

use crate::matrix::SquareMatrix;

/// Inclusive bounds on observable and root family sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilySizeRange {
    pub min: usize,
    pub max: usize,
    pub root_min: usize,
    pub root_max: usize,
}

impl FamilySizeRange {
    pub fn new(min: usize, max: usize, root_min: usize, root_max: usize) -> Self {
        Self {
            min,
            max,
            root_min,
            root_max,
        }
    }

    /// Working bounds derived from the largest observed family size:
    /// root sizes 1 ..= max(1.25 * observed, 30), family sizes
    /// 0 ..= max(1.5 * observed, 60).
    pub fn from_observed_max(observed_max: usize) -> Self {
        Self {
            min: 0,
            max: (observed_max * 3 / 2).max(60),
            root_min: 1,
            root_max: (observed_max * 5 / 4).max(30),
        }
    }

    pub fn span(&self) -> usize {
        self.max - self.min + 1
    }

    pub fn root_span(&self) -> usize {
        self.root_max - self.root_min + 1
    }

    /// Largest family size any transition matrix must cover.
    pub fn required_size(&self) -> usize {
        self.max.max(self.root_max)
    }
}

/// Birth and death rates attached to a node. `mu` of -1 selects the
/// no-death special case. `lambdas`/`mus` hold per-mixture-component
/// rates for clustered models.
#[derive(Debug, Clone)]
pub struct BirthDeathRates {
    pub lambda: f64,
    pub mu: f64,
    pub lambdas: Option<Vec<f64>>,
    pub mus: Option<Vec<f64>>,
}

impl Default for BirthDeathRates {
    fn default() -> Self {
        Self {
            lambda: 0.0,
            mu: -1.0,
            lambdas: None,
            mus: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhyloNode {
    pub id: usize,
    pub name: Option<String>,
    /// Branch length to the parent; -1 when unset (the root).
    pub branch_length: f64,
    parent: Option<usize>,
    children: Vec<usize>,
    pub rates: BirthDeathRates,
    /// Shared transition matrix owned by the cache; never a second copy.
    pub transition: Option<Arc<SquareMatrix>>,
    /// Per-mixture-component transition matrices for clustered models.
    pub k_bd: Vec<Arc<SquareMatrix>>,
    /// Observed or reconstructed family size; -1 when unset.
    pub family_size: i64,
    pub likelihoods: Vec<f64>,
    pub k_likelihoods: Vec<Vec<f64>>,
    /// Index into the owning family table's error-model set.
    pub error_model: Option<usize>,
}

impl PhyloNode {
    fn new(id: usize, vector_len: usize) -> Self {
        Self {
            id,
            name: None,
            branch_length: -1.0,
            parent: None,
            children: Vec::new(),
            rates: BirthDeathRates::default(),
            transition: None,
            k_bd: Vec::new(),
            family_size: -1,
            likelihoods: vec![0.0; vector_len],
            k_likelihoods: Vec::new(),
            error_model: None,
        }
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Allocate `k` zeroed component likelihood vectors of length `len`.
    pub fn reset_k_likelihoods(&mut self, k: usize, len: usize) {
        self.k_likelihoods = vec![vec![0.0; len]; k];
    }
}

/// Phylogeny stored as an arena; node index equals its infix-order id.
#[derive(Debug, Clone)]
pub struct PhyloTree {
    nodes: Vec<PhyloNode>,
    root: usize,
    pub range: FamilySizeRange,
    pub lambda: f64,
    size_of_factor: usize,
}

struct RawNode {
    name: Option<String>,
    branch_length: f64,
    children: Vec<RawNode>,
}

impl PhyloTree {
    pub fn from_newick(
        newick: &str,
        range: &FamilySizeRange,
        lambda: f64,
        mu: f64,
    ) -> Result<Self> {
        let raw = parse_newick(newick)?;
        let size_of_factor = range.required_size() + 1;
        let mut nodes = Vec::new();
        let root = flatten_infix(&raw, None, &mut nodes, size_of_factor);
        for node in &mut nodes {
            node.rates.lambda = lambda;
            node.rates.mu = mu;
        }
        Ok(Self {
            nodes,
            root,
            range: *range,
            lambda,
            size_of_factor,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root_id(&self) -> usize {
        self.root
    }

    pub fn node(&self, id: usize) -> &PhyloNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: usize) -> &mut PhyloNode {
        &mut self.nodes[id]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PhyloNode> {
        self.nodes.iter()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut PhyloNode> {
        self.nodes.iter_mut()
    }

    pub fn is_root(&self, id: usize) -> bool {
        id == self.root
    }

    pub fn size_of_factor(&self) -> usize {
        self.size_of_factor
    }

    /// Case-insensitive lookup by node name.
    pub fn find_node(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| {
            n.name
                .as_deref()
                .map(|s| s.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })
    }

    pub fn postorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.len());
        self.postorder_visit(self.root, &mut order);
        order
    }

    fn postorder_visit(&self, id: usize, order: &mut Vec<usize>) {
        for &child in &self.nodes[id].children {
            self.postorder_visit(child, order);
        }
        order.push(id);
    }

    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            for &child in self.nodes[id].children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    /// Infix order is the id order by construction.
    pub fn inorder(&self) -> Vec<usize> {
        (0..self.len()).collect()
    }

    /// Update the working range and rate, resizing per-node buffers.
    pub fn set_parameters(&mut self, range: &FamilySizeRange, lambda: f64) {
        self.range = *range;
        self.lambda = lambda;
        self.size_of_factor = range.required_size() + 1;
        let len = self.size_of_factor;
        for node in &mut self.nodes {
            node.likelihoods = vec![0.0; len];
            for v in &mut node.k_likelihoods {
                *v = vec![0.0; len];
            }
        }
    }

    pub fn distance_from_root(&self, id: usize) -> f64 {
        let mut dist = 0.0;
        let mut cur = id;
        while let Some(parent) = self.nodes[cur].parent {
            dist += self.nodes[cur].branch_length.max(0.0);
            cur = parent;
        }
        dist
    }

    pub fn max_root_to_leaf_length(&self) -> f64 {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| self.distance_from_root(n.id))
            .fold(0.0, f64::max)
    }

    /// True when every leaf sits at the same distance from the root.
    pub fn is_ultrametric(&self) -> bool {
        let depths: Vec<f64> = self
            .nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| self.distance_from_root(n.id))
            .collect();
        match depths.first() {
            None => true,
            Some(&first) => depths.iter().all(|&d| (d - first).abs() < 1e-9),
        }
    }

    /// Replace every branch length, indexed by node id. The root slot is
    /// present but ignored for likelihood purposes.
    pub fn set_branch_lengths(&mut self, lengths: &[f64]) -> Result<()> {
        if lengths.len() != self.len() {
            bail!(
                "expected {} branch lengths including the empty branch of the root, got {}",
                self.len(),
                lengths.len()
            );
        }
        for (node, &len) in self.nodes.iter_mut().zip(lengths) {
            node.branch_length = len;
        }
        Ok(())
    }

    pub fn to_newick(&self) -> String {
        let mut out = String::new();
        self.write_newick(self.root, &mut out);
        out
    }

    fn write_newick(&self, id: usize, out: &mut String) {
        let node = &self.nodes[id];
        if !node.children.is_empty() {
            out.push('(');
            for (i, &child) in node.children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.write_newick(child, out);
            }
            out.push(')');
        }
        if let Some(name) = &node.name {
            out.push_str(name);
        }
        if node.branch_length >= 0.0 && !self.is_root(id) {
            out.push(':');
            out.push_str(&format_branch_length(node.branch_length));
        }
    }
}

fn format_branch_length(len: f64) -> String {
    if len == len.trunc() {
        format!("{}", len as i64)
    } else {
        format!("{len}")
    }
}

/// Assign ids in infix order: first child subtree, the node itself, then
/// the remaining child subtrees.
fn flatten_infix(
    raw: &RawNode,
    parent: Option<usize>,
    nodes: &mut Vec<PhyloNode>,
    vector_len: usize,
) -> usize {
    if raw.children.is_empty() {
        let id = nodes.len();
        let mut node = PhyloNode::new(id, vector_len);
        node.name = raw.name.clone();
        node.branch_length = raw.branch_length;
        node.parent = parent;
        nodes.push(node);
        return id;
    }

    // First child subtree, then this node, then the remaining subtrees,
    // so ids come out in infix order; parent links are patched once the
    // node's own id is known.
    let mut child_ids = Vec::with_capacity(raw.children.len());
    let first = flatten_infix(&raw.children[0], None, nodes, vector_len);
    child_ids.push(first);

    let id = nodes.len();
    let mut node = PhyloNode::new(id, vector_len);
    node.name = raw.name.clone();
    node.branch_length = raw.branch_length;
    node.parent = parent;
    nodes.push(node);

    for child in &raw.children[1..] {
        child_ids.push(flatten_infix(child, Some(id), nodes, vector_len));
    }
    for &child in &child_ids {
        nodes[child].parent = Some(id);
    }
    nodes[id].children = child_ids;
    id
}

fn parse_newick(input: &str) -> Result<RawNode> {
    let chars: Vec<char> = input.trim().chars().collect();
    let mut pos = 0usize;
    let node = parse_subtree(&chars, &mut pos)?;
    while pos < chars.len() && (chars[pos] == ';' || chars[pos].is_whitespace()) {
        pos += 1;
    }
    if pos != chars.len() {
        bail!("trailing characters in newick string at position {pos}");
    }
    Ok(node)
}

fn parse_subtree(chars: &[char], pos: &mut usize) -> Result<RawNode> {
    skip_ws(chars, pos);
    let mut children = Vec::new();
    if peek(chars, *pos) == Some('(') {
        *pos += 1;
        loop {
            children.push(parse_subtree(chars, pos)?);
            skip_ws(chars, pos);
            match peek(chars, *pos) {
                Some(',') => {
                    *pos += 1;
                }
                Some(')') => {
                    *pos += 1;
                    break;
                }
                other => bail!("expected ',' or ')' in newick string, found {other:?}"),
            }
        }
    }
    let name = parse_label(chars, pos);
    let branch_length = if peek(chars, *pos) == Some(':') {
        *pos += 1;
        parse_number(chars, pos)?
    } else {
        -1.0
    };
    if children.is_empty() && name.is_none() {
        bail!("empty leaf label in newick string at position {pos}", pos = *pos);
    }
    Ok(RawNode {
        name,
        branch_length,
        children,
    })
}

fn parse_label(chars: &[char], pos: &mut usize) -> Option<String> {
    let start = *pos;
    while let Some(c) = peek(chars, *pos) {
        if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' || c == '|' {
            *pos += 1;
        } else {
            break;
        }
    }
    if *pos > start {
        Some(chars[start..*pos].iter().collect())
    } else {
        None
    }
}

fn parse_number(chars: &[char], pos: &mut usize) -> Result<f64> {
    let start = *pos;
    while let Some(c) = peek(chars, *pos) {
        if c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e' || c == 'E' {
            *pos += 1;
        } else {
            break;
        }
    }
    let text: String = chars[start..*pos].iter().collect();
    text.parse::<f64>()
        .with_context(|| format!("invalid branch length '{text}' in newick string"))
}

fn skip_ws(chars: &[char], pos: &mut usize) {
    while peek(chars, *pos).map(|c| c.is_whitespace()).unwrap_or(false) {
        *pos += 1;
    }
}

fn peek(chars: &[char], pos: usize) -> Option<char> {
    chars.get(pos).copied()
}
