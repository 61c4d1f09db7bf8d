//! Measurement-error model: a conditional probability matrix mapping true
//! family sizes to observed ones, loaded from a small text format:
//!
//! ```text
//! maxcnt:68
//! cntdiff -1 0 1
//! 0 0.0 0.8 0.2
//! 1 0.2 0.6 0.2
//! ```
//!
//! Line one names the largest family size, line two the signed error
//! classes, and each following row gives one true size's distribution over
//! those classes. Omitted sizes inherit the previous row's distribution,
//! so a model that is constant above some size needs only its first rows.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::family::FamilyTable;
use crate::matrix::SquareMatrix;
use crate::tree::{FamilySizeRange, PhyloTree};

const COLUMN_SUM_TOLERANCE: f64 = 1e-2;

#[derive(Debug, Clone)]
pub struct ErrorModel {
    filename: Option<String>,
    maxfamilysize: usize,
    fromdiff: i64,
    todiff: i64,
    /// Row = observed size, column = true size.
    errormatrix: SquareMatrix,
}

impl ErrorModel {
    pub fn new(
        maxfamilysize: usize,
        fromdiff: i64,
        todiff: i64,
        errormatrix: SquareMatrix,
    ) -> Self {
        Self {
            filename: None,
            maxfamilysize,
            fromdiff,
            todiff,
            errormatrix,
        }
    }

    pub fn load(path: &Path, min_max_size: usize) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open error model {path:?}"))?;
        let mut model = Self::from_reader(BufReader::new(file), min_max_size)
            .with_context(|| format!("failed to parse error model {path:?}"))?;
        model.filename = Some(path.to_string_lossy().into_owned());
        Ok(model)
    }

    /// Parse the text format. `min_max_size` is the family range already in
    /// force; the model covers at least that many sizes even when the file
    /// declares fewer.
    pub fn from_reader(reader: impl BufRead, min_max_size: usize) -> Result<Self> {
        let mut lines = reader.lines();

        let first = match lines.next() {
            Some(line) => line?,
            None => bail!("empty error model file"),
        };
        let declared: usize = match first.split(':').nth(1) {
            Some(value) if first.trim_start().starts_with("maxcnt") => value
                .trim()
                .parse()
                .with_context(|| format!("invalid maxcnt line '{first}'"))?,
            _ => bail!("expected 'maxcnt:<N>' on line 1, found '{first}'"),
        };
        let maxfamilysize = min_max_size.max(declared);

        let second = match lines.next() {
            Some(line) => line?,
            None => bail!("missing cntdiff line"),
        };
        let tokens: Vec<&str> = second.split_whitespace().collect();
        if tokens.len() < 2 || tokens[0] != "cntdiff" {
            bail!("expected 'cntdiff <d_min> ... <d_max>' on line 2, found '{second}'");
        }
        let fromdiff: i64 = tokens[1]
            .parse()
            .with_context(|| format!("invalid error class '{}'", tokens[1]))?;
        let todiff: i64 = tokens[tokens.len() - 1]
            .parse()
            .with_context(|| format!("invalid error class '{}'", tokens[tokens.len() - 1]))?;
        if todiff < fromdiff || tokens.len() as i64 - 1 != todiff - fromdiff + 1 {
            bail!("error classes must be contiguous from {fromdiff} to {todiff}");
        }
        let n_classes = (todiff - fromdiff + 1) as usize;

        let mut errormatrix = SquareMatrix::zeros(maxfamilysize + 1);
        let mut next_size = 0usize;
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() != n_classes + 1 {
                bail!(
                    "row '{line}' has {} probabilities, expected {n_classes}",
                    tokens.len().saturating_sub(1)
                );
            }
            let size: usize = tokens[0]
                .parse()
                .with_context(|| format!("invalid family size '{}'", tokens[0]))?;
            if size < next_size || size > maxfamilysize {
                bail!("family size {size} out of order or out of range in error model");
            }
            // Omitted sizes inherit the previous row's distribution.
            while next_size > 0 && next_size < size {
                copy_previous_column(&mut errormatrix, next_size, fromdiff, todiff, maxfamilysize);
                next_size += 1;
            }
            for (k, offset) in (fromdiff..=todiff).enumerate() {
                let observed = offset + size as i64;
                // Cells outside [0, maxcnt] are written as a #nan marker;
                // only in-range cells carry a probability.
                if observed >= 0 && observed <= maxfamilysize as i64 {
                    let p: f64 = tokens[k + 1]
                        .parse()
                        .with_context(|| format!("invalid probability '{}'", tokens[k + 1]))?;
                    errormatrix.set(observed as usize, size, p);
                }
            }
            next_size = size + 1;
        }
        if next_size == 0 {
            bail!("error model file has no probability rows");
        }
        while next_size <= maxfamilysize {
            copy_previous_column(&mut errormatrix, next_size, fromdiff, todiff, maxfamilysize);
            next_size += 1;
        }

        let mut model = Self {
            filename: None,
            maxfamilysize,
            fromdiff,
            todiff,
            errormatrix,
        };
        model.renormalize_clipped_columns();
        model.validate_column_sums()?;
        Ok(model)
    }

    /// Close the columns whose deficit comes from error classes clipped at
    /// the [0, maxcnt] boundary. Any other deficit is a real format error
    /// and is left for `validate_column_sums` to reject.
    fn renormalize_clipped_columns(&mut self) {
        for true_size in 0..=self.maxfamilysize {
            let clipped = self.fromdiff + (true_size as i64) < 0
                || self.todiff + (true_size as i64) > self.maxfamilysize as i64;
            if !clipped {
                continue;
            }
            let mut sum = 0.0;
            for observed in 0..=self.maxfamilysize {
                sum += self.errormatrix.get(observed, true_size);
            }
            if (sum - 1.0).abs() > COLUMN_SUM_TOLERANCE && sum > 0.0 {
                for observed in 0..=self.maxfamilysize {
                    let p = self.errormatrix.get(observed, true_size) / sum;
                    self.errormatrix.set(observed, true_size, p);
                }
            }
        }
    }

    /// Every true size's distribution over observed sizes must close.
    pub fn validate_column_sums(&self) -> Result<()> {
        for true_size in 0..=self.maxfamilysize {
            let mut sum = 0.0;
            for observed in 0..=self.maxfamilysize {
                sum += self.errormatrix.get(observed, true_size);
            }
            if (sum - 1.0).abs() > COLUMN_SUM_TOLERANCE {
                bail!(
                    "error model column for true size {true_size} sums to {sum}, expected 1"
                );
            }
        }
        Ok(())
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn maxfamilysize(&self) -> usize {
        self.maxfamilysize
    }

    pub fn fromdiff(&self) -> i64 {
        self.fromdiff
    }

    pub fn todiff(&self) -> i64 {
        self.todiff
    }

    /// P(observed | true_size); zero outside the matrix bounds.
    pub fn probability(&self, observed: usize, true_size: usize) -> f64 {
        if observed > self.maxfamilysize || true_size > self.maxfamilysize {
            return 0.0;
        }
        self.errormatrix.get(observed, true_size)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(w, "maxcnt:{}", self.maxfamilysize)?;
        write!(w, "cntdiff")?;
        for offset in self.fromdiff..=self.todiff {
            write!(w, " {offset}")?;
        }
        writeln!(w)?;
        for size in 0..=self.maxfamilysize {
            write!(w, "{size}")?;
            for offset in self.fromdiff..=self.todiff {
                let observed = offset + size as i64;
                if observed >= 0 && observed <= self.maxfamilysize as i64 {
                    write!(w, " {:.2}", self.errormatrix.get(observed as usize, size))?;
                } else {
                    write!(w, " #nan")?;
                }
            }
            writeln!(w)?;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file =
            File::create(path).with_context(|| format!("failed to create {path:?}"))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)
    }
}

fn copy_previous_column(
    matrix: &mut SquareMatrix,
    size: usize,
    fromdiff: i64,
    todiff: i64,
    maxfamilysize: usize,
) {
    for offset in fromdiff..=todiff {
        let observed = offset + size as i64;
        if observed >= 1 && observed <= maxfamilysize as i64 {
            let previous = matrix.get(observed as usize - 1, size - 1);
            matrix.set(observed as usize, size, previous);
        }
    }
}

/// Error models owned at the family level, keyed by the filename they were
/// loaded from.
#[derive(Debug, Clone, Default)]
pub struct ErrorModelSet {
    models: Vec<ErrorModel>,
}

impl ErrorModelSet {
    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn get(&self, index: usize) -> &ErrorModel {
        &self.models[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorModel> {
        self.models.iter()
    }

    /// Case-insensitive filename lookup; a model loaded once is reused.
    pub fn find_by_filename(&self, filename: &str) -> Option<usize> {
        self.models.iter().position(|m| {
            m.filename
                .as_deref()
                .map(|f| f.eq_ignore_ascii_case(filename))
                .unwrap_or(false)
        })
    }

    pub fn insert(&mut self, model: ErrorModel) -> usize {
        self.models.push(model);
        self.models.len() - 1
    }

    pub fn clear(&mut self) {
        self.models.clear();
    }
}

/// Load (or reuse) the model at `path` and associate it with one species
/// (case-insensitive; unknown names are silently ignored) or, when
/// `species` is `None`, with every species. Matching tree leaves get the
/// same non-owning reference.
pub fn apply_error_model(
    family: &mut FamilyTable,
    tree: &mut PhyloTree,
    range: &FamilySizeRange,
    path: &Path,
    species: Option<&str>,
) -> Result<()> {
    let filename = path.to_string_lossy();
    let index = match family.errors.find_by_filename(&filename) {
        Some(index) => index,
        None => {
            let model = ErrorModel::load(path, range.max)?;
            family.errors.insert(model)
        }
    };

    match species {
        Some(name) => {
            for i in 0..family.species.len() {
                if family.species[i].eq_ignore_ascii_case(name) {
                    attach(family, tree, i, Some(index));
                    break;
                }
            }
        }
        None => {
            for i in 0..family.species.len() {
                attach(family, tree, i, Some(index));
            }
        }
    }
    Ok(())
}

/// Detach the error model from one species (and its tree leaf).
pub fn remove_error_model(family: &mut FamilyTable, tree: &mut PhyloTree, species: &str) {
    for i in 0..family.species.len() {
        if family.species[i].eq_ignore_ascii_case(species) {
            attach(family, tree, i, None);
            break;
        }
    }
}

/// Drop every model and every per-species reference.
pub fn clear_error_models(family: &mut FamilyTable, tree: &mut PhyloTree) {
    for i in 0..family.species.len() {
        attach(family, tree, i, None);
    }
    family.errors.clear();
}

fn attach(family: &mut FamilyTable, tree: &mut PhyloTree, species: usize, index: Option<usize>) {
    family.error_ptr[species] = index;
    if let Some(Some(node_id)) = family.index.get(species) {
        if *node_id < tree.len() {
            tree.node_mut(*node_id).error_model = index;
        }
    }
}
