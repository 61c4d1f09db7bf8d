use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Fitted error-model estimate: the configuration it was fit under, the
/// best score and the winning parameter vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEstimateFile {
    pub symmetric: bool,
    pub max_diff: usize,
    pub peak_zero: bool,
    pub max_family_size: usize,
    pub score: f64,
    pub parameters: Vec<f64>,
}

pub fn save_estimate(path: &Path, estimate: &ErrorEstimateFile) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, estimate)
        .with_context(|| format!("failed to write {path:?}"))?;
    Ok(())
}

pub fn load_estimate(path: &Path) -> Result<ErrorEstimateFile> {
    let file = File::open(path).with_context(|| format!("failed to open {path:?}"))?;
    let reader = BufReader::new(file);
    let estimate =
        serde_json::from_reader(reader).with_context(|| format!("failed to parse {path:?}"))?;
    Ok(estimate)
}
