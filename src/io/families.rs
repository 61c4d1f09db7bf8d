use anyhow::{bail, Context, Result};
use std::io::BufRead;
use std::path::Path;

use crate::family::{FamilyTable, GeneFamily};
use crate::io::open_reader;

/// Read a family table: a header row (`Desc`, `Family ID`, then one column
/// per species) followed by one gene family per line.
pub fn read_family_table(path: &Path) -> Result<FamilyTable> {
    let reader = open_reader(path)?;
    parse_family_table(reader).with_context(|| format!("failed to parse family table {path:?}"))
}

pub fn parse_family_table(reader: impl BufRead) -> Result<FamilyTable> {
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(line) => line?,
        None => bail!("empty family table"),
    };
    let columns: Vec<&str> = if header.contains('\t') {
        header.trim_end().split('\t').collect()
    } else {
        header.split_whitespace().collect()
    };
    if columns.len() < 3 {
        bail!("family table header '{header}' names no species columns");
    }
    let species: Vec<String> = columns[2..].iter().map(|s| s.trim().to_string()).collect();

    let mut table = FamilyTable::new(species);
    for (row, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let family = GeneFamily::parse_line(&line)
            .with_context(|| format!("invalid family row {}", row + 2))?;
        table.add_family(family)?;
    }
    Ok(table)
}
