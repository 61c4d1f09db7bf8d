use anyhow::{bail, Context, Result};
use std::io::Write;

use crate::error_model::ErrorModelSet;
use crate::tree::PhyloTree;

/// Sanity bitmask: a species with no tree node mapping.
pub const SYNC_UNMAPPED_SPECIES: u32 = 0x01;
/// Sanity bitmask: a species index outside the tree's node list.
pub const SYNC_INDEX_RANGE: u32 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneFamily {
    pub id: String,
    pub desc: String,
    pub counts: Vec<u64>,
}

impl GeneFamily {
    pub fn new(id: &str, desc: &str, counts: Vec<u64>) -> Self {
        Self {
            id: id.to_string(),
            desc: desc.to_string(),
            counts,
        }
    }

    /// One table row: description, family id, then one count per species.
    /// Tab-separated when tabs are present, otherwise whitespace.
    pub fn parse_line(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = if line.contains('\t') {
            line.trim_end().split('\t').collect()
        } else {
            line.split_whitespace().collect()
        };
        if tokens.len() < 3 {
            bail!("family row '{}' needs a description, an id and at least one count", line.trim_end());
        }
        let mut counts = Vec::with_capacity(tokens.len() - 2);
        for token in &tokens[2..] {
            let count: u64 = token
                .trim()
                .parse()
                .with_context(|| format!("invalid family count '{token}'"))?;
            counts.push(count);
        }
        Ok(Self {
            id: tokens[1].trim().to_string(),
            desc: tokens[0].trim().to_string(),
            counts,
        })
    }

    pub fn max_count(&self) -> u64 {
        self.counts.iter().copied().max().unwrap_or(0)
    }
}

/// Gene family counts per species, plus the species-to-tree mapping and
/// the error models applied to each species.
#[derive(Debug, Clone, Default)]
pub struct FamilyTable {
    pub species: Vec<String>,
    /// Species slot -> tree node id, filled by `set_species_index`.
    pub index: Vec<Option<usize>>,
    pub families: Vec<GeneFamily>,
    pub errors: ErrorModelSet,
    /// Species slot -> error model index in `errors`.
    pub error_ptr: Vec<Option<usize>>,
}

impl FamilyTable {
    pub fn new(species: Vec<String>) -> Self {
        let n = species.len();
        Self {
            species,
            index: vec![None; n],
            families: Vec::new(),
            errors: ErrorModelSet::default(),
            error_ptr: vec![None; n],
        }
    }

    pub fn add_family(&mut self, family: GeneFamily) -> Result<()> {
        if family.counts.len() != self.species.len() {
            bail!(
                "family {} has {} counts for {} species",
                family.id,
                family.counts.len(),
                self.species.len()
            );
        }
        self.families.push(family);
        Ok(())
    }

    /// Map each species to its tree leaf by case-insensitive name; species
    /// absent from the tree stay unmapped.
    pub fn set_species_index(&mut self, tree: &PhyloTree) {
        for (i, name) in self.species.iter().enumerate() {
            self.index[i] = tree.find_node(name);
        }
    }

    /// OR of every synchronization problem found, so callers can report
    /// them all rather than the first.
    pub fn sync_sanity_check(&self, tree: &PhyloTree) -> u32 {
        let mut problems = 0;
        for slot in &self.index {
            match slot {
                None => problems |= SYNC_UNMAPPED_SPECIES,
                Some(id) if *id >= tree.len() => problems |= SYNC_INDEX_RANGE,
                Some(_) => {}
            }
        }
        problems
    }

    /// Copy one family's observed counts onto the mapped tree leaves.
    pub fn set_family_sizes(&self, item: usize, tree: &mut PhyloTree) -> Result<()> {
        let family = self
            .families
            .get(item)
            .with_context(|| format!("no family at index {item}"))?;
        for (i, &count) in family.counts.iter().enumerate() {
            if let Some(Some(node_id)) = self.index.get(i) {
                if *node_id >= tree.len() {
                    bail!("species {} maps outside the tree", self.species[i]);
                }
                tree.node_mut(*node_id).family_size = count as i64;
            }
        }
        Ok(())
    }

    pub fn max_observed_size(&self) -> u64 {
        self.families.iter().map(GeneFamily::max_count).max().unwrap_or(0)
    }

    pub fn write_species_counts<W: Write>(&self, w: &mut W) -> Result<()> {
        write!(w, "Desc\tFamily ID")?;
        for name in &self.species {
            write!(w, "\t{name}")?;
        }
        writeln!(w)?;
        for family in &self.families {
            write!(w, "{}\t{}", family.desc, family.id)?;
            for count in &family.counts {
                write!(w, "\t{count}")?;
            }
            writeln!(w)?;
        }
        Ok(())
    }
}
