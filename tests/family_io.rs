use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

use famevol::family::{
    FamilyTable, GeneFamily, SYNC_INDEX_RANGE, SYNC_UNMAPPED_SPECIES,
};
use famevol::io::families::read_family_table;
use famevol::tree::{FamilySizeRange, PhyloTree};

const TABLE: &str = "Desc\tFamily ID\tchimp\thuman\tmouse\trat\tdog\n\
description\tENS01\t3\t5\t7\t11\t13\n\
description\tENS02\t2\t2\t2\t2\t2\n";

fn five_species_tree() -> PhyloTree {
    let range = FamilySizeRange::new(0, 15, 0, 15);
    PhyloTree::from_newick(
        "(((chimp:6,human:6):81,(mouse:17,rat:17):70):6,dog:9)",
        &range,
        0.01,
        -1.0,
    )
    .expect("failed to parse tree")
}

#[test]
fn parse_family_row() {
    let family = GeneFamily::parse_line("description\tENS01\t3\t5\t7\t11\t13")
        .expect("parse failed");
    assert_eq!(family.id, "ENS01");
    assert_eq!(family.desc, "description");
    assert_eq!(family.counts, vec![3, 5, 7, 11, 13]);
    assert_eq!(family.max_count(), 13);
}

#[test]
fn parse_family_row_rejects_bad_counts() {
    let err = GeneFamily::parse_line("desc\tENS01\tthree").expect_err("expected parse error");
    assert!(err.to_string().contains("invalid family count"));
    let err = GeneFamily::parse_line("lonely").expect_err("expected parse error");
    assert!(err.to_string().contains("at least one count"));
}

#[test]
fn read_table_from_file() {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let path = dir.path().join("families.tsv");
    std::fs::write(&path, TABLE).expect("write failed");

    let table = read_family_table(&path).expect("read failed");
    assert_eq!(
        table.species,
        vec!["chimp", "human", "mouse", "rat", "dog"]
    );
    assert_eq!(table.families.len(), 2);
    assert_eq!(table.families[0].counts, vec![3, 5, 7, 11, 13]);
    assert_eq!(table.max_observed_size(), 13);
}

#[test]
fn read_table_from_gzip() {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let path = dir.path().join("families.tsv.gz");
    let file = std::fs::File::create(&path).expect("create failed");
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(TABLE.as_bytes()).expect("write failed");
    encoder.finish().expect("finish failed");

    let table = read_family_table(&path).expect("read failed");
    assert_eq!(table.families.len(), 2);
    assert_eq!(table.families[1].id, "ENS02");
}

#[test]
fn mismatched_count_arity_is_rejected() {
    let mut table = FamilyTable::new(vec!["A".to_string(), "B".to_string()]);
    let err = table
        .add_family(GeneFamily::new("ENS01", "description", vec![1, 2, 3]))
        .expect_err("expected arity error");
    assert!(err.to_string().contains("3 counts for 2 species"));
}

#[test]
fn species_index_sync_and_sanity_bits() {
    let tree = five_species_tree();
    let mut table = FamilyTable::new(vec!["chimp".to_string(), "HUMAN".to_string()]);

    // Not yet synchronized.
    assert_eq!(
        table.sync_sanity_check(&tree) & SYNC_UNMAPPED_SPECIES,
        SYNC_UNMAPPED_SPECIES
    );

    table.set_species_index(&tree);
    assert_eq!(table.sync_sanity_check(&tree), 0);
    assert_eq!(table.index, vec![Some(0), Some(2)]);

    table.index[0] = Some(1000);
    assert_eq!(
        table.sync_sanity_check(&tree) & SYNC_INDEX_RANGE,
        SYNC_INDEX_RANGE
    );

    // Both problems are reported at once.
    table.index[1] = None;
    let problems = table.sync_sanity_check(&tree);
    assert_eq!(problems & SYNC_INDEX_RANGE, SYNC_INDEX_RANGE);
    assert_eq!(problems & SYNC_UNMAPPED_SPECIES, SYNC_UNMAPPED_SPECIES);
}

#[test]
fn family_sizes_land_on_the_mapped_leaves() {
    let mut tree = five_species_tree();
    let mut table = FamilyTable::new(vec![
        "chimp".to_string(),
        "human".to_string(),
        "mouse".to_string(),
        "rat".to_string(),
        "dog".to_string(),
    ]);
    table
        .add_family(GeneFamily::new("ENS01", "description", vec![3, 5, 7, 11, 13]))
        .expect("add failed");
    table.set_species_index(&tree);
    table.set_family_sizes(0, &mut tree).expect("set failed");

    assert_eq!(tree.node(0).family_size, 3);
    assert_eq!(tree.node(2).family_size, 5);
    assert_eq!(tree.node(4).family_size, 7);
    assert_eq!(tree.node(6).family_size, 11);
    assert_eq!(tree.node(8).family_size, 13);
    // Internal nodes are untouched.
    assert_eq!(tree.node(3).family_size, -1);
}

#[test]
fn species_counts_round_trip_through_text() {
    let mut table = FamilyTable::new(vec!["chimp".to_string()]);
    table
        .add_family(GeneFamily::new("id", "description", vec![3]))
        .expect("add failed");
    let mut out = Vec::new();
    table.write_species_counts(&mut out).expect("write failed");
    let text = String::from_utf8(out).expect("invalid utf8");
    assert!(text.contains("Desc\tFamily ID\tchimp\n"));
    assert!(text.contains("description\tid\t3\n"));
}
