use std::io::Cursor;
use std::io::Write;

use famevol::error_model::{
    apply_error_model, clear_error_models, remove_error_model, ErrorModel,
};
use famevol::family::{FamilyTable, GeneFamily};
use famevol::tree::{FamilySizeRange, PhyloTree};

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}"
    );
}

const SIMPLE_MODEL: &str = "maxcnt:5\n\
cntdiff -1 0 1\n\
0 0.0 0.8 0.2\n\
1 0.2 0.6 0.2\n";

#[test]
fn load_fills_omitted_rows_from_previous_distribution() {
    let model = ErrorModel::from_reader(Cursor::new(SIMPLE_MODEL), 0).expect("load failed");
    assert_eq!(model.maxfamilysize(), 5);
    assert_eq!(model.fromdiff(), -1);
    assert_eq!(model.todiff(), 1);

    // Sizes 2..=4 adopt size 1's distribution.
    for true_size in 2..=4usize {
        approx_eq(model.probability(true_size - 1, true_size), 0.2, 1e-9);
        approx_eq(model.probability(true_size, true_size), 0.6, 1e-9);
        approx_eq(model.probability(true_size + 1, true_size), 0.2, 1e-9);
    }
}

#[test]
fn column_sums_close_after_load() {
    let model = ErrorModel::from_reader(Cursor::new(SIMPLE_MODEL), 0).expect("load failed");
    for true_size in 0..=5 {
        let sum: f64 = (0..=5).map(|obs| model.probability(obs, true_size)).sum();
        approx_eq(sum, 1.0, 1e-9);
    }
    // The top boundary column loses its +1 class and is renormalized.
    approx_eq(model.probability(5, 5), 0.75, 1e-9);
    approx_eq(model.probability(4, 5), 0.25, 1e-9);
}

#[test]
fn load_honors_larger_working_range() {
    let model = ErrorModel::from_reader(Cursor::new(SIMPLE_MODEL), 9).expect("load failed");
    assert_eq!(model.maxfamilysize(), 9);
    approx_eq(model.probability(7, 7), 0.6, 1e-9);
}

#[test]
fn empty_file_is_a_hard_error() {
    let err = ErrorModel::from_reader(Cursor::new(""), 0).expect_err("expected load error");
    assert!(err.to_string().contains("empty error model file"));
}

#[test]
fn bad_column_count_is_a_hard_error() {
    let text = "maxcnt:3\ncntdiff -1 0 1\n0 0.8 0.2\n";
    let err = ErrorModel::from_reader(Cursor::new(text), 0).expect_err("expected load error");
    assert!(err.to_string().contains("probabilities"));
}

#[test]
fn broken_column_sum_is_a_hard_error() {
    // Interior column for true size 1 sums to 0.7 with nothing clipped.
    let text = "maxcnt:3\ncntdiff -1 0 1\n0 0.0 0.8 0.2\n1 0.2 0.3 0.2\n";
    let err = ErrorModel::from_reader(Cursor::new(text), 0).expect_err("expected load error");
    assert!(err.to_string().contains("sums to"));
}

#[test]
fn write_renders_out_of_range_cells_as_nan_marker() {
    let model = ErrorModel::from_reader(Cursor::new(SIMPLE_MODEL), 0).expect("load failed");
    let mut out = Vec::new();
    model.write_to(&mut out).expect("write failed");
    let text = String::from_utf8(out).expect("invalid utf8");

    assert!(text.starts_with("maxcnt:5\ncntdiff -1 0 1\n"));
    let lines: Vec<&str> = text.lines().collect();
    // Size 0 cannot lose a member; size 5 cannot gain one.
    assert_eq!(lines[2], "0 #nan 0.80 0.20");
    assert!(lines[7].starts_with("5 "));
    assert!(lines[7].ends_with("#nan"));
}

#[test]
fn write_read_round_trip() {
    let model = ErrorModel::from_reader(Cursor::new(SIMPLE_MODEL), 0).expect("load failed");
    let mut out = Vec::new();
    model.write_to(&mut out).expect("write failed");
    let reloaded = ErrorModel::from_reader(Cursor::new(out), 0).expect("reload failed");

    assert_eq!(reloaded.maxfamilysize(), model.maxfamilysize());
    assert_eq!(reloaded.fromdiff(), model.fromdiff());
    assert_eq!(reloaded.todiff(), model.todiff());
    for true_size in 0..=5 {
        for observed in 0..=5 {
            approx_eq(
                reloaded.probability(observed, true_size),
                model.probability(observed, true_size),
                5e-3,
            );
        }
    }
}

fn table_and_tree() -> (FamilyTable, PhyloTree) {
    let range = FamilySizeRange::new(0, 5, 0, 5);
    let tree = PhyloTree::from_newick("((A:1,B:1):1,(C:1,D:1):1)", &range, 0.01, -1.0)
        .expect("failed to parse tree");
    let mut table = FamilyTable::new(vec![
        "A".to_string(),
        "B".to_string(),
        "C".to_string(),
        "D".to_string(),
    ]);
    table
        .add_family(GeneFamily::new("ENS01", "description", vec![1, 2, 3, 4]))
        .expect("add failed");
    table.set_species_index(&tree);
    (table, tree)
}

#[test]
fn apply_to_one_species_and_reuse_by_filename() {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let path = dir.path().join("errors.txt");
    std::fs::File::create(&path)
        .and_then(|mut f| f.write_all(SIMPLE_MODEL.as_bytes()))
        .expect("write failed");

    let (mut table, mut tree) = table_and_tree();
    let range = tree.range;
    apply_error_model(&mut table, &mut tree, &range, &path, Some("b")).expect("apply failed");

    assert_eq!(table.errors.len(), 1);
    assert_eq!(table.error_ptr, vec![None, Some(0), None, None]);
    let b = tree.find_node("B").expect("missing leaf");
    assert_eq!(tree.node(b).error_model, Some(0));

    // Same file applied again: the loaded model is reused, not reloaded.
    apply_error_model(&mut table, &mut tree, &range, &path, Some("C")).expect("apply failed");
    assert_eq!(table.errors.len(), 1);
    assert_eq!(table.error_ptr, vec![None, Some(0), Some(0), None]);

    // Unknown species are silently ignored.
    apply_error_model(&mut table, &mut tree, &range, &path, Some("walrus"))
        .expect("apply failed");
    assert_eq!(table.errors.len(), 1);
}

#[test]
fn apply_to_all_species_and_remove() {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let path = dir.path().join("errors.txt");
    std::fs::File::create(&path)
        .and_then(|mut f| f.write_all(SIMPLE_MODEL.as_bytes()))
        .expect("write failed");

    let (mut table, mut tree) = table_and_tree();
    let range = tree.range;
    apply_error_model(&mut table, &mut tree, &range, &path, None).expect("apply failed");
    assert!(table.error_ptr.iter().all(|slot| slot.is_some()));

    remove_error_model(&mut table, &mut tree, "a");
    assert_eq!(table.error_ptr[0], None);
    let a = tree.find_node("A").expect("missing leaf");
    assert_eq!(tree.node(a).error_model, None);

    clear_error_models(&mut table, &mut tree);
    assert!(table.errors.is_empty());
    assert!(table.error_ptr.iter().all(|slot| slot.is_none()));
    for node in tree.nodes() {
        assert_eq!(node.error_model, None);
    }
}

#[test]
fn missing_file_reports_the_path() {
    let (mut table, mut tree) = table_and_tree();
    let range = tree.range;
    let err = apply_error_model(
        &mut table,
        &mut tree,
        &range,
        std::path::Path::new("no_such_model.txt"),
        None,
    )
    .expect_err("expected io error");
    assert!(err.to_string().contains("no_such_model.txt"));
}
