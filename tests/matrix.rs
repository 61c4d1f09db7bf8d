use famevol::SquareMatrix;

fn build_matrix() -> SquareMatrix {
    let mut m = SquareMatrix::zeros(3);
    let mut v = 1.0;
    for i in 0..3 {
        for j in 0..3 {
            m.set(i, j, v);
            v += 1.0;
        }
    }
    m
}

#[test]
fn resize_preserves_window_and_zero_fills() {
    let mut m = SquareMatrix::zeros(2);
    m.set(0, 0, 1.0);
    m.set(0, 1, 2.0);
    m.set(1, 0, 3.0);
    m.set(1, 1, 4.0);

    m.resize(3);
    assert_eq!(m.size(), 3);
    assert_eq!(m.get(0, 0), 1.0);
    assert_eq!(m.get(0, 1), 2.0);
    assert_eq!(m.get(1, 0), 3.0);
    assert_eq!(m.get(1, 1), 4.0);
    assert_eq!(m.get(2, 2), 0.0);
    assert_eq!(m.get(0, 2), 0.0);

    m.resize(1);
    assert_eq!(m.size(), 1);
    assert_eq!(m.get(0, 0), 1.0);
}

#[test]
fn ranged_multiply() {
    let m = build_matrix();
    let v = [7.0, 9.0, 11.0];
    let mut result = [0.0; 3];
    m.multiply(&v, 0, 2, 0, 2, &mut result);
    assert_eq!(result, [58.0, 139.0, 220.0]);
}

#[test]
fn ranged_multiply_on_interior_block() {
    let mut m = SquareMatrix::zeros(8);
    let mut v = 1.0;
    for i in 3..=5 {
        for j in 3..=5 {
            m.set(i, j, v);
            v += 1.0;
        }
    }
    let vector = [7.0, 9.0, 11.0];
    let mut result = [0.0; 3];
    m.multiply(&vector, 3, 5, 3, 5, &mut result);
    assert_eq!(result, [58.0, 139.0, 220.0]);
}

#[test]
fn identity_matrix() {
    let m = SquareMatrix::identity(4);
    for i in 0..4 {
        for j in 0..4 {
            assert_eq!(m.get(i, j), if i == j { 1.0 } else { 0.0 });
        }
    }
}
