use ndarray::Array2;

/// Square table of transition probabilities indexed [from][to].
#[derive(Debug, Clone, PartialEq)]
pub struct SquareMatrix {
    values: Array2<f64>,
}

impl SquareMatrix {
    pub fn zeros(size: usize) -> Self {
        Self {
            values: Array2::zeros((size, size)),
        }
    }

    pub fn identity(size: usize) -> Self {
        let mut m = Self::zeros(size);
        for i in 0..size {
            m.values[(i, i)] = 1.0;
        }
        m
    }

    pub fn size(&self) -> usize {
        self.values.nrows()
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[(row, col)]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.values[(row, col)] = value;
    }

    /// Resize in place, keeping the overlapping window and zero-filling
    /// any newly exposed cells.
    pub fn resize(&mut self, new_size: usize) {
        let keep = self.size().min(new_size);
        let mut next = Array2::zeros((new_size, new_size));
        for i in 0..keep {
            for j in 0..keep {
                next[(i, j)] = self.values[(i, j)];
            }
        }
        self.values = next;
    }

    /// Ranged matrix-vector product:
    /// result[i - row_from] = sum over j in [col_from, col_to] of
    /// self[i][j] * vector[j - col_from], for i in [row_from, row_to].
    /// Both ranges are inclusive.
    pub fn multiply(
        &self,
        vector: &[f64],
        row_from: usize,
        row_to: usize,
        col_from: usize,
        col_to: usize,
        result: &mut [f64],
    ) {
        debug_assert!(row_to < self.size() && col_to < self.size());
        debug_assert!(vector.len() >= col_to - col_from + 1);
        debug_assert!(result.len() >= row_to - row_from + 1);
        for i in row_from..=row_to {
            let mut acc = 0.0;
            for j in col_from..=col_to {
                acc += self.values[(i, j)] * vector[j - col_from];
            }
            result[i - row_from] = acc;
        }
    }
}
