/// Precomputed ln C(n, k) table.
///
/// The birth-death transition formula indexes binomials up to
/// n = s + c - 1 <= 2 * max_family_size - 1, so a cache built for
/// `size` covers every n <= 2 * size.
#[derive(Debug, Clone)]
pub struct BinomialCache {
    size: usize,
    values: Vec<Vec<f64>>,
}

impl BinomialCache {
    pub fn new(size: usize) -> Self {
        let mut cache = Self {
            size: 0,
            values: Vec::new(),
        };
        cache.ensure(size);
        cache
    }

    /// The max family size this cache was built for.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `ln_choose` may be called with first argument up to 2 * n.
    pub fn covers(&self, n: usize) -> bool {
        n <= self.size
    }

    /// Grow the table to cover `size`; never shrinks.
    pub fn ensure(&mut self, size: usize) {
        if size <= self.size && !self.values.is_empty() {
            return;
        }
        let n_max = 2 * size;
        let mut ln_fact = vec![0.0f64; n_max + 1];
        for n in 1..=n_max {
            ln_fact[n] = ln_fact[n - 1] + (n as f64).ln();
        }
        let mut values = Vec::with_capacity(n_max + 1);
        for n in 0..=n_max {
            let mut row = Vec::with_capacity(n + 1);
            for k in 0..=n {
                row.push(ln_fact[n] - ln_fact[k] - ln_fact[n - k]);
            }
            values.push(row);
        }
        self.size = size;
        self.values = values;
    }

    #[inline]
    pub fn ln_choose(&self, n: usize, k: usize) -> f64 {
        debug_assert!(n < self.values.len(), "binomial cache too small for n={n}");
        debug_assert!(k <= n);
        self.values[n][k]
    }
}
