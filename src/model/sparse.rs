/// Compressed-sparse-row matrix for the action-mode rate matrices.
///
/// Small S×S generators are stored once per eigen slot and scaled per node;
/// the action kernel only needs matvec against partials blocks, the 1-norm
/// and ∞-norm, and sparse-sparse products for the norm-power estimates.
#[derive(Debug, Clone)]
pub struct CsrMatrix {
    n: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl CsrMatrix {
    pub fn from_triplets(n: usize, triplets: &[(usize, usize, f64)]) -> CsrMatrix {
        let mut sorted: Vec<(usize, usize, f64)> = triplets
            .iter()
            .copied()
            .filter(|&(i, j, v)| i < n && j < n && v != 0.0)
            .collect();
        sorted.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        // Duplicate coordinates accumulate.
        let mut merged: Vec<(usize, usize, f64)> = Vec::with_capacity(sorted.len());
        for (i, j, v) in sorted {
            match merged.last_mut() {
                Some(last) if last.0 == i && last.1 == j => last.2 += v,
                _ => merged.push((i, j, v)),
            }
        }

        let mut row_ptr = vec![0usize; n + 1];
        let mut col_idx = Vec::with_capacity(merged.len());
        let mut values = Vec::with_capacity(merged.len());
        for &(i, j, v) in &merged {
            row_ptr[i + 1] += 1;
            col_idx.push(j);
            values.push(v);
        }
        for i in 0..n {
            row_ptr[i + 1] += row_ptr[i];
        }
        CsrMatrix {
            n,
            row_ptr,
            col_idx,
            values,
        }
    }

    pub fn identity(n: usize) -> CsrMatrix {
        CsrMatrix {
            n,
            row_ptr: (0..=n).collect(),
            col_idx: (0..n).collect(),
            values: vec![1.0; n],
        }
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Sum of the diagonal.
    pub fn trace(&self) -> f64 {
        let mut t = 0.0;
        for i in 0..self.n {
            for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                if self.col_idx[k] == i {
                    t += self.values[k];
                }
            }
        }
        t
    }

    /// Multiply every stored value by `factor`.
    pub fn scaled(&self, factor: f64) -> CsrMatrix {
        let mut out = self.clone();
        for v in &mut out.values {
            *v *= factor;
        }
        out
    }

    /// `self - shift * I`, densifying the diagonal entries where absent.
    pub fn shifted_diagonal(&self, shift: f64) -> CsrMatrix {
        let mut triplets: Vec<(usize, usize, f64)> = Vec::with_capacity(self.nnz() + self.n);
        for i in 0..self.n {
            let mut saw_diag = false;
            for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                let j = self.col_idx[k];
                let mut v = self.values[k];
                if j == i {
                    v -= shift;
                    saw_diag = true;
                }
                triplets.push((i, j, v));
            }
            if !saw_diag {
                triplets.push((i, i, -shift));
            }
        }
        CsrMatrix::from_triplets(self.n, &triplets)
    }

    /// 1-norm: maximum absolute column sum.
    pub fn one_norm(&self) -> f64 {
        let mut col_sums = vec![0.0f64; self.n];
        for k in 0..self.values.len() {
            col_sums[self.col_idx[k]] += self.values[k].abs();
        }
        col_sums.iter().cloned().fold(0.0, f64::max)
    }

    /// y[k·S + i] = Σ_j A[i][j] · x[k·S + j] for every pattern block k.
    ///
    /// Partials blocks are contiguous length-S state vectors per pattern, so
    /// the action of A applies independently to each block.
    pub fn mul_blocks(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), y.len());
        debug_assert_eq!(x.len() % self.n, 0);
        for (xb, yb) in x.chunks_exact(self.n).zip(y.chunks_exact_mut(self.n)) {
            for i in 0..self.n {
                let mut acc = 0.0;
                for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                    acc += self.values[k] * xb[self.col_idx[k]];
                }
                yb[i] = acc;
            }
        }
    }

    /// Sparse-sparse product, used only for the small norm-power estimates.
    pub fn matmul(&self, rhs: &CsrMatrix) -> CsrMatrix {
        debug_assert_eq!(self.n, rhs.n);
        let mut triplets = Vec::new();
        let mut acc = vec![0.0f64; self.n];
        let mut touched = Vec::with_capacity(self.n);
        for i in 0..self.n {
            for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                let a = self.values[k];
                let j = self.col_idx[k];
                for kk in rhs.row_ptr[j]..rhs.row_ptr[j + 1] {
                    let c = rhs.col_idx[kk];
                    if acc[c] == 0.0 {
                        touched.push(c);
                    }
                    acc[c] += a * rhs.values[kk];
                }
            }
            for &c in &touched {
                if acc[c] != 0.0 {
                    triplets.push((i, c, acc[c]));
                }
                acc[c] = 0.0;
            }
            touched.clear();
        }
        CsrMatrix::from_triplets(self.n, &triplets)
    }
}
