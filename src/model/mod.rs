//! Substitution-model stores.
//!
//! Two distinct schemas, selected by the instance's computation mode:
//! [`eigen`] holds dense decompositions (real or conjugate-pair complex) for
//! the exponentiation path; [`sparse`] holds triplet-form rate matrices for
//! the action path.

pub mod eigen;
pub mod sparse;

pub use eigen::EigenDecomposition;
pub use sparse::CsrMatrix;

/// Analytic eigensystem of the S-state Jukes-Cantor generator (off-diagonal
/// rate 1/(S-1), unit total rate): eigenvalue 0 on the constant vector and
/// -S/(S-1) with multiplicity S-1, diagonalized by the orthonormal Helmert
/// basis so U⁻¹ = Uᵀ. Returns (eigenvectors, inverse eigenvectors,
/// eigenvalues) in the row-major layout `set_eigen_decomposition` expects.
pub fn jukes_cantor_eigensystem(state_count: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let s = state_count;
    // Helmert rows: h_0 = 1/√S; h_j has 1/√(j(j+1)) before position j and
    // -j/√(j(j+1)) at it.
    let mut h = vec![0.0f64; s * s];
    for i in 0..s {
        h[i] = 1.0 / (s as f64).sqrt();
    }
    for j in 1..s {
        let norm = 1.0 / ((j * (j + 1)) as f64).sqrt();
        for i in 0..j {
            h[j * s + i] = norm;
        }
        h[j * s + j] = -(j as f64) * norm;
    }

    let mut evec = vec![0.0f64; s * s];
    for i in 0..s {
        for j in 0..s {
            evec[i * s + j] = h[j * s + i];
        }
    }
    let mut eval = vec![-(s as f64) / (s as f64 - 1.0); s];
    eval[0] = 0.0;
    (evec, h, eval)
}

/// The matching sparse generator as a triplet list for the action backend:
/// coordinate pairs, the descriptor `[nnz]`, and the values.
pub fn jukes_cantor_triplets(state_count: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let s = state_count;
    let off = 1.0 / (s as f64 - 1.0);
    let mut coords = Vec::with_capacity(2 * s * s);
    let mut values = Vec::with_capacity(s * s);
    for i in 0..s {
        for j in 0..s {
            coords.push(i as f64);
            coords.push(j as f64);
            values.push(if i == j { -1.0 } else { off });
        }
    }
    (coords, vec![(s * s) as f64], values)
}
