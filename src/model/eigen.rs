use crate::core::error::{check_len, Result};

/// A decomposed rate matrix Q = U diag(Λ) U⁻¹.
///
/// The complex form stores eigenvalues as `[re; S]` followed by `[im; S]`;
/// a conjugate pair occupies two adjacent positions whose imaginary parts
/// are negatives of each other. Pairs are normalized on construction so the
/// member with positive imaginary part leads, making block order stable
/// across repeated `set` calls.
#[derive(Debug, Clone)]
pub struct EigenDecomposition {
    state_count: usize,
    /// Eigenvectors U, row-major S×S.
    evec: Vec<f64>,
    /// Inverse eigenvectors U⁻¹, row-major S×S.
    ivec: Vec<f64>,
    /// Real parts of the eigenvalues, length S.
    values: Vec<f64>,
    /// Imaginary parts, length S; all zero for a real decomposition.
    values_im: Vec<f64>,
    complex: bool,
}

impl EigenDecomposition {
    pub fn real(state_count: usize, evec: &[f64], ivec: &[f64], values: &[f64]) -> Result<Self> {
        let s2 = state_count * state_count;
        check_len("eigenvectors", evec.len(), s2)?;
        check_len("inverse eigenvectors", ivec.len(), s2)?;
        check_len("eigenvalues", values.len(), state_count)?;
        Ok(EigenDecomposition {
            state_count,
            evec: evec.to_vec(),
            ivec: ivec.to_vec(),
            values: values.to_vec(),
            values_im: vec![0.0; state_count],
            complex: false,
        })
    }

    /// Complex form: `values` carries 2S entries, real parts then imaginary
    /// parts. Conjugate pairs are normalized in place.
    pub fn complex(state_count: usize, evec: &[f64], ivec: &[f64], values: &[f64]) -> Result<Self> {
        let s2 = state_count * state_count;
        check_len("eigenvectors", evec.len(), s2)?;
        check_len("inverse eigenvectors", ivec.len(), s2)?;
        check_len("eigenvalues", values.len(), 2 * state_count)?;
        let mut model = EigenDecomposition {
            state_count,
            evec: evec.to_vec(),
            ivec: ivec.to_vec(),
            values: values[..state_count].to_vec(),
            values_im: values[state_count..].to_vec(),
            complex: true,
        };
        model.normalize_pairs();
        Ok(model)
    }

    /// Ensure each conjugate pair leads with the positive imaginary part.
    /// Negating the imaginary part of a pair flips the sign of the rotation
    /// block, which is compensated by negating the trailing column of U and
    /// the trailing row of U⁻¹, leaving U B U⁻¹ unchanged.
    fn normalize_pairs(&mut self) {
        let s = self.state_count;
        let mut i = 0;
        while i < s {
            if self.values_im[i] != 0.0 {
                if self.values_im[i] < 0.0 {
                    self.values_im[i] = -self.values_im[i];
                    self.values_im[i + 1] = -self.values_im[i + 1];
                    for row in 0..s {
                        self.evec[row * s + i + 1] = -self.evec[row * s + i + 1];
                    }
                    for col in 0..s {
                        self.ivec[(i + 1) * s + col] = -self.ivec[(i + 1) * s + col];
                    }
                }
                i += 2;
            } else {
                i += 1;
            }
        }
    }

    pub fn state_count(&self) -> usize {
        self.state_count
    }

    pub fn is_complex(&self) -> bool {
        self.complex
    }

    pub fn eigenvectors(&self) -> &[f64] {
        &self.evec
    }

    pub fn inverse_eigenvectors(&self) -> &[f64] {
        &self.ivec
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_im(&self) -> &[f64] {
        &self.values_im
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_rejects_bad_lengths() {
        let evec = vec![0.0; 4];
        assert!(EigenDecomposition::real(2, &evec, &evec, &[0.0, -1.0]).is_ok());
        assert!(EigenDecomposition::real(2, &evec, &evec, &[0.0]).is_err());
        assert!(EigenDecomposition::real(3, &evec, &evec, &[0.0; 3]).is_err());
    }

    #[test]
    fn pair_normalization_is_idempotent_and_sign_stable() {
        // 2x2 rotation-like system with eigenvalues 0 ± i.
        let evec = vec![1.0, 0.0, 0.0, 1.0];
        let ivec = vec![1.0, 0.0, 0.0, 1.0];
        // Pair supplied with the negative imaginary part first.
        let vals = vec![0.0, 0.0, -1.0, 1.0];
        let m = EigenDecomposition::complex(2, &evec, &ivec, &vals).unwrap();
        assert_eq!(m.values_im(), &[1.0, -1.0]);
        // Trailing column of U and row of U⁻¹ were negated to compensate.
        assert_eq!(m.eigenvectors(), &[1.0, -0.0, 0.0, -1.0]);
        assert_eq!(m.inverse_eigenvectors(), &[1.0, 0.0, -0.0, -1.0]);

        // Re-setting with the already-normalized order changes nothing.
        let vals2 = vec![0.0, 0.0, 1.0, -1.0];
        let m2 = EigenDecomposition::complex(2, &evec, &ivec, &vals2).unwrap();
        assert_eq!(m2.values_im(), &[1.0, -1.0]);
        assert_eq!(m2.eigenvectors(), &[1.0, 0.0, 0.0, 1.0]);
    }
}
