//! Vectorized partials kernels built on `wide::f64x4`.
//!
//! Two forms: a four-state specialization holding one lane vector per
//! pattern-state column, and a general-state path that packs four patterns
//! at a time and broadcasts matrix entries across the block. Both accumulate
//! in the same j-order as the scalar kernel, so outputs differ from the
//! scalar path only by fused-multiply associativity.

use wide::f64x4;

use super::partials;
use super::Dims;
use crate::store::ChildSource;

/// Transpose one 4×4 category block so columns become lane vectors.
#[inline]
fn transpose4(m: &[f64]) -> [f64x4; 4] {
    [
        f64x4::from([m[0], m[4], m[8], m[12]]),
        f64x4::from([m[1], m[5], m[9], m[13]]),
        f64x4::from([m[2], m[6], m[10], m[14]]),
        f64x4::from([m[3], m[7], m[11], m[15]]),
    ]
}

/// Four-state partials×partials: dest column vector per pattern is
/// (Σ_j v1[j]·M1ᵀ[j]) ⊙ (Σ_j v2[j]·M2ᵀ[j]), all lanes vertical.
fn partials_partials_4(dest: &mut [f64], p1: &[f64], m1: &[f64], p2: &[f64], m2: &[f64], dims: Dims) {
    let cs = dims.category_stride();
    for r in 0..dims.categories {
        let m1t = transpose4(&m1[r * 16..(r + 1) * 16]);
        let m2t = transpose4(&m2[r * 16..(r + 1) * 16]);
        let p1c = &p1[r * cs..(r + 1) * cs];
        let p2c = &p2[r * cs..(r + 1) * cs];
        let dc = &mut dest[r * cs..(r + 1) * cs];
        for k in 0..dims.patterns {
            let b = k * 4;
            let mut sum1 = f64x4::splat(p1c[b]) * m1t[0];
            let mut sum2 = f64x4::splat(p2c[b]) * m2t[0];
            for j in 1..4 {
                sum1 += f64x4::splat(p1c[b + j]) * m1t[j];
                sum2 += f64x4::splat(p2c[b + j]) * m2t[j];
            }
            let out = (sum1 * sum2).to_array();
            dc[b..b + 4].copy_from_slice(&out);
        }
    }
}

/// Four-state states×partials: the compact side is a single transposed
/// column (or the row-sum vector for the ambiguous code).
fn states_partials_4(dest: &mut [f64], s1: &[u32], m1: &[f64], p2: &[f64], m2: &[f64], dims: Dims) {
    let cs = dims.category_stride();
    for r in 0..dims.categories {
        let m1t = transpose4(&m1[r * 16..(r + 1) * 16]);
        let m2t = transpose4(&m2[r * 16..(r + 1) * 16]);
        let row_sums = m1t[0] + m1t[1] + m1t[2] + m1t[3];
        let p2c = &p2[r * cs..(r + 1) * cs];
        let dc = &mut dest[r * cs..(r + 1) * cs];
        for k in 0..dims.patterns {
            let b = k * 4;
            let tip = if (s1[k] as usize) < 4 {
                m1t[s1[k] as usize]
            } else {
                row_sums
            };
            let mut sum2 = f64x4::splat(p2c[b]) * m2t[0];
            for j in 1..4 {
                sum2 += f64x4::splat(p2c[b + j]) * m2t[j];
            }
            let out = (tip * sum2).to_array();
            dc[b..b + 4].copy_from_slice(&out);
        }
    }
}

/// General-state partials×partials, four patterns per block with broadcast
/// matrix entries. The trailing remainder runs through the scalar kernel's
/// arithmetic via a one-pattern loop.
fn partials_partials_blocked(
    dest: &mut [f64],
    p1: &[f64],
    m1: &[f64],
    p2: &[f64],
    m2: &[f64],
    dims: Dims,
) {
    let s = dims.states;
    let cs = dims.category_stride();
    let ms = dims.matrix_stride();
    let full_blocks = dims.patterns / 4;

    // Pattern-transposed scratch: packed[j] holds state j for 4 patterns.
    let mut pack1 = vec![f64x4::splat(0.0); s];
    let mut pack2 = vec![f64x4::splat(0.0); s];

    for r in 0..dims.categories {
        let m1c = &m1[r * ms..(r + 1) * ms];
        let m2c = &m2[r * ms..(r + 1) * ms];
        let p1c = &p1[r * cs..(r + 1) * cs];
        let p2c = &p2[r * cs..(r + 1) * cs];

        for blk in 0..full_blocks {
            let k0 = blk * 4;
            for j in 0..s {
                pack1[j] = f64x4::from([
                    p1c[k0 * s + j],
                    p1c[(k0 + 1) * s + j],
                    p1c[(k0 + 2) * s + j],
                    p1c[(k0 + 3) * s + j],
                ]);
                pack2[j] = f64x4::from([
                    p2c[k0 * s + j],
                    p2c[(k0 + 1) * s + j],
                    p2c[(k0 + 2) * s + j],
                    p2c[(k0 + 3) * s + j],
                ]);
            }
            for i in 0..s {
                let mut sum1 = f64x4::splat(m1c[i * s]) * pack1[0];
                let mut sum2 = f64x4::splat(m2c[i * s]) * pack2[0];
                for j in 1..s {
                    sum1 += f64x4::splat(m1c[i * s + j]) * pack1[j];
                    sum2 += f64x4::splat(m2c[i * s + j]) * pack2[j];
                }
                let out = (sum1 * sum2).to_array();
                for lane in 0..4 {
                    dest[r * cs + (k0 + lane) * s + i] = out[lane];
                }
            }
        }

        for k in full_blocks * 4..dims.patterns {
            for i in 0..s {
                let mut sum1 = 0.0;
                let mut sum2 = 0.0;
                for j in 0..s {
                    sum1 += m1c[i * s + j] * p1c[k * s + j];
                    sum2 += m2c[i * s + j] * p2c[k * s + j];
                }
                dest[r * cs + k * s + i] = sum1 * sum2;
            }
        }
    }
}

/// Vectorized dispatch; operations without a profitable SIMD form fall back
/// to the scalar kernel so the backend always completes the operation.
pub fn update_op(
    dest: &mut [f64],
    child1: &ChildSource<'_>,
    m1: &[f64],
    child2: &ChildSource<'_>,
    m2: &[f64],
    dims: Dims,
) {
    match (child1, child2, dims.states) {
        (ChildSource::Partials(p1), ChildSource::Partials(p2), 4) => {
            partials_partials_4(dest, p1, m1, p2, m2, dims)
        }
        (ChildSource::States(s1), ChildSource::Partials(p2), 4) => {
            states_partials_4(dest, s1, m1, p2, m2, dims)
        }
        (ChildSource::Partials(p1), ChildSource::States(s2), 4) => {
            states_partials_4(dest, s2, m2, p1, m1, dims)
        }
        (ChildSource::Partials(p1), ChildSource::Partials(p2), _) => {
            partials_partials_blocked(dest, p1, m1, p2, m2, dims)
        }
        _ => partials::update_op(dest, child1, m1, child2, m2, dims),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(states: usize, patterns: usize, categories: usize) -> Dims {
        Dims {
            states,
            patterns,
            categories,
        }
    }

    fn pseudo(n: usize, seed: u64) -> Vec<f64> {
        // Deterministic fill without pulling rand into unit tests.
        let mut state = seed;
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 11) as f64 / (1u64 << 53) as f64).abs()
            })
            .collect()
    }

    #[test]
    fn four_state_matches_scalar() {
        let d = dims(4, 7, 3);
        let m1 = pseudo(3 * 16, 1);
        let m2 = pseudo(3 * 16, 2);
        let p1 = pseudo(d.categories * d.category_stride(), 3);
        let p2 = pseudo(d.categories * d.category_stride(), 4);
        let mut simd_out = vec![0.0; p1.len()];
        let mut scalar_out = vec![0.0; p1.len()];
        partials_partials_4(&mut simd_out, &p1, &m1, &p2, &m2, d);
        partials::partials_partials(&mut scalar_out, &p1, &m1, &p2, &m2, d);
        for (a, b) in simd_out.iter().zip(&scalar_out) {
            assert!((a - b).abs() < 1e-14, "{} vs {}", a, b);
        }
    }

    #[test]
    fn four_state_tip_matches_scalar() {
        let d = dims(4, 5, 2);
        let m1 = pseudo(2 * 16, 5);
        let m2 = pseudo(2 * 16, 6);
        let p2 = pseudo(d.categories * d.category_stride(), 7);
        let states = [0u32, 3, 4, 1, 2]; // includes the ambiguous code
        let mut simd_out = vec![0.0; p2.len()];
        let mut scalar_out = vec![0.0; p2.len()];
        states_partials_4(&mut simd_out, &states, &m1, &p2, &m2, d);
        partials::states_partials(&mut scalar_out, &states, &m1, &p2, &m2, d);
        for (a, b) in simd_out.iter().zip(&scalar_out) {
            assert!((a - b).abs() < 1e-14);
        }
    }

    #[test]
    fn blocked_general_matches_scalar_with_remainder() {
        // 6 patterns: one full block of 4 plus a remainder of 2.
        let d = dims(5, 6, 2);
        let m1 = pseudo(2 * 25, 11);
        let m2 = pseudo(2 * 25, 12);
        let p1 = pseudo(d.categories * d.category_stride(), 13);
        let p2 = pseudo(d.categories * d.category_stride(), 14);
        let mut simd_out = vec![0.0; p1.len()];
        let mut scalar_out = vec![0.0; p1.len()];
        partials_partials_blocked(&mut simd_out, &p1, &m1, &p2, &m2, d);
        partials::partials_partials(&mut scalar_out, &p1, &m1, &p2, &m2, d);
        for (a, b) in simd_out.iter().zip(&scalar_out) {
            assert!((a - b).abs() < 1e-14);
        }
    }
}
