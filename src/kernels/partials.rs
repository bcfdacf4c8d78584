//! Scalar post-order and pre-order partials propagation.
//!
//! dest[r,k,i] = (Σ_j M1[r,i,j]·P1[r,k,j]) · (Σ_j M2[r,i,j]·P2[r,k,j])
//!
//! Compact tips collapse a matrix-vector product into a column lookup; the
//! ambiguous state code selects the matrix row sum instead (equivalent to a
//! uniform partial). Pattern loops go parallel above a cutoff so small
//! instances stay on one thread.

use rayon::prelude::*;

use super::Dims;
use crate::store::ChildSource;

/// Below this many patterns the per-op rayon split costs more than it saves.
const PAR_PATTERN_CUTOFF: usize = 128;

/// Column lookup for a compact tip state; the ambiguous code yields the row
/// sum of the transition matrix.
#[inline]
fn tip_entry(m_cat: &[f64], states: usize, row: usize, state: u32) -> f64 {
    if (state as usize) < states {
        m_cat[row * states + state as usize]
    } else {
        let mut sum = 0.0;
        for j in 0..states {
            sum += m_cat[row * states + j];
        }
        sum
    }
}

fn for_each_pattern<F>(dest_cat: &mut [f64], states: usize, f: F)
where
    F: Fn(usize, &mut [f64]) + Sync + Send,
{
    if dest_cat.len() / states >= PAR_PATTERN_CUTOFF {
        dest_cat
            .par_chunks_mut(states)
            .enumerate()
            .for_each(|(k, d)| f(k, d));
    } else {
        for (k, d) in dest_cat.chunks_mut(states).enumerate() {
            f(k, d);
        }
    }
}

pub fn partials_partials(
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
    for r in 0..dims.categories {
        let m1c = &m1[r * ms..(r + 1) * ms];
        let m2c = &m2[r * ms..(r + 1) * ms];
        let p1c = &p1[r * cs..(r + 1) * cs];
        let p2c = &p2[r * cs..(r + 1) * cs];
        for_each_pattern(&mut dest[r * cs..(r + 1) * cs], s, |k, d| {
            let v1 = &p1c[k * s..(k + 1) * s];
            let v2 = &p2c[k * s..(k + 1) * s];
            for i in 0..s {
                let mut sum1 = 0.0;
                let mut sum2 = 0.0;
                for j in 0..s {
                    sum1 += m1c[i * s + j] * v1[j];
                    sum2 += m2c[i * s + j] * v2[j];
                }
                d[i] = sum1 * sum2;
            }
        });
    }
}

pub fn states_partials(
    dest: &mut [f64],
    s1: &[u32],
    m1: &[f64],
    p2: &[f64],
    m2: &[f64],
    dims: Dims,
) {
    let s = dims.states;
    let cs = dims.category_stride();
    let ms = dims.matrix_stride();
    for r in 0..dims.categories {
        let m1c = &m1[r * ms..(r + 1) * ms];
        let m2c = &m2[r * ms..(r + 1) * ms];
        let p2c = &p2[r * cs..(r + 1) * cs];
        for_each_pattern(&mut dest[r * cs..(r + 1) * cs], s, |k, d| {
            let state1 = s1[k];
            let v2 = &p2c[k * s..(k + 1) * s];
            for i in 0..s {
                let mut sum2 = 0.0;
                for j in 0..s {
                    sum2 += m2c[i * s + j] * v2[j];
                }
                d[i] = tip_entry(m1c, s, i, state1) * sum2;
            }
        });
    }
}

pub fn states_states(
    dest: &mut [f64],
    s1: &[u32],
    m1: &[f64],
    s2: &[u32],
    m2: &[f64],
    dims: Dims,
) {
    let s = dims.states;
    let cs = dims.category_stride();
    let ms = dims.matrix_stride();
    for r in 0..dims.categories {
        let m1c = &m1[r * ms..(r + 1) * ms];
        let m2c = &m2[r * ms..(r + 1) * ms];
        for_each_pattern(&mut dest[r * cs..(r + 1) * cs], s, |k, d| {
            let state1 = s1[k];
            let state2 = s2[k];
            for i in 0..s {
                d[i] = tip_entry(m1c, s, i, state1) * tip_entry(m2c, s, i, state2);
            }
        });
    }
}

/// Dispatch one post-order operation to the matching specialization.
pub fn update_op(
    dest: &mut [f64],
    child1: &ChildSource<'_>,
    m1: &[f64],
    child2: &ChildSource<'_>,
    m2: &[f64],
    dims: Dims,
) {
    match (child1, child2) {
        (ChildSource::Partials(p1), ChildSource::Partials(p2)) => {
            partials_partials(dest, p1, m1, p2, m2, dims)
        }
        (ChildSource::States(s1), ChildSource::Partials(p2)) => {
            states_partials(dest, s1, m1, p2, m2, dims)
        }
        (ChildSource::Partials(p1), ChildSource::States(s2)) => {
            states_partials(dest, s2, m2, p1, m1, dims)
        }
        (ChildSource::States(s1), ChildSource::States(s2)) => {
            states_states(dest, s1, m1, s2, m2, dims)
        }
    }
}

/// Same dispatch restricted to an explicit pattern subset (partitioned
/// updates). Patterns outside the subset keep their previous contents.
pub fn update_op_subset(
    dest: &mut [f64],
    child1: &ChildSource<'_>,
    m1: &[f64],
    child2: &ChildSource<'_>,
    m2: &[f64],
    dims: Dims,
    patterns: &[usize],
) {
    let s = dims.states;
    let cs = dims.category_stride();
    let ms = dims.matrix_stride();
    for r in 0..dims.categories {
        let m1c = &m1[r * ms..(r + 1) * ms];
        let m2c = &m2[r * ms..(r + 1) * ms];
        for &k in patterns {
            let base = r * cs + k * s;
            for i in 0..s {
                let e1 = child_entry(child1, m1c, r, k, i, s, cs);
                let e2 = child_entry(child2, m2c, r, k, i, s, cs);
                dest[base + i] = e1 * e2;
            }
        }
    }
}

#[inline]
fn child_entry(
    child: &ChildSource<'_>,
    m_cat: &[f64],
    category: usize,
    pattern: usize,
    row: usize,
    states: usize,
    category_stride: usize,
) -> f64 {
    match child {
        ChildSource::States(st) => tip_entry(m_cat, states, row, st[pattern]),
        ChildSource::Partials(p) => {
            let v = &p[category * category_stride + pattern * states..];
            let mut sum = 0.0;
            for j in 0..states {
                sum += m_cat[row * states + j] * v[j];
            }
            sum
        }
    }
}

/// Pre-order (root-to-tip) propagation for one node.
///
/// dest[r,k,j] = Σ_i M_self[r,i,j] · pre_parent[r,k,i] · (Σ_l M_sib[r,i,l] · post_sib[r,k,l])
///
/// The self matrix enters transposed (summation over its rows), matching the
/// downward direction of the recursion.
pub fn pre_order_op(
    dest: &mut [f64],
    parent_pre: &[f64],
    m_self: &[f64],
    sibling: &ChildSource<'_>,
    m_sib: &[f64],
    dims: Dims,
) {
    let s = dims.states;
    let cs = dims.category_stride();
    let ms = dims.matrix_stride();
    for r in 0..dims.categories {
        let msc = &m_self[r * ms..(r + 1) * ms];
        let mbc = &m_sib[r * ms..(r + 1) * ms];
        let prec = &parent_pre[r * cs..(r + 1) * cs];
        let sib = sibling;
        for_each_pattern(&mut dest[r * cs..(r + 1) * cs], s, |k, d| {
            // tmp_i = pre_parent[i] · (M_sib · post_sib)[i]
            let mut tmp = [0.0f64; 64];
            let tmp = &mut tmp[..s.min(64)];
            if s <= 64 {
                for i in 0..s {
                    tmp[i] = prec[k * s + i] * child_entry(sib, mbc, r, k, i, s, cs);
                }
                for j in 0..s {
                    let mut acc = 0.0;
                    for i in 0..s {
                        acc += msc[i * s + j] * tmp[i];
                    }
                    d[j] = acc;
                }
            } else {
                for j in 0..s {
                    let mut acc = 0.0;
                    for i in 0..s {
                        acc += msc[i * s + j]
                            * prec[k * s + i]
                            * child_entry(sib, mbc, r, k, i, s, cs);
                    }
                    d[j] = acc;
                }
            }
        });
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

    /// Identity matrices make the destination the elementwise child product.
    #[test]
    fn identity_matrices_multiply_children() {
        let d = dims(2, 2, 1);
        let ident = vec![1.0, 0.0, 0.0, 1.0];
        let p1 = vec![0.25, 0.75, 0.5, 0.5];
        let p2 = vec![0.4, 0.6, 1.0, 0.0];
        let mut dest = vec![0.0; 4];
        partials_partials(&mut dest, &p1, &ident, &p2, &ident, d);
        assert_eq!(dest, vec![0.1, 0.45, 0.5, 0.0]);
    }

    #[test]
    fn ambiguous_state_equals_uniform_partial() {
        let d = dims(3, 1, 1);
        let m: Vec<f64> = (1..=9).map(|v| v as f64 * 0.05).collect();
        let mut from_state = vec![0.0; 3];
        let mut from_partial = vec![0.0; 3];
        // State code 3 == state_count marks ambiguity.
        states_partials(&mut from_state, &[3], &m, &[1.0, 1.0, 1.0], &m, d);
        partials_partials(
            &mut from_partial,
            &[1.0, 1.0, 1.0],
            &m,
            &[1.0, 1.0, 1.0],
            &m,
            d,
        );
        for (a, b) in from_state.iter().zip(&from_partial) {
            assert!((a - b).abs() < 1e-15);
        }
    }

    #[test]
    fn states_states_is_column_product() {
        let d = dims(2, 2, 1);
        let m1 = vec![0.9, 0.1, 0.2, 0.8];
        let m2 = vec![0.7, 0.3, 0.4, 0.6];
        let mut dest = vec![0.0; 4];
        states_states(&mut dest, &[0, 1], &m1, &[1, 1], &m2, d);
        // pattern 0: states (0,1): dest_i = m1[i][0] * m2[i][1]
        assert!((dest[0] - 0.9 * 0.3).abs() < 1e-15);
        assert!((dest[1] - 0.2 * 0.6).abs() < 1e-15);
        // pattern 1: states (1,1)
        assert!((dest[2] - 0.1 * 0.3).abs() < 1e-15);
        assert!((dest[3] - 0.8 * 0.6).abs() < 1e-15);
    }

    #[test]
    fn subset_update_leaves_other_patterns() {
        let d = dims(2, 3, 1);
        let ident = vec![1.0, 0.0, 0.0, 1.0];
        let p1 = vec![0.5; 6];
        let p2 = vec![0.5; 6];
        let mut dest = vec![9.0; 6];
        update_op_subset(
            &mut dest,
            &ChildSource::Partials(&p1),
            &ident,
            &ChildSource::Partials(&p2),
            &ident,
            d,
            &[1],
        );
        assert_eq!(dest, vec![9.0, 9.0, 0.25, 0.25, 9.0, 9.0]);
    }

    #[test]
    fn pre_order_identity_round_trip() {
        // With identity matrices and a sibling of all-ones, the pre-order
        // partial is just the parent's pre-order partial.
        let d = dims(2, 2, 1);
        let ident = vec![1.0, 0.0, 0.0, 1.0];
        let parent = vec![0.3, 0.7, 0.6, 0.4];
        let sib = vec![1.0, 1.0, 1.0, 1.0];
        let mut dest = vec![0.0; 4];
        pre_order_op(
            &mut dest,
            &parent,
            &ident,
            &ChildSource::Partials(&sib),
            &ident,
            d,
        );
        assert_eq!(dest, parent);
    }

    #[test]
    fn mixed_child_order_is_symmetric() {
        let d = dims(2, 2, 2);
        let m: Vec<f64> = vec![0.8, 0.2, 0.3, 0.7, 0.9, 0.1, 0.4, 0.6];
        let p: Vec<f64> = vec![0.2, 0.8, 0.6, 0.4, 0.1, 0.9, 0.5, 0.5];
        let s = [0u32, 1];
        let mut a = vec![0.0; 8];
        let mut b = vec![0.0; 8];
        update_op(
            &mut a,
            &ChildSource::States(&s),
            &m,
            &ChildSource::Partials(&p),
            &m,
            d,
        );
        update_op(
            &mut b,
            &ChildSource::Partials(&p),
            &m,
            &ChildSource::States(&s),
            &m,
            d,
        );
        assert_eq!(a, b);
    }
}
