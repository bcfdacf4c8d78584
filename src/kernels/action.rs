//! Matrix-exponential action on partials.
//!
//! Instead of building P = exp(tQ) explicitly, this backend applies the
//! exponential directly to each partials block with a truncated, rescaled
//! Taylor series. The degree m and squaring count s follow Al-Mohy & Higham
//! ("Computing the action of the matrix exponential"): s is minimized
//! subject to θ_m bounds on ‖A‖₁ and, when the 1-norm alone is too crude,
//! on the sequence d_p = ‖A^p‖₁^{1/p}. A diagonal shift µ = tr(Q)/S is
//! removed before the series and restored as a scalar exp(t·µ/s) factor per
//! squaring step.

use super::Dims;
use crate::model::sparse::CsrMatrix;

/// Series truncation tolerance: unit round-off 2⁻⁵³.
const TOL: f64 = 1.1102230246251565e-16;

const M_MAX: usize = 55;

/// θ_{M_MAX}, the loosest bound in the table below.
const THETA_MAX: f64 = 9.9;

/// θ_m bounds for double-precision backward error (Al-Mohy & Higham,
/// Table A.3, tol = 2⁻⁵³).
const THETA: &[(usize, f64)] = &[
    (1, 2.29e-16),
    (2, 2.58e-8),
    (3, 1.39e-5),
    (4, 3.40e-4),
    (5, 2.40e-3),
    (6, 9.07e-3),
    (7, 2.38e-2),
    (8, 5.00e-2),
    (9, 8.96e-2),
    (10, 1.44e-1),
    (11, 2.14e-1),
    (12, 3.00e-1),
    (13, 4.00e-1),
    (14, 5.14e-1),
    (15, 6.41e-1),
    (16, 7.81e-1),
    (17, 9.31e-1),
    (18, 1.09),
    (19, 1.26),
    (20, 1.44),
    (21, 1.62),
    (22, 1.82),
    (23, 2.01),
    (24, 2.22),
    (25, 2.43),
    (26, 2.64),
    (27, 2.86),
    (28, 3.08),
    (29, 3.31),
    (30, 3.54),
    (35, 4.7),
    (40, 6.0),
    (45, 7.2),
    (50, 8.5),
    (55, 9.9),
];

fn theta_for(m: usize) -> Option<f64> {
    THETA.iter().find(|(mm, _)| *mm == m).map(|(_, t)| *t)
}

/// Max absolute entry of a dense block (Eigen's lpNorm<∞> on a matrix).
fn inf_norm(x: &[f64]) -> f64 {
    x.iter().fold(0.0f64, |acc, v| acc.max(v.abs()))
}

/// Lazily-extended d_p = ‖A^p‖₁^{1/p} estimates.
struct PowerNorms {
    powers: Vec<CsrMatrix>,
    d: Vec<Option<f64>>,
}

impl PowerNorms {
    fn new(a: &CsrMatrix) -> Self {
        PowerNorms {
            powers: vec![a.clone()],
            d: vec![None; 2],
        }
    }

    fn d_value(&mut self, p: usize) -> f64 {
        while self.d.len() <= p {
            self.d.push(None);
        }
        if let Some(v) = self.d[p] {
            return v;
        }
        while self.powers.len() < p {
            let next = self.powers[self.powers.len() - 1].matmul(&self.powers[0]);
            self.powers.push(next);
        }
        let v = self.powers[p - 1].one_norm().powf(1.0 / p as f64);
        self.d[p] = Some(v);
        v
    }
}

/// Pick the Taylor degree m and squaring count s for ‖A‖₁ and `n_col`
/// right-hand-side columns.
pub fn taylor_statistics(a1_norm: f64, a: &CsrMatrix, t: f64, n_col: usize) -> (usize, usize) {
    if t * a1_norm == 0.0 {
        return (0, 1);
    }
    let mut best_m = usize::MAX;
    let mut best_s = usize::MAX;

    let theta_max = THETA_MAX;
    // Largest p with p(p-1) <= mMax + 1.
    let p_max = (0.5 + 0.5 * (5.0 + 4.0 * M_MAX as f64).sqrt()).floor() as usize;

    let fragment_313 =
        a1_norm <= 2.0 * theta_max / (n_col as f64 * M_MAX as f64) * (p_max * (p_max + 3)) as f64;

    if fragment_313 {
        for &(m, theta) in THETA {
            let s = (a1_norm / theta).ceil() as usize;
            if best_m == usize::MAX || m * s < best_m * best_s {
                best_m = m;
                best_s = s;
            }
        }
        (best_m, best_s.max(1))
    } else {
        let mut norms = PowerNorms::new(a);
        for p in 2..p_max {
            for m in (p * (p - 1)).saturating_sub(1)..=M_MAX {
                if let Some(theta) = theta_for(m) {
                    let alpha = norms.d_value(p).max(norms.d_value(p + 1));
                    let s = (alpha / theta).ceil() as usize;
                    if best_m == usize::MAX || m * s < best_m * best_s {
                        best_m = m;
                        best_s = s;
                    }
                }
            }
        }
        (best_m, best_s.max(1))
    }
}

/// dest = exp(t·Q) · dest, applied per pattern block of one category slab.
///
/// `dest` holds `n_col` contiguous state vectors; `scratch` must match its
/// length. The shift µ is removed from Q up front and restored via the
/// per-squaring factor η = exp(t·µ/s).
pub fn expm_multiply(q: &CsrMatrix, t: f64, dest: &mut [f64], scratch: &mut [f64]) {
    let n = q.dim();
    debug_assert_eq!(dest.len() % n, 0);
    let n_col = dest.len() / n;

    let mu = q.trace() / n as f64;
    let a = q.shifted_diagonal(mu);
    let a1_norm = a.one_norm();
    let (m, s) = taylor_statistics(a1_norm, &a, t, n_col);

    // F accumulates the series; dest plays the role of the running term B.
    let mut f = dest.to_vec();
    let eta = (t * mu / s as f64).exp();

    for _ in 0..s {
        let mut c1 = inf_norm(dest);
        for j in 1..=m {
            a.mul_blocks(dest, scratch);
            let factor = t / (s as f64 * j as f64);
            for (d, sc) in dest.iter_mut().zip(scratch.iter()) {
                *d = sc * factor;
            }
            let c2 = inf_norm(dest);
            for (fv, dv) in f.iter_mut().zip(dest.iter()) {
                *fv += dv;
            }
            if c1 + c2 <= TOL * inf_norm(&f) {
                break;
            }
            c1 = c2;
        }
        for fv in f.iter_mut() {
            *fv *= eta;
        }
        dest.copy_from_slice(&f);
    }
}

/// Post-order action update: dest = (exp(Q1)·P1) ⊙ (exp(Q2)·P2) per
/// category. Edge length and category rate are already folded into the
/// scaled matrices, so the series always runs with t = 1.
pub fn partials_partials(
    dest: &mut [f64],
    p1: &[f64],
    q1: &[CsrMatrix],
    p2: &[f64],
    q2: &[CsrMatrix],
    dims: Dims,
) {
    let cs = dims.category_stride();
    let mut left = vec![0.0f64; cs];
    let mut right = vec![0.0f64; cs];
    let mut scratch = vec![0.0f64; cs];
    for r in 0..dims.categories {
        left.copy_from_slice(&p1[r * cs..(r + 1) * cs]);
        right.copy_from_slice(&p2[r * cs..(r + 1) * cs]);
        expm_multiply(&q1[r], 1.0, &mut left, &mut scratch);
        expm_multiply(&q2[r], 1.0, &mut right, &mut scratch);
        let dc = &mut dest[r * cs..(r + 1) * cs];
        for (d, (l, rt)) in dc.iter_mut().zip(left.iter().zip(right.iter())) {
            *d = l * rt;
        }
    }
}
