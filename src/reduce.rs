//! Reduction kernels: log-likelihoods, derivatives, cross products.
//!
//! site_lik(k) = Σ_r w_r · Σ_i π_i · P_root[r,k,i]
//! site_logL(k) = ln(site_lik(k)) + cum(k)        (log scalers)
//!              = ln(site_lik(k) · cum(k))        (raw scalers)
//! logL = Σ_k pattern_weight(k) · site_logL(k)
//!
//! Edge reductions push one transition (or differential) matrix between a
//! parent partials buffer and a child buffer; gradients combine post-order
//! and pre-order partials with a rate-scaled Q. The per-pattern denominator
//! of a gradient is Σ_r w_r Σ_i pre[r,k,i]·post[r,k,i], which equals the
//! site likelihood at any node of the tree.

use crate::core::error::{Error, Result};
use crate::kernels::Dims;
use crate::scaling::{log_contribution, ScalerRepr};
use crate::store::ChildSource;

/// Σ_i π_i · P[r,k,i] accumulated over weighted categories for one pattern.
#[inline]
fn weighted_site_lik(partials: &[f64], weights: &[f64], freqs: &[f64], dims: Dims, k: usize) -> f64 {
    let s = dims.states;
    let cs = dims.category_stride();
    let mut lik = 0.0;
    for (r, w) in weights.iter().enumerate() {
        let base = r * cs + k * s;
        let mut inner = 0.0;
        for i in 0..s {
            inner += freqs[i] * partials[base + i];
        }
        lik += w * inner;
    }
    lik
}

/// Σ_j M[r,i,j]·child[r,k,j] with the compact-tip collapse.
#[inline]
fn child_dot(
    child: &ChildSource<'_>,
    matrix_cat: &[f64],
    r: usize,
    k: usize,
    i: usize,
    dims: Dims,
) -> f64 {
    let s = dims.states;
    match child {
        ChildSource::States(states) => {
            let st = states[k] as usize;
            if st < s {
                matrix_cat[i * s + st]
            } else {
                let mut sum = 0.0;
                for j in 0..s {
                    sum += matrix_cat[i * s + j];
                }
                sum
            }
        }
        ChildSource::Partials(p) => {
            let base = r * dims.category_stride() + k * s;
            let mut sum = 0.0;
            for j in 0..s {
                sum += matrix_cat[i * s + j] * p[base + j];
            }
            sum
        }
    }
}

fn finite_or(value: f64, what: &'static str) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::NumericalFailure(what))
    }
}

/// Root reduction over the full pattern set or an explicit subset.
///
/// Site log-likelihoods of the covered patterns are written into
/// `site_log_out` (a full-length K buffer); the return value is the
/// pattern-weighted total.
pub fn root_log_likelihood(
    partials: &[f64],
    weights: &[f64],
    freqs: &[f64],
    cumulative: Option<&[f64]>,
    repr: ScalerRepr,
    pattern_weights: &[f64],
    dims: Dims,
    patterns: Option<&[usize]>,
    site_log_out: &mut [f64],
) -> Result<f64> {
    let mut total = 0.0;
    let mut reduce_one = |k: usize| -> Result<()> {
        let lik = weighted_site_lik(partials, weights, freqs, dims, k);
        let mut site = lik.ln();
        if let Some(cum) = cumulative {
            site += log_contribution(repr, cum[k]);
        }
        let site = finite_or(site, "root site log-likelihood")?;
        site_log_out[k] = site;
        total += pattern_weights[k] * site;
        Ok(())
    };
    match patterns {
        None => {
            for k in 0..dims.patterns {
                reduce_one(k)?;
            }
        }
        Some(subset) => {
            for &k in subset {
                reduce_one(k)?;
            }
        }
    }
    finite_or(total, "root log-likelihood")
}

/// Edge reduction with optional first/second derivative matrices.
///
/// num(k) = Σ_r w_r Σ_i π_i · parent[r,k,i] · (Σ_j M'[r,i,j]·child[r,k,j]);
/// dlogL/db  = Σ_k pw_k · num1/f,
/// d²logL/db² = Σ_k pw_k · (num2/f − (num1/f)²), f = site_lik.
pub struct EdgeReduction {
    pub log_likelihood: f64,
    pub first: Option<f64>,
    pub second: Option<f64>,
}

#[allow(clippy::too_many_arguments)]
pub fn edge_log_likelihood(
    parent: &[f64],
    child: &ChildSource<'_>,
    matrix: &[f64],
    d1_matrix: Option<&[f64]>,
    d2_matrix: Option<&[f64]>,
    weights: &[f64],
    freqs: &[f64],
    cumulative: Option<&[f64]>,
    repr: ScalerRepr,
    pattern_weights: &[f64],
    dims: Dims,
    site_log_out: &mut [f64],
) -> Result<EdgeReduction> {
    let s = dims.states;
    let cs = dims.category_stride();
    let ms = dims.matrix_stride();

    let mut total = 0.0;
    let mut d1_total = 0.0;
    let mut d2_total = 0.0;

    for k in 0..dims.patterns {
        let mut f = 0.0;
        let mut num1 = 0.0;
        let mut num2 = 0.0;
        for (r, w) in weights.iter().enumerate() {
            let mcat = &matrix[r * ms..(r + 1) * ms];
            let base = r * cs + k * s;
            let mut inner = 0.0;
            let mut inner1 = 0.0;
            let mut inner2 = 0.0;
            for i in 0..s {
                let pi_parent = freqs[i] * parent[base + i];
                inner += pi_parent * child_dot(child, mcat, r, k, i, dims);
                if let Some(d1) = d1_matrix {
                    inner1 +=
                        pi_parent * child_dot(child, &d1[r * ms..(r + 1) * ms], r, k, i, dims);
                }
                if let Some(d2) = d2_matrix {
                    inner2 +=
                        pi_parent * child_dot(child, &d2[r * ms..(r + 1) * ms], r, k, i, dims);
                }
            }
            f += w * inner;
            num1 += w * inner1;
            num2 += w * inner2;
        }

        let mut site = f.ln();
        if let Some(cum) = cumulative {
            site += log_contribution(repr, cum[k]);
        }
        let site = finite_or(site, "edge site log-likelihood")?;
        site_log_out[k] = site;
        total += pattern_weights[k] * site;

        if d1_matrix.is_some() {
            let ratio = num1 / f;
            d1_total += pattern_weights[k] * ratio;
            if d2_matrix.is_some() {
                d2_total += pattern_weights[k] * (num2 / f - ratio * ratio);
            }
        }
    }

    Ok(EdgeReduction {
        log_likelihood: finite_or(total, "edge log-likelihood")?,
        first: if d1_matrix.is_some() {
            Some(finite_or(d1_total, "edge first derivative")?)
        } else {
            None
        },
        second: if d2_matrix.is_some() {
            Some(finite_or(d2_total, "edge second derivative")?)
        } else {
            None
        },
    })
}

/// Post-order state vector entry for pattern k, state j: a partials lookup,
/// or the implied unit/uniform vector of a compact tip.
#[inline]
fn post_entry(post: &ChildSource<'_>, base: usize, k: usize, j: usize, states: usize) -> f64 {
    match post {
        ChildSource::Partials(p) => p[base + j],
        ChildSource::States(st) => {
            let state = st[k] as usize;
            if state >= states || state == j {
                1.0
            } else {
                0.0
            }
        }
    }
}

/// Per-pattern first derivative of one edge from its post-order partials
/// (or compact tip states), pre-order partials and the rate-scaled
/// differential matrix.
///
/// Writes num(k)/f(k) into `out_first` and returns the pattern-weighted sum.
pub fn edge_gradient(
    post: &ChildSource<'_>,
    pre: &[f64],
    diff_matrix: &[f64],
    weights: &[f64],
    pattern_weights: &[f64],
    dims: Dims,
    out_first: &mut [f64],
) -> Result<f64> {
    let s = dims.states;
    let cs = dims.category_stride();
    let ms = dims.matrix_stride();
    let mut sum = 0.0;
    for k in 0..dims.patterns {
        let mut numer = 0.0;
        let mut denom = 0.0;
        for (r, w) in weights.iter().enumerate() {
            let qcat = &diff_matrix[r * ms..(r + 1) * ms];
            let base = r * cs + k * s;
            for i in 0..s {
                let mut acc = 0.0;
                for j in 0..s {
                    acc += qcat[i * s + j] * post_entry(post, base, k, j, s);
                }
                numer += w * pre[base + i] * acc;
                denom += w * pre[base + i] * post_entry(post, base, k, i, s);
            }
        }
        let g = finite_or(numer / denom, "edge gradient")?;
        out_first[k] = g;
        sum += pattern_weights[k] * g;
    }
    finite_or(sum, "edge gradient sum")
}

/// Accumulate one edge's contribution to the S×S cross-product matrix:
/// out[i,j] += Σ_k pw_k/f(k) · Σ_r w_r · r_r · t · pre[r,k,i] · post[r,k,j].
#[allow(clippy::too_many_arguments)]
pub fn accumulate_cross_product(
    post: &ChildSource<'_>,
    pre: &[f64],
    rates: &[f64],
    weights: &[f64],
    edge_length: f64,
    pattern_weights: &[f64],
    dims: Dims,
    out: &mut [f64],
) -> Result<()> {
    let s = dims.states;
    let cs = dims.category_stride();
    for k in 0..dims.patterns {
        let mut denom = 0.0;
        for (r, w) in weights.iter().enumerate() {
            let base = r * cs + k * s;
            for i in 0..s {
                denom += w * pre[base + i] * post_entry(post, base, k, i, s);
            }
        }
        if denom == 0.0 {
            return Err(Error::NumericalFailure("cross-product denominator"));
        }
        let scale = pattern_weights[k] / denom;
        for (r, w) in weights.iter().enumerate() {
            let base = r * cs + k * s;
            let factor = w * rates[r] * edge_length * scale;
            for i in 0..s {
                let pi = factor * pre[base + i];
                if pi == 0.0 {
                    continue;
                }
                for j in 0..s {
                    out[i * s + j] += pi * post_entry(post, base, k, j, s);
                }
            }
        }
    }
    Ok(())
}
