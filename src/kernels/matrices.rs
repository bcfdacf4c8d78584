//! Transition-probability matrix construction from eigen decompositions.
//!
//! P(b) = U · diag(exp(b · r · Λ)) · U⁻¹ per rate category, stacked into one
//! [R, S, S] slot. Complex conjugate pairs contribute 2×2 rotation blocks.
//! Derivative matrices reuse the same sandwich with diag weights r·Λ·exp(·)
//! and (r·Λ)²·exp(·).

use crate::core::error::Result;
use crate::model::eigen::EigenDecomposition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivativeOrder {
    Zeroth,
    First,
    Second,
}

/// Diagonal weight for one real eigenvalue under rate multiplier `rate`.
fn real_weight(order: DerivativeOrder, lambda: f64, rate: f64, edge: f64) -> f64 {
    let scaled = rate * lambda;
    let e = (edge * scaled).exp();
    match order {
        DerivativeOrder::Zeroth => e,
        DerivativeOrder::First => scaled * e,
        DerivativeOrder::Second => scaled * scaled * e,
    }
}

/// Complex diagonal weight (wr, wi) for eigenvalue α + iβ under `rate`.
fn complex_weight(
    order: DerivativeOrder,
    alpha: f64,
    beta: f64,
    rate: f64,
    edge: f64,
) -> (f64, f64) {
    let a = rate * alpha;
    let b = rate * beta;
    let e = (edge * a).exp();
    let (wr, wi) = (e * (edge * b).cos(), e * (edge * b).sin());
    match order {
        DerivativeOrder::Zeroth => (wr, wi),
        // Multiply by (a + ib) once or twice.
        DerivativeOrder::First => (a * wr - b * wi, a * wi + b * wr),
        DerivativeOrder::Second => {
            let (rr, ri) = (a * a - b * b, 2.0 * a * b);
            (rr * wr - ri * wi, rr * wi + ri * wr)
        }
    }
}

/// Build the stacked per-category matrices for one edge length into `out`
/// (length R·S·S). A zero edge with order 0 produces exact identities.
pub fn build_matrices(
    model: &EigenDecomposition,
    edge_length: f64,
    rates: &[f64],
    order: DerivativeOrder,
    out: &mut [f64],
) -> Result<()> {
    let s = model.state_count();
    let stride = s * s;
    debug_assert_eq!(out.len(), rates.len() * stride);

    if edge_length == 0.0 && order == DerivativeOrder::Zeroth {
        for block in out.chunks_exact_mut(stride) {
            block.fill(0.0);
            for i in 0..s {
                block[i * s + i] = 1.0;
            }
        }
        return Ok(());
    }

    let evec = model.eigenvectors();
    let ivec = model.inverse_eigenvectors();
    let re = model.values();
    let im = model.values_im();

    // Scratch for U·diag(w) of the current category.
    let mut ud = vec![0.0f64; stride];

    for (category, block) in out.chunks_exact_mut(stride).enumerate() {
        let rate = rates[category];

        let mut j = 0;
        while j < s {
            if im[j] == 0.0 {
                let w = real_weight(order, re[j], rate, edge_length);
                for i in 0..s {
                    ud[i * s + j] = evec[i * s + j] * w;
                }
                j += 1;
            } else {
                // Conjugate pair occupying columns j, j+1; the 2×2 block
                // [[wr, wi], [-wi, wr]] combines both columns of U.
                let (wr, wi) = complex_weight(order, re[j], im[j], rate, edge_length);
                for i in 0..s {
                    let u0 = evec[i * s + j];
                    let u1 = evec[i * s + j + 1];
                    ud[i * s + j] = wr * u0 - wi * u1;
                    ud[i * s + j + 1] = wi * u0 + wr * u1;
                }
                j += 2;
            }
        }

        for i in 0..s {
            for col in 0..s {
                let mut acc = 0.0;
                for k in 0..s {
                    acc += ud[i * s + k] * ivec[k * s + col];
                }
                block[i * s + col] = acc;
            }
        }
    }
    Ok(())
}

/// Write per-category transposes of `src` into `dst` (both length R·S·S).
pub fn transpose_matrices(src: &[f64], dst: &mut [f64], states: usize) {
    let stride = states * states;
    for (sb, db) in src.chunks_exact(stride).zip(dst.chunks_exact_mut(stride)) {
        for i in 0..states {
            for j in 0..states {
                db[j * states + i] = sb[i * states + j];
            }
        }
    }
}
