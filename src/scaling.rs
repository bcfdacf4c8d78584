//! Rescaling disciplines and scale-factor bookkeeping.
//!
//! One discipline tag on the instance drives every update path. The
//! per-operation `write_scale`/`read_scale` fields are honored only under
//! the manual and dynamic disciplines; auto and always keep node-keyed
//! factors internal to the instance. Factors are stored raw (divisors) or
//! as logs per the scaler-representation flag; the cumulative buffer
//! aggregates by multiplying (raw) or summing (log).

use crate::core::error::{Error, Result};
use crate::core::flags::Flags;
use crate::kernels::Dims;

/// Auto-discipline trigger: rescale when the largest destination partial of
/// a pattern falls below 2⁻⁵⁰. The same threshold applies under both scaler
/// representations.
pub const AUTO_RESCALE_THRESHOLD: f64 = 8.881784197001252e-16; // 2^-50

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    None,
    Manual,
    Auto,
    Dynamic,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalerRepr {
    Raw,
    Log,
}

impl ScalingMode {
    pub fn from_flags(flags: Flags) -> ScalingMode {
        if flags.contains(Flags::SCALING_AUTO) {
            ScalingMode::Auto
        } else if flags.contains(Flags::SCALING_ALWAYS) {
            ScalingMode::Always
        } else if flags.contains(Flags::SCALING_DYNAMIC) {
            ScalingMode::Dynamic
        } else if flags.contains(Flags::SCALING_MANUAL) {
            ScalingMode::Manual
        } else {
            ScalingMode::None
        }
    }
}

impl ScalerRepr {
    pub fn from_flags(flags: Flags) -> ScalerRepr {
        if flags.contains(Flags::SCALERS_LOG) {
            ScalerRepr::Log
        } else {
            ScalerRepr::Raw
        }
    }

    /// The stored factor as a divisor in linear space.
    #[inline]
    pub fn divisor(&self, stored: f64) -> f64 {
        match self {
            ScalerRepr::Raw => stored,
            ScalerRepr::Log => stored.exp(),
        }
    }

    /// Identity element of a scale buffer under this representation.
    pub fn identity(&self) -> f64 {
        match self {
            ScalerRepr::Raw => 1.0,
            ScalerRepr::Log => 0.0,
        }
    }
}

/// Pattern iteration for scaling passes: the whole buffer, or just the
/// patterns of one partition.
#[derive(Clone, Copy)]
pub enum PatternRange<'a> {
    Full,
    Subset(&'a [usize]),
}

impl<'a> PatternRange<'a> {
    fn for_each(&self, full_count: usize, mut f: impl FnMut(usize)) {
        match self {
            PatternRange::Full => {
                for k in 0..full_count {
                    f(k);
                }
            }
            PatternRange::Subset(subset) => {
                for &k in *subset {
                    f(k);
                }
            }
        }
    }
}

/// Per-pattern maximum of a destination slab over categories and states,
/// restricted to the covered patterns. Entries outside stay untouched.
fn pattern_maxima(dest: &[f64], dims: Dims, range: PatternRange<'_>, out: &mut [f64]) {
    let s = dims.states;
    let cs = dims.category_stride();
    range.for_each(dims.patterns, |k| {
        out[k] = 0.0;
        for r in 0..dims.categories {
            let base = r * cs + k * s;
            for i in 0..s {
                if dest[base + i] > out[k] {
                    out[k] = dest[base + i];
                }
            }
        }
    });
}

/// Rescale the covered pattern columns of `dest` to L∞-norm 1, writing the
/// divisors into `factors` and folding them into `cumulative` when given.
/// Patterns whose maximum is zero keep factor 1; uncovered patterns keep
/// their previous factors and partials.
pub fn rescale(
    repr: ScalerRepr,
    dest: &mut [f64],
    factors: &mut [f64],
    mut cumulative: Option<&mut [f64]>,
    dims: Dims,
    range: PatternRange<'_>,
) {
    let s = dims.states;
    let cs = dims.category_stride();
    let mut maxima = vec![0.0f64; dims.patterns];
    pattern_maxima(dest, dims, range, &mut maxima);

    range.for_each(dims.patterns, |k| {
        let max = if maxima[k] == 0.0 { 1.0 } else { maxima[k] };
        let inv = 1.0 / max;
        for r in 0..dims.categories {
            let base = r * cs + k * s;
            for i in 0..s {
                dest[base + i] *= inv;
            }
        }
        match repr {
            ScalerRepr::Raw => factors[k] = max,
            ScalerRepr::Log => factors[k] = max.ln(),
        }
        if let Some(cum) = cumulative.as_deref_mut() {
            match repr {
                ScalerRepr::Raw => cum[k] *= max,
                ScalerRepr::Log => cum[k] += max.ln(),
            }
        }
    });
}

/// Divide the covered pattern columns by previously stored factors, carrying
/// the prior evaluation's scaling (dynamic discipline's read path).
pub fn apply_stored_factors(
    repr: ScalerRepr,
    dest: &mut [f64],
    factors: &[f64],
    dims: Dims,
    range: PatternRange<'_>,
) {
    let s = dims.states;
    let cs = dims.category_stride();
    range.for_each(dims.patterns, |k| {
        let inv = 1.0 / repr.divisor(factors[k]);
        for r in 0..dims.categories {
            let base = r * cs + k * s;
            for i in 0..s {
                dest[base + i] *= inv;
            }
        }
    });
}

/// Fold one factor buffer into a cumulative buffer over the covered
/// patterns.
pub fn accumulate(
    repr: ScalerRepr,
    cumulative: &mut [f64],
    factors: &[f64],
    range: PatternRange<'_>,
) {
    range.for_each(cumulative.len(), |k| match repr {
        ScalerRepr::Raw => cumulative[k] *= factors[k],
        ScalerRepr::Log => cumulative[k] += factors[k],
    });
}

/// Remove a factor buffer's contribution from a cumulative buffer over the
/// covered patterns.
pub fn remove(repr: ScalerRepr, cumulative: &mut [f64], factors: &[f64], range: PatternRange<'_>) {
    range.for_each(cumulative.len(), |k| match repr {
        ScalerRepr::Raw => cumulative[k] /= factors[k],
        ScalerRepr::Log => cumulative[k] -= factors[k],
    });
}

/// Cumulative contribution of a pattern to the site log-likelihood.
#[inline]
pub fn log_contribution(repr: ScalerRepr, cum: f64) -> f64 {
    match repr {
        ScalerRepr::Raw => cum.ln(),
        ScalerRepr::Log => cum,
    }
}

/// Instance-held scaling state: the discipline, the representation, the
/// dynamic cadence, and the node-keyed factor buffers used by the auto and
/// always disciplines (stored as logs regardless of representation, since
/// they never surface to the caller).
pub struct ScalingState {
    pub mode: ScalingMode,
    pub repr: ScalerRepr,
    pub rescale_frequency: u64,
    evaluation_count: u64,
    node_log_factors: Vec<Vec<f64>>,
    node_active: Vec<bool>,
}

impl ScalingState {
    pub fn new(flags: Flags, buffer_count: usize, pattern_count: usize) -> ScalingState {
        let mode = ScalingMode::from_flags(flags);
        let internal = matches!(mode, ScalingMode::Auto | ScalingMode::Always);
        ScalingState {
            mode,
            repr: ScalerRepr::from_flags(flags),
            rescale_frequency: 1,
            evaluation_count: 0,
            node_log_factors: if internal {
                vec![vec![0.0; pattern_count]; buffer_count]
            } else {
                Vec::new()
            },
            node_active: vec![false; if internal { buffer_count } else { 0 }],
        }
    }

    /// Called once per root reduction; drives the dynamic cadence.
    pub fn end_evaluation(&mut self) {
        self.evaluation_count += 1;
    }

    /// Dynamic discipline: rescale on every `rescale_frequency`-th
    /// evaluation, carry stored factors otherwise.
    pub fn dynamic_rescales_now(&self) -> bool {
        self.evaluation_count % self.rescale_frequency == 0
    }

    /// Auto/always: rescale `dest` into the node-keyed buffer when the
    /// discipline asks for it.
    ///
    /// `contributes` marks buffers whose factors belong in the root
    /// reduction's cumulative total. Pre-order buffers rescale with it
    /// unset: gradient reductions divide by a matching pre·post
    /// denominator, so their factors cancel per pattern and must not be
    /// folded back into root log-likelihoods.
    pub fn internal_rescale(
        &mut self,
        node: usize,
        dest: &mut [f64],
        dims: Dims,
        range: PatternRange<'_>,
        contributes: bool,
    ) -> Result<()> {
        if node >= self.node_log_factors.len() {
            return Err(Error::bad_index(
                "internal scale buffer",
                node as i64,
                self.node_log_factors.len(),
            ));
        }
        let trigger = match self.mode {
            ScalingMode::Always => true,
            ScalingMode::Auto => {
                let mut maxima = vec![f64::INFINITY; dims.patterns];
                pattern_maxima(dest, dims, range, &mut maxima);
                maxima
                    .iter()
                    .any(|&m| m > 0.0 && m < AUTO_RESCALE_THRESHOLD)
            }
            _ => false,
        };
        if trigger {
            rescale(
                ScalerRepr::Log,
                dest,
                &mut self.node_log_factors[node],
                None,
                dims,
                range,
            );
            if contributes {
                self.node_active[node] = true;
            }
        } else if self.mode == ScalingMode::Auto && self.node_active[node] {
            // Node recomputed without underflow: retire its old factors.
            if let PatternRange::Subset(subset) = range {
                for &k in subset {
                    self.node_log_factors[node][k] = 0.0;
                }
            } else {
                self.node_log_factors[node].fill(0.0);
                self.node_active[node] = false;
            }
        }
        Ok(())
    }

    /// Summed log factors of every active node, added to site logs during
    /// reductions under the auto/always disciplines.
    pub fn internal_cumulative(&self, pattern_count: usize) -> Vec<f64> {
        let mut cum = vec![0.0; pattern_count];
        for (node, active) in self.node_active.iter().enumerate() {
            if *active {
                for (c, f) in cum.iter_mut().zip(&self.node_log_factors[node]) {
                    *c += f;
                }
            }
        }
        cum
    }

    pub fn uses_internal_buffers(&self) -> bool {
        matches!(self.mode, ScalingMode::Auto | ScalingMode::Always)
    }
}
