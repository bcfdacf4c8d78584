//! The instance: owns every buffer, resolves flags to a backend at creation,
//! validates each call at the boundary, and dispatches to the kernels.
//!
//! An instance is single-threaded from the caller's perspective; the only
//! internal parallelism is the optional rayon pool installed around the
//! pattern loops. Effects of successive calls are linearized, and a failed
//! operation leaves its destination buffer unspecified but memory-safe.

use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use crate::core::error::{check_len, Error, Result};
use crate::core::flags::Flags;
use crate::core::operation::{Operation, PartitionOperation, OP_NONE};
use crate::core::sizes::InstanceSizes;
use crate::kernels::matrices::DerivativeOrder;
use crate::kernels::{action, matrices, partials, simd, Dims};
use crate::model::eigen::EigenDecomposition;
use crate::model::sparse::CsrMatrix;
use crate::reduce::{self, EdgeReduction};
use crate::registry::{self, Resource, ResourceKind};
use crate::scaling::{self, PatternRange, ScalerRepr, ScalingMode, ScalingState};
use crate::store::{BufferStore, ChildSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDetails {
    pub resource_number: usize,
    pub resource_name: String,
    pub impl_name: String,
    pub impl_description: String,
    pub flags: Flags,
}

/// Backend kernel state; the action variant carries the sparse generators
/// and the per-node scaled copies recorded by `update_transition_matrices`.
enum BackendState {
    Scalar,
    Simd,
    Action {
        generators: Vec<Option<CsrMatrix>>,
        scaled: Vec<Option<Vec<CsrMatrix>>>,
    },
}

pub struct Instance {
    sizes: InstanceSizes,
    details: InstanceDetails,
    store: BufferStore,
    models: Vec<Option<EigenDecomposition>>,
    backend: BackendState,
    scaling: ScalingState,
    pool: Option<ThreadPool>,
}

fn resolve_flags(preference: Flags, requirement: Flags, resource: &Resource) -> Flags {
    let requested = preference | requirement;
    let mut flags = Flags::PRECISION_DOUBLE | Flags::PROCESSOR_CPU | Flags::FRAMEWORK_CPU;

    flags |= if requested.contains(Flags::COMPUTATION_ASYNCH) {
        Flags::COMPUTATION_ASYNCH
    } else {
        Flags::COMPUTATION_SYNCH
    };
    flags |= if requested.contains(Flags::EIGEN_COMPLEX)
        && resource.support_flags.contains(Flags::EIGEN_COMPLEX)
    {
        Flags::EIGEN_COMPLEX
    } else {
        Flags::EIGEN_REAL
    };
    flags |= if requested.contains(Flags::SCALERS_LOG) {
        Flags::SCALERS_LOG
    } else {
        Flags::SCALERS_RAW
    };
    for discipline in [
        Flags::SCALING_AUTO,
        Flags::SCALING_ALWAYS,
        Flags::SCALING_DYNAMIC,
        Flags::SCALING_MANUAL,
    ] {
        if requested.contains(discipline) {
            flags |= discipline;
            break;
        }
    }
    flags |= resource.support_flags
        & (Flags::VECTOR_NONE | Flags::VECTOR_SSE | Flags::VECTOR_AVX);
    if resource.kind == ResourceKind::CpuAction {
        flags |= Flags::COMPUTATION_ACTION;
    }
    flags |= if requested.contains(Flags::PREORDER_TRANSPOSE_MANUAL) {
        Flags::PREORDER_TRANSPOSE_MANUAL
    } else {
        Flags::PREORDER_TRANSPOSE_AUTO
    };
    flags |= Flags::THREADING_NONE;
    flags
}

fn run_pooled<R: Send>(pool: &Option<ThreadPool>, f: impl FnOnce() -> R + Send) -> R {
    match pool {
        Some(p) => p.install(f),
        None => f(),
    }
}

fn as_index(value: i32, kind: &'static str, count: usize) -> Result<usize> {
    if value < 0 || value as usize >= count {
        return Err(Error::bad_index(kind, value as i64, count));
    }
    Ok(value as usize)
}

fn optional_index(value: i32, kind: &'static str, count: usize) -> Result<Option<usize>> {
    if value == OP_NONE {
        Ok(None)
    } else {
        as_index(value, kind, count).map(Some)
    }
}

impl Instance {
    /// Create an instance on the best resource for the flag sets, or on a
    /// pinned resource number.
    pub fn create(
        sizes: InstanceSizes,
        preference_flags: Flags,
        requirement_flags: Flags,
        pinned_resource: Option<usize>,
    ) -> Result<Instance> {
        sizes.validate()?;
        let (number, resource) = registry::select(preference_flags, requirement_flags, pinned_resource)?;
        let flags = resolve_flags(preference_flags, requirement_flags, resource);
        let store = BufferStore::new(sizes)?;
        let backend = match resource.kind {
            ResourceKind::CpuScalar => BackendState::Scalar,
            ResourceKind::CpuSimd => BackendState::Simd,
            ResourceKind::CpuAction => BackendState::Action {
                generators: vec![None; sizes.eigen_count.max(1)],
                scaled: (0..sizes.matrix_count).map(|_| None).collect(),
            },
        };
        let scaling = ScalingState::new(flags, sizes.buffer_count(), sizes.pattern_count);
        let impl_name = match resource.kind {
            ResourceKind::CpuScalar => "felsite-cpu-double",
            ResourceKind::CpuSimd => "felsite-cpu-simd-double",
            ResourceKind::CpuAction => "felsite-cpu-action-double",
        };
        Ok(Instance {
            sizes,
            details: InstanceDetails {
                resource_number: number,
                resource_name: resource.name.clone(),
                impl_name: impl_name.to_string(),
                impl_description: resource.description.clone(),
                flags,
            },
            store,
            models: vec![None; sizes.eigen_count.max(1)],
            backend,
            scaling,
            pool: None,
        })
    }

    pub fn details(&self) -> &InstanceDetails {
        &self.details
    }

    pub fn sizes(&self) -> &InstanceSizes {
        &self.sizes
    }

    fn dims(&self) -> Dims {
        Dims {
            states: self.sizes.state_count,
            patterns: self.sizes.pattern_count,
            categories: self.sizes.category_count,
        }
    }

    /// Size the cooperative worker pool used inside partials and reduction
    /// loops. One (or zero) keeps everything on the calling thread.
    pub fn set_thread_count(&mut self, threads: usize) -> Result<()> {
        if threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|_| Error::General)?;
            self.pool = Some(pool);
            self.details.flags |= Flags::THREADING_CPP;
        } else {
            self.pool = None;
        }
        Ok(())
    }

    /// Dynamic-discipline cadence: rescale every `frequency`-th evaluation.
    pub fn set_rescale_frequency(&mut self, frequency: u64) {
        self.scaling.rescale_frequency = frequency.max(1);
    }

    // ---- data transfer ----

    pub fn set_tip_states(&mut self, tip_index: usize, states: &[u32]) -> Result<()> {
        self.store.set_tip_states(tip_index, states)
    }

    pub fn set_tip_partials(&mut self, tip_index: usize, partials: &[f64]) -> Result<()> {
        self.store.set_tip_partials(tip_index, partials)
    }

    pub fn set_partials(&mut self, buffer_index: usize, partials: &[f64]) -> Result<()> {
        self.store.set_partials(buffer_index, partials)
    }

    /// Copy a partials buffer out. A scale index restores unscaled values by
    /// multiplying each pattern column with its stored divisor.
    pub fn get_partials(
        &self,
        buffer_index: usize,
        scale_index: i32,
        out: &mut [f64],
    ) -> Result<()> {
        let src = self.store.partials(buffer_index)?;
        check_len("partials out", out.len(), src.len())?;
        out.copy_from_slice(src);
        if let Some(scale) = optional_index(scale_index, "scale buffer", self.sizes.scale_count)? {
            let factors = self.store.scale(scale)?;
            let repr = self.scaling.repr;
            let dims = self.dims();
            let s = dims.states;
            for r in 0..dims.categories {
                for k in 0..dims.patterns {
                    let divisor = repr.divisor(factors[k]);
                    let base = r * dims.category_stride() + k * s;
                    for i in 0..s {
                        out[base + i] *= divisor;
                    }
                }
            }
        }
        Ok(())
    }

    /// Install a caller-provided matrix verbatim. The pad value fills any
    /// platform padding; this layout carries none, so it is accepted and
    /// ignored.
    pub fn set_transition_matrix(
        &mut self,
        matrix_index: usize,
        matrix: &[f64],
        _pad_value: f64,
    ) -> Result<()> {
        self.store.set_matrix(matrix_index, matrix)
    }

    /// Install a caller-computed differential matrix (scaled Q or Q²).
    pub fn set_differential_matrix(&mut self, matrix_index: usize, matrix: &[f64]) -> Result<()> {
        self.store.set_matrix(matrix_index, matrix)
    }

    pub fn get_transition_matrix(&self, matrix_index: usize, out: &mut [f64]) -> Result<()> {
        let src = self.store.matrix(matrix_index)?;
        check_len("matrix out", out.len(), src.len())?;
        out.copy_from_slice(src);
        Ok(())
    }

    pub fn get_scale_factors(&self, scale_index: usize, out: &mut [f64]) -> Result<()> {
        let src = self.store.scale(scale_index)?;
        check_len("scale out", out.len(), src.len())?;
        out.copy_from_slice(src);
        Ok(())
    }

    pub fn get_site_log_likelihoods(&self, out: &mut [f64]) -> Result<()> {
        check_len(
            "site log-likelihoods out",
            out.len(),
            self.sizes.pattern_count,
        )?;
        out.copy_from_slice(self.store.site_log_likelihoods());
        Ok(())
    }

    // ---- model parameters ----

    /// Install an eigen decomposition (or, on the action backend, the
    /// sparse generator conveyed as a triplet list: `evec` holds (row, col)
    /// pairs, `ivec[0]` the non-zero count, `eval` the values).
    pub fn set_eigen_decomposition(
        &mut self,
        eigen_index: usize,
        evec: &[f64],
        ivec: &[f64],
        eval: &[f64],
    ) -> Result<()> {
        let s = self.sizes.state_count;
        if let BackendState::Action { generators, .. } = &mut self.backend {
            if eigen_index >= generators.len() {
                return Err(Error::bad_index(
                    "eigen buffer",
                    eigen_index as i64,
                    generators.len(),
                ));
            }
            if ivec.is_empty() {
                return Err(Error::SizeMismatch {
                    kind: "sparse generator descriptor",
                    expected: 1,
                    actual: 0,
                });
            }
            let nnz = ivec[0] as usize;
            if evec.len() < 2 * nnz {
                return Err(Error::SizeMismatch {
                    kind: "sparse generator coordinates",
                    expected: 2 * nnz,
                    actual: evec.len(),
                });
            }
            if eval.len() < nnz {
                return Err(Error::SizeMismatch {
                    kind: "sparse generator values",
                    expected: nnz,
                    actual: eval.len(),
                });
            }
            let mut triplets = Vec::with_capacity(nnz);
            for t in 0..nnz {
                triplets.push((evec[2 * t] as usize, evec[2 * t + 1] as usize, eval[t]));
            }
            generators[eigen_index] = Some(CsrMatrix::from_triplets(s, &triplets));
            return Ok(());
        }

        if eigen_index >= self.models.len() {
            return Err(Error::bad_index(
                "eigen buffer",
                eigen_index as i64,
                self.models.len(),
            ));
        }
        let model = if self.details.flags.contains(Flags::EIGEN_COMPLEX) {
            EigenDecomposition::complex(s, evec, ivec, eval)?
        } else {
            EigenDecomposition::real(s, evec, ivec, eval)?
        };
        self.models[eigen_index] = Some(model);
        Ok(())
    }

    pub fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        self.store.set_category_rates(0, rates)
    }

    pub fn set_category_rates_with_index(&mut self, index: usize, rates: &[f64]) -> Result<()> {
        self.store.set_category_rates(index, rates)
    }

    pub fn set_category_weights(&mut self, index: usize, weights: &[f64]) -> Result<()> {
        self.store.set_category_weights(index, weights)
    }

    pub fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]) -> Result<()> {
        self.store.set_state_frequencies(index, frequencies)
    }

    pub fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()> {
        self.store.set_pattern_weights(weights)
    }

    pub fn set_pattern_partitions(
        &mut self,
        partition_count: usize,
        assignments: &[i32],
    ) -> Result<()> {
        self.store.set_pattern_partitions(partition_count, assignments)
    }

    // ---- transition matrices ----

    /// Build per-category transition matrices (and optional derivative
    /// matrices) for a set of edges; the action backend records scaled
    /// generators instead.
    pub fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        probability_indices: &[usize],
        first_derivative_indices: Option<&[usize]>,
        second_derivative_indices: Option<&[usize]>,
        edge_lengths: &[f64],
    ) -> Result<()> {
        check_len(
            "edge lengths",
            edge_lengths.len(),
            probability_indices.len(),
        )?;
        if let Some(d1) = first_derivative_indices {
            check_len("first derivative indices", d1.len(), probability_indices.len())?;
        }
        if let Some(d2) = second_derivative_indices {
            check_len("second derivative indices", d2.len(), probability_indices.len())?;
        }
        let rates = self.store.category_rates(eigen_index)?.to_vec();

        if let BackendState::Action { generators, scaled } = &mut self.backend {
            if first_derivative_indices.is_some() || second_derivative_indices.is_some() {
                return Err(Error::Unsupported(
                    "derivative matrices on the action backend",
                ));
            }
            let q = generators
                .get(eigen_index)
                .and_then(|g| g.as_ref())
                .ok_or(Error::bad_index(
                    "eigen buffer (unset)",
                    eigen_index as i64,
                    generators.len(),
                ))?;
            for (&node, &edge) in probability_indices.iter().zip(edge_lengths) {
                if node >= scaled.len() {
                    return Err(Error::bad_index("matrix buffer", node as i64, scaled.len()));
                }
                scaled[node] =
                    Some(rates.iter().map(|&r| q.scaled(edge * r)).collect());
            }
            return Ok(());
        }

        let model = self
            .models
            .get(eigen_index)
            .and_then(|m| m.as_ref())
            .cloned()
            .ok_or(Error::bad_index(
                "eigen buffer (unset)",
                eigen_index as i64,
                self.models.len(),
            ))?;

        for (i, (&slot, &edge)) in probability_indices.iter().zip(edge_lengths).enumerate() {
            matrices::build_matrices(
                &model,
                edge,
                &rates,
                DerivativeOrder::Zeroth,
                self.store.matrix_mut(slot)?,
            )?;
            if let Some(d1) = first_derivative_indices {
                matrices::build_matrices(
                    &model,
                    edge,
                    &rates,
                    DerivativeOrder::First,
                    self.store.matrix_mut(d1[i])?,
                )?;
            }
            if let Some(d2) = second_derivative_indices {
                matrices::build_matrices(
                    &model,
                    edge,
                    &rates,
                    DerivativeOrder::Second,
                    self.store.matrix_mut(d2[i])?,
                )?;
            }
        }
        Ok(())
    }

    /// Write transposes of source matrix slots into destination slots, for
    /// the manual pre-order transpose mode.
    pub fn transpose_transition_matrices(
        &mut self,
        source_indices: &[usize],
        destination_indices: &[usize],
    ) -> Result<()> {
        check_len(
            "transpose destinations",
            destination_indices.len(),
            source_indices.len(),
        )?;
        let states = self.sizes.state_count;
        for (&src, &dst) in source_indices.iter().zip(destination_indices) {
            let (s, d) = self.store.matrix_pair_mut(src, dst)?;
            matrices::transpose_matrices(s, d, states);
        }
        Ok(())
    }

    // ---- partials propagation ----

    /// Execute an ordered post-order operation list. The caller guarantees
    /// children precede parents; operations run strictly in the order given.
    pub fn update_partials(&mut self, operations: &[Operation], cumulative_scale_index: i32) -> Result<()> {
        let cumulative =
            optional_index(cumulative_scale_index, "scale buffer", self.sizes.scale_count)?;
        for op in operations {
            self.execute_operation(op, cumulative, false)?;
        }
        Ok(())
    }

    /// Partitioned form: each operation carries its partition and its own
    /// cumulative scale target.
    pub fn update_partials_by_partition(
        &mut self,
        operations: &[PartitionOperation],
    ) -> Result<()> {
        for pop in operations {
            let cumulative =
                optional_index(pop.cumulative_scale, "scale buffer", self.sizes.scale_count)?;
            let partition = as_index(pop.partition, "partition", self.store.partition_count())?;
            let patterns = self.store.partition_patterns(partition)?;
            self.execute_subset_operation(&pop.op, cumulative, &patterns)?;
        }
        Ok(())
    }

    /// Pre-order propagation, root toward tips. Field interpretation:
    /// child1 = the parent's pre-order buffer, matrix1 = this node's edge
    /// matrix, child2 = the sibling's post-order buffer, matrix2 = the
    /// sibling's edge matrix.
    pub fn update_pre_partials(
        &mut self,
        operations: &[Operation],
        cumulative_scale_index: i32,
    ) -> Result<()> {
        let cumulative =
            optional_index(cumulative_scale_index, "scale buffer", self.sizes.scale_count)?;
        for op in operations {
            self.execute_operation(op, cumulative, true)?;
        }
        Ok(())
    }

    fn execute_operation(
        &mut self,
        op: &Operation,
        cumulative: Option<usize>,
        pre_order: bool,
    ) -> Result<()> {
        let dims = self.dims();
        let buffer_count = self.sizes.buffer_count();
        let dest = as_index(op.destination, "partials buffer", buffer_count)?;
        let c1 = as_index(op.child1_partials, "partials buffer", buffer_count)?;
        let c2 = as_index(op.child2_partials, "partials buffer", buffer_count)?;
        let m1 = as_index(op.child1_matrix, "matrix buffer", self.sizes.matrix_count)?;
        let m2 = as_index(op.child2_matrix, "matrix buffer", self.sizes.matrix_count)?;

        {
            let Instance {
                store,
                backend,
                pool,
                ..
            } = &mut *self;
            let view = store.operation_views(dest, c1, m1, c2, m2)?;

            match backend {
                BackendState::Action { scaled, .. } => {
                    if pre_order {
                        return Err(Error::Unsupported(
                            "pre-order propagation on the action backend",
                        ));
                    }
                    let q1 = scaled.get(m1).and_then(|q| q.as_ref()).ok_or(
                        Error::bad_index("matrix buffer (unset)", m1 as i64, scaled.len()),
                    )?;
                    let q2 = scaled.get(m2).and_then(|q| q.as_ref()).ok_or(
                        Error::bad_index("matrix buffer (unset)", m2 as i64, scaled.len()),
                    )?;
                    let (p1, p2) = match (&view.child1, &view.child2) {
                        (ChildSource::Partials(a), ChildSource::Partials(b)) => (*a, *b),
                        _ => {
                            return Err(Error::Unsupported(
                                "compact tip children on the action backend",
                            ))
                        }
                    };
                    action::partials_partials(view.dest, p1, q1, p2, q2, dims);
                }
                BackendState::Scalar | BackendState::Simd => {
                    let use_simd = matches!(backend, BackendState::Simd);
                    run_pooled(pool, move || -> Result<()> {
                        if pre_order {
                            let parent = match &view.child1 {
                                ChildSource::Partials(p) => *p,
                                ChildSource::States(_) => {
                                    return Err(Error::Unsupported(
                                        "compact parent in pre-order operation",
                                    ))
                                }
                            };
                            partials::pre_order_op(
                                view.dest,
                                parent,
                                view.matrix1,
                                &view.child2,
                                view.matrix2,
                                dims,
                            );
                        } else if use_simd {
                            simd::update_op(
                                view.dest,
                                &view.child1,
                                view.matrix1,
                                &view.child2,
                                view.matrix2,
                                dims,
                            );
                        } else {
                            partials::update_op(
                                view.dest,
                                &view.child1,
                                view.matrix1,
                                &view.child2,
                                view.matrix2,
                                dims,
                            );
                        }
                        Ok(())
                    })?;
                }
            }
        }

        self.apply_operation_scaling(op, dest, cumulative, dims, PatternRange::Full, !pre_order)
    }

    fn execute_subset_operation(
        &mut self,
        op: &Operation,
        cumulative: Option<usize>,
        patterns: &[usize],
    ) -> Result<()> {
        let dims = self.dims();
        let buffer_count = self.sizes.buffer_count();
        let dest = as_index(op.destination, "partials buffer", buffer_count)?;
        let c1 = as_index(op.child1_partials, "partials buffer", buffer_count)?;
        let c2 = as_index(op.child2_partials, "partials buffer", buffer_count)?;
        let m1 = as_index(op.child1_matrix, "matrix buffer", self.sizes.matrix_count)?;
        let m2 = as_index(op.child2_matrix, "matrix buffer", self.sizes.matrix_count)?;

        if matches!(self.backend, BackendState::Action { .. }) {
            return Err(Error::Unsupported(
                "partitioned updates on the action backend",
            ));
        }
        {
            let view = self.store.operation_views(dest, c1, m1, c2, m2)?;
            partials::update_op_subset(
                view.dest,
                &view.child1,
                view.matrix1,
                &view.child2,
                view.matrix2,
                dims,
                patterns,
            );
        }
        self.apply_operation_scaling(
            op,
            dest,
            cumulative,
            dims,
            PatternRange::Subset(patterns),
            true,
        )
    }

    fn apply_operation_scaling(
        &mut self,
        op: &Operation,
        dest: usize,
        cumulative: Option<usize>,
        dims: Dims,
        range: PatternRange<'_>,
        contributes: bool,
    ) -> Result<()> {
        let scale_count = self.sizes.scale_count;
        match self.scaling.mode {
            ScalingMode::None => Ok(()),
            ScalingMode::Auto | ScalingMode::Always => {
                let Instance { store, scaling, .. } = self;
                scaling.internal_rescale(dest, store.partials_mut(dest)?, dims, range, contributes)
            }
            ScalingMode::Manual | ScalingMode::Dynamic => {
                let write = optional_index(op.write_scale, "scale buffer", scale_count)?;
                let read = optional_index(op.read_scale, "scale buffer", scale_count)?;
                let repr = self.scaling.repr;

                enum ScalePlan {
                    Rescale(usize),
                    Carry(usize),
                }
                let plan = match (self.scaling.mode, write, read) {
                    (_, None, None) => return Ok(()),
                    (ScalingMode::Dynamic, Some(w), Some(r)) => {
                        if self.scaling.dynamic_rescales_now() {
                            ScalePlan::Rescale(w)
                        } else {
                            ScalePlan::Carry(r)
                        }
                    }
                    (_, Some(w), _) => ScalePlan::Rescale(w),
                    (_, None, Some(r)) => ScalePlan::Carry(r),
                };

                match plan {
                    ScalePlan::Rescale(write) => {
                        // Un-apply the superseded factors from the cumulative
                        // buffer before the new ones are folded in.
                        if let (Some(read), Some(cum)) = (read, cumulative) {
                            if read != write {
                                let (factors, cum) = self.store.scale_pair(read, cum)?;
                                scaling::remove(repr, cum, factors, range);
                            }
                        }
                        let (dest_slab, factors, cum) =
                            self.store.rescale_views(dest, write, cumulative)?;
                        scaling::rescale(repr, dest_slab, factors, cum, dims, range);
                    }
                    ScalePlan::Carry(read) => {
                        let (dest_slab, factors, cum) =
                            self.store.carry_views(dest, read, cumulative)?;
                        scaling::apply_stored_factors(repr, dest_slab, factors, dims, range);
                        // Carried factors still belong in this evaluation's
                        // cumulative total.
                        if let Some(cum) = cum {
                            scaling::accumulate(repr, cum, factors, range);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    // ---- scale-factor management ----

    pub fn reset_scale_factors(&mut self, cumulative_scale_index: usize) -> Result<()> {
        let identity = self.scaling.repr.identity();
        self.store.scale_mut(cumulative_scale_index)?.fill(identity);
        Ok(())
    }

    pub fn accumulate_scale_factors(
        &mut self,
        scale_indices: &[usize],
        cumulative_scale_index: usize,
    ) -> Result<()> {
        let repr = self.scaling.repr;
        for &index in scale_indices {
            let (factors, cum) = self.store.scale_pair(index, cumulative_scale_index)?;
            scaling::accumulate(repr, cum, factors, PatternRange::Full);
        }
        Ok(())
    }

    pub fn remove_scale_factors(
        &mut self,
        scale_indices: &[usize],
        cumulative_scale_index: usize,
    ) -> Result<()> {
        let repr = self.scaling.repr;
        for &index in scale_indices {
            let (factors, cum) = self.store.scale_pair(index, cumulative_scale_index)?;
            scaling::remove(repr, cum, factors, PatternRange::Full);
        }
        Ok(())
    }

    pub fn reset_scale_factors_by_partition(
        &mut self,
        cumulative_scale_index: usize,
        partition: usize,
    ) -> Result<()> {
        let identity = self.scaling.repr.identity();
        let patterns = self.store.partition_patterns(partition)?;
        let cum = self.store.scale_mut(cumulative_scale_index)?;
        for k in patterns {
            cum[k] = identity;
        }
        Ok(())
    }

    pub fn accumulate_scale_factors_by_partition(
        &mut self,
        scale_indices: &[usize],
        cumulative_scale_index: usize,
        partition: usize,
    ) -> Result<()> {
        let repr = self.scaling.repr;
        let patterns = self.store.partition_patterns(partition)?;
        for &index in scale_indices {
            let (factors, cum) = self.store.scale_pair(index, cumulative_scale_index)?;
            scaling::accumulate(repr, cum, factors, PatternRange::Subset(&patterns));
        }
        Ok(())
    }

    // ---- reductions ----

    /// Cumulative scale vector a reduction should apply: the explicit
    /// buffer under caller-managed disciplines, the summed node-keyed
    /// factors under auto/always.
    fn effective_cumulative(&self, explicit: Option<usize>) -> Result<Option<Vec<f64>>> {
        if self.scaling.uses_internal_buffers() {
            return Ok(Some(
                self.scaling.internal_cumulative(self.sizes.pattern_count),
            ));
        }
        match explicit {
            None => Ok(None),
            Some(index) => Ok(Some(self.store.scale(index)?.to_vec())),
        }
    }

    /// Internal cumulative vectors are always log-valued.
    fn effective_repr(&self) -> ScalerRepr {
        if self.scaling.uses_internal_buffers() {
            ScalerRepr::Log
        } else {
            self.scaling.repr
        }
    }

    /// Root reduction over one or more root buffers (independent subsets
    /// whose log-likelihoods sum). Site log-likelihoods are retained for
    /// `get_site_log_likelihoods`.
    pub fn calculate_root_log_likelihoods(
        &mut self,
        root_indices: &[i32],
        category_weights_indices: &[i32],
        state_frequencies_indices: &[i32],
        cumulative_scale_indices: &[i32],
    ) -> Result<f64> {
        check_len(
            "category weight indices",
            category_weights_indices.len(),
            root_indices.len(),
        )?;
        check_len(
            "state frequency indices",
            state_frequencies_indices.len(),
            root_indices.len(),
        )?;
        check_len(
            "cumulative scale indices",
            cumulative_scale_indices.len(),
            root_indices.len(),
        )?;

        let dims = self.dims();
        let mut total = 0.0;
        let mut site_accum = vec![0.0f64; dims.patterns];

        for subset in 0..root_indices.len() {
            let root = as_index(root_indices[subset], "partials buffer", self.sizes.buffer_count())?;
            let weights_index = as_index(
                category_weights_indices[subset],
                "category weights slot",
                self.sizes.eigen_count.max(1),
            )?;
            let freqs_index = as_index(
                state_frequencies_indices[subset],
                "state frequencies slot",
                self.sizes.eigen_count.max(1),
            )?;
            let cumulative = self.effective_cumulative(optional_index(
                cumulative_scale_indices[subset],
                "scale buffer",
                self.sizes.scale_count,
            )?)?;

            let mut site = vec![0.0f64; dims.patterns];
            let logl = reduce::root_log_likelihood(
                self.store.partials(root)?,
                self.store.category_weights(weights_index)?,
                self.store.state_frequencies(freqs_index)?,
                cumulative.as_deref(),
                self.effective_repr(),
                self.store.pattern_weights(),
                dims,
                None,
                &mut site,
            )?;
            total += logl;
            for (acc, s) in site_accum.iter_mut().zip(&site) {
                *acc += s;
            }
        }

        self.store
            .site_log_likelihoods_mut()
            .copy_from_slice(&site_accum);
        self.scaling.end_evaluation();
        Ok(total)
    }

    /// Partitioned root reduction: per-partition log-likelihoods plus the
    /// total. Entry p of every index slice belongs to partition p.
    pub fn calculate_root_log_likelihoods_by_partition(
        &mut self,
        root_indices: &[i32],
        category_weights_indices: &[i32],
        state_frequencies_indices: &[i32],
        cumulative_scale_indices: &[i32],
        out_partition_log_likelihoods: &mut [f64],
    ) -> Result<f64> {
        let partitions = self.store.partition_count();
        check_len("root indices", root_indices.len(), partitions)?;
        check_len(
            "partition log-likelihoods out",
            out_partition_log_likelihoods.len(),
            partitions,
        )?;
        check_len(
            "category weight indices",
            category_weights_indices.len(),
            partitions,
        )?;
        check_len(
            "state frequency indices",
            state_frequencies_indices.len(),
            partitions,
        )?;
        check_len(
            "cumulative scale indices",
            cumulative_scale_indices.len(),
            partitions,
        )?;

        let dims = self.dims();
        let mut total = 0.0;
        let mut site_accum = vec![0.0f64; dims.patterns];

        for partition in 0..partitions {
            let patterns = self.store.partition_patterns(partition)?;
            let root = as_index(
                root_indices[partition],
                "partials buffer",
                self.sizes.buffer_count(),
            )?;
            let weights_index = as_index(
                category_weights_indices[partition],
                "category weights slot",
                self.sizes.eigen_count.max(1),
            )?;
            let freqs_index = as_index(
                state_frequencies_indices[partition],
                "state frequencies slot",
                self.sizes.eigen_count.max(1),
            )?;
            let cumulative = self.effective_cumulative(optional_index(
                cumulative_scale_indices[partition],
                "scale buffer",
                self.sizes.scale_count,
            )?)?;

            let mut site = vec![0.0f64; dims.patterns];
            let logl = reduce::root_log_likelihood(
                self.store.partials(root)?,
                self.store.category_weights(weights_index)?,
                self.store.state_frequencies(freqs_index)?,
                cumulative.as_deref(),
                self.effective_repr(),
                self.store.pattern_weights(),
                dims,
                Some(&patterns),
                &mut site,
            )?;
            out_partition_log_likelihoods[partition] = logl;
            total += logl;
            for &k in &patterns {
                site_accum[k] = site[k];
            }
        }

        self.store
            .site_log_likelihoods_mut()
            .copy_from_slice(&site_accum);
        self.scaling.end_evaluation();
        Ok(total)
    }

    /// Likelihood (and optional first/second derivatives) along one edge.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_edge_log_likelihoods(
        &mut self,
        parent_index: usize,
        child_index: usize,
        matrix_index: usize,
        first_derivative_index: Option<usize>,
        second_derivative_index: Option<usize>,
        category_weights_index: usize,
        state_frequencies_index: usize,
        cumulative_scale_index: i32,
    ) -> Result<EdgeReduction> {
        if matches!(self.backend, BackendState::Action { .. }) {
            return Err(Error::Unsupported(
                "edge reductions on the action backend",
            ));
        }
        let dims = self.dims();
        let cumulative = self.effective_cumulative(optional_index(
            cumulative_scale_index,
            "scale buffer",
            self.sizes.scale_count,
        )?)?;

        let child = if self.store.is_compact(child_index) {
            ChildSource::States(self.store.tip_states(child_index)?)
        } else {
            ChildSource::Partials(self.store.partials(child_index)?)
        };
        let d1 = match first_derivative_index {
            Some(i) => Some(self.store.matrix(i)?),
            None => None,
        };
        let d2 = match second_derivative_index {
            Some(i) => Some(self.store.matrix(i)?),
            None => None,
        };

        let mut site = vec![0.0f64; dims.patterns];
        let reduction = reduce::edge_log_likelihood(
            self.store.partials(parent_index)?,
            &child,
            self.store.matrix(matrix_index)?,
            d1,
            d2,
            self.store.category_weights(category_weights_index)?,
            self.store.state_frequencies(state_frequencies_index)?,
            cumulative.as_deref(),
            self.effective_repr(),
            self.store.pattern_weights(),
            dims,
            &mut site,
        )?;
        self.store.site_log_likelihoods_mut().copy_from_slice(&site);
        Ok(reduction)
    }

    /// Per-edge, per-site first derivatives from post-order and pre-order
    /// partials with pre-computed differential matrices. Enforces the
    /// reverse-index convention: post + pre must be one uniform odd constant
    /// across the edge list.
    pub fn calculate_edge_derivatives(
        &mut self,
        post_buffer_indices: &[usize],
        pre_buffer_indices: &[usize],
        derivative_matrix_indices: &[usize],
        category_weights_index: usize,
        out_first: &mut [f64],
        out_sums: &mut [f64],
    ) -> Result<()> {
        let n = post_buffer_indices.len();
        check_len("pre-order indices", pre_buffer_indices.len(), n)?;
        check_len(
            "differential matrix indices",
            derivative_matrix_indices.len(),
            n,
        )?;
        let dims = self.dims();
        check_len("per-site derivatives out", out_first.len(), n * dims.patterns)?;
        check_len("derivative sums out", out_sums.len(), n)?;

        if n > 1 {
            let mirror = post_buffer_indices[0] + pre_buffer_indices[0];
            if mirror % 2 == 0 {
                return Err(Error::bad_index(
                    "pre-order mirror constant (must be odd)",
                    mirror as i64,
                    mirror + 1,
                ));
            }
            for (&post, &pre) in post_buffer_indices.iter().zip(pre_buffer_indices).skip(1) {
                if post + pre != mirror {
                    return Err(Error::bad_index(
                        "pre-order mirror constant",
                        (post + pre) as i64,
                        mirror + 1,
                    ));
                }
            }
        }

        let weights = self.store.category_weights(category_weights_index)?;
        for (edge, ((&post, &pre), &dmat)) in post_buffer_indices
            .iter()
            .zip(pre_buffer_indices)
            .zip(derivative_matrix_indices)
            .enumerate()
        {
            let post_source = if self.store.is_compact(post) {
                ChildSource::States(self.store.tip_states(post)?)
            } else {
                ChildSource::Partials(self.store.partials(post)?)
            };
            let first = &mut out_first[edge * dims.patterns..(edge + 1) * dims.patterns];
            out_sums[edge] = reduce::edge_gradient(
                &post_source,
                self.store.partials(pre)?,
                self.store.matrix(dmat)?,
                weights,
                self.store.pattern_weights(),
                dims,
                first,
            )?;
        }
        Ok(())
    }

    /// S×S expected-statistic matrix accumulated over edges:
    /// out[i,j] = Σ_edges Σ_k w_k · pre[k,i]·rate·t·post[k,j] / site_lik(k).
    pub fn calculate_cross_product_derivatives(
        &mut self,
        post_buffer_indices: &[usize],
        pre_buffer_indices: &[usize],
        category_rates_index: usize,
        category_weights_index: usize,
        edge_lengths: &[f64],
        out: &mut [f64],
    ) -> Result<()> {
        let n = post_buffer_indices.len();
        check_len("pre-order indices", pre_buffer_indices.len(), n)?;
        check_len("edge lengths", edge_lengths.len(), n)?;
        let dims = self.dims();
        check_len("cross-product out", out.len(), dims.states * dims.states)?;

        out.fill(0.0);
        let rates = self.store.category_rates(category_rates_index)?;
        let weights = self.store.category_weights(category_weights_index)?;
        for (i, (&post, &pre)) in post_buffer_indices.iter().zip(pre_buffer_indices).enumerate() {
            let post_source = if self.store.is_compact(post) {
                ChildSource::States(self.store.tip_states(post)?)
            } else {
                ChildSource::Partials(self.store.partials(post)?)
            };
            reduce::accumulate_cross_product(
                &post_source,
                self.store.partials(pre)?,
                rates,
                weights,
                edge_lengths[i],
                self.store.pattern_weights(),
                dims,
                out,
            )?;
        }
        Ok(())
    }
}
