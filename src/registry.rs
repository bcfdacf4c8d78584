//! Capability registry and backend selection.
//!
//! Resources are enumerated once at first use: the scalar CPU kernel set,
//! the SIMD kernel set (advertising the vector ISA detected at startup),
//! and the matrix-exponential-action kernel set. `select` filters resources
//! whose support set covers every required bit, then ranks by
//! preference-bit overlap with priority as the tie-break.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::core::flags::Flags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    CpuScalar,
    CpuSimd,
    CpuAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub description: String,
    pub kind: ResourceKind,
    pub support_flags: Flags,
    pub required_flags: Flags,
    /// Default ranking among equally-preferred resources.
    pub priority: u32,
}

/// Scaling and scaler bits every CPU kernel set supports.
fn common_scaling() -> Flags {
    Flags::SCALING_MANUAL
        | Flags::SCALING_AUTO
        | Flags::SCALING_ALWAYS
        | Flags::SCALING_DYNAMIC
        | Flags::SCALERS_RAW
        | Flags::SCALERS_LOG
}

fn detect_vector_isa() -> Flags {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("avx") {
            return Flags::VECTOR_SSE | Flags::VECTOR_AVX;
        }
        if std::arch::is_x86_feature_detected!("sse2") {
            return Flags::VECTOR_SSE;
        }
    }
    // Non-x86 targets still run the lane-typed kernels.
    Flags::VECTOR_SSE
}

fn build_resources() -> Vec<Resource> {
    let base = Flags::PRECISION_DOUBLE
        | Flags::COMPUTATION_SYNCH
        | Flags::COMPUTATION_ASYNCH
        | Flags::THREADING_NONE
        | Flags::THREADING_CPP
        | Flags::PROCESSOR_CPU
        | Flags::FRAMEWORK_CPU
        | Flags::INVEVEC_STANDARD
        | common_scaling();

    vec![
        Resource {
            name: "CPU".to_string(),
            description: "scalar likelihood kernels".to_string(),
            kind: ResourceKind::CpuScalar,
            support_flags: base
                | Flags::EIGEN_REAL
                | Flags::EIGEN_COMPLEX
                | Flags::VECTOR_NONE
                | Flags::PREORDER_TRANSPOSE_MANUAL
                | Flags::PREORDER_TRANSPOSE_AUTO,
            required_flags: Flags::NONE,
            priority: 10,
        },
        Resource {
            name: "CPU-SIMD".to_string(),
            description: "lane-vectorized likelihood kernels".to_string(),
            kind: ResourceKind::CpuSimd,
            support_flags: base
                | Flags::EIGEN_REAL
                | Flags::EIGEN_COMPLEX
                | detect_vector_isa()
                | Flags::PREORDER_TRANSPOSE_MANUAL
                | Flags::PREORDER_TRANSPOSE_AUTO,
            required_flags: Flags::NONE,
            priority: 20,
        },
        Resource {
            name: "CPU-Action".to_string(),
            description: "matrix-exponential action kernels (sparse Q)".to_string(),
            kind: ResourceKind::CpuAction,
            support_flags: base | Flags::COMPUTATION_ACTION | Flags::EIGEN_REAL | Flags::VECTOR_NONE,
            required_flags: Flags::COMPUTATION_ACTION,
            priority: 5,
        },
    ]
}

pub fn resources() -> &'static [Resource] {
    static RESOURCES: OnceLock<Vec<Resource>> = OnceLock::new();
    RESOURCES.get_or_init(build_resources)
}

/// Pick the backend for an instance.
///
/// A pinned resource number is used verbatim or the call fails; otherwise
/// the highest preference-overlap among resources supporting every required
/// bit wins, with the priority field breaking ties.
pub fn select(
    preference: Flags,
    requirement: Flags,
    pinned: Option<usize>,
) -> Result<(usize, &'static Resource)> {
    let list = resources();
    if let Some(number) = pinned {
        let resource = list
            .get(number)
            .ok_or(Error::bad_index("resource", number as i64, list.len()))?;
        if !resource.support_flags.contains(requirement) {
            return Err(Error::NoResource);
        }
        return Ok((number, resource));
    }

    let mut best: Option<(usize, &Resource, (u32, u32))> = None;
    for (number, resource) in list.iter().enumerate() {
        if !resource.support_flags.contains(requirement) {
            continue;
        }
        // A resource demanding a capability bit (the action backend) is only
        // eligible when the caller asked for that bit.
        if !resource.required_flags.is_empty()
            && !(preference | requirement).contains(resource.required_flags)
        {
            continue;
        }
        let score = (resource.support_flags.overlap(preference), resource.priority);
        if best.map_or(true, |(_, _, s)| score > s) {
            best = Some((number, resource, score));
        }
    }
    best.map(|(n, r, _)| (n, r)).ok_or(Error::NoResource)
}

/// One resource timed on the standard synthetic workload.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkedResource {
    pub resource_number: usize,
    pub name: String,
    pub impl_name: String,
    pub benched_flags: Flags,
    pub elapsed_ms: f64,
    pub speedup_vs_cpu: f64,
}

/// Time every resource on a fixed workload (16 taxa, 250 patterns, 4
/// categories, 4 states) so speedups are comparable across runs on one
/// host. Resource 0 (the scalar CPU) anchors the speedup column.
pub fn benchmarked_resource_list() -> Vec<BenchmarkedResource> {
    let mut out = Vec::new();
    let mut scalar_ms = None;
    for (number, resource) in resources().iter().enumerate() {
        let elapsed_ms = match benchmark_workload(number, resource) {
            Ok(ms) => ms,
            Err(_) => continue,
        };
        if number == 0 {
            scalar_ms = Some(elapsed_ms);
        }
        out.push(BenchmarkedResource {
            resource_number: number,
            name: resource.name.clone(),
            impl_name: format!("felsite::{}", resource.name.to_lowercase()),
            benched_flags: resource.support_flags,
            elapsed_ms,
            speedup_vs_cpu: scalar_ms.map_or(1.0, |base| base / elapsed_ms),
        });
    }
    out
}

fn benchmark_workload(number: usize, resource: &Resource) -> Result<f64> {
    use crate::core::operation::{Operation, OP_NONE};
    use crate::core::sizes::InstanceSizes;
    use crate::instance::Instance;

    const TAXA: usize = 16;
    const PATTERNS: usize = 250;
    const CATEGORIES: usize = 4;
    const REPS: usize = 5;

    let sizes = InstanceSizes {
        tip_count: TAXA,
        partials_count: TAXA - 1,
        compact_count: 0,
        state_count: 4,
        pattern_count: PATTERNS,
        eigen_count: 1,
        matrix_count: 2 * TAXA - 2,
        category_count: CATEGORIES,
        scale_count: 1,
    };
    let mut instance = Instance::create(
        sizes,
        Flags::NONE,
        resource.required_flags,
        Some(number),
    )?;

    // Deterministic tip data; unit state vectors per pattern.
    let mut lcg: u64 = 0x2545F4914F6CDD1D;
    for tip in 0..TAXA {
        let mut partials = vec![0.0f64; PATTERNS * 4];
        for k in 0..PATTERNS {
            lcg = lcg.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            partials[k * 4 + (lcg >> 33) as usize % 4] = 1.0;
        }
        instance.set_tip_partials(tip, &partials)?;
    }
    instance.set_category_rates(&[0.2, 0.6, 1.1, 2.1])?;

    if resource.kind == ResourceKind::CpuAction {
        let (coords, descriptor, values) = crate::model::jukes_cantor_triplets(4);
        instance.set_eigen_decomposition(0, &coords, &descriptor, &values)?;
    } else {
        let (evec, ivec, eval) = crate::model::jukes_cantor_eigensystem(4);
        instance.set_eigen_decomposition(0, &evec, &ivec, &eval)?;
    }

    let node_indices: Vec<usize> = (0..2 * TAXA - 2).collect();
    let edges = vec![0.1f64; node_indices.len()];
    instance.update_transition_matrices(0, &node_indices, None, None, &edges)?;

    // Balanced pairing: internal node TAXA+i joins buffers 2i and 2i+1.
    let ops: Vec<Operation> = (0..TAXA - 1)
        .map(|i| {
            Operation::from([
                (TAXA + i) as i32,
                OP_NONE,
                OP_NONE,
                (2 * i) as i32,
                (2 * i) as i32,
                (2 * i + 1) as i32,
                (2 * i + 1) as i32,
            ])
        })
        .collect();
    let root = (2 * TAXA - 2) as i32;

    let start = std::time::Instant::now();
    for _ in 0..REPS {
        instance.update_partials(&ops, OP_NONE)?;
        instance.calculate_root_log_likelihoods(&[root], &[0], &[0], &[OP_NONE])?;
    }
    Ok(start.elapsed().as_secs_f64() * 1000.0 / REPS as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simd_wins_by_default() {
        let (_, r) = select(Flags::NONE, Flags::NONE, None).unwrap();
        assert_eq!(r.kind, ResourceKind::CpuSimd);
    }

    #[test]
    fn vector_none_requirement_selects_scalar() {
        let (_, r) = select(Flags::NONE, Flags::VECTOR_NONE, None).unwrap();
        assert_eq!(r.kind, ResourceKind::CpuScalar);
    }

    #[test]
    fn action_needs_explicit_request() {
        let (_, r) = select(Flags::NONE, Flags::COMPUTATION_ACTION, None).unwrap();
        assert_eq!(r.kind, ResourceKind::CpuAction);
        // Never selected spontaneously.
        let (_, r) = select(Flags::PRECISION_DOUBLE, Flags::NONE, None).unwrap();
        assert_ne!(r.kind, ResourceKind::CpuAction);
    }

    #[test]
    fn pinned_resource_is_respected_or_rejected() {
        let (n, r) = select(Flags::NONE, Flags::NONE, Some(0)).unwrap();
        assert_eq!(n, 0);
        assert_eq!(r.kind, ResourceKind::CpuScalar);
        assert!(select(Flags::NONE, Flags::NONE, Some(99)).is_err());
        // Scalar cannot satisfy an action requirement.
        assert!(select(Flags::NONE, Flags::COMPUTATION_ACTION, Some(0)).is_err());
    }

    #[test]
    fn unsatisfiable_requirement_is_no_resource() {
        let err = select(Flags::NONE, Flags::PROCESSOR_GPU, None).unwrap_err();
        assert_eq!(err.code(), -6);
    }
}
