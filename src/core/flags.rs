use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Capability / configuration bitset shared by resources and instances.
///
/// A resource advertises a `support` set and a `required` set; instance
/// creation intersects the caller's requirement and preference sets against
/// those. The numeric values are part of the stable surface.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Flags(pub u64);

impl Flags {
    pub const NONE: Flags = Flags(0);

    pub const PRECISION_SINGLE: Flags = Flags(1 << 0);
    pub const PRECISION_DOUBLE: Flags = Flags(1 << 1);

    pub const COMPUTATION_SYNCH: Flags = Flags(1 << 2);
    pub const COMPUTATION_ASYNCH: Flags = Flags(1 << 3);
    pub const COMPUTATION_ACTION: Flags = Flags(1 << 4);

    pub const EIGEN_REAL: Flags = Flags(1 << 5);
    pub const EIGEN_COMPLEX: Flags = Flags(1 << 6);

    pub const SCALING_MANUAL: Flags = Flags(1 << 7);
    pub const SCALING_AUTO: Flags = Flags(1 << 8);
    pub const SCALING_ALWAYS: Flags = Flags(1 << 9);
    pub const SCALING_DYNAMIC: Flags = Flags(1 << 10);

    pub const SCALERS_RAW: Flags = Flags(1 << 11);
    pub const SCALERS_LOG: Flags = Flags(1 << 12);

    pub const VECTOR_NONE: Flags = Flags(1 << 13);
    pub const VECTOR_SSE: Flags = Flags(1 << 14);
    pub const VECTOR_AVX: Flags = Flags(1 << 15);

    pub const THREADING_NONE: Flags = Flags(1 << 16);
    pub const THREADING_CPP: Flags = Flags(1 << 17);

    pub const PROCESSOR_CPU: Flags = Flags(1 << 18);
    pub const PROCESSOR_GPU: Flags = Flags(1 << 19);
    pub const PROCESSOR_OTHER: Flags = Flags(1 << 20);

    pub const FRAMEWORK_CPU: Flags = Flags(1 << 21);
    pub const FRAMEWORK_CUDA: Flags = Flags(1 << 22);
    pub const FRAMEWORK_OPENCL: Flags = Flags(1 << 23);

    pub const INVEVEC_STANDARD: Flags = Flags(1 << 24);
    pub const INVEVEC_TRANSPOSED: Flags = Flags(1 << 25);

    pub const PREORDER_TRANSPOSE_MANUAL: Flags = Flags(1 << 26);
    pub const PREORDER_TRANSPOSE_AUTO: Flags = Flags(1 << 27);
    pub const PREORDER_TRANSPOSE_LOW_MEMORY: Flags = Flags(1 << 28);

    pub const PARALLELOPS_STREAMS: Flags = Flags(1 << 29);
    pub const PARALLELOPS_GRID: Flags = Flags(1 << 30);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    /// Number of bits shared with `other`, used as a preference score.
    pub fn overlap(self, other: Flags) -> u32 {
        (self.0 & other.0).count_ones()
    }
}

impl BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Flags;
    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

const FLAG_NAMES: &[(Flags, &str)] = &[
    (Flags::PRECISION_SINGLE, "PRECISION_SINGLE"),
    (Flags::PRECISION_DOUBLE, "PRECISION_DOUBLE"),
    (Flags::COMPUTATION_SYNCH, "COMPUTATION_SYNCH"),
    (Flags::COMPUTATION_ASYNCH, "COMPUTATION_ASYNCH"),
    (Flags::COMPUTATION_ACTION, "COMPUTATION_ACTION"),
    (Flags::EIGEN_REAL, "EIGEN_REAL"),
    (Flags::EIGEN_COMPLEX, "EIGEN_COMPLEX"),
    (Flags::SCALING_MANUAL, "SCALING_MANUAL"),
    (Flags::SCALING_AUTO, "SCALING_AUTO"),
    (Flags::SCALING_ALWAYS, "SCALING_ALWAYS"),
    (Flags::SCALING_DYNAMIC, "SCALING_DYNAMIC"),
    (Flags::SCALERS_RAW, "SCALERS_RAW"),
    (Flags::SCALERS_LOG, "SCALERS_LOG"),
    (Flags::VECTOR_NONE, "VECTOR_NONE"),
    (Flags::VECTOR_SSE, "VECTOR_SSE"),
    (Flags::VECTOR_AVX, "VECTOR_AVX"),
    (Flags::THREADING_NONE, "THREADING_NONE"),
    (Flags::THREADING_CPP, "THREADING_CPP"),
    (Flags::PROCESSOR_CPU, "PROCESSOR_CPU"),
    (Flags::PROCESSOR_GPU, "PROCESSOR_GPU"),
    (Flags::PROCESSOR_OTHER, "PROCESSOR_OTHER"),
    (Flags::FRAMEWORK_CPU, "FRAMEWORK_CPU"),
    (Flags::FRAMEWORK_CUDA, "FRAMEWORK_CUDA"),
    (Flags::FRAMEWORK_OPENCL, "FRAMEWORK_OPENCL"),
    (Flags::INVEVEC_STANDARD, "INVEVEC_STANDARD"),
    (Flags::INVEVEC_TRANSPOSED, "INVEVEC_TRANSPOSED"),
    (Flags::PREORDER_TRANSPOSE_MANUAL, "PREORDER_TRANSPOSE_MANUAL"),
    (Flags::PREORDER_TRANSPOSE_AUTO, "PREORDER_TRANSPOSE_AUTO"),
    (
        Flags::PREORDER_TRANSPOSE_LOW_MEMORY,
        "PREORDER_TRANSPOSE_LOW_MEMORY",
    ),
    (Flags::PARALLELOPS_STREAMS, "PARALLELOPS_STREAMS"),
    (Flags::PARALLELOPS_GRID, "PARALLELOPS_GRID"),
];

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in FLAG_NAMES {
            if self.contains(*flag) {
                if !first {
                    write!(f, " ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_and_overlap() {
        let support = Flags::PRECISION_DOUBLE
            | Flags::PROCESSOR_CPU
            | Flags::VECTOR_SSE
            | Flags::SCALING_MANUAL;
        assert!(support.contains(Flags::PRECISION_DOUBLE | Flags::PROCESSOR_CPU));
        assert!(!support.contains(Flags::PROCESSOR_GPU));
        assert_eq!(
            support.overlap(Flags::VECTOR_SSE | Flags::PROCESSOR_GPU),
            1
        );
    }

    #[test]
    fn display_lists_set_bits() {
        let f = Flags::PRECISION_DOUBLE | Flags::EIGEN_REAL;
        assert_eq!(f.to_string(), "PRECISION_DOUBLE EIGEN_REAL");
        assert_eq!(Flags::NONE.to_string(), "");
    }
}
