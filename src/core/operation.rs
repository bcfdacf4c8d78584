use serde::{Deserialize, Serialize};

/// Sentinel for "no buffer": no scaling read/write, no cumulative buffer.
pub const OP_NONE: i32 = -1;

/// One post-order (or pre-order) partials update.
///
/// The destination is computed from two children; each child contributes a
/// partials (or compact tip-state) buffer and a transition-matrix slot. The
/// scale fields are honored only under the manual and dynamic scaling
/// disciplines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub destination: i32,
    pub write_scale: i32,
    pub read_scale: i32,
    pub child1_partials: i32,
    pub child1_matrix: i32,
    pub child2_partials: i32,
    pub child2_matrix: i32,
}

impl Operation {
    pub fn new(
        destination: i32,
        write_scale: i32,
        read_scale: i32,
        child1_partials: i32,
        child1_matrix: i32,
        child2_partials: i32,
        child2_matrix: i32,
    ) -> Self {
        Operation {
            destination,
            write_scale,
            read_scale,
            child1_partials,
            child1_matrix,
            child2_partials,
            child2_matrix,
        }
    }
}

impl From<[i32; 7]> for Operation {
    fn from(v: [i32; 7]) -> Self {
        Operation::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6])
    }
}

/// Partitioned operation: the same seven fields plus the partition whose
/// patterns the update is restricted to and a per-operation cumulative scale
/// target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOperation {
    pub op: Operation,
    pub partition: i32,
    pub cumulative_scale: i32,
}

impl From<[i32; 9]> for PartitionOperation {
    fn from(v: [i32; 9]) -> Self {
        PartitionOperation {
            op: Operation::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6]),
            partition: v[7],
            cumulative_scale: v[8],
        }
    }
}
