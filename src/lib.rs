//! # Felsite
//!
//! A likelihood-evaluation kernel for phylogenetic inference: post-order and
//! pre-order partials propagation under continuous-time Markov substitution
//! models, transition-matrix construction from eigen decompositions (or
//! their direct action via a sparse generator), numerical rescaling, and the
//! reductions inference programs poll in their inner loop: log-likelihoods,
//! site log-likelihoods, edge derivatives and cross products.
//!
//! - **[`core`]:** sizing, flags, operations, errors.
//! - **[`store`]:** the flat handle-addressed buffer stores.
//! - **[`model`]:** eigen decompositions and sparse generators.
//! - **[`kernels`]:** scalar, SIMD and action compute kernels.
//! - **[`scaling`]:** the rescaling disciplines.
//! - **[`reduce`]:** log-likelihood and derivative reductions.
//! - **[`instance`]:** the per-instance orchestration layer.
//! - **[`registry`]:** resource enumeration and backend selection.
//! - **[`interface`]:** the handle-based integer-status surface.

pub mod core;
pub mod instance;
pub mod interface;
pub mod kernels;
pub mod model;
pub mod reduce;
pub mod registry;
pub mod scaling;
pub mod store;

pub use crate::core::{Error, Flags, InstanceSizes, Operation, PartitionOperation, Result, OP_NONE};
pub use crate::instance::{Instance, InstanceDetails};
pub use crate::reduce::EdgeReduction;
pub use crate::registry::{BenchmarkedResource, Resource, ResourceKind};
