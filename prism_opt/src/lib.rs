//! Prism optimizing middle end.
//!
//! Takes a built SSA flow graph for one function together with the call-site
//! type feedback gathered by the unoptimized tier, and rewrites it into a
//! faster, semantically equivalent graph:
//!
//! 1. **Call-site specialization**: dynamic calls become typed, guarded
//!    operations (or explicit multi-target dispatch).
//! 2. **Constant propagation**: sparse conditional constant propagation with
//!    reachability, dead-code and branch pruning.
//! 3. **Range analysis**: integer intervals, induction variables and
//!    bounds-check elimination.
//! 4. **Integer narrowing**: wide integer operations whose results fit in
//!    32 unsigned bits are selected as `uint32` operations.
//!
//! # Architecture
//!
//! ```text
//! FlowGraph + Feedback
//!          │
//!          ▼
//!     Specializer ──► ConstProp ──► RangeAnalysis ──► Narrowing ──► codegen
//!          │                             │
//!    ClassHierarchy              (re-run ConstProp if
//!       snapshot                  a path proved dead)
//! ```
//!
//! The [`ir`] module owns the data model; [`opt`] owns the passes.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod feedback;
pub mod hierarchy;
pub mod ir;
pub mod opt;

pub use config::OptConfig;
pub use error::{OptError, OptResult};
pub use opt::pipeline::{optimize, PipelineReport};
