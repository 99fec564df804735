//! Intermediate representation.
//!
//! A block-structured SSA flow graph with arena-allocated instructions and
//! intrusive def-use lists:
//!
//! - [`arena`]: typed ids, arenas, side tables and bit sets
//! - [`types`]: class ids, representations, literals, operator kinds
//! - [`instr`]: the closed operator set and instruction records
//! - [`graph`]: the flow graph and its editing primitives
//! - [`range`]: integer ranges with symbolic boundaries
//! - [`cfg`]: dominator tree and loops
//! - [`builder`]: programmatic construction
//! - [`verify`]: consistency checks
//! - [`eval`]: exact built-in operator semantics
//! - [`interp`]: reference interpreter and profiler

pub mod arena;
pub mod builder;
pub mod cfg;
pub mod eval;
pub mod graph;
pub mod instr;
pub mod interp;
pub mod range;
pub mod types;
pub mod verify;

pub use builder::FlowGraphBuilder;
pub use cfg::{DominatorTree, LoopAnalysis};
pub use graph::FlowGraph;
pub use instr::{BlockId, DeoptId, InstrId, MissAction, Op};
pub use interp::{Interpreter, Outcome, Value};
pub use range::{Range, RangeBoundary};
pub use types::{BinaryOp, ClassId, CmpOp, IntWidth, Literal, Repr, Selector, UnaryOp};
pub use verify::verify;
