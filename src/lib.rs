//! A Datalog evaluation engine: rules compile into a relational-algebra
//! tree, the semi-naive fixpoint loop runs it over double-buffered
//! generations, and either a tree-walking interpreter or a specialized
//! callable does the running. Stratified negation and grouping
//! aggregation are supported.

pub mod engine;
pub mod error;
pub mod evaluation;
pub mod planner;

pub use engine::datalog::Engine;
pub use error::EngineError;
pub use evaluation::{EvalContext, Granularity, JitOptions, OnlineSort, StageTimings};
pub use planner::sort_order::SortOrder;
