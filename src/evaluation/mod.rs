pub mod interpreter;
pub mod ir;
pub mod query;
pub mod staged;

use crate::planner::sort_order::SortOrder;
use std::time::Duration;

/// When the executor re-plans a join order against live relation sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OnlineSort {
    #[default]
    Off,
    /// Once per rule and delta slot, memoized for the rest of the solve.
    PerRule,
    /// At every execution of the join node.
    PerStep,
}

/// Unit of specialization the staged executor caches at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Granularity {
    #[default]
    Program,
    Rule,
    Atom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JitOptions {
    pub sort_order: SortOrder,
    pub online_sort: OnlineSort,
    pub granularity: Granularity,
}

/// Wall-clock cost of the three staged surfaces of the last compiled
/// solve. Interpreted solves only fill `execute`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageTimings {
    pub generate: Duration,
    pub specialize: Duration,
    pub execute: Duration,
}

/// Everything a generated tree needs besides itself to be specialized and
/// run: the queried relation and the options it was generated under.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub target: String,
    pub options: JitOptions,
}
