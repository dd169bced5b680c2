use thiserror::Error;

/// Every failure class the engine surfaces. All of them abort the current
/// operation; no partial results are produced and nothing is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("variable {variable} of rule {rule} occurs only in negated or aggregated positions")]
    VariableOnlyInNegatedContext { variable: String, rule: String },

    #[error("free variable {variable} in the head of rule {rule}")]
    FreeHeadVariable { variable: String, rule: String },

    #[error("anonymous variable in the head of rule {rule}")]
    AnonymousHeadVariable { rule: String },

    #[error("recursion through negation or aggregation involving relation {relation}")]
    UnstratifiableNegationOrAggregation { relation: String },

    #[error("relation {relation} has neither asserted facts nor a producing rule")]
    UnknownRelation { relation: String },

    #[error("relation {relation} used with arity {found}, expected {expected}")]
    ArityMismatch {
        relation: String,
        expected: usize,
        found: usize,
    },

    #[error("aggregation operand {variable} of rule {rule} is neither a group-by variable nor local to the grouped atom")]
    AggregationOnUnboundVariable { variable: String, rule: String },
}
