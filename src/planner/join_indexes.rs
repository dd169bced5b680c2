use crate::error::EngineError;
use ahash::{HashMap, HashMapExt};
use datalog_syntax::{AggregateOp, Atom, Rule, Term, TypedValue};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub type Column = usize;

#[derive(PartialEq, Eq, Debug, Clone, Hash)]
pub enum ProjectionInput {
    Column(Column),
    Value(TypedValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Positive,
    Negated,
    Grouping,
}

/// How the universe of one column of a negated atom is obtained when its
/// complement is materialized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnUniverse {
    /// The column is pinned to one constant.
    Constant(TypedValue),
    /// Distinct values found at these (relation, column) slots of positive
    /// body atoms.
    Occurrences(Vec<(String, Column)>),
    /// Anonymous or otherwise positionally unconstrained: the full active
    /// domain.
    Domain,
}

/// Where one aggregated output value is read from, per input row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggSource {
    /// A group-by key column (index into the group key).
    Group(usize),
    /// A column of the grouped atom.
    Local(Column),
    /// A constant contributed by every row.
    Constant(TypedValue),
}

/// Precomputed metadata for one grouping atom: constraints on the grouped
/// atom's own columns, the group-by columns, and the aggregation sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupingIndexes {
    pub var_indexes: Vec<Vec<Column>>,
    pub const_indexes: BTreeMap<Column, TypedValue>,
    pub group_by: Vec<Column>,
    pub agg_sources: Vec<(AggregateOp, AggSource)>,
}

/// Everything the executors need to run one rule body in one particular
/// order: equality classes and constant pins over the flattened body
/// columns, the head projection, dependency edges, the connectivity map
/// driving body reordering, negation universes, and grouping metadata.
///
/// Body columns are flattened left to right. A positive or negated atom
/// contributes one column per term; a grouping atom contributes its output
/// schema (group keys, then one column per aggregation op).
#[derive(Debug, Clone, PartialEq)]
pub struct JoinIndexes {
    pub var_indexes: Vec<Vec<Column>>,
    pub const_indexes: BTreeMap<Column, TypedValue>,
    pub proj_indexes: Vec<ProjectionInput>,
    pub deps: Vec<(EdgeKind, String)>,
    pub cxns: HashMap<u64, BTreeMap<usize, Vec<u64>>>,
    pub negation_info: HashMap<usize, Vec<ColumnUniverse>>,
    pub grouping_indexes: HashMap<usize, GroupingIndexes>,
    pub edb: bool,
    pub offsets: Vec<Column>,
    pub width: usize,
}

impl Hash for JoinIndexes {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.var_indexes.hash(state);
        self.const_indexes.hash(state);
        self.proj_indexes.hash(state);
        self.deps.hash(state);
        self.edb.hash(state);
        self.offsets.hash(state);
        self.width.hash(state);
    }
}

impl Eq for JoinIndexes {}

fn rule_label(rule: &Rule) -> String {
    format!("{:?}", rule)
}

/// Number of flattened columns an atom contributes.
fn atom_width(atom: &Atom) -> usize {
    atom.terms.len()
}

/// The named (non-anonymous) variables of an atom's own terms.
fn named_variables(atom: &Atom) -> Vec<&str> {
    atom.terms
        .iter()
        .filter(|term| !term.is_anonymous())
        .filter_map(|term| term.as_variable())
        .collect()
}

fn record_arity(
    arities: &mut HashMap<String, usize>,
    symbol: &str,
    arity: usize,
) -> Result<(), EngineError> {
    match arities.get(symbol) {
        Some(&known) if known != arity => Err(EngineError::ArityMismatch {
            relation: symbol.to_string(),
            expected: known,
            found: arity,
        }),
        Some(_) => Ok(()),
        None => {
            arities.insert(symbol.to_string(), arity);
            Ok(())
        }
    }
}

fn compile_grouping(atom: &Atom, rule: &Rule) -> Result<GroupingIndexes, EngineError> {
    let agg = atom.agg.as_ref().unwrap();
    let inner = &agg.inner;

    let mut first_position: IndexMap<&str, Column> = IndexMap::new();
    let mut var_groups: IndexMap<&str, Vec<Column>> = IndexMap::new();
    let mut const_indexes = BTreeMap::new();

    for (position, term) in inner.terms.iter().enumerate() {
        match term {
            Term::Variable(_) if term.is_anonymous() => {}
            Term::Variable(name) => {
                first_position.entry(name.as_str()).or_insert(position);
                var_groups.entry(name.as_str()).or_default().push(position);
            }
            Term::Constant(value) => {
                const_indexes.insert(position, value.clone());
            }
        }
    }

    let var_indexes = var_groups
        .into_iter()
        .map(|(_, positions)| positions)
        .filter(|positions| positions.len() > 1)
        .collect();

    let mut group_by = Vec::with_capacity(agg.group_by.len());
    for group_var in &agg.group_by {
        match first_position.get(group_var.as_str()) {
            Some(&position) => group_by.push(position),
            None => {
                return Err(EngineError::AggregationOnUnboundVariable {
                    variable: group_var.clone(),
                    rule: rule_label(rule),
                })
            }
        }
    }

    let mut agg_sources = Vec::with_capacity(agg.ops.len());
    for (op, operand) in &agg.ops {
        let source = match operand {
            Term::Constant(value) => AggSource::Constant(value.clone()),
            Term::Variable(name) => {
                if let Some(key_index) = agg.group_by.iter().position(|gv| gv == name) {
                    AggSource::Group(key_index)
                } else if let Some(&position) = first_position.get(name.as_str()) {
                    AggSource::Local(position)
                } else {
                    return Err(EngineError::AggregationOnUnboundVariable {
                        variable: name.clone(),
                        rule: rule_label(rule),
                    });
                }
            }
        };
        agg_sources.push((*op, source));
    }

    Ok(GroupingIndexes {
        var_indexes,
        const_indexes,
        group_by,
        agg_sources,
    })
}

impl JoinIndexes {
    /// Compiles a rule body into its join indexes, validating the rule on
    /// the way. The result is specific to the body order it was given.
    pub fn compile(rule: &Rule) -> Result<JoinIndexes, EngineError> {
        let mut arities: HashMap<String, usize> = HashMap::new();
        record_arity(&mut arities, &rule.head.symbol, rule.head.terms.len())?;
        for atom in &rule.body {
            match &atom.agg {
                Some(agg) => {
                    record_arity(&mut arities, &agg.inner.symbol, agg.inner.terms.len())?;
                    let expected = agg.group_by.len() + agg.ops.len();
                    if atom.terms.len() != expected {
                        return Err(EngineError::ArityMismatch {
                            relation: atom.symbol.clone(),
                            expected,
                            found: atom.terms.len(),
                        });
                    }
                }
                None => record_arity(&mut arities, &atom.symbol, atom.terms.len())?,
            }
        }

        // Trivial EDB assertion: a bodyless rule whose head is ground.
        if rule.body.is_empty() {
            let mut proj_indexes = Vec::with_capacity(rule.head.terms.len());
            for term in &rule.head.terms {
                match term {
                    Term::Constant(value) => {
                        proj_indexes.push(ProjectionInput::Value(value.clone()))
                    }
                    Term::Variable(name) => {
                        return Err(EngineError::FreeHeadVariable {
                            variable: name.clone(),
                            rule: rule_label(rule),
                        })
                    }
                }
            }
            return Ok(JoinIndexes {
                var_indexes: vec![],
                const_indexes: BTreeMap::new(),
                proj_indexes,
                deps: vec![],
                cxns: HashMap::new(),
                negation_info: HashMap::new(),
                grouping_indexes: HashMap::new(),
                edb: true,
                offsets: vec![],
                width: 0,
            });
        }

        let mut offsets = Vec::with_capacity(rule.body.len());
        let mut width = 0;
        for atom in &rule.body {
            offsets.push(width);
            width += atom_width(atom);
        }

        // Left-to-right occurrence collection over flattened columns.
        // Canonical binding = first occurrence under a positive atom
        // (grouping output columns included, negated columns excluded).
        let mut occurrences: IndexMap<&str, Vec<Column>> = IndexMap::new();
        let mut canonical: IndexMap<&str, Column> = IndexMap::new();
        let mut const_indexes = BTreeMap::new();

        for (atom_idx, atom) in rule.body.iter().enumerate() {
            for (local, term) in atom.terms.iter().enumerate() {
                let position = offsets[atom_idx] + local;
                match term {
                    Term::Variable(_) if term.is_anonymous() => {}
                    Term::Variable(name) => {
                        occurrences.entry(name.as_str()).or_default().push(position);
                        if atom.sign {
                            canonical.entry(name.as_str()).or_insert(position);
                        }
                    }
                    Term::Constant(value) => {
                        const_indexes.insert(position, value.clone());
                    }
                }
            }
        }

        for (name, _) in &occurrences {
            if !canonical.contains_key(name) {
                return Err(EngineError::VariableOnlyInNegatedContext {
                    variable: (*name).to_string(),
                    rule: rule_label(rule),
                });
            }
        }

        // Equality classes: canonical column first, the rest in occurrence
        // order. Single-occurrence variables constrain nothing.
        let mut var_indexes = Vec::new();
        for (name, positions) in &occurrences {
            if positions.len() < 2 {
                continue;
            }
            let canon = canonical[name];
            let mut group = vec![canon];
            group.extend(positions.iter().copied().filter(|&p| p != canon));
            var_indexes.push(group);
        }

        let mut proj_indexes = Vec::with_capacity(rule.head.terms.len());
        for term in &rule.head.terms {
            match term {
                Term::Constant(value) => proj_indexes.push(ProjectionInput::Value(value.clone())),
                Term::Variable(_) if term.is_anonymous() => {
                    return Err(EngineError::AnonymousHeadVariable {
                        rule: rule_label(rule),
                    })
                }
                Term::Variable(name) => match canonical.get(name.as_str()) {
                    Some(&column) => proj_indexes.push(ProjectionInput::Column(column)),
                    None => {
                        return Err(EngineError::FreeHeadVariable {
                            variable: name.clone(),
                            rule: rule_label(rule),
                        })
                    }
                },
            }
        }

        let deps = rule
            .body
            .iter()
            .map(|atom| {
                let kind = if atom.is_grouping() {
                    EdgeKind::Grouping
                } else if !atom.sign {
                    EdgeKind::Negated
                } else {
                    EdgeKind::Positive
                };
                (kind, atom.symbol.clone())
            })
            .collect();

        // Exhaustive pairwise connectivity, grouped by the number of shared
        // named variables. Atoms sharing only anonymous positions are not
        // connected.
        let mut cxns: HashMap<u64, BTreeMap<usize, Vec<u64>>> = HashMap::new();
        for (i, left) in rule.body.iter().enumerate() {
            for right in rule.body.iter().skip(i + 1) {
                let left_vars = named_variables(left);
                let shared = named_variables(right)
                    .iter()
                    .filter(|name| left_vars.contains(name))
                    .count();
                if shared == 0 {
                    continue;
                }
                cxns.entry(left.stable_hash())
                    .or_default()
                    .entry(shared)
                    .or_default()
                    .push(right.stable_hash());
                cxns.entry(right.stable_hash())
                    .or_default()
                    .entry(shared)
                    .or_default()
                    .push(left.stable_hash());
            }
        }

        // For every negated atom, how each of its columns' universes is
        // inferred when the complement is materialized.
        let mut negation_info = HashMap::new();
        for (atom_idx, atom) in rule.body.iter().enumerate() {
            if atom.sign {
                continue;
            }
            let mut universes = Vec::with_capacity(atom.terms.len());
            for term in &atom.terms {
                let universe = match term {
                    Term::Constant(value) => ColumnUniverse::Constant(value.clone()),
                    Term::Variable(_) if term.is_anonymous() => ColumnUniverse::Domain,
                    Term::Variable(name) => {
                        let mut slots = Vec::new();
                        for positive in rule.body.iter().filter(|a| a.sign && !a.is_grouping()) {
                            for (column, positive_term) in positive.terms.iter().enumerate() {
                                if positive_term.as_variable() == Some(name.as_str()) {
                                    slots.push((positive.symbol.clone(), column));
                                }
                            }
                        }
                        if slots.is_empty() {
                            // Bound only through a grouping output; no stored
                            // column carries it, fall back to the domain.
                            ColumnUniverse::Domain
                        } else {
                            ColumnUniverse::Occurrences(slots)
                        }
                    }
                };
                universes.push(universe);
            }
            negation_info.insert(atom_idx, universes);
        }

        let mut grouping_indexes = HashMap::new();
        for (atom_idx, atom) in rule.body.iter().enumerate() {
            if atom.is_grouping() {
                grouping_indexes.insert(atom_idx, compile_grouping(atom, rule)?);
            }
        }

        Ok(JoinIndexes {
            var_indexes,
            const_indexes,
            proj_indexes,
            deps,
            cxns,
            negation_info,
            grouping_indexes,
            edb: false,
            offsets,
            width,
        })
    }
}

/// Memoizes compiled join indexes per rule content hash. One body
/// permutation is one entry; failures are not cached.
#[derive(Default)]
pub struct IndexCache {
    inner: HashMap<u64, Arc<JoinIndexes>>,
}

impl IndexCache {
    pub fn get_or_compile(&mut self, rule: &Rule) -> Result<Arc<JoinIndexes>, EngineError> {
        let key = rule.stable_hash();
        if let Some(hit) = self.inner.get(&key) {
            tracing::trace!(rule = %rule_label(rule), "join index cache hit");
            return Ok(hit.clone());
        }
        let compiled = Arc::new(JoinIndexes::compile(rule)?);
        self.inner.insert(key, compiled.clone());
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Join indexes for every permutation of the rule body, paired with the
/// permuted rule. Exhaustive planning for development and tests.
pub fn all_orders(rule: &Rule) -> Result<Vec<(Rule, JoinIndexes)>, EngineError> {
    let mut result = Vec::new();
    for permutation in super::sort_order::permutations(rule.body.len()) {
        let permuted = Rule {
            head: rule.head.clone(),
            body: permutation.iter().map(|&i| rule.body[i].clone()).collect(),
            id: rule.id,
        };
        let indexes = JoinIndexes::compile(&permuted)?;
        result.push((permuted, indexes));
    }
    Ok(result)
}
