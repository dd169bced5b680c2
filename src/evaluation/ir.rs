use crate::engine::storage::{Db, Sink};
use crate::error::EngineError;
use crate::evaluation::{JitOptions, OnlineSort};
use crate::planner::join_indexes::{IndexCache, JoinIndexes};
use crate::planner::sort_order::{presort_select, presort_select_worst, rank_for, SortOrder};
use datalog_syntax::{Atom, Rule};
use indexmap::{IndexMap, IndexSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Loop exit condition of a `DoWhile` node, checked after each pass over
/// the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationTest {
    /// Every known-generation delta is empty.
    DeltaEmpty,
    /// The derived database did not grow during the pass.
    FixpointReached,
}

/// One relational operator. Value nodes produce a relation; statement
/// nodes mutate storage and produce nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Node {
    Scan {
        symbol: String,
        db: Db,
    },
    /// Multi-way join over `inputs` per `jidx`. Carries the head and body
    /// atoms plus the delta slot so an executor can re-plan the order
    /// right before running it.
    ProjectJoinFilter {
        head: Atom,
        body: Vec<Atom>,
        jidx: Arc<JoinIndexes>,
        inputs: Vec<Node>,
        delta_idx: Option<usize>,
    },
    Union {
        inputs: Vec<Node>,
    },
    Diff {
        left: Box<Node>,
        right: Box<Node>,
    },
    /// Complement of the negated atom at `atom_idx` over the universe
    /// recorded in `jidx.negation_info`.
    Complement {
        symbol: String,
        atom_idx: usize,
        jidx: Arc<JoinIndexes>,
    },
    /// Group-by-aggregate of the grouping atom at `atom_idx` per
    /// `jidx.grouping_indexes`.
    Group {
        input: Box<Node>,
        atom_idx: usize,
        jidx: Arc<JoinIndexes>,
    },
    Insert {
        symbol: String,
        sink: Sink,
        value: Box<Node>,
    },
    SwapAndClear,
    Sequence {
        nodes: Vec<Node>,
    },
    DoWhile {
        test: TerminationTest,
        body: Box<Node>,
    },
    Init,
    Freeze {
        relations: Vec<String>,
    },
}

impl Node {
    /// Content hash for specialization caching.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn scan(symbol: &str, db: Db) -> Node {
        Node::Scan {
            symbol: symbol.to_string(),
            db,
        }
    }
}

/// Body slots eligible to read the delta: positive, non-grouping atoms.
/// Negated and grouping atoms read stabilized lower strata, whose deltas
/// are empty by the time this stratum runs.
pub fn delta_slots(rule: &Rule) -> Vec<usize> {
    rule.body
        .iter()
        .enumerate()
        .filter(|(_, atom)| atom.sign && !atom.is_grouping())
        .map(|(index, _)| index)
        .collect()
}

/// The join input for one body atom: a generation scan, a complement, or a
/// grouped scan.
pub fn atom_input(
    atom: &Atom,
    atom_idx: usize,
    jidx: &Arc<JoinIndexes>,
    delta_idx: Option<usize>,
) -> Node {
    if atom.is_grouping() {
        let inner = &atom.agg.as_ref().unwrap().inner;
        Node::Group {
            input: Box::new(Node::scan(&inner.symbol, Db::Known)),
            atom_idx,
            jidx: jidx.clone(),
        }
    } else if !atom.sign {
        Node::Complement {
            symbol: atom.symbol.clone(),
            atom_idx,
            jidx: jidx.clone(),
        }
    } else {
        let db = if Some(atom_idx) == delta_idx {
            Db::Delta
        } else {
            Db::Known
        };
        Node::scan(&atom.symbol, db)
    }
}

/// One semi-naive variant of a rule: the body atom at `delta_idx` reads
/// the delta generation, every other positive slot reads known. When
/// offline ordering is configured, the body is permuted here and the
/// permutation's own join indexes are compiled.
pub fn rule_variant(
    rule: &Rule,
    delta_idx: Option<usize>,
    cache: &mut IndexCache,
    options: &JitOptions,
    relation_size: &dyn Fn(&str) -> usize,
) -> Result<Node, EngineError> {
    let offline = options.sort_order.reorders() && options.online_sort == OnlineSort::Off;

    let (body, jidx, delta_idx) = if offline {
        let base = cache.get_or_compile(rule)?;
        let rank = rank_for(options.sort_order, relation_size);
        let (order, new_delta) = if options.sort_order == SortOrder::Worst {
            presort_select_worst(&rule.body, delta_idx, &rank, &base.cxns)
        } else {
            presort_select(&rule.body, delta_idx, &rank, &base.cxns)
        };

        let body: Vec<Atom> = order.iter().map(|&i| rule.body[i].clone()).collect();
        let permuted = Rule {
            head: rule.head.clone(),
            body: body.clone(),
            id: rule.id,
        };
        (body, cache.get_or_compile(&permuted)?, new_delta)
    } else {
        (rule.body.clone(), cache.get_or_compile(rule)?, delta_idx)
    };

    let inputs = body
        .iter()
        .enumerate()
        .map(|(index, atom)| atom_input(atom, index, &jidx, delta_idx))
        .collect();

    Ok(Node::ProjectJoinFilter {
        head: rule.head.clone(),
        body,
        jidx,
        inputs,
        delta_idx,
    })
}

/// Builds the full program tree for one solve:
///
/// ```text
/// Sequence(
///   Init,
///   per stratum: Sequence(
///     Insert(R, delta-known := scan R)          for each read relation,
///     DoWhile(DeltaEmpty, Sequence(
///       per head H:
///         Insert(H, new       := known ∪ variants),
///         Insert(H, delta-new := new \ known),
///       SwapAndClear)),
///     Freeze(heads)))
/// ```
pub fn build_program_tree(
    strata: &[Vec<Rule>],
    cache: &mut IndexCache,
    options: &JitOptions,
    relation_size: &dyn Fn(&str) -> usize,
) -> Result<Node, EngineError> {
    let mut top = vec![Node::Init];

    for stratum in strata {
        let mut seed_symbols: IndexSet<String> = IndexSet::new();
        for rule in stratum {
            for atom in &rule.body {
                if atom.sign && !atom.is_grouping() {
                    seed_symbols.insert(atom.symbol.clone());
                }
            }
        }

        let mut nodes: Vec<Node> = seed_symbols
            .iter()
            .map(|symbol| Node::Insert {
                symbol: symbol.clone(),
                sink: Sink::DeltaKnown,
                value: Box::new(Node::scan(symbol, Db::Known)),
            })
            .collect();

        let mut rules_per_head: IndexMap<String, Vec<&Rule>> = IndexMap::new();
        for rule in stratum {
            rules_per_head
                .entry(rule.head.symbol.clone())
                .or_default()
                .push(rule);
        }

        let mut updates = Vec::new();
        for (head_symbol, rules) in &rules_per_head {
            let mut union_inputs = vec![Node::scan(head_symbol, Db::Known)];
            for rule in rules {
                let slots = delta_slots(rule);
                if slots.is_empty() {
                    union_inputs.push(rule_variant(rule, None, cache, options, relation_size)?);
                } else {
                    for slot in slots {
                        union_inputs.push(rule_variant(
                            rule,
                            Some(slot),
                            cache,
                            options,
                            relation_size,
                        )?);
                    }
                }
            }

            updates.push(Node::Insert {
                symbol: head_symbol.clone(),
                sink: Sink::New,
                value: Box::new(Node::Union {
                    inputs: union_inputs,
                }),
            });
            updates.push(Node::Insert {
                symbol: head_symbol.clone(),
                sink: Sink::DeltaNew,
                value: Box::new(Node::Diff {
                    left: Box::new(Node::scan(head_symbol, Db::New)),
                    right: Box::new(Node::scan(head_symbol, Db::Known)),
                }),
            });
        }
        updates.push(Node::SwapAndClear);

        nodes.push(Node::DoWhile {
            test: TerminationTest::DeltaEmpty,
            body: Box::new(Node::Sequence { nodes: updates }),
        });
        nodes.push(Node::Freeze {
            relations: rules_per_head.keys().cloned().collect(),
        });

        top.push(Node::Sequence { nodes });
    }

    Ok(Node::Sequence { nodes: top })
}
