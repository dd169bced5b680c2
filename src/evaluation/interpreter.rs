use crate::engine::storage::{Relation, StorageManager};
use crate::error::EngineError;
use crate::evaluation::ir::{atom_input, Node, TerminationTest};
use crate::evaluation::{JitOptions, OnlineSort};
use crate::planner::join_indexes::{IndexCache, JoinIndexes};
use crate::planner::sort_order::{presort_select, presort_select_worst, rank_for, SortOrder};
use ahash::{HashMap, HashMapExt};
use datalog_syntax::{Atom, Rule};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Tree-walking executor. Value nodes evaluate to an in-memory relation
/// that the parent consumes; statement nodes write into storage. With
/// online sorting enabled, join nodes are re-planned against live relation
/// sizes right before they run.
pub struct Interpreter<'a> {
    storage: &'a mut StorageManager,
    cache: &'a mut IndexCache,
    options: JitOptions,
    replanned: HashMap<(u64, Option<usize>), Node>,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        storage: &'a mut StorageManager,
        cache: &'a mut IndexCache,
        options: JitOptions,
    ) -> Self {
        Self {
            storage,
            cache,
            options,
            replanned: HashMap::new(),
        }
    }

    pub fn run(&mut self, node: &Node) -> Result<(), EngineError> {
        self.execute(node)
    }

    fn execute(&mut self, node: &Node) -> Result<(), EngineError> {
        match node {
            Node::Init => {
                self.storage.init_evaluation();
                Ok(())
            }
            Node::Freeze { relations } => {
                self.storage.freeze(relations);
                Ok(())
            }
            Node::SwapAndClear => {
                self.storage.swap_and_clear();
                Ok(())
            }
            Node::Sequence { nodes } => {
                for child in nodes {
                    self.execute(child)?;
                }
                Ok(())
            }
            Node::Insert {
                symbol,
                sink,
                value,
            } => {
                let relation = self.evaluate(value)?;
                self.storage.reset(*sink, symbol, relation);
                Ok(())
            }
            Node::DoWhile { test, body } => {
                loop {
                    let before = self.storage.total_derived_len();
                    self.execute(body)?;
                    let done = match test {
                        TerminationTest::DeltaEmpty => self.storage.delta_known_empty(),
                        TerminationTest::FixpointReached => {
                            self.storage.total_derived_len() == before
                        }
                    };
                    tracing::trace!(
                        iteration = self.storage.iteration(),
                        derived = self.storage.total_derived_len(),
                        done,
                        "fixpoint step"
                    );
                    if done {
                        break;
                    }
                }
                Ok(())
            }
            value_node => {
                self.evaluate(value_node)?;
                Ok(())
            }
        }
    }

    fn evaluate(&mut self, node: &Node) -> Result<Relation, EngineError> {
        match node {
            Node::Scan { symbol, db } => Ok(self.storage.scan(symbol, *db)),
            Node::Union { inputs } => {
                let mut parts = Vec::with_capacity(inputs.len());
                for input in inputs {
                    parts.push(self.evaluate(input)?);
                }
                Ok(self.storage.union(parts))
            }
            Node::Diff { left, right } => {
                let left = self.evaluate(left)?;
                let right = self.evaluate(right)?;
                Ok(self.storage.diff(left, &right))
            }
            Node::Complement {
                symbol,
                atom_idx,
                jidx,
            } => Ok(self
                .storage
                .complement(symbol, &jidx.negation_info[atom_idx])),
            Node::Group {
                input,
                atom_idx,
                jidx,
            } => {
                let relation = self.evaluate(input)?;
                Ok(self
                    .storage
                    .group_by_aggregate(&relation, &jidx.grouping_indexes[atom_idx]))
            }
            Node::ProjectJoinFilter {
                head,
                body,
                jidx,
                inputs,
                delta_idx,
            } => {
                if self.options.online_sort != OnlineSort::Off && self.options.sort_order.reorders()
                {
                    let replanned = self.replan(head, body, *delta_idx)?;
                    let Node::ProjectJoinFilter { jidx, inputs, .. } = &replanned else {
                        unreachable!()
                    };
                    let (jidx, inputs) = (jidx.clone(), inputs.clone());
                    return self.run_join(&jidx, &inputs);
                }
                self.run_join(jidx, inputs)
            }
            statement => {
                self.execute(statement)?;
                Ok(Vec::new())
            }
        }
    }

    fn run_join(
        &mut self,
        jidx: &Arc<JoinIndexes>,
        inputs: &[Node],
    ) -> Result<Relation, EngineError> {
        let mut relations = Vec::with_capacity(inputs.len());
        for input in inputs {
            relations.push(self.evaluate(input)?);
        }
        Ok(self.storage.project_join_filter(&relations, jidx))
    }

    /// Rebuilds a join node with a body order picked against current
    /// relation sizes. `PerRule` memoizes per (rule, delta slot) for the
    /// rest of the solve; `PerStep` re-plans on every execution.
    fn replan(
        &mut self,
        head: &Atom,
        body: &[Atom],
        delta_idx: Option<usize>,
    ) -> Result<Node, EngineError> {
        let key = (plan_key(head, body), delta_idx);
        if self.options.online_sort == OnlineSort::PerRule {
            if let Some(hit) = self.replanned.get(&key) {
                return Ok(hit.clone());
            }
        }

        let sizes: HashMap<String, usize> = body
            .iter()
            .map(|atom| {
                (
                    atom.symbol.clone(),
                    self.storage.relation_size(&atom.symbol),
                )
            })
            .collect();
        let rank = rank_for(self.options.sort_order, move |symbol: &str| {
            sizes.get(symbol).copied().unwrap_or(0)
        });

        let base = self.cache.get_or_compile(&Rule {
            head: head.clone(),
            body: body.to_vec(),
            id: 0,
        })?;
        let (order, new_delta) = if self.options.sort_order == SortOrder::Worst {
            presort_select_worst(body, delta_idx, &rank, &base.cxns)
        } else {
            presort_select(body, delta_idx, &rank, &base.cxns)
        };

        let permuted_body: Vec<Atom> = order.iter().map(|&i| body[i].clone()).collect();
        let permuted = Rule {
            head: head.clone(),
            body: permuted_body.clone(),
            id: 0,
        };
        let jidx = self.cache.get_or_compile(&permuted)?;

        let inputs = permuted_body
            .iter()
            .enumerate()
            .map(|(index, atom)| atom_input(atom, index, &jidx, new_delta))
            .collect();

        let node = Node::ProjectJoinFilter {
            head: head.clone(),
            body: permuted_body,
            jidx,
            inputs,
            delta_idx: new_delta,
        };

        if self.options.online_sort == OnlineSort::PerRule {
            self.replanned.insert(key, node.clone());
        }
        Ok(node)
    }
}

fn plan_key(head: &Atom, body: &[Atom]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    head.stable_hash().hash(&mut hasher);
    for atom in body {
        atom.stable_hash().hash(&mut hasher);
    }
    hasher.finish()
}
