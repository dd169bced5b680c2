use crate::engine::storage::{Relation, StorageManager};
use crate::evaluation::ir::{Node, TerminationTest};
use crate::evaluation::{EvalContext, Granularity};
use ahash::HashMap;
use std::rc::Rc;

/// A specialized value subtree: all node-kind dispatch and join-index
/// interpretation happened at specialization time, the closure only holds
/// the constants it needs and a read-only view of storage.
pub type ValueFn = Rc<dyn Fn(&StorageManager) -> Relation>;

/// A specialized statement subtree.
pub type StmtFn = Rc<dyn Fn(&mut StorageManager)>;

/// Specialization is pure in the subtree, so compiled subtrees are reused
/// across solves. Which roots land here is the granularity knob: the whole
/// program, each per-relation update, or every node.
#[derive(Default)]
pub struct SpecializationCache {
    values: HashMap<u64, ValueFn>,
    stmts: HashMap<u64, StmtFn>,
}

impl SpecializationCache {
    pub fn len(&self) -> usize {
        self.values.len() + self.stmts.len()
    }
}

/// The runnable form of one program tree.
pub struct CompiledProgram {
    root: StmtFn,
}

impl CompiledProgram {
    pub fn run(&self, storage: &mut StorageManager) {
        (self.root)(storage)
    }
}

/// Partially evaluates a program tree into a callable. Results are
/// byte-identical to interpreting the same tree.
pub fn specialize(
    tree: &Node,
    ctx: &EvalContext,
    cache: &mut SpecializationCache,
) -> CompiledProgram {
    let root = specialize_stmt(tree, ctx.options.granularity, cache, true);
    CompiledProgram { root }
}

fn stmt_is_cache_root(node: &Node, granularity: Granularity, is_root: bool) -> bool {
    match granularity {
        Granularity::Program => is_root,
        Granularity::Rule => is_root || matches!(node, Node::Insert { .. }),
        Granularity::Atom => true,
    }
}

fn specialize_stmt(
    node: &Node,
    granularity: Granularity,
    cache: &mut SpecializationCache,
    is_root: bool,
) -> StmtFn {
    let cacheable = stmt_is_cache_root(node, granularity, is_root);
    let key = node.stable_hash();
    if cacheable {
        if let Some(hit) = cache.stmts.get(&key) {
            tracing::trace!(key, "specialization cache hit");
            return hit.clone();
        }
    }

    let compiled: StmtFn = match node {
        Node::Init => Rc::new(|storage| storage.init_evaluation()),
        Node::SwapAndClear => Rc::new(|storage| storage.swap_and_clear()),
        Node::Freeze { relations } => {
            let relations = relations.clone();
            Rc::new(move |storage| storage.freeze(&relations))
        }
        Node::Sequence { nodes } => {
            let children: Vec<StmtFn> = nodes
                .iter()
                .map(|child| specialize_stmt(child, granularity, cache, false))
                .collect();
            Rc::new(move |storage| {
                for child in &children {
                    child(storage);
                }
            })
        }
        Node::Insert {
            symbol,
            sink,
            value,
        } => {
            let symbol = symbol.clone();
            let sink = *sink;
            let value = specialize_value(value, granularity, cache);
            Rc::new(move |storage| {
                let relation = value(storage);
                storage.reset(sink, &symbol, relation);
            })
        }
        Node::DoWhile { test, body } => {
            let test = *test;
            let body = specialize_stmt(body, granularity, cache, false);
            Rc::new(move |storage| loop {
                let before = storage.total_derived_len();
                body(storage);
                let done = match test {
                    TerminationTest::DeltaEmpty => storage.delta_known_empty(),
                    TerminationTest::FixpointReached => storage.total_derived_len() == before,
                };
                if done {
                    break;
                }
            })
        }
        value_node => {
            let value = specialize_value(value_node, granularity, cache);
            Rc::new(move |storage| {
                value(storage);
            })
        }
    };

    if cacheable {
        cache.stmts.insert(key, compiled.clone());
    }
    compiled
}

fn specialize_value(
    node: &Node,
    granularity: Granularity,
    cache: &mut SpecializationCache,
) -> ValueFn {
    let cacheable = granularity == Granularity::Atom;
    let key = node.stable_hash();
    if cacheable {
        if let Some(hit) = cache.values.get(&key) {
            return hit.clone();
        }
    }

    let compiled: ValueFn = match node {
        Node::Scan { symbol, db } => {
            let symbol = symbol.clone();
            let db = *db;
            Rc::new(move |storage| storage.scan(&symbol, db))
        }
        Node::Union { inputs } => {
            let children: Vec<ValueFn> = inputs
                .iter()
                .map(|child| specialize_value(child, granularity, cache))
                .collect();
            Rc::new(move |storage| {
                let parts: Vec<Relation> = children.iter().map(|child| child(storage)).collect();
                storage.union(parts)
            })
        }
        Node::Diff { left, right } => {
            let left = specialize_value(left, granularity, cache);
            let right = specialize_value(right, granularity, cache);
            Rc::new(move |storage| {
                let left = left(storage);
                let right = right(storage);
                storage.diff(left, &right)
            })
        }
        Node::Complement {
            symbol,
            atom_idx,
            jidx,
        } => {
            // The universe lookup is resolved here, once.
            let symbol = symbol.clone();
            let universes = jidx.negation_info[atom_idx].clone();
            Rc::new(move |storage| storage.complement(&symbol, &universes))
        }
        Node::Group {
            input,
            atom_idx,
            jidx,
        } => {
            let gidx = jidx.grouping_indexes[atom_idx].clone();
            let input = specialize_value(input, granularity, cache);
            Rc::new(move |storage| {
                let relation = input(storage);
                storage.group_by_aggregate(&relation, &gidx)
            })
        }
        Node::ProjectJoinFilter { jidx, inputs, .. } => {
            let jidx = jidx.clone();
            let children: Vec<ValueFn> = inputs
                .iter()
                .map(|child| specialize_value(child, granularity, cache))
                .collect();
            Rc::new(move |storage| {
                let relations: Vec<Relation> =
                    children.iter().map(|child| child(storage)).collect();
                storage.project_join_filter(&relations, &jidx)
            })
        }
        statement => unreachable!("statement node in value position: {:?}", statement),
    };

    if cacheable {
        cache.values.insert(key, compiled.clone());
    }
    compiled
}
