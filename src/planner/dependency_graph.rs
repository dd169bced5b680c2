use crate::error::EngineError;
use crate::planner::join_indexes::EdgeKind;
use ahash::{HashMap, HashMapExt};
use datalog_syntax::{Program, Rule};
use indexmap::IndexMap;
use petgraph::algo;
use petgraph::graphmap::DiGraphMap;

type RelationGraph = DiGraphMap<usize, EdgeKind>;

/// Builds the relation-level dependency graph of a program: one node per
/// relation, one edge per body occurrence pointing at the head relation,
/// labeled positive, negated or grouping. Parallel occurrences collapse to
/// the most restrictive kind.
fn relation_graph(program: &Program, interner: &mut IndexMap<String, usize>) -> RelationGraph {
    let mut intern = |symbol: &str, interner: &mut IndexMap<String, usize>| -> usize {
        let next = interner.len();
        *interner.entry(symbol.to_string()).or_insert(next)
    };

    let mut graph = DiGraphMap::new();
    for rule in &program.inner {
        let head = intern(&rule.head.symbol, interner);
        graph.add_node(head);

        for atom in &rule.body {
            let kind = if atom.is_grouping() {
                EdgeKind::Grouping
            } else if !atom.sign {
                EdgeKind::Negated
            } else {
                EdgeKind::Positive
            };
            let body = intern(&atom.symbol, interner);
            graph.add_node(body);

            match graph.edge_weight(body, head) {
                Some(EdgeKind::Positive) | None => {
                    graph.add_edge(body, head, kind);
                }
                Some(_) => {}
            }
        }
    }

    graph
}

/// Splits a program into strata: groups of rules evaluated to fixpoint in
/// order, such that every negated or grouping dependency points at an
/// earlier stratum. A negated or grouping edge inside a strongly connected
/// component is unstratifiable and rejected.
pub fn stratify(program: &Program) -> Result<Vec<Vec<Rule>>, EngineError> {
    let mut interner: IndexMap<String, usize> = IndexMap::new();
    let graph = relation_graph(program, &mut interner);

    let sccs = algo::kosaraju_scc(&graph);

    let mut component_of: HashMap<usize, usize> = HashMap::new();
    for (component, members) in sccs.iter().enumerate() {
        for &node in members {
            component_of.insert(node, component);
        }
    }

    for (from, to, kind) in graph.all_edges() {
        if *kind != EdgeKind::Positive && component_of[&from] == component_of[&to] {
            let (relation, _) = interner.get_index(to).unwrap();
            return Err(EngineError::UnstratifiableNegationOrAggregation {
                relation: relation.clone(),
            });
        }
    }

    // Kosaraju yields components in reverse topological order; evaluation
    // wants dependencies first.
    let mut strata = Vec::new();
    for members in sccs.iter().rev() {
        let stratum: Vec<Rule> = program
            .inner
            .iter()
            .filter(|rule| {
                let head = interner[&rule.head.symbol];
                members.contains(&head)
            })
            .cloned()
            .collect();
        if !stratum.is_empty() {
            strata.push(stratum);
        }
    }

    Ok(strata)
}
