use crate::planner::join_indexes::{
    AggSource, ColumnUniverse, GroupingIndexes, JoinIndexes, ProjectionInput,
};
use ahash::HashMap;
use datalog_syntax::{AggregateOp, AnonymousGroundAtom, TypedValue};
use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;

pub type FactStorage = IndexSet<Arc<AnonymousGroundAtom>, ahash::RandomState>;

/// An intermediate relation value: ordered, duplicates allowed. Union is
/// the deduplication boundary.
pub type Relation = Vec<Arc<AnonymousGroundAtom>>;

/// Which database a scan reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Db {
    Edb,
    Known,
    New,
    Delta,
}

/// Which database an insert writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sink {
    Known,
    New,
    DeltaKnown,
    DeltaNew,
}

#[derive(Default)]
pub struct RelationStorage {
    pub(crate) inner: HashMap<String, FactStorage>,
}

impl RelationStorage {
    pub fn get_relation(&self, relation_symbol: &str) -> Option<&FactStorage> {
        self.inner.get(relation_symbol)
    }
    pub fn insert(&mut self, relation_symbol: &str, ground_atom: AnonymousGroundAtom) -> bool {
        if let Some(relation) = self.inner.get_mut(relation_symbol) {
            return relation.insert(Arc::new(ground_atom));
        }

        let mut fresh_fact_storage = FactStorage::default();
        fresh_fact_storage.insert(Arc::new(ground_atom));

        self.inner
            .insert(relation_symbol.to_string(), fresh_fact_storage);

        true
    }
    pub fn insert_all(
        &mut self,
        relation_symbol: &str,
        facts: impl Iterator<Item = Arc<AnonymousGroundAtom>>,
    ) {
        if let Some(relation) = self.inner.get_mut(relation_symbol) {
            relation.extend(facts);
        } else {
            let mut fresh_fact_storage = FactStorage::default();
            fresh_fact_storage.extend(facts);

            self.inner
                .insert(relation_symbol.to_string(), fresh_fact_storage);
        }
    }
    pub fn reset(&mut self, relation_symbol: &str, facts: FactStorage) {
        self.inner.insert(relation_symbol.to_string(), facts);
    }
    pub fn contains(&self, relation_symbol: &str, ground_atom: &AnonymousGroundAtom) -> bool {
        if let Some(relation) = self.inner.get(relation_symbol) {
            return relation.contains(ground_atom);
        }

        false
    }
    pub fn clear(&mut self) {
        self.inner.clear();
    }
    pub fn len(&self) -> usize {
        self.inner.values().map(|facts| facts.len()).sum()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns every relation the engine touches: the asserted EDBs, two derived
/// and two delta generations selected by a swapping generation id, and the
/// frozen store holding stabilized strata. Contents are never copied at a
/// generation swap, only the id moves.
pub struct StorageManager {
    pub(crate) edbs: RelationStorage,
    derived: [RelationStorage; 2],
    deltas: [RelationStorage; 2],
    frozen: RelationStorage,
    known: usize,
    iteration: usize,
}

impl Default for StorageManager {
    fn default() -> Self {
        Self {
            edbs: RelationStorage::default(),
            derived: [RelationStorage::default(), RelationStorage::default()],
            deltas: [RelationStorage::default(), RelationStorage::default()],
            frozen: RelationStorage::default(),
            known: 0,
            iteration: 0,
        }
    }
}

impl StorageManager {
    pub fn declare(&mut self, relation_symbol: &str) {
        self.edbs
            .inner
            .entry(relation_symbol.to_string())
            .or_default();
    }

    pub fn insert_edb(&mut self, relation_symbol: &str, fact: AnonymousGroundAtom) -> bool {
        self.edbs.insert(relation_symbol, fact)
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    fn new_id(&self) -> usize {
        1 - self.known
    }

    /// Read one generation of one relation. Derived reads fall back on key
    /// absence, never on emptiness: generation, then frozen, then EDB.
    pub fn scan(&self, relation_symbol: &str, db: Db) -> Relation {
        let storage = match db {
            Db::Edb => self.edbs.get_relation(relation_symbol),
            Db::Known => self.derived[self.known]
                .get_relation(relation_symbol)
                .or_else(|| self.frozen.get_relation(relation_symbol))
                .or_else(|| self.edbs.get_relation(relation_symbol)),
            Db::New => self.derived[self.new_id()]
                .get_relation(relation_symbol)
                .or_else(|| self.frozen.get_relation(relation_symbol))
                .or_else(|| self.edbs.get_relation(relation_symbol)),
            Db::Delta => self.deltas[self.known].get_relation(relation_symbol),
        };

        storage
            .map(|facts| facts.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Write a relation value into one generation, replacing the previous
    /// value for that symbol. Duplicates are suppressed here.
    pub fn reset(&mut self, sink: Sink, relation_symbol: &str, relation: Relation) {
        let facts: FactStorage = relation.into_iter().collect();
        let target = match sink {
            Sink::Known => &mut self.derived[self.known],
            Sink::New => &mut self.derived[1 - self.known],
            Sink::DeltaKnown => &mut self.deltas[self.known],
            Sink::DeltaNew => &mut self.deltas[1 - self.known],
        };
        target.reset(relation_symbol, facts);
    }

    pub fn swap_knowledge(&mut self) {
        self.known = 1 - self.known;
        self.iteration += 1;
    }

    /// Iteration boundary: swap the generation ids and clear what is now
    /// the new side so the next step starts from a clean write buffer.
    pub fn swap_and_clear(&mut self) {
        self.swap_knowledge();
        let new = self.new_id();
        self.derived[new].clear();
        self.deltas[new].clear();
    }

    pub fn delta_known_empty(&self) -> bool {
        self.deltas[self.known].is_empty()
    }

    pub fn delta_new_empty(&self) -> bool {
        self.deltas[self.new_id()].is_empty()
    }

    /// Element-equality of the two derived generations.
    pub fn fixpoint_reached(&self) -> bool {
        let keys: IndexSet<&String> = self.derived[0]
            .inner
            .keys()
            .chain(self.derived[1].inner.keys())
            .collect();

        keys.into_iter().all(|symbol| {
            let empty = FactStorage::default();
            let left = self.derived[0].get_relation(symbol).unwrap_or(&empty);
            let right = self.derived[1].get_relation(symbol).unwrap_or(&empty);
            left == right
        })
    }

    pub fn total_derived_len(&self) -> usize {
        self.derived[self.known].len()
    }

    /// Current visible size of a relation; the only statistic the
    /// reordering heuristics consult besides arity.
    pub fn relation_size(&self, relation_symbol: &str) -> usize {
        self.derived[self.known]
            .get_relation(relation_symbol)
            .or_else(|| self.frozen.get_relation(relation_symbol))
            .or_else(|| self.edbs.get_relation(relation_symbol))
            .map(|facts| facts.len())
            .unwrap_or(0)
    }

    /// Per-solve reset. EDBs persist; everything derived goes.
    pub fn init_evaluation(&mut self) {
        self.derived[0].clear();
        self.derived[1].clear();
        self.deltas[0].clear();
        self.deltas[1].clear();
        self.frozen.clear();
        self.known = 0;
        self.iteration = 0;
    }

    /// Stratum boundary: move the stabilized contents of `symbols` into the
    /// frozen store and drop all generation state, so the next stratum
    /// reads them the way it reads EDBs.
    pub fn freeze(&mut self, symbols: &[String]) {
        for symbol in symbols {
            let facts = self.scan(symbol, Db::Known);
            self.frozen.insert_all(symbol, facts.into_iter());
        }
        self.derived[0].clear();
        self.derived[1].clear();
        self.deltas[0].clear();
        self.deltas[1].clear();
    }

    /// Ordered multiset union with duplicate elimination.
    pub fn union(&self, parts: impl IntoIterator<Item = Relation>) -> Relation {
        let mut seen = FactStorage::default();
        for part in parts {
            seen.extend(part);
        }
        seen.into_iter().collect()
    }

    /// Tuples of `left` not in `right`, left order preserved.
    pub fn diff(&self, left: Relation, right: &Relation) -> Relation {
        let exclusions: FactStorage = right.iter().cloned().collect();
        left.into_iter()
            .filter(|fact| !exclusions.contains(fact.as_ref()))
            .collect()
    }

    /// Multi-way equi-join, filter and projection in one nested scan over
    /// `inputs`. A cross-product row survives iff every equality group is
    /// single-valued and every pinned column matches; the emitted tuple
    /// follows the head projection. Duplicates are kept.
    pub fn project_join_filter(&self, inputs: &[Relation], jidx: &JoinIndexes) -> Relation {
        let levels = inputs.len();
        let mut level_end = Vec::with_capacity(levels);
        for level in 0..levels {
            let end = if level + 1 < levels {
                jidx.offsets[level + 1]
            } else {
                jidx.width
            };
            level_end.push(end);
        }

        // Each constraint is checked at the first level where all of its
        // columns are bound, so failing branches are cut early.
        let mut consts_by_level: Vec<Vec<(usize, &TypedValue)>> = vec![vec![]; levels];
        for (&position, value) in &jidx.const_indexes {
            let level = level_end.iter().position(|&end| position < end).unwrap();
            consts_by_level[level].push((position, value));
        }
        let mut groups_by_level: Vec<Vec<&Vec<usize>>> = vec![vec![]; levels];
        for group in &jidx.var_indexes {
            let last = *group.iter().max().unwrap();
            let level = level_end.iter().position(|&end| last < end).unwrap();
            groups_by_level[level].push(group);
        }

        let mut out = Vec::new();
        let mut flat: Vec<&TypedValue> = Vec::with_capacity(jidx.width);
        scan_level(
            inputs,
            0,
            &mut flat,
            &consts_by_level,
            &groups_by_level,
            &jidx.proj_indexes,
            &mut out,
        );
        out
    }

    /// Complement of a negated relation over the universe its columns
    /// infer from the positive context.
    pub fn complement(&self, relation_symbol: &str, universes: &[ColumnUniverse]) -> Relation {
        let existing: FactStorage = self.scan(relation_symbol, Db::Known).into_iter().collect();

        let domains: Vec<Vec<TypedValue>> = universes
            .iter()
            .map(|universe| match universe {
                ColumnUniverse::Constant(value) => vec![value.clone()],
                ColumnUniverse::Occurrences(slots) => {
                    let mut values: IndexSet<TypedValue> = IndexSet::new();
                    for (symbol, column) in slots {
                        for row in self.scan(symbol, Db::Known) {
                            values.insert(row[*column].clone());
                        }
                    }
                    values.into_iter().collect()
                }
                ColumnUniverse::Domain => self.active_domain(),
            })
            .collect();

        let mut out = Vec::new();
        let mut candidate: AnonymousGroundAtom = Vec::with_capacity(domains.len());
        cartesian(&domains, 0, &mut candidate, &existing, &mut out);
        out
    }

    /// Every constant currently visible in any relation.
    fn active_domain(&self) -> Vec<TypedValue> {
        let mut values: IndexSet<TypedValue> = IndexSet::new();
        for storage in [
            &self.edbs,
            &self.frozen,
            &self.derived[self.known],
            &self.derived[1 - self.known],
        ] {
            for facts in storage.inner.values() {
                for fact in facts {
                    values.extend(fact.iter().cloned());
                }
            }
        }
        values.into_iter().collect()
    }

    /// Partitions `input` by its group-by columns (first-seen key order)
    /// and emits the key followed by the aggregated values.
    pub fn group_by_aggregate(&self, input: &Relation, gidx: &GroupingIndexes) -> Relation {
        let mut groups: IndexMap<AnonymousGroundAtom, Vec<Arc<AnonymousGroundAtom>>> =
            IndexMap::new();

        'rows: for row in input {
            for (column, expected) in &gidx.const_indexes {
                if row[*column] != *expected {
                    continue 'rows;
                }
            }
            for group in &gidx.var_indexes {
                let first = &row[group[0]];
                if group.iter().any(|&column| row[column] != *first) {
                    continue 'rows;
                }
            }

            let key: AnonymousGroundAtom = gidx
                .group_by
                .iter()
                .map(|&column| row[column].clone())
                .collect();
            groups.entry(key).or_default().push(row.clone());
        }

        let mut out = Vec::with_capacity(groups.len());
        for (key, rows) in groups {
            let mut tuple = key.clone();
            for (op, source) in &gidx.agg_sources {
                let values = rows.iter().map(|row| match source {
                    AggSource::Group(index) => key[*index].clone(),
                    AggSource::Local(column) => row[*column].clone(),
                    AggSource::Constant(value) => value.clone(),
                });
                let aggregated = match op {
                    AggregateOp::Count => TypedValue::Int(rows.len()),
                    AggregateOp::Sum => TypedValue::Int(
                        values
                            .filter_map(|value| match value {
                                TypedValue::Int(x) => Some(x),
                                _ => None,
                            })
                            .sum(),
                    ),
                    AggregateOp::Min => values.min().unwrap(),
                    AggregateOp::Max => values.max().unwrap(),
                };
                tuple.push(aggregated);
            }
            out.push(Arc::new(tuple));
        }
        out
    }
}

fn scan_level<'a>(
    inputs: &'a [Relation],
    level: usize,
    flat: &mut Vec<&'a TypedValue>,
    consts_by_level: &[Vec<(usize, &TypedValue)>],
    groups_by_level: &[Vec<&Vec<usize>>],
    proj_indexes: &[ProjectionInput],
    out: &mut Vec<Arc<AnonymousGroundAtom>>,
) {
    if level == inputs.len() {
        let tuple: AnonymousGroundAtom = proj_indexes
            .iter()
            .map(|input| match input {
                ProjectionInput::Column(column) => flat[*column].clone(),
                ProjectionInput::Value(value) => value.clone(),
            })
            .collect();
        out.push(Arc::new(tuple));
        return;
    }

    for row in &inputs[level] {
        let base = flat.len();
        flat.extend(row.iter());

        let constants_hold = consts_by_level[level]
            .iter()
            .all(|(position, expected)| flat[*position] == *expected);
        let equalities_hold = constants_hold
            && groups_by_level[level].iter().all(|group| {
                let first = flat[group[0]];
                group.iter().all(|&position| flat[position] == first)
            });

        if equalities_hold {
            scan_level(
                inputs,
                level + 1,
                flat,
                consts_by_level,
                groups_by_level,
                proj_indexes,
                out,
            );
        }
        flat.truncate(base);
    }
}

fn cartesian(
    domains: &[Vec<TypedValue>],
    column: usize,
    candidate: &mut AnonymousGroundAtom,
    existing: &FactStorage,
    out: &mut Vec<Arc<AnonymousGroundAtom>>,
) {
    if column == domains.len() {
        if !existing.contains(candidate) {
            out.push(Arc::new(candidate.clone()));
        }
        return;
    }
    for value in &domains[column] {
        candidate.push(value.clone());
        cartesian(domains, column + 1, candidate, existing, out);
        candidate.pop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::planner::join_indexes::JoinIndexes;
    use datalog_rule_macro::rule;
    use datalog_syntax::*;
    use pretty_assertions::assert_eq;

    fn tuples(relation: &Relation) -> Vec<AnonymousGroundAtom> {
        relation.iter().map(|fact| (**fact).clone()).collect()
    }

    fn edge_storage() -> StorageManager {
        let mut storage = StorageManager::default();
        storage.insert_edb("e", vec!["a".into(), "b".into()]);
        storage.insert_edb("e", vec!["b".into(), "c".into()]);
        storage.insert_edb("e", vec!["c".into(), "d".into()]);
        storage
    }

    #[test]
    fn known_scan_falls_back_to_edb() {
        let storage = edge_storage();

        assert_eq!(storage.scan("e", Db::Known).len(), 3);
        assert_eq!(storage.scan("e", Db::Edb).len(), 3);
        assert!(storage.scan("e", Db::Delta).is_empty());
    }

    #[test]
    fn reset_shadows_the_edb_even_when_empty() {
        let mut storage = edge_storage();
        storage.reset(Sink::Known, "e", vec![]);

        assert!(storage.scan("e", Db::Known).is_empty());
        assert_eq!(storage.scan("e", Db::Edb).len(), 3);
    }

    #[test]
    fn swap_exchanges_generations() {
        let mut storage = StorageManager::default();
        storage.reset(Sink::New, "p", vec![Arc::new(vec![1usize.into()])]);
        assert!(storage.scan("p", Db::Known).is_empty());

        storage.swap_and_clear();

        assert_eq!(storage.scan("p", Db::Known).len(), 1);
        assert!(storage.scan("p", Db::New).is_empty());
        assert_eq!(storage.iteration(), 1);
    }

    #[test]
    fn delta_emptiness_follows_the_generation_id() {
        let mut storage = StorageManager::default();
        storage.reset(Sink::DeltaNew, "p", vec![Arc::new(vec![1usize.into()])]);

        assert!(storage.delta_known_empty());
        assert!(!storage.delta_new_empty());

        storage.swap_and_clear();

        assert!(!storage.delta_known_empty());
        assert!(storage.delta_new_empty());
    }

    #[test]
    fn union_deduplicates_preserving_first_occurrence() {
        let storage = StorageManager::default();
        let a: Relation = vec![Arc::new(vec![1usize.into()]), Arc::new(vec![2usize.into()])];
        let b: Relation = vec![Arc::new(vec![2usize.into()]), Arc::new(vec![3usize.into()])];

        let union = storage.union(vec![a, b]);

        assert_eq!(
            tuples(&union),
            vec![
                vec![TypedValue::Int(1)],
                vec![TypedValue::Int(2)],
                vec![TypedValue::Int(3)]
            ]
        );
    }

    #[test]
    fn diff_preserves_left_order() {
        let storage = StorageManager::default();
        let left: Relation = vec![
            Arc::new(vec![3usize.into()]),
            Arc::new(vec![1usize.into()]),
            Arc::new(vec![2usize.into()]),
        ];
        let right: Relation = vec![Arc::new(vec![1usize.into()])];

        let diff = storage.diff(left, &right);

        assert_eq!(
            tuples(&diff),
            vec![vec![TypedValue::Int(3)], vec![TypedValue::Int(2)]]
        );
    }

    #[test]
    fn join_filters_on_equality_groups() {
        let storage = edge_storage();
        let rule = rule! { hop(?x, ?z) <- [e(?x, ?y), e(?y, ?z)] };
        let jidx = JoinIndexes::compile(&rule).unwrap();

        let e = storage.scan("e", Db::Known);
        let hops = storage.project_join_filter(&[e.clone(), e], &jidx);

        assert_eq!(
            tuples(&hops),
            vec![
                vec!["a".into(), "c".into()],
                vec!["b".into(), "d".into()],
            ]
        );
    }

    #[test]
    fn join_honors_constant_pins() {
        let storage = edge_storage();
        let rule = rule! { from_a(?y) <- [e("a", ?y)] };
        let jidx = JoinIndexes::compile(&rule).unwrap();

        let e = storage.scan("e", Db::Known);
        let result = storage.project_join_filter(&[e], &jidx);

        assert_eq!(tuples(&result), vec![vec!["b".into()]]);
    }

    #[test]
    fn join_emits_duplicates_for_union_to_remove() {
        let mut storage = StorageManager::default();
        storage.insert_edb("p", vec![1usize.into(), "x".into()]);
        storage.insert_edb("p", vec![1usize.into(), "y".into()]);
        let rule = rule! { q(?a) <- [p(?a, _)] };
        let jidx = JoinIndexes::compile(&rule).unwrap();

        let p = storage.scan("p", Db::Known);
        let result = storage.project_join_filter(&[p], &jidx);

        assert_eq!(result.len(), 2);
        assert_eq!(storage.union(vec![result]).len(), 1);
    }

    #[test]
    fn complement_uses_positive_occurrences_as_universe() {
        let mut storage = StorageManager::default();
        storage.insert_edb("p", vec![1usize.into()]);
        storage.insert_edb("p", vec![2usize.into()]);
        storage.insert_edb("p", vec![3usize.into()]);
        storage.insert_edb("q", vec![2usize.into()]);

        let universes = vec![ColumnUniverse::Occurrences(vec![("p".to_string(), 0)])];
        let complement = storage.complement("q", &universes);

        assert_eq!(
            tuples(&complement),
            vec![vec![TypedValue::Int(1)], vec![TypedValue::Int(3)]]
        );
    }

    #[test]
    fn complement_with_constant_column() {
        let mut storage = StorageManager::default();
        storage.insert_edb("q", vec![2usize.into()]);

        let pinned = vec![ColumnUniverse::Constant(TypedValue::Int(2))];
        assert!(storage.complement("q", &pinned).is_empty());

        let pinned = vec![ColumnUniverse::Constant(TypedValue::Int(5))];
        assert_eq!(
            tuples(&storage.complement("q", &pinned)),
            vec![vec![TypedValue::Int(5)]]
        );
    }

    #[test]
    fn group_by_aggregate_sums_per_key() {
        let mut storage = StorageManager::default();
        storage.insert_edb("sales", vec!["east".into(), 10usize.into()]);
        storage.insert_edb("sales", vec!["east".into(), 20usize.into()]);
        storage.insert_edb("sales", vec!["west".into(), 5usize.into()]);

        let gidx = GroupingIndexes {
            var_indexes: vec![],
            const_indexes: Default::default(),
            group_by: vec![0],
            agg_sources: vec![
                (AggregateOp::Sum, AggSource::Local(1)),
                (AggregateOp::Count, AggSource::Local(1)),
                (AggregateOp::Min, AggSource::Local(1)),
                (AggregateOp::Max, AggSource::Local(1)),
            ],
        };

        let input = storage.scan("sales", Db::Known);
        let result = storage.group_by_aggregate(&input, &gidx);

        assert_eq!(
            tuples(&result),
            vec![
                vec![
                    "east".into(),
                    TypedValue::Int(30),
                    TypedValue::Int(2),
                    TypedValue::Int(10),
                    TypedValue::Int(20)
                ],
                vec![
                    "west".into(),
                    TypedValue::Int(5),
                    TypedValue::Int(1),
                    TypedValue::Int(5),
                    TypedValue::Int(5)
                ],
            ]
        );
    }

    #[test]
    fn freeze_moves_results_out_of_the_generations() {
        let mut storage = StorageManager::default();
        storage.reset(Sink::Known, "p", vec![Arc::new(vec![1usize.into()])]);
        storage.reset(Sink::DeltaKnown, "p", vec![Arc::new(vec![1usize.into()])]);

        storage.freeze(&["p".to_string()]);

        assert_eq!(storage.scan("p", Db::Known).len(), 1);
        assert!(storage.delta_known_empty());

        // A later overwrite of the generation shadows the frozen value.
        storage.reset(Sink::Known, "p", vec![]);
        assert!(storage.scan("p", Db::Known).is_empty());
    }

    #[test]
    fn fixpoint_reached_compares_generations() {
        let mut storage = StorageManager::default();
        assert!(storage.fixpoint_reached());

        storage.reset(Sink::New, "p", vec![Arc::new(vec![1usize.into()])]);
        assert!(!storage.fixpoint_reached());

        storage.reset(Sink::Known, "p", vec![Arc::new(vec![1usize.into()])]);
        assert!(storage.fixpoint_reached());
    }
}
