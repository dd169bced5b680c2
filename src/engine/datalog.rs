use crate::engine::storage::{Db, StorageManager};
use crate::error::EngineError;
use crate::evaluation::interpreter::Interpreter;
use crate::evaluation::ir::{build_program_tree, Node};
use crate::evaluation::query::pattern_match;
use crate::evaluation::staged::{specialize, CompiledProgram, SpecializationCache};
use crate::evaluation::{EvalContext, JitOptions, StageTimings};
use crate::planner::dependency_graph::stratify;
use crate::planner::join_indexes::IndexCache;
use ahash::{HashMap, HashMapExt};
use datalog_syntax::*;
use std::collections::HashSet;
use std::time::Instant;

/// The evaluation engine: holds the asserted facts, the rule program and
/// its stratification, the planner caches, and the jit configuration. One
/// engine solves any of its relations, from scratch, as often as asked.
pub struct Engine {
    storage: StorageManager,
    program: Program,
    strata: Vec<Vec<Rule>>,
    arities: HashMap<String, usize>,
    index_cache: IndexCache,
    spec_cache: SpecializationCache,
    options: JitOptions,
    timings: StageTimings,
}

impl Engine {
    pub fn new(program: Program) -> Result<Self, EngineError> {
        Self::with_options(program, JitOptions::default())
    }

    pub fn with_options(program: Program, options: JitOptions) -> Result<Self, EngineError> {
        let mut engine = Self {
            storage: StorageManager::default(),
            program: Program::default(),
            strata: vec![],
            arities: HashMap::new(),
            index_cache: IndexCache::default(),
            spec_cache: SpecializationCache::default(),
            options,
            timings: StageTimings::default(),
        };

        for rule in program.inner {
            engine.add_rule(rule)?;
        }
        Ok(engine)
    }

    /// Registers an EDB relation with no facts yet.
    pub fn declare_relation(&mut self, relation: &str) {
        self.storage.declare(relation);
    }

    /// Asserts one EDB tuple. The relation's arity is pinned by its first
    /// use, whether in a rule or an assertion.
    pub fn insert(
        &mut self,
        relation: &str,
        ground_atom: impl Into<Fact>,
    ) -> Result<bool, EngineError> {
        let fact = ground_atom.into().0;
        self.check_arity(relation, fact.len())?;
        Ok(self.storage.insert_edb(relation, fact))
    }

    /// Adds one rule, validating it eagerly: join indexes compile (head
    /// and variable checks, per-rule arities), cross-rule arities agree,
    /// and the grown program still stratifies. A bodyless ground rule is
    /// folded into the EDBs instead of being evaluated.
    pub fn add_rule(&mut self, rule: Rule) -> Result<(), EngineError> {
        let jidx = self.index_cache.get_or_compile(&rule)?;

        self.check_arity(&rule.head.symbol, rule.head.terms.len())?;
        for atom in &rule.body {
            match &atom.agg {
                Some(agg) => self.check_arity(&agg.inner.symbol, agg.inner.terms.len())?,
                None => self.check_arity(&atom.symbol, atom.terms.len())?,
            }
        }

        if jidx.edb {
            let fact: AnonymousGroundAtom = rule
                .head
                .terms
                .iter()
                .map(|term| match term {
                    Term::Constant(value) => value.clone(),
                    Term::Variable(_) => unreachable!("edb assertion heads are ground"),
                })
                .collect();
            self.storage.insert_edb(&rule.head.symbol, fact);
            return Ok(());
        }

        let mut rules = std::mem::take(&mut self.program.inner);
        rules.push(rule);
        let program = Program::from(rules);
        let strata = stratify(&program)?;

        self.program = program;
        self.strata = strata;
        Ok(())
    }

    pub fn solve_interpreted(
        &mut self,
        relation: &str,
    ) -> Result<HashSet<AnonymousGroundAtom>, EngineError> {
        self.ensure_known(relation)?;

        let generate_start = Instant::now();
        let tree = self.build_tree()?;
        let generate = generate_start.elapsed();

        let execute_start = Instant::now();
        let mut interpreter =
            Interpreter::new(&mut self.storage, &mut self.index_cache, self.options);
        interpreter.run(&tree)?;
        let execute = execute_start.elapsed();

        self.timings = StageTimings {
            generate,
            specialize: Default::default(),
            execute,
        };
        tracing::debug!(relation, iterations = self.storage.iteration(), "interpreted solve done");

        Ok(self.collect(relation))
    }

    /// All three staged surfaces, timed separately: tree generation,
    /// specialization, execution.
    pub fn solve_compiled(
        &mut self,
        relation: &str,
    ) -> Result<HashSet<AnonymousGroundAtom>, EngineError> {
        let generate_start = Instant::now();
        let (tree, ctx) = self.generate_program_tree(relation)?;
        let generate = generate_start.elapsed();

        let specialize_start = Instant::now();
        let compiled = self.specialize(&tree, &ctx);
        let specialize = specialize_start.elapsed();

        let execute_start = Instant::now();
        let result = self.run_specialized(&compiled, &ctx)?;
        let execute = execute_start.elapsed();

        self.timings = StageTimings {
            generate,
            specialize,
            execute,
        };
        tracing::debug!(relation, iterations = self.storage.iteration(), "compiled solve done");

        Ok(result)
    }

    /// First staged surface: the program tree and its context.
    pub fn generate_program_tree(
        &mut self,
        relation: &str,
    ) -> Result<(Node, EvalContext), EngineError> {
        self.ensure_known(relation)?;
        let tree = self.build_tree()?;
        let ctx = EvalContext {
            target: relation.to_string(),
            options: self.options,
        };
        Ok((tree, ctx))
    }

    /// Second staged surface: partial evaluation of a generated tree.
    pub fn specialize(&mut self, tree: &Node, ctx: &EvalContext) -> CompiledProgram {
        specialize(tree, ctx, &mut self.spec_cache)
    }

    /// Third staged surface: run a specialized program against the live
    /// storage and read off the queried relation.
    pub fn run_specialized(
        &mut self,
        compiled: &CompiledProgram,
        ctx: &EvalContext,
    ) -> Result<HashSet<AnonymousGroundAtom>, EngineError> {
        self.ensure_known(&ctx.target)?;
        compiled.run(&mut self.storage);
        Ok(self.collect(&ctx.target))
    }

    pub fn stage_timings(&self) -> StageTimings {
        self.timings
    }

    /// Generation swaps performed by the last solve, summed over strata.
    pub fn iterations(&self) -> usize {
        self.storage.iteration()
    }

    /// Pattern-matched view over a relation as of the last solve.
    pub fn query<'a>(
        &'a self,
        query: &'a Query,
    ) -> impl Iterator<Item = AnonymousGroundAtom> + 'a {
        self.storage
            .scan(query.symbol, Db::Known)
            .into_iter()
            .filter(|fact| pattern_match(query, fact))
            .map(|fact| (*fact).clone())
    }

    fn build_tree(&mut self) -> Result<Node, EngineError> {
        let mut sizes: HashMap<String, usize> = HashMap::new();
        for symbol in self.arities.keys() {
            sizes.insert(symbol.clone(), self.storage.relation_size(symbol));
        }
        let relation_size = |symbol: &str| sizes.get(symbol).copied().unwrap_or(0);

        build_program_tree(
            &self.strata,
            &mut self.index_cache,
            &self.options,
            &relation_size,
        )
    }

    fn check_arity(&mut self, relation: &str, found: usize) -> Result<(), EngineError> {
        match self.arities.get(relation) {
            Some(&expected) if expected != found => Err(EngineError::ArityMismatch {
                relation: relation.to_string(),
                expected,
                found,
            }),
            Some(_) => Ok(()),
            None => {
                self.arities.insert(relation.to_string(), found);
                Ok(())
            }
        }
    }

    /// A relation is known if it has asserted facts (or was declared) or
    /// some rule produces it. Checked for the queried relation and every
    /// relation the rules read.
    fn ensure_known(&self, target: &str) -> Result<(), EngineError> {
        let heads: HashSet<&str> = self
            .program
            .inner
            .iter()
            .map(|rule| rule.head.symbol.as_str())
            .collect();

        let known =
            |symbol: &str| heads.contains(symbol) || self.storage.edbs.inner.contains_key(symbol);

        if !known(target) {
            return Err(EngineError::UnknownRelation {
                relation: target.to_string(),
            });
        }
        for rule in &self.program.inner {
            for atom in &rule.body {
                if !known(&atom.symbol) {
                    return Err(EngineError::UnknownRelation {
                        relation: atom.symbol.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn collect(&self, relation: &str) -> HashSet<AnonymousGroundAtom> {
        self.storage
            .scan(relation, Db::Known)
            .into_iter()
            .map(|fact| (*fact).clone())
            .collect()
    }
}
