use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};

#[derive(Eq, Ord, PartialEq, PartialOrd, Clone, Hash)]
pub enum TypedValue {
    Str(String),
    Int(usize),
    Bool(bool),
}

impl Debug for TypedValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TypedValue::Str(x) => x.fmt(f),
            TypedValue::Int(x) => x.fmt(f),
            TypedValue::Bool(x) => x.fmt(f),
        }
    }
}

impl From<String> for TypedValue {
    fn from(value: String) -> Self {
        TypedValue::Str(value)
    }
}

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        TypedValue::Str(value.to_string())
    }
}

impl From<usize> for TypedValue {
    fn from(value: usize) -> Self {
        TypedValue::Int(value)
    }
}

impl From<bool> for TypedValue {
    fn from(value: bool) -> Self {
        TypedValue::Bool(value)
    }
}

impl From<TypedValue> for usize {
    fn from(value: TypedValue) -> Self {
        match value {
            TypedValue::Int(x) => x,
            _ => unreachable!(),
        }
    }
}

impl From<TypedValue> for String {
    fn from(value: TypedValue) -> Self {
        match value {
            TypedValue::Str(x) => x,
            _ => unreachable!(),
        }
    }
}

pub type Variable = String;

/// Reserved variable name for anonymous positions. Every occurrence is
/// distinct: anonymous variables never induce an equality.
pub const ANONYMOUS: &str = "_";

#[derive(Ord, PartialOrd, Eq, PartialEq, Clone, Hash)]
pub enum Term {
    Variable(String),
    Constant(TypedValue),
}

impl Term {
    pub fn var(name: &str) -> Self {
        Term::Variable(name.to_string())
    }
    pub fn val(value: impl Into<TypedValue>) -> Self {
        Term::Constant(value.into())
    }
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Term::Variable(name) if name == ANONYMOUS)
    }
    pub fn as_variable(&self) -> Option<&str> {
        match self {
            Term::Variable(name) => Some(name),
            Term::Constant(_) => None,
        }
    }
}

impl Debug for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Variable(x) => x.fmt(f),
            Term::Constant(x) => x.fmt(f),
        }
    }
}

/// Hands out fresh variable names for hosts that build rules
/// programmatically rather than through the macros.
#[derive(Default)]
pub struct VariableGenerator {
    counter: usize,
}

impl VariableGenerator {
    pub fn fresh(&mut self) -> Variable {
        let name = format!("v{}", self.counter);
        self.counter += 1;
        name
    }
}

#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Clone, Copy, Hash)]
pub enum AggregateOp {
    Sum,
    Count,
    Min,
    Max,
}

/// Payload of a grouping atom: the grouped sub-atom, the group-by
/// variables, and the aggregation operators with their operands.
#[derive(Ord, PartialOrd, Eq, PartialEq, Clone, Hash)]
pub struct Aggregation {
    pub inner: Box<Atom>,
    pub group_by: Vec<Variable>,
    pub ops: Vec<(AggregateOp, Term)>,
}

pub type AnonymousGroundAtom = Vec<TypedValue>;

pub struct Fact(pub AnonymousGroundAtom);

impl<T> From<(T,)> for Fact
where
    T: Into<TypedValue>,
{
    fn from(value: (T,)) -> Self {
        Fact(vec![value.0.into()])
    }
}

impl<T, R> From<(T, R)> for Fact
where
    T: Into<TypedValue>,
    R: Into<TypedValue>,
{
    fn from(value: (T, R)) -> Self {
        Fact(vec![value.0.into(), value.1.into()])
    }
}

impl<T, R, S> From<(T, R, S)> for Fact
where
    T: Into<TypedValue>,
    R: Into<TypedValue>,
    S: Into<TypedValue>,
{
    fn from(value: (T, R, S)) -> Self {
        Fact(vec![value.0.into(), value.1.into(), value.2.into()])
    }
}

impl<T, R, S, U> From<(T, R, S, U)> for Fact
where
    T: Into<TypedValue>,
    R: Into<TypedValue>,
    S: Into<TypedValue>,
    U: Into<TypedValue>,
{
    fn from(value: (T, R, S, U)) -> Self {
        Fact(vec![
            value.0.into(),
            value.1.into(),
            value.2.into(),
            value.3.into(),
        ])
    }
}

impl<T> From<Vec<T>> for Fact
where
    T: Into<TypedValue>,
{
    fn from(value: Vec<T>) -> Self {
        Fact(value.into_iter().map(|x| x.into()).collect())
    }
}

/// A relation reference inside a rule. `sign == false` negates the atom.
/// A `Some` aggregation makes it a grouping atom: `terms` are then the
/// output schema, group keys first, one term per aggregation op after.
#[derive(Ord, PartialOrd, Eq, PartialEq, Clone, Hash)]
pub struct Atom {
    pub terms: Vec<Term>,
    pub symbol: String,
    pub sign: bool,
    pub agg: Option<Aggregation>,
}

impl Atom {
    pub fn positive(symbol: &str, terms: Vec<Term>) -> Self {
        Atom {
            terms,
            symbol: symbol.to_string(),
            sign: true,
            agg: None,
        }
    }
    pub fn negated(symbol: &str, terms: Vec<Term>) -> Self {
        Atom {
            terms,
            symbol: symbol.to_string(),
            sign: false,
            agg: None,
        }
    }
    /// Builds a grouping atom over `inner`. The output terms are the group
    /// keys (one per group-by variable, same names) followed by `outputs`,
    /// one per aggregation op.
    pub fn grouping(
        inner: Atom,
        group_by: Vec<&str>,
        ops: Vec<(AggregateOp, Term)>,
        outputs: Vec<Term>,
    ) -> Self {
        let mut terms: Vec<Term> = group_by.iter().map(|v| Term::var(v)).collect();
        terms.extend(outputs);

        Atom {
            terms,
            symbol: inner.symbol.clone(),
            sign: true,
            agg: Some(Aggregation {
                inner: Box::new(inner),
                group_by: group_by.into_iter().map(|v| v.to_string()).collect(),
                ops,
            }),
        }
    }
    pub fn is_grouping(&self) -> bool {
        self.agg.is_some()
    }
    /// Content hash: relation symbol, sign, term shapes with variable names
    /// or constant values, and the aggregation payload. Independent of
    /// address identity.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl Debug for Atom {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if !self.sign {
            write!(f, "!")?;
        }
        write!(f, "{}(", &self.symbol)?;

        for (index, term) in self.terms.iter().enumerate() {
            write!(f, "{:?}", term)?;
            if index < self.terms.len() - 1 {
                write!(f, ", ")?;
            }
        }

        write!(f, ")")
    }
}

#[derive(Ord, PartialOrd, Eq, PartialEq, Clone, Hash)]
pub struct Rule {
    pub head: Atom,
    pub body: Vec<Atom>,
    pub id: usize,
}

impl Rule {
    /// Content hash combining the head and body atom hashes in order.
    /// Permuting the body yields a different hash, which is what planner
    /// caches keyed per body order need.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.head.stable_hash().hash(&mut hasher);
        for atom in &self.body {
            atom.stable_hash().hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl Debug for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", &self.head)?;
        write!(f, " <- [")?;
        for (index, atom) in self.body.iter().enumerate() {
            write!(f, "{:?}", atom)?;
            if index < self.body.len() - 1 {
                write!(f, ", ")?;
            }
        }

        write!(f, "]")
    }
}

#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Clone, Hash, Default)]
pub struct Program {
    pub inner: Vec<Rule>,
}

impl From<Vec<Rule>> for Program {
    fn from(value: Vec<Rule>) -> Self {
        let mut rules = value;
        for (id, rule) in rules.iter_mut().enumerate() {
            rule.id = id;
        }

        Self { inner: rules }
    }
}

pub enum Matcher {
    Any,
    Constant(TypedValue),
}

pub struct Query<'a> {
    pub matchers: Vec<Matcher>,
    pub symbol: &'a str,
}

pub struct QueryBuilder<'a> {
    pub query: Query<'a>,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(relation: &'a str) -> Self {
        QueryBuilder {
            query: Query {
                matchers: vec![],
                symbol: relation,
            },
        }
    }
    pub fn with_any(&mut self) {
        self.query.matchers.push(Matcher::Any);
    }
    pub fn with_constant(&mut self, value: TypedValue) {
        self.query.matchers.push(Matcher::Constant(value))
    }
}

impl<'a> From<QueryBuilder<'a>> for Query<'a> {
    fn from(value: QueryBuilder<'a>) -> Self {
        value.query
    }
}

#[macro_export]
macro_rules! build_query {
    ($relation:ident ( $( $matcher:tt ),* $(,)? )) => {{
        let mut builder = QueryBuilder::new(stringify!($relation));
        $(
            build_query!(@matcher builder, $matcher);
        )*
        builder.query
    }};
    (@matcher $builder:expr, _) => {{
        $builder.with_any();
    }};
    (@matcher $builder:expr, $value:expr) => {{
        $builder.with_constant($value.into());
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_distinguishes_content() {
        let a = Atom::positive("e", vec![Term::var("x"), Term::var("y")]);
        let b = Atom::positive("e", vec![Term::var("x"), Term::var("y")]);
        let c = Atom::positive("e", vec![Term::var("y"), Term::var("z")]);
        let d = Atom::negated("e", vec![Term::var("x"), Term::var("y")]);

        assert_eq!(a.stable_hash(), b.stable_hash());
        assert_ne!(a.stable_hash(), c.stable_hash());
        assert_ne!(a.stable_hash(), d.stable_hash());
    }

    #[test]
    fn rule_hash_depends_on_body_order() {
        let e = Atom::positive("e", vec![Term::var("x"), Term::var("y")]);
        let tc = Atom::positive("tc", vec![Term::var("y"), Term::var("z")]);
        let head = Atom::positive("tc", vec![Term::var("x"), Term::var("z")]);

        let forward = Rule {
            head: head.clone(),
            body: vec![e.clone(), tc.clone()],
            id: 0,
        };
        let backward = Rule {
            head,
            body: vec![tc, e],
            id: 0,
        };

        assert_ne!(forward.stable_hash(), backward.stable_hash());
    }

    #[test]
    fn anonymous_terms() {
        assert!(Term::var("_").is_anonymous());
        assert!(!Term::var("x").is_anonymous());
        assert!(!Term::val(3usize).is_anonymous());
    }

    #[test]
    fn grouping_atom_schema() {
        let sales = Atom::positive("sales", vec![Term::var("g"), Term::var("v")]);
        let total = Atom::grouping(
            sales,
            vec!["g"],
            vec![(AggregateOp::Sum, Term::var("v"))],
            vec![Term::var("s")],
        );

        assert!(total.is_grouping());
        assert_eq!(total.symbol, "sales");
        assert_eq!(total.terms, vec![Term::var("g"), Term::var("s")]);
    }

    #[test]
    fn program_assigns_rule_ids_in_order() {
        let fact_rule = Rule {
            head: Atom::positive("p", vec![Term::val(1usize)]),
            body: vec![],
            id: 7,
        };
        let program = Program::from(vec![fact_rule.clone(), fact_rule]);

        assert_eq!(program.inner[0].id, 0);
        assert_eq!(program.inner[1].id, 1);
    }
}
