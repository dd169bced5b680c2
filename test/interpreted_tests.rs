use datalog_rule_macro::program;
use datalog_syntax::*;
use staged_datalog::{Engine, EngineError, JitOptions, OnlineSort, SortOrder};
use std::collections::HashSet;

fn string_pairs(facts: &HashSet<AnonymousGroundAtom>) -> HashSet<(String, String)> {
    facts
        .iter()
        .map(|fact| {
            (
                Into::<String>::into(fact[0].clone()),
                Into::<String>::into(fact[1].clone()),
            )
        })
        .collect()
}

fn expected_pairs(pairs: &[(&str, &str)]) -> HashSet<(String, String)> {
    pairs
        .iter()
        .map(|(x, y)| (x.to_string(), y.to_string()))
        .collect()
}

fn chain_engine(program: Program) -> Engine {
    let mut engine = Engine::new(program).unwrap();
    for edge in [("a", "b"), ("b", "c"), ("c", "d")] {
        engine.insert("edge", edge).unwrap();
    }
    engine
}

#[test]
fn transitive_closure() {
    let mut engine = chain_engine(program! {
        path(?x, ?y) <- [edge(?x, ?y)],
        path(?x, ?z) <- [edge(?x, ?y), path(?y, ?z)]
    });

    let path = engine.solve_interpreted("path").unwrap();

    assert_eq!(
        string_pairs(&path),
        expected_pairs(&[
            ("a", "b"),
            ("b", "c"),
            ("c", "d"),
            ("a", "c"),
            ("b", "d"),
            ("a", "d")
        ])
    );
}

#[test]
fn hops_k_chain() {
    let mut engine = chain_engine(program! {
        hops1(?x, ?y) <- [edge(?x, ?y)],
        hops2(?x, ?y) <- [hops1(?x, ?z), hops1(?z, ?y)],
        hops3(?x, ?y) <- [hops1(?x, ?z), hops2(?z, ?y)],
        hops4(?x, ?y) <- [hops1(?x, ?z), hops3(?z, ?y)]
    });

    let hops2 = engine.solve_interpreted("hops2").unwrap();
    assert_eq!(string_pairs(&hops2), expected_pairs(&[("a", "c"), ("b", "d")]));

    let hops3 = engine.solve_interpreted("hops3").unwrap();
    assert_eq!(string_pairs(&hops3), expected_pairs(&[("a", "d")]));

    let hops4 = engine.solve_interpreted("hops4").unwrap();
    assert!(hops4.is_empty());
}

#[test]
fn negation_as_complement() {
    let mut engine = Engine::new(program! {
        r(?x) <- [p(?x), !q(?x)]
    })
    .unwrap();
    for value in [1usize, 2, 3] {
        engine.insert("p", (value,)).unwrap();
    }
    engine.insert("q", (2usize,)).unwrap();

    let r = engine.solve_interpreted("r").unwrap();

    let expected: HashSet<AnonymousGroundAtom> =
        [vec![TypedValue::Int(1)], vec![TypedValue::Int(3)]]
            .into_iter()
            .collect();
    assert_eq!(r, expected);
}

#[test]
fn negation_over_a_derived_relation() {
    let mut engine = chain_engine(program! {
        node(?x) <- [edge(?x, _)],
        node(?y) <- [edge(_, ?y)],
        path(?x, ?y) <- [edge(?x, ?y)],
        path(?x, ?z) <- [edge(?x, ?y), path(?y, ?z)],
        unreachable(?x, ?y) <- [node(?x), node(?y), !path(?x, ?y)]
    });

    let unreachable = engine.solve_interpreted("unreachable").unwrap();

    assert_eq!(
        string_pairs(&unreachable),
        expected_pairs(&[
            ("a", "a"),
            ("b", "a"),
            ("b", "b"),
            ("c", "a"),
            ("c", "b"),
            ("c", "c"),
            ("d", "a"),
            ("d", "b"),
            ("d", "c"),
            ("d", "d")
        ])
    );
}

#[test]
fn sum_aggregation() {
    let sales = Atom::positive("sales", vec![Term::var("g"), Term::var("v")]);
    let total_rule = Rule {
        head: Atom::positive("total", vec![Term::var("g"), Term::var("s")]),
        body: vec![Atom::grouping(
            sales,
            vec!["g"],
            vec![(AggregateOp::Sum, Term::var("v"))],
            vec![Term::var("s")],
        )],
        id: 0,
    };

    let mut engine = Engine::new(Program::from(vec![total_rule])).unwrap();
    engine.insert("sales", ("east", 10usize)).unwrap();
    engine.insert("sales", ("east", 20usize)).unwrap();
    engine.insert("sales", ("west", 5usize)).unwrap();

    let total = engine.solve_interpreted("total").unwrap();

    let expected: HashSet<AnonymousGroundAtom> = [
        vec!["east".into(), TypedValue::Int(30)],
        vec!["west".into(), TypedValue::Int(5)],
    ]
    .into_iter()
    .collect();
    assert_eq!(total, expected);
}

#[test]
fn count_min_max_aggregation() {
    let readings = Atom::positive("readings", vec![Term::var("s"), Term::var("v")]);
    let stats_rule = Rule {
        head: Atom::positive(
            "stats",
            vec![
                Term::var("s"),
                Term::var("n"),
                Term::var("lo"),
                Term::var("hi"),
            ],
        ),
        body: vec![Atom::grouping(
            readings,
            vec!["s"],
            vec![
                (AggregateOp::Count, Term::var("v")),
                (AggregateOp::Min, Term::var("v")),
                (AggregateOp::Max, Term::var("v")),
            ],
            vec![Term::var("n"), Term::var("lo"), Term::var("hi")],
        )],
        id: 0,
    };

    let mut engine = Engine::new(Program::from(vec![stats_rule])).unwrap();
    engine.insert("readings", ("probe", 7usize)).unwrap();
    engine.insert("readings", ("probe", 3usize)).unwrap();
    engine.insert("readings", ("probe", 9usize)).unwrap();

    let stats = engine.solve_interpreted("stats").unwrap();

    let expected: HashSet<AnonymousGroundAtom> = [vec![
        "probe".into(),
        TypedValue::Int(3),
        TypedValue::Int(3),
        TypedValue::Int(9),
    ]]
    .into_iter()
    .collect();
    assert_eq!(stats, expected);
}

#[test]
fn aggregation_over_a_derived_relation() {
    let path = Atom::positive("path", vec![Term::var("x"), Term::var("y")]);
    let mut rules = program! {
        path(?x, ?y) <- [edge(?x, ?y)],
        path(?x, ?z) <- [edge(?x, ?y), path(?y, ?z)]
    }
    .inner;
    rules.push(Rule {
        head: Atom::positive("out_count", vec![Term::var("x"), Term::var("n")]),
        body: vec![Atom::grouping(
            path,
            vec!["x"],
            vec![(AggregateOp::Count, Term::var("y"))],
            vec![Term::var("n")],
        )],
        id: 0,
    });

    let mut engine = Engine::new(Program::from(rules)).unwrap();
    for edge in [("a", "b"), ("b", "c"), ("c", "d")] {
        engine.insert("edge", edge).unwrap();
    }

    let out_count = engine.solve_interpreted("out_count").unwrap();

    let expected: HashSet<AnonymousGroundAtom> = [
        vec!["a".into(), TypedValue::Int(3)],
        vec!["b".into(), TypedValue::Int(2)],
        vec!["c".into(), TypedValue::Int(1)],
    ]
    .into_iter()
    .collect();
    assert_eq!(out_count, expected);
}

#[test]
fn siblings_exclude_the_diagonal() {
    let mut engine = Engine::new(program! {
        same(?x, ?x) <- [kin(_, ?x)],
        sib(?x, ?y) <- [kin(?p, ?x), kin(?p, ?y), !same(?x, ?y)]
    })
    .unwrap();
    for pair in [("a", "b"), ("b", "c"), ("a", "d")] {
        engine.insert("kin", pair).unwrap();
    }

    let sib = engine.solve_interpreted("sib").unwrap();

    assert_eq!(string_pairs(&sib), expected_pairs(&[("b", "d"), ("d", "b")]));
}

#[test]
fn empty_edb_reaches_fixpoint_immediately() {
    let mut engine = Engine::new(program! {
        path(?x, ?y) <- [edge(?x, ?y)],
        path(?x, ?z) <- [edge(?x, ?y), path(?y, ?z)]
    })
    .unwrap();
    engine.declare_relation("edge");

    let path = engine.solve_interpreted("path").unwrap();

    assert!(path.is_empty());
    assert_eq!(engine.iterations(), 1);
}

#[test]
fn stratified_layers_solve_in_order() {
    let mut engine = Engine::new(program! {
        base(?x, ?y) <- [edge(?x, ?y)],
        derived(?x, ?y) <- [base(?x, ?y)],
        derived(?x, ?z) <- [derived(?x, ?y), base(?y, ?z)],
        top(?x, ?z) <- [derived(?x, ?y), base(?y, ?z)]
    })
    .unwrap();
    for edge in [("a", "b"), ("b", "c")] {
        engine.insert("edge", edge).unwrap();
    }

    let derived = engine.solve_interpreted("derived").unwrap();
    assert_eq!(
        string_pairs(&derived),
        expected_pairs(&[("a", "b"), ("b", "c"), ("a", "c")])
    );

    let top = engine.solve_interpreted("top").unwrap();
    assert_eq!(string_pairs(&top), expected_pairs(&[("a", "c")]));
}

#[test]
fn every_sort_order_yields_the_same_result() {
    let reference = {
        let mut engine = chain_engine(program! {
            path(?x, ?y) <- [edge(?x, ?y)],
            path(?x, ?z) <- [edge(?x, ?y), path(?y, ?z)]
        });
        engine.solve_interpreted("path").unwrap()
    };

    for sort_order in [
        SortOrder::Unordered,
        SortOrder::Badluck,
        SortOrder::Sel,
        SortOrder::Mixed,
        SortOrder::IntMax,
        SortOrder::Worst,
    ] {
        for online_sort in [OnlineSort::Off, OnlineSort::PerRule, OnlineSort::PerStep] {
            let options = JitOptions {
                sort_order,
                online_sort,
                ..Default::default()
            };
            let mut engine = Engine::with_options(
                program! {
                    path(?x, ?y) <- [edge(?x, ?y)],
                    path(?x, ?z) <- [edge(?x, ?y), path(?y, ?z)]
                },
                options,
            )
            .unwrap();
            for edge in [("a", "b"), ("b", "c"), ("c", "d")] {
                engine.insert("edge", edge).unwrap();
            }

            let path = engine.solve_interpreted("path").unwrap();
            assert_eq!(path, reference, "order {:?} online {:?}", sort_order, online_sort);
        }
    }
}

#[test]
fn constant_filters_prune_the_join() {
    let mut engine = chain_engine(program! {
        from_a(?y) <- [edge("a", ?y)],
        via(?x, ?y) <- [edge(?x, "b"), edge("b", ?y)]
    });

    let from_a = engine.solve_interpreted("from_a").unwrap();
    assert_eq!(
        from_a,
        [vec![TypedValue::Str("b".to_string())]].into_iter().collect()
    );

    let via = engine.solve_interpreted("via").unwrap();
    assert_eq!(string_pairs(&via), expected_pairs(&[("a", "c")]));
}

#[test]
fn variable_only_in_negated_body_is_rejected() {
    let bad = Rule {
        head: Atom::positive("r", vec![Term::var("x")]),
        body: vec![
            Atom::positive("p", vec![Term::var("x")]),
            Atom::negated("q", vec![Term::var("y")]),
        ],
        id: 0,
    };

    assert!(matches!(
        Engine::new(Program::from(vec![bad])),
        Err(EngineError::VariableOnlyInNegatedContext { variable, .. }) if variable == "y"
    ));
}

#[test]
fn aggregation_inside_recursion_is_rejected() {
    let grouped_self = Atom::positive("acc", vec![Term::var("x"), Term::var("v")]);
    let bad = Rule {
        head: Atom::positive("acc", vec![Term::var("x"), Term::var("s")]),
        body: vec![Atom::grouping(
            grouped_self,
            vec!["x"],
            vec![(AggregateOp::Sum, Term::var("v"))],
            vec![Term::var("s")],
        )],
        id: 0,
    };

    assert!(matches!(
        Engine::new(Program::from(vec![bad])),
        Err(EngineError::UnstratifiableNegationOrAggregation { relation }) if relation == "acc"
    ));
}
