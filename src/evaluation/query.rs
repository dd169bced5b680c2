use datalog_syntax::{AnonymousGroundAtom, Matcher, Query};

/// Matches a solved tuple against a query pattern. A pattern with the
/// wrong arity matches nothing.
pub fn pattern_match(query: &Query, fact: &AnonymousGroundAtom) -> bool {
    if query.matchers.len() != fact.len() {
        return false;
    }

    query
        .matchers
        .iter()
        .zip(fact.iter())
        .all(|(matcher, value)| match matcher {
            Matcher::Any => true,
            Matcher::Constant(target) => target == value,
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use datalog_syntax::{build_query, QueryBuilder, TypedValue};

    #[test]
    fn wildcards_and_constants() {
        let query = build_query!(edge("a", _));

        assert!(pattern_match(&query, &vec!["a".into(), "b".into()]));
        assert!(!pattern_match(&query, &vec!["b".into(), "a".into()]));
    }

    #[test]
    fn arity_mismatch_never_matches() {
        let query = build_query!(edge(_, _));

        assert!(!pattern_match(&query, &vec![TypedValue::Int(1)]));
    }
}
