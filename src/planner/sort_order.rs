use ahash::HashMap;
use datalog_syntax::{Atom, Term};
use std::collections::BTreeMap;

/// Body-ordering policy. `Unordered` and `Badluck` keep the order the rule
/// was written in; `Sel`, `Mixed` and `IntMax` share the greedy best-first
/// machinery and differ only in their rank function; `Worst` deliberately
/// builds adversarial orders for comparison runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortOrder {
    #[default]
    Unordered,
    Badluck,
    Sel,
    Mixed,
    IntMax,
    Worst,
}

impl SortOrder {
    pub fn reorders(self) -> bool {
        !matches!(self, SortOrder::Unordered | SortOrder::Badluck)
    }
}

/// Rank of one body atom: lower sorts earlier. The boolean lets the delta
/// slot win every comparison against a non-delta slot.
pub type Rank = (bool, i64);

pub type RankFn<'a> = dyn Fn(&Atom, bool) -> Rank + 'a;

fn bound_positions(atom: &Atom) -> i64 {
    atom.terms
        .iter()
        .filter(|term| matches!(term, Term::Constant(_)))
        .count() as i64
}

/// Builds the rank function for one sort order. `relation_size` reports the
/// current visible cardinality of a relation; arity and size are the only
/// statistics consulted.
pub fn rank_for<'a>(
    order: SortOrder,
    relation_size: impl Fn(&str) -> usize + 'a,
) -> Box<RankFn<'a>> {
    match order {
        SortOrder::Sel | SortOrder::Worst => Box::new(move |atom, is_delta| {
            (!is_delta, relation_size(&atom.symbol) as i64)
        }),
        SortOrder::Mixed => Box::new(move |atom, is_delta| {
            (
                !is_delta,
                (relation_size(&atom.symbol) * atom.terms.len()) as i64,
            )
        }),
        SortOrder::IntMax => Box::new(move |atom, is_delta| (!is_delta, -bound_positions(atom))),
        SortOrder::Unordered | SortOrder::Badluck => {
            Box::new(move |_, is_delta| (!is_delta, 0))
        }
    }
}

type Connectivity = HashMap<u64, BTreeMap<usize, Vec<u64>>>;

/// Greedy best-first body ordering: start from the best-ranked atom, then
/// repeatedly take the still-unplaced peer sharing the most variables with
/// the atom just placed, falling back to the rank order when the placed
/// atom has no remaining peer. Returns the new order as indexes into
/// `atoms` plus the new position of the delta slot.
pub fn presort_select(
    atoms: &[Atom],
    delta_idx: Option<usize>,
    rank: &RankFn,
    cxns: &Connectivity,
) -> (Vec<usize>, Option<usize>) {
    select_order(atoms, delta_idx, rank, cxns, false)
}

/// Mirror image of `presort_select`: takes the least-connected remaining
/// peer, walking shared-variable counts ascending. Used to simulate
/// adversarial plans.
pub fn presort_select_worst(
    atoms: &[Atom],
    delta_idx: Option<usize>,
    rank: &RankFn,
    cxns: &Connectivity,
) -> (Vec<usize>, Option<usize>) {
    select_order(atoms, delta_idx, rank, cxns, true)
}

fn select_order(
    atoms: &[Atom],
    delta_idx: Option<usize>,
    rank: &RankFn,
    cxns: &Connectivity,
    worst: bool,
) -> (Vec<usize>, Option<usize>) {
    let mut stack: Vec<usize> = (0..atoms.len()).collect();
    stack.sort_by_key(|&i| rank(&atoms[i], Some(i) == delta_idx));

    let mut order: Vec<usize> = Vec::with_capacity(atoms.len());

    while !stack.is_empty() {
        let next = match order.last() {
            None => stack.remove(0),
            Some(&placed) => {
                match connected_candidate(&atoms[placed], atoms, &stack, cxns, worst) {
                    Some(stack_pos) => stack.remove(stack_pos),
                    None => stack.remove(0),
                }
            }
        };
        order.push(next);
    }

    let new_delta = delta_idx.map(|original| {
        order
            .iter()
            .position(|&i| i == original)
            .expect("delta slot survives reordering")
    });

    (order, new_delta)
}

/// Position in `stack` of the preferred peer of `placed`, if any. `Sel`
/// walks shared-variable counts descending; `Worst` ascending. The
/// asymmetry is intentional.
fn connected_candidate(
    placed: &Atom,
    atoms: &[Atom],
    stack: &[usize],
    cxns: &Connectivity,
    worst: bool,
) -> Option<usize> {
    let peers = cxns.get(&placed.stable_hash())?;

    let counts: Vec<&usize> = if worst {
        peers.keys().collect()
    } else {
        peers.keys().rev().collect()
    };

    for count in counts {
        for peer_hash in &peers[count] {
            if let Some(stack_pos) = stack
                .iter()
                .position(|&i| atoms[i].stable_hash() == *peer_hash)
            {
                return Some(stack_pos);
            }
        }
    }

    None
}

/// All permutations of `0..n` in a stable order.
pub fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![vec![]];
    }
    let mut result = Vec::new();
    for rest in permutations(n - 1) {
        for slot in 0..=rest.len() {
            let mut order = rest.clone();
            order.insert(slot, n - 1);
            result.push(order);
        }
    }
    result
}
