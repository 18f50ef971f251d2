//! Stable topological ordering.
//!
//! Items are first sorted by a caller-supplied key, then visited depth first
//! in that order, so the output is deterministic whatever order the input
//! arrived in. Cycles never abort the ordering: the closing edge is reported
//! and ignored.

use std::collections::HashMap;
use std::hash::Hash;

/// A problem found while ordering. Neither stops the ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DagIssue<T> {
    /// A dependency names an item that is not in the input.
    UnknownItem(T),
    /// The edge `before -> after` closes a cycle and was ignored.
    Cycle { before: T, after: T },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ordered<T> {
    pub items: Vec<T>,
    pub issues: Vec<DagIssue<T>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Orders `items` so that for every `(before, after)` pair in `dependencies`
/// `before` precedes `after`. Ties are broken by `key`.
pub fn calculate_order<T, K, F>(items: &[T], dependencies: &[(T, T)], key: F) -> Ordered<T>
where
    T: Clone + Eq + Hash,
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut seeds: Vec<T> = items.to_vec();
    seeds.sort_by_key(|t| key(t));
    let position: HashMap<T, usize> = seeds.iter().cloned().enumerate().map(|(i, t)| (t, i)).collect();

    let mut issues = Vec::new();
    // predecessors of each item, in key order
    let mut before: Vec<Vec<usize>> = vec![Vec::new(); seeds.len()];
    for (b, a) in dependencies {
        let (Some(bi), Some(ai)) = (position.get(b), position.get(a)) else {
            for side in [b, a] {
                if !position.contains_key(side) {
                    issues.push(DagIssue::UnknownItem(side.clone()));
                }
            }
            continue;
        };
        if !before[*ai].contains(bi) {
            before[*ai].push(*bi);
        }
    }
    for list in &mut before {
        list.sort_unstable();
    }

    let mut marks = vec![Mark::Unvisited; seeds.len()];
    let mut output = Vec::with_capacity(seeds.len());
    for seed in 0..seeds.len() {
        if marks[seed] != Mark::Unvisited {
            continue;
        }
        // (item, next predecessor to look at)
        let mut stack: Vec<(usize, usize)> = vec![(seed, 0)];
        marks[seed] = Mark::Visiting;
        while let Some((item, cursor)) = stack.pop() {
            match before[item].get(cursor).copied() {
                Some(dep) => {
                    stack.push((item, cursor + 1));
                    match marks[dep] {
                        Mark::Unvisited => {
                            marks[dep] = Mark::Visiting;
                            stack.push((dep, 0));
                        }
                        Mark::Visiting => issues.push(DagIssue::Cycle { before: seeds[dep].clone(), after: seeds[item].clone() }),
                        Mark::Visited => {}
                    }
                }
                None => {
                    marks[item] = Mark::Visited;
                    output.push(seeds[item].clone());
                }
            }
        }
    }

    Ordered { items: output, issues }
}
