//! Rank sort: a two-pass BFS producing the minimum and maximum
//! position of each vertex in any valid topological order.
//!
//! The top-down pass assigns `rank(root) = 0` and
//! `rank(v) = max(rank(p)) + 1` over the predecessors `p`, which is
//! the earliest slot `v` can occupy. Run again on the reversed graph
//! it yields the latest slot. The spread between the two is what the
//! variable resolver uses to decide whether two groups have a fixed
//! relative order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

/// A cycle in a graph that must be cycle free, naming the vertices
/// known to be involved.
#[derive(Debug, Error)]
#[error("dependency cycle detected! The cycle includes {vertices:?}.")]
pub struct CycleError {
    /// The offending vertex set.
    pub vertices: Vec<String>,
}

/// Calculates the top-down rank for each vertex. Supports graphs with
/// multiple components. The graph must not have cycles; if it does, a
/// [`CycleError`] may be raised here, but some cycles only become
/// visible as back edges in the returned assignment - callers must
/// verify that every edge increases the rank.
pub fn rank_sort<P, C>(
    vertices: &[String],
    preds_of: P,
    childs_of: C,
) -> Result<BTreeMap<String, usize>, CycleError>
where
    P: Fn(&str) -> Vec<String>,
    C: Fn(&str) -> Vec<String>,
{
    let mut ranks: BTreeMap<String, Option<usize>> =
        vertices.iter().map(|v| (v.clone(), None)).collect();

    // While at least one vertex is unranked, find the root of that
    // portion of the graph and assign ranks to everything reachable.
    while ranks.values().any(Option::is_none) {
        // Start at any unranked vertex, in declaration order for
        // deterministic error output.
        let mut root = vertices
            .iter()
            .find(|v| ranks[*v].is_none())
            .expect("an unranked vertex exists")
            .clone();

        // Walk to the subtree root, detecting cycles by revisit.
        let mut visited: BTreeSet<String> = BTreeSet::new();
        visited.insert(root.clone());
        while let Some(pred) = preds_of(&root).into_iter().next() {
            if visited.contains(&pred) {
                return Err(CycleError {
                    vertices: visited.into_iter().collect(),
                });
            }
            visited.insert(pred.clone());
            root = pred;
        }

        ranks.insert(root.clone(), Some(0));

        // Assign increasing ranks breadth-first so transitive edges
        // don't cause repeated subtree updates.
        let mut queue: VecDeque<(String, String)> = childs_of(&root)
            .into_iter()
            .map(|c| (c, root.clone()))
            .collect();
        while let Some((vertex, parent)) = queue.pop_front() {
            let rank = ranks[&parent].expect("parent is ranked") + 1;

            // A rank beyond the vertex count means we are running in
            // circles.
            if rank > vertices.len() {
                return Err(CycleError {
                    vertices: vec![parent],
                });
            }

            if ranks[&vertex].is_some_and(|r| r >= rank) {
                continue;
            }
            ranks.insert(vertex.clone(), Some(rank));
            queue.extend(childs_of(&vertex).into_iter().map(|c| (c, vertex.clone())));
        }
    }

    Ok(ranks
        .into_iter()
        .map(|(v, r)| (v, r.expect("all vertices ranked")))
        .collect())
}

/// Returns the transitive closure of `start` under `edges_of`,
/// including the starting vertices themselves.
pub fn transitive_closure<F>(start: &BTreeSet<String>, edges_of: F) -> BTreeSet<String>
where
    F: Fn(&str) -> Vec<String>,
{
    let mut closure = start.clone();
    let mut queue: Vec<String> = start.iter().cloned().collect();
    while let Some(vertex) = queue.pop() {
        for next in edges_of(&vertex) {
            if closure.insert(next.clone()) {
                queue.push(next);
            }
        }
    }
    closure
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)], vertices: &[&str]) -> (Vec<String>, BTreeMap<String, Vec<String>>, BTreeMap<String, Vec<String>>) {
        let vertices: Vec<String> = vertices.iter().map(|s| (*s).to_owned()).collect();
        let mut preds: BTreeMap<String, Vec<String>> =
            vertices.iter().map(|v| (v.clone(), Vec::new())).collect();
        let mut childs = preds.clone();
        for (from, to) in edges {
            childs.get_mut(*from).unwrap().push((*to).to_owned());
            preds.get_mut(*to).unwrap().push((*from).to_owned());
        }
        (vertices, preds, childs)
    }

    fn ranks_of(
        edges: &[(&str, &str)],
        vertices: &[&str],
    ) -> Result<BTreeMap<String, usize>, CycleError> {
        let (vertices, preds, childs) = graph(edges, vertices);
        rank_sort(
            &vertices,
            |v| preds[v].clone(),
            |v| childs[v].clone(),
        )
    }

    #[test]
    fn test_chain_ranks() {
        let ranks = ranks_of(&[("a", "b"), ("b", "c")], &["a", "b", "c"]).unwrap();
        assert_eq!(ranks["a"], 0);
        assert_eq!(ranks["b"], 1);
        assert_eq!(ranks["c"], 2);
    }

    #[test]
    fn test_diamond_uses_longest_path() {
        // a -> b -> d, a -> d: d must come after b.
        let ranks = ranks_of(&[("a", "b"), ("b", "d"), ("a", "d")], &["a", "b", "d"]).unwrap();
        assert_eq!(ranks["a"], 0);
        assert_eq!(ranks["b"], 1);
        assert_eq!(ranks["d"], 2);
    }

    #[test]
    fn test_every_edge_increases_rank() {
        let edges = [("a", "b"), ("a", "c"), ("c", "d"), ("b", "d"), ("d", "e")];
        let ranks = ranks_of(&edges, &["a", "b", "c", "d", "e"]).unwrap();
        for (from, to) in edges {
            assert!(ranks[from] < ranks[to], "edge {from}->{to}");
        }
    }

    #[test]
    fn test_multiple_components() {
        let ranks = ranks_of(&[("a", "b"), ("x", "y")], &["a", "b", "x", "y"]).unwrap();
        assert_eq!(ranks["a"], 0);
        assert_eq!(ranks["x"], 0);
        assert_eq!(ranks["b"], 1);
        assert_eq!(ranks["y"], 1);
    }

    #[test]
    fn test_two_cycle_raises() {
        let err = ranks_of(&[("a", "b"), ("b", "a")], &["a", "b"]).unwrap_err();
        assert!(err.vertices.contains(&"a".to_owned()) || err.vertices.contains(&"b".to_owned()));
    }

    #[test]
    fn test_larger_cycle_raises() {
        let err = ranks_of(
            &[("a", "b"), ("b", "c"), ("c", "a")],
            &["a", "b", "c"],
        )
        .unwrap_err();
        assert!(!err.vertices.is_empty());
    }

    #[test]
    fn test_transitive_closure_includes_start() {
        let (_, _, childs) = graph(&[("a", "b"), ("b", "c"), ("x", "y")], &["a", "b", "c", "x", "y"]);
        let start: BTreeSet<String> = ["a".to_owned()].into();
        let closure = transitive_closure(&start, |v| childs[v].clone());
        assert_eq!(
            closure,
            ["a".to_owned(), "b".to_owned(), "c".to_owned()].into()
        );
    }
}
