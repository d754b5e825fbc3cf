// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dependency levels of a directed acyclic graph.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub(crate) enum DagError {
    #[error("Work items {0:?} depend on each other")]
    Cycle(Vec<usize>),

    #[error("Edge {from} -> {to} refers to a node that doesn't exist ({n} nodes)")]
    BadEdge { from: usize, to: usize, n: usize },
}

/// Sort `n` nodes into levels such that every edge `(from, to)` goes from a
/// lower level to a higher one. Nodes within a level keep their index order.
pub(crate) fn levels(n: usize, edges: &[(usize, usize)]) -> Result<Vec<Vec<usize>>, DagError> {
    let mut in_degree = vec![0usize; n];
    let mut children: Vec<Vec<usize>> = vec![vec![]; n];
    for &(from, to) in edges {
        if from >= n || to >= n {
            return Err(DagError::BadEdge { from, to, n });
        }
        children[from].push(to);
        in_degree[to] += 1;
    }

    let mut levels = vec![];
    let mut current: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut placed = 0;
    while !current.is_empty() {
        placed += current.len();
        let mut next = vec![];
        for &node in &current {
            for &child in &children[node] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    next.push(child);
                }
            }
        }
        next.sort_unstable();
        levels.push(current);
        current = next;
    }

    if placed < n {
        return Err(DagError::Cycle(
            (0..n).filter(|&i| in_degree[i] > 0).collect(),
        ));
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        // 0 -> 1 -> 3, 0 -> 2 -> 3, 4 alone.
        let edges = [(0, 1), (0, 2), (1, 3), (2, 3)];
        assert_eq!(
            levels(5, &edges).unwrap(),
            vec![vec![0, 4], vec![1, 2], vec![3]]
        );
    }

    #[test]
    fn test_duplicate_edges() {
        assert_eq!(
            levels(2, &[(0, 1), (0, 1)]).unwrap(),
            vec![vec![0], vec![1]]
        );
    }

    #[test]
    fn test_cycle() {
        assert_eq!(
            levels(3, &[(0, 1), (1, 2), (2, 1)]),
            Err(DagError::Cycle(vec![1, 2]))
        );
        assert!(matches!(levels(1, &[(0, 3)]), Err(DagError::BadEdge { .. })));
    }

    #[test]
    fn test_empty() {
        assert!(levels(0, &[]).unwrap().is_empty());
    }
}
