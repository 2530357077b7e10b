//! Power-iteration page rank over a harvested link graph.

use std::collections::HashMap;

use ndarray::{Array1, Array2};

/// Rank the columns of a column-stochastic adjacency matrix.
///
/// `matrix[(i, j)]` is the probability of moving from node `j` to node `i`.
#[must_use]
pub fn page_rank(matrix: &Array2<f64>, iterations: usize, damping: f64) -> Array1<f64> {
    let n = matrix.ncols();
    if n == 0 {
        return Array1::zeros(0);
    }
    let uniform = 1.0 / n as f64;
    let mut rank = Array1::from_elem(n, uniform);
    let hat = matrix * damping + (1.0 - damping) * uniform;
    for _ in 0..iterations {
        rank = hat.dot(&rank);
    }
    rank
}

/// Build a column-stochastic matrix from directed edges, returning the node
/// identifiers in column order. Dangling nodes link uniformly everywhere.
#[must_use]
pub fn adjacency_from_edges(edges: &[(i64, i64)]) -> (Array2<f64>, Vec<i64>) {
    let mut nodes: Vec<i64> = edges
        .iter()
        .flat_map(|(from, to)| [*from, *to])
        .collect();
    nodes.sort_unstable();
    nodes.dedup();
    let index: HashMap<i64, usize> = nodes
        .iter()
        .enumerate()
        .map(|(position, id)| (*id, position))
        .collect();

    let n = nodes.len();
    let mut matrix = Array2::zeros((n, n));
    let mut out_degree = vec![0usize; n];
    for (from, _) in edges {
        out_degree[index[from]] += 1;
    }
    for (from, to) in edges {
        let column = index[from];
        let row = index[to];
        matrix[(row, column)] += 1.0 / out_degree[column] as f64;
    }
    // A node with no outgoing links teleports uniformly.
    if n > 0 {
        let uniform = 1.0 / n as f64;
        for (column, degree) in out_degree.iter().enumerate() {
            if *degree == 0 {
                for row in 0..n {
                    matrix[(row, column)] = uniform;
                }
            }
        }
    }
    (matrix, nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_pair_ranks_equally() {
        let (matrix, nodes) = adjacency_from_edges(&[(1, 2), (2, 1)]);
        let ranks = page_rank(&matrix, 100, 0.5);

        assert_eq!(nodes, vec![1, 2]);
        assert!((ranks[0] - ranks[1]).abs() < 1e-9);
    }

    #[test]
    fn a_node_everyone_links_to_ranks_highest() {
        let (matrix, nodes) = adjacency_from_edges(&[(1, 3), (2, 3), (3, 1)]);
        let ranks = page_rank(&matrix, 100, 0.85);

        let hub = nodes.iter().position(|id| *id == 3).expect("node present");
        for (position, _) in nodes.iter().enumerate() {
            if position != hub {
                assert!(ranks[hub] > ranks[position]);
            }
        }
    }

    #[test]
    fn rank_mass_is_conserved() {
        let (matrix, _) = adjacency_from_edges(&[(1, 2), (2, 3), (3, 1), (1, 3)]);
        let ranks = page_rank(&matrix, 50, 0.85);
        let total: f64 = ranks.sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_graph_yields_empty_ranking() {
        let (matrix, nodes) = adjacency_from_edges(&[]);
        assert!(nodes.is_empty());
        assert_eq!(page_rank(&matrix, 10, 0.5).len(), 0);
    }
}
