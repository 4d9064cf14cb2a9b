//! Dependency ordering of registered services.

use std::collections::{HashMap, VecDeque};

use crate::types::{Error, Result};

/// One node of the service graph: a name and the names it depends on.
pub(crate) struct Node<'a> {
    pub name: &'a str,
    pub depends_on: &'a [String],
}

/// Find a cycle with DFS, returning its path closed on the first node
/// (`a -> b -> a`).
fn detect_cycle(names: &[&str], adj: &[Vec<usize>]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White, // unvisited
        Gray,  // on the current path
        Black, // finished
    }

    fn dfs(
        node: usize,
        names: &[&str],
        adj: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        colors[node] = Color::Gray;
        path.push(node);

        for &next in &adj[node] {
            match colors[next] {
                Color::Gray => {
                    if let Some(start) = path.iter().position(|&n| n == next) {
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|&i| names[i].to_string()).collect();
                        cycle.push(names[next].to_string());
                        return Some(cycle);
                    }
                }
                Color::White => {
                    if let Some(cycle) = dfs(next, names, adj, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; names.len()];
    let mut path = Vec::new();
    for i in 0..names.len() {
        if colors[i] == Color::White {
            if let Some(cycle) = dfs(i, names, adj, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Compute a start order (indices into `nodes`) in which every service
/// comes after all of its dependencies.
///
/// Ties are broken by registration order. Unknown dependencies and cycles
/// are reported before any order is produced.
pub(crate) fn start_order(nodes: &[Node<'_>]) -> Result<Vec<usize>> {
    let names: Vec<&str> = nodes.iter().map(|n| n.name).collect();
    let index: HashMap<&str, usize> = names.iter().enumerate().map(|(i, &n)| (n, i)).collect();

    // Edge dependency -> dependent.
    let mut adj = vec![Vec::<usize>::new(); nodes.len()];
    for (u, node) in nodes.iter().enumerate() {
        for dep in node.depends_on {
            let v = *index
                .get(dep.as_str())
                .ok_or_else(|| Error::UnknownDependency {
                    service: node.name.to_string(),
                    depends_on: dep.clone(),
                })?;
            adj[v].push(u);
        }
    }

    // Dependency edges run dependency -> dependent; report the cycle the
    // way it reads in declarations (dependent -> dependency).
    if let Some(mut cycle) = detect_cycle(&names, &adj) {
        cycle.reverse();
        return Err(Error::CycleDetected { path: cycle });
    }

    // Kahn's algorithm; no cycles past this point.
    let mut indegree = vec![0usize; nodes.len()];
    for targets in &adj {
        for &t in targets {
            indegree[t] += 1;
        }
    }

    let mut queue: VecDeque<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(u) = queue.pop_front() {
        order.push(u);
        for &w in &adj[u] {
            indegree[w] -= 1;
            if indegree[w] == 0 {
                queue.push_back(w);
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(Error::internal("dependency graph could not be linearized"));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn order_of(graph: &[(&str, Vec<String>)]) -> Result<Vec<String>> {
        let nodes: Vec<Node<'_>> = graph
            .iter()
            .map(|(name, d)| Node {
                name,
                depends_on: d,
            })
            .collect();
        start_order(&nodes).map(|order| order.into_iter().map(|i| graph[i].0.to_string()).collect())
    }

    #[test]
    fn test_dependencies_come_first() {
        let graph = vec![
            ("playlist", deps(&["library", "tags"])),
            ("library", deps(&["database"])),
            ("tags", deps(&["database"])),
            ("database", deps(&[])),
        ];
        assert_eq!(
            order_of(&graph).unwrap(),
            vec!["database", "library", "tags", "playlist"]
        );
    }

    #[test]
    fn test_independent_services_keep_registration_order() {
        let graph = vec![("c", deps(&[])), ("a", deps(&[])), ("b", deps(&[]))];
        assert_eq!(order_of(&graph).unwrap(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let graph = vec![("a", deps(&["missing"]))];
        match order_of(&graph).unwrap_err() {
            Error::UnknownDependency {
                service,
                depends_on,
            } => {
                assert_eq!(service, "a");
                assert_eq!(depends_on, "missing");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_cycle_reported_with_path() {
        let graph = vec![
            ("a", deps(&["b"])),
            ("b", deps(&["c"])),
            ("c", deps(&["a"])),
            ("d", deps(&[])),
        ];
        match order_of(&graph).unwrap_err() {
            Error::CycleDetected { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
                for name in ["a", "b", "c"] {
                    assert!(path.iter().any(|p| p == name));
                }
                assert!(!path.iter().any(|p| p == "d"));

                let message = Error::CycleDetected { path }.to_string();
                assert!(message.contains("cyclic dependency detected"));
                assert!(message.contains("->"));
            }
            other => panic!("expected CycleDetected, got: {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let graph = vec![("a", deps(&["a"]))];
        assert!(matches!(
            order_of(&graph).unwrap_err(),
            Error::CycleDetected { .. }
        ));
    }
}
