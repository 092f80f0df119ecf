//! Dependency resolution into provisioning batches

use crate::error::TemplateError;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Layer a dependency map into batches.
///
/// `deps` maps each logical id to the ids it must come after. Each batch is
/// the maximal set whose dependencies are all in earlier batches, sorted
/// lexically. Dependencies on ids missing from the map are ignored.
pub fn resolve(deps: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<Vec<String>>, TemplateError> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = deps
        .iter()
        .map(|(id, targets)| {
            let known = targets
                .iter()
                .map(String::as_str)
                .filter(|t| deps.contains_key(*t))
                .collect();
            (id.as_str(), known)
        })
        .collect();

    let mut batches = Vec::new();
    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, targets)| targets.is_empty())
            .map(|(id, _)| *id)
            .collect();

        if ready.is_empty() {
            return Err(TemplateError::CyclicDependency {
                cycle: shortest_cycle(&remaining),
            });
        }

        for id in &ready {
            remaining.remove(id);
        }
        for targets in remaining.values_mut() {
            for id in &ready {
                targets.remove(id);
            }
        }
        batches.push(ready.into_iter().map(str::to_string).collect());
    }

    Ok(batches)
}

/// Batches for teardown: dependents before their dependencies
pub fn reverse(batches: &[Vec<String>]) -> Vec<Vec<String>> {
    batches.iter().rev().cloned().collect()
}

/// Find the shortest cycle among nodes that could not be layered.
///
/// Ties are broken by comparing the paths lexically, so the reported cycle
/// starts at its smallest member.
fn shortest_cycle(remaining: &BTreeMap<&str, BTreeSet<&str>>) -> Vec<String> {
    let mut best: Option<Vec<&str>> = None;

    for start in remaining.keys() {
        let Some(path) = cycle_through(remaining, start) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some(current) => (path.len(), &path) < (current.len(), current),
        };
        if better {
            best = Some(path);
        }
    }

    best.unwrap_or_default()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Breadth-first search from `start` back to itself
fn cycle_through<'a>(graph: &BTreeMap<&'a str, BTreeSet<&'a str>>, start: &'a str) -> Option<Vec<&'a str>> {
    let mut parent: BTreeMap<&str, &str> = BTreeMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        for next in graph.get(node).into_iter().flatten() {
            if *next == start {
                let mut path = vec![start];
                let mut cursor = node;
                while cursor != start {
                    path.push(cursor);
                    cursor = parent.get(cursor).copied()?;
                }
                path.push(start);
                let end = path.len() - 1;
                path[1..end].reverse();
                return Some(path);
            }
            if !parent.contains_key(next) && graph.contains_key(next) {
                parent.insert(*next, node);
                queue.push_back(*next);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(edges: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        edges
            .iter()
            .map(|(id, targets)| {
                (
                    (*id).to_string(),
                    targets.iter().map(|t| (*t).to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_fan_out_batches() {
        let graph = deps(&[("A", &[]), ("C", &["A"]), ("B", &["A"])]);
        let batches = resolve(&graph).unwrap();
        assert_eq!(batches, vec![vec!["A"], vec!["B", "C"]]);
    }

    #[test]
    fn test_dependencies_land_in_earlier_batches() {
        let graph = deps(&[
            ("App", &["Db", "Net"]),
            ("Db", &["Net"]),
            ("Net", &[]),
            ("Dns", &["App"]),
            ("Logs", &[]),
        ]);
        let batches = resolve(&graph).unwrap();

        let position: BTreeMap<&str, usize> = batches
            .iter()
            .enumerate()
            .flat_map(|(i, batch)| batch.iter().map(move |id| (id.as_str(), i)))
            .collect();
        for (id, targets) in &graph {
            for target in targets {
                assert!(position[id.as_str()] > position[target.as_str()]);
            }
        }
        assert_eq!(batches[0], vec!["Logs", "Net"]);
    }

    #[test]
    fn test_two_node_cycle() {
        let graph = deps(&[("A", &["B"]), ("B", &["A"])]);
        let err = resolve(&graph).unwrap_err();
        assert_eq!(
            err,
            TemplateError::CyclicDependency {
                cycle: vec!["A".into(), "B".into(), "A".into()]
            }
        );
    }

    #[test]
    fn test_shortest_cycle_is_reported() {
        // C -> D -> E -> C is longer than X -> Y -> X
        let graph = deps(&[
            ("C", &["D"]),
            ("D", &["E"]),
            ("E", &["C"]),
            ("X", &["Y"]),
            ("Y", &["X"]),
            ("Root", &[]),
        ]);
        let err = resolve(&graph).unwrap_err();
        assert_eq!(err.to_string(), "cyclic dependency: X -> Y -> X");
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let graph = deps(&[("A", &["A"])]);
        let err = resolve(&graph).unwrap_err();
        assert_eq!(err.to_string(), "cyclic dependency: A -> A");
    }

    #[test]
    fn test_three_node_cycle_starts_at_smallest() {
        let graph = deps(&[("B", &["C"]), ("C", &["A"]), ("A", &["B"]), ("D", &["A"])]);
        let err = resolve(&graph).unwrap_err();
        assert_eq!(err.to_string(), "cyclic dependency: A -> B -> C -> A");
    }

    #[test]
    fn test_reverse_layering() {
        let batches = vec![vec!["A".to_string()], vec!["B".to_string(), "C".to_string()]];
        assert_eq!(
            reverse(&batches),
            vec![vec!["B".to_string(), "C".to_string()], vec!["A".to_string()]]
        );
    }

    #[test]
    fn test_unknown_dependencies_ignored() {
        let graph = deps(&[("A", &["Gone"])]);
        assert_eq!(resolve(&graph).unwrap(), vec![vec!["A"]]);
    }
}
