use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::errors::{Error, Result};

/// Validated dependency DAG. Edges point from a service to the services it
/// depends on.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph, rejecting unknown dependencies, self-edges and cycles.
    pub fn new<I, D>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, D)>,
        D: IntoIterator<Item = String>,
    {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (id, deps) in nodes {
            let deps: BTreeSet<String> = deps.into_iter().collect();
            if deps.contains(&id) {
                return Err(Error::validation(format!("service '{}' depends on itself", id)));
            }
            if edges.insert(id.clone(), deps).is_some() {
                return Err(Error::validation(format!("service '{}' is declared twice", id)));
            }
        }

        for (id, deps) in &edges {
            if let Some(unknown) = deps.iter().find(|d| !edges.contains_key(*d)) {
                return Err(Error::validation(format!(
                    "service '{}' depends on unknown service '{}'",
                    id, unknown
                )));
            }
        }

        let order = topological_order(&edges)?;
        Ok(Self { edges, order })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.edges.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Every service, dependencies before dependents. Ties break by name.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn dependencies(&self, id: &str) -> impl Iterator<Item = &String> {
        self.edges.get(id).into_iter().flatten()
    }

    /// Services that directly or transitively depend on `id`.
    pub fn dependents(&self, id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for (candidate, deps) in &self.edges {
                if deps.contains(&current) && found.insert(candidate.clone()) {
                    queue.push_back(candidate.clone());
                }
            }
        }
        found
    }

    /// Restart sequence for `roots`: the roots plus everything downstream of
    /// them, in dependency order.
    pub fn restart_order<'a>(&self, roots: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut affected = BTreeSet::new();
        for root in roots {
            if self.contains(root) {
                affected.insert(root.to_string());
                affected.extend(self.dependents(root));
            }
        }
        self.order.iter().filter(|id| affected.contains(*id)).cloned().collect()
    }
}

/// Kahn's algorithm over a name-ordered ready set so the result is stable.
fn topological_order(edges: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>> {
    let mut remaining: BTreeMap<&str, usize> =
        edges.iter().map(|(id, deps)| (id.as_str(), deps.len())).collect();
    let mut ready: BTreeSet<&str> =
        remaining.iter().filter(|(_, n)| **n == 0).map(|(id, _)| *id).collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(id) = ready.pop_first() {
        remaining.remove(id);
        order.push(id.to_string());
        for (candidate, deps) in edges {
            if deps.contains(id) {
                if let Some(count) = remaining.get_mut(candidate.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(candidate.as_str());
                    }
                }
            }
        }
    }

    if !remaining.is_empty() {
        let cycle: Vec<&str> = remaining.keys().copied().collect();
        return Err(Error::validation(format!(
            "dependency cycle among services: {}",
            cycle.join(", ")
        )));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(spec: &[(&str, &[&str])]) -> Result<DependencyGraph> {
        DependencyGraph::new(
            spec.iter()
                .map(|(id, deps)| (id.to_string(), deps.iter().map(|d| d.to_string()).collect::<Vec<_>>())),
        )
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let g = graph(&[("c", &["b"]), ("b", &["a"]), ("a", &[]), ("d", &[])]).unwrap();
        let pos = |id: &str| g.order().iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        assert_eq!(g.len(), 4);
    }

    #[test]
    fn test_cycle_detected() {
        let err = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cycle"));
        assert!(!message.contains("d"));
    }

    #[test]
    fn test_unknown_and_self_dependencies_rejected() {
        assert!(graph(&[("a", &["ghost"])]).unwrap_err().to_string().contains("ghost"));
        assert!(graph(&[("a", &["a"])]).is_err());
    }

    #[test]
    fn test_restart_order_includes_downstream() {
        let g = graph(&[
            ("postgres", &[]),
            ("pgbouncer", &["postgres"]),
            ("api", &["pgbouncer"]),
            ("redis", &[]),
        ])
        .unwrap();
        assert_eq!(g.restart_order(["postgres"]), vec!["postgres", "pgbouncer", "api"]);
        assert_eq!(g.restart_order(["redis"]), vec!["redis"]);
        assert!(g.restart_order(["unknown"]).is_empty());
        assert_eq!(g.dependents("pgbouncer"), BTreeSet::from(["api".to_string()]));
    }
}
