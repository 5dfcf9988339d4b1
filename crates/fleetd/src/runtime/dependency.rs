//! Dependency graph construction and topological sorting

use crate::config::ServiceDescriptor;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};

/// Service dependency graph
#[derive(Debug)]
pub struct DependencyGraph {
    /// Service names in topological order
    order: Vec<String>,
    /// Direct dependencies per service
    dependencies: HashMap<String, Vec<String>>,
    /// Startup level: 0 for services without dependencies
    levels: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build the graph from a descriptor set
    pub fn build(descriptors: &[ServiceDescriptor]) -> Result<Self, DependencyError> {
        // Declaration order keeps the sort deterministic
        let nodes: IndexMap<&str, &ServiceDescriptor> = descriptors
            .iter()
            .map(|d| (d.name.as_str(), d))
            .collect();

        for (name, descriptor) in &nodes {
            for dep in &descriptor.dependencies {
                if !nodes.contains_key(dep.as_str()) {
                    return Err(DependencyError::UnknownDependency {
                        service: name.to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let order = Self::topological_sort(&nodes)?;

        let dependencies: HashMap<String, Vec<String>> = nodes
            .iter()
            .map(|(name, d)| (name.to_string(), d.dependencies.clone()))
            .collect();

        let mut levels: HashMap<String, usize> = HashMap::new();
        for name in &order {
            let level = dependencies
                .get(name)
                .into_iter()
                .flatten()
                .filter_map(|dep| levels.get(dep))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            levels.insert(name.clone(), level);
        }

        Ok(Self {
            order,
            dependencies,
            levels,
        })
    }

    /// Topological sort using Kahn's algorithm
    fn topological_sort(
        nodes: &IndexMap<&str, &ServiceDescriptor>,
    ) -> Result<Vec<String>, DependencyError> {
        let mut in_degree: IndexMap<&str, usize> = IndexMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, descriptor) in nodes {
            in_degree.entry(*name).or_insert(0);
            for dep in &descriptor.dependencies {
                *in_degree.entry(*name).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(*name);
            }
        }

        // Start with services that have no dependencies
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut sorted: Vec<String> = Vec::with_capacity(nodes.len());

        while let Some(name) = queue.pop_front() {
            sorted.push(name.to_string());

            if let Some(deps) = dependents.get(name) {
                for dependent in deps {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*dependent);
                        }
                    }
                }
            }
        }

        if sorted.len() != nodes.len() {
            let sorted_names: HashSet<&str> = sorted.iter().map(String::as_str).collect();
            let cycle: Vec<String> = nodes
                .keys()
                .filter(|name| !sorted_names.contains(*name))
                .map(|name| name.to_string())
                .collect();

            return Err(DependencyError::CyclicDependency(cycle));
        }

        Ok(sorted)
    }

    /// Startup order
    pub fn launch_order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Shutdown order (reverse of launch order)
    pub fn shutdown_order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().rev().map(String::as_str)
    }

    /// Services grouped by startup level; each level only depends on earlier ones
    pub fn levels(&self) -> Vec<Vec<String>> {
        let depth = self.levels.values().max().map(|l| l + 1).unwrap_or(0);
        let mut levels = vec![Vec::new(); depth];
        for name in &self.order {
            if let Some(&level) = self.levels.get(name) {
                levels[level].push(name.clone());
            }
        }
        levels
    }

    /// Direct dependencies of a service
    pub fn dependencies_of(&self, service: &str) -> &[String] {
        self.dependencies
            .get(service)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Services that directly depend on `service`
    pub fn dependents(&self, service: &str) -> Vec<&str> {
        self.order
            .iter()
            .filter(|name| self.dependencies_of(name).iter().any(|d| d == service))
            .map(String::as_str)
            .collect()
    }

    /// `roots` plus everything they transitively depend on
    pub fn closure<'a>(&self, roots: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<String> = roots.into_iter().map(str::to_string).collect();
        while let Some(name) = stack.pop() {
            if seen.insert(name.clone()) {
                stack.extend(self.dependencies_of(&name).iter().cloned());
            }
        }
        seen
    }
}

/// Errors that can occur when building the dependency graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Cyclic dependency detected involving services: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Criticality, ServiceType};

    fn service(name: &str, deps: &[&str]) -> ServiceDescriptor {
        let mut d = ServiceDescriptor::new(
            name,
            ServiceType::Core,
            Criticality::Important,
            format!("bin/{}", name),
            ".",
            "http://127.0.0.1:1/health",
        );
        d.dependencies = deps.iter().map(|s| s.to_string()).collect();
        d
    }

    #[test]
    fn test_simple_dependency_order() {
        let graph = DependencyGraph::build(&[
            service("c", &["b"]),
            service("b", &["a"]),
            service("a", &[]),
        ])
        .unwrap();

        let order: Vec<_> = graph.launch_order().collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        let shutdown: Vec<_> = graph.shutdown_order().collect();
        assert_eq!(shutdown, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_diamond_dependency() {
        let graph = DependencyGraph::build(&[
            service("a", &[]),
            service("b", &["a"]),
            service("c", &["a"]),
            service("d", &["b", "c"]),
        ])
        .unwrap();

        let order: Vec<_> = graph.launch_order().collect();
        // a must come first, d must come last, b and c can be in any order
        assert_eq!(order[0], "a");
        assert_eq!(order[3], "d");
        assert_eq!(
            graph.levels(),
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
        assert_eq!(graph.dependents("a"), vec!["b", "c"]);
    }

    #[test]
    fn test_cyclic_dependency_detection() {
        let result = DependencyGraph::build(&[
            service("a", &["c"]),
            service("b", &["a"]),
            service("c", &["b"]),
            service("gateway", &[]),
        ]);

        match result {
            Err(DependencyError::CyclicDependency(cycle)) => {
                assert_eq!(cycle, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency_error() {
        let result = DependencyGraph::build(&[service("b", &["a"])]);
        assert!(matches!(
            result,
            Err(DependencyError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_closure_pulls_in_dependencies() {
        let graph = DependencyGraph::build(&[
            service("db", &[]),
            service("auth", &["db"]),
            service("gateway", &["auth"]),
            service("media", &[]),
        ])
        .unwrap();

        let needed = graph.closure(["gateway"]);
        assert_eq!(needed.len(), 3);
        assert!(needed.contains("db"));
        assert!(!needed.contains("media"));
    }
}
