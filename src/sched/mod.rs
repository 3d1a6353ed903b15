//! Best-effort test scheduling.
//!
//! Dependency edges are heuristic (shared module stems, integration-suite
//! naming) and make no accuracy guarantee. Ordering guarantees only that a
//! dependency precedes its dependent for acyclic subsets.

mod history;

pub use history::{AggregateCounters, ExecutionHistory, load_perf_snapshot, save_perf_snapshot};

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyAnalysis {
    /// Files with no dependencies inside the analyzed set.
    pub independent: Vec<String>,
    pub dependent: Vec<String>,
    pub cycles: Vec<Vec<String>>,
    pub longest_chain: usize,
}

pub struct TestSchedulingGraph {
    deps: HashMap<String, HashSet<String>>,
    history: Arc<ExecutionHistory>,
}

impl TestSchedulingGraph {
    pub fn new(history: Arc<ExecutionHistory>) -> Self {
        Self {
            deps: HashMap::new(),
            history,
        }
    }

    pub fn history(&self) -> &Arc<ExecutionHistory> {
        &self.history
    }

    pub fn add_dependency(
        &mut self,
        file: impl Into<String>,
        depends_on: impl IntoIterator<Item = impl Into<String>>,
    ) {
        let file = file.into();
        let entry = self.deps.entry(file.clone()).or_default();
        for dep in depends_on {
            let dep = dep.into();
            if dep != file {
                entry.insert(dep);
            }
        }
    }

    pub fn dependencies_of(&self, file: &str) -> Option<&HashSet<String>> {
        self.deps.get(file)
    }

    /// Derive heuristic edges among `files`: a test file depends on the file
    /// sharing its module stem, and integration-suite files depend on the
    /// non-integration files in their directory.
    pub fn infer_dependencies(&mut self, files: &[String]) {
        let set: HashSet<&String> = files.iter().collect();

        for file in files {
            let mut inferred: Vec<String> = Vec::new();

            if let Some(stem) = test_module_stem(file) {
                for candidate in &set {
                    if *candidate != file && module_stem(candidate.as_str()) == stem {
                        inferred.push((*candidate).clone());
                    }
                }
            }

            if is_integration(file) {
                let dir = parent_dir(file);
                for candidate in &set {
                    if *candidate != file
                        && !is_integration(candidate.as_str())
                        && parent_dir(candidate.as_str()) == dir
                    {
                        inferred.push((*candidate).clone());
                    }
                }
            }

            if !inferred.is_empty() {
                debug!(file, deps = inferred.len(), "Inferred dependencies");
                self.add_dependency(file.clone(), inferred);
            }
        }
    }

    /// Dependency-respecting order over `files`: depth-first post-order
    /// restricted to the given set, preferring historically fast files
    /// wherever no edge constrains the choice. Cycle back-edges are skipped,
    /// so every input file appears exactly once.
    pub fn optimal_order(&self, files: &[String]) -> Vec<String> {
        let set: HashSet<&str> = files.iter().map(String::as_str).collect();
        let mut roots: Vec<&str> = files.iter().map(String::as_str).collect();
        self.sort_by_preference(&mut roots);

        let mut order: Vec<String> = Vec::with_capacity(files.len());
        let mut visited: HashSet<&str> = HashSet::new();
        let mut on_stack: HashSet<&str> = HashSet::new();

        for root in roots {
            self.visit(root, &set, &mut visited, &mut on_stack, &mut order);
        }
        order
    }

    fn visit<'a>(
        &'a self,
        file: &'a str,
        set: &HashSet<&'a str>,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        order: &mut Vec<String>,
    ) {
        if visited.contains(file) || on_stack.contains(file) {
            return;
        }
        on_stack.insert(file);

        if let Some(deps) = self.deps.get(file) {
            let mut in_set: Vec<&str> = deps
                .iter()
                .map(String::as_str)
                .filter(|d| set.contains(d))
                .collect();
            self.sort_by_preference(&mut in_set);
            for dep in in_set {
                self.visit(dep, set, visited, on_stack, order);
            }
        }

        on_stack.remove(file);
        visited.insert(file);
        order.push(file.to_string());
    }

    /// Descending weight; name as a deterministic tie-break.
    fn sort_by_preference(&self, files: &mut [&str]) {
        files.sort_by(|a, b| {
            self.history
                .weight(b)
                .partial_cmp(&self.history.weight(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });
    }

    /// Partition `files`, detect cycles, and measure the longest chain.
    pub fn analyze(&self, files: &[String]) -> DependencyAnalysis {
        let set: HashSet<&str> = files.iter().map(String::as_str).collect();

        let mut independent = Vec::new();
        let mut dependent = Vec::new();
        for file in files {
            let has_in_set_dep = self
                .deps
                .get(file)
                .is_some_and(|deps| deps.iter().any(|d| set.contains(d.as_str())));
            if has_in_set_dep {
                dependent.push(file.clone());
            } else {
                independent.push(file.clone());
            }
        }

        let cycles = self.find_cycles(files, &set);

        let mut chain_memo: HashMap<&str, usize> = HashMap::new();
        let mut longest_chain = 0;
        for file in files {
            let mut on_stack = HashSet::new();
            let depth = self.chain_depth(file, &set, &mut chain_memo, &mut on_stack);
            longest_chain = longest_chain.max(depth);
        }

        DependencyAnalysis {
            independent,
            dependent,
            cycles,
            longest_chain,
        }
    }

    fn find_cycles(&self, files: &[String], set: &HashSet<&str>) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();

        for file in files {
            let mut stack: Vec<&str> = Vec::new();
            self.cycle_dfs(file, set, &mut visited, &mut stack, &mut cycles);
        }
        cycles
    }

    fn cycle_dfs<'a>(
        &'a self,
        file: &'a str,
        set: &HashSet<&'a str>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        if let Some(pos) = stack.iter().position(|f| *f == file) {
            cycles.push(stack[pos..].iter().map(|f| f.to_string()).collect());
            return;
        }
        if visited.contains(file) {
            return;
        }
        stack.push(file);
        if let Some(deps) = self.deps.get(file) {
            for dep in deps {
                if set.contains(dep.as_str()) {
                    self.cycle_dfs(dep, set, visited, stack, cycles);
                }
            }
        }
        stack.pop();
        visited.insert(file);
    }

    fn chain_depth<'a>(
        &'a self,
        file: &'a str,
        set: &HashSet<&'a str>,
        memo: &mut HashMap<&'a str, usize>,
        on_stack: &mut HashSet<&'a str>,
    ) -> usize {
        if let Some(depth) = memo.get(file) {
            return *depth;
        }
        if !on_stack.insert(file) {
            // Back edge inside a cycle contributes no further depth.
            return 0;
        }

        let mut max_dep = 0;
        if let Some(deps) = self.deps.get(file) {
            for dep in deps {
                if set.contains(dep.as_str()) {
                    max_dep = max_dep.max(self.chain_depth(dep, set, memo, on_stack));
                }
            }
        }
        on_stack.remove(file);
        let depth = max_dep + 1;
        memo.insert(file, depth);
        depth
    }
}

fn parent_dir(file: &str) -> &str {
    Path::new(file)
        .parent()
        .and_then(Path::to_str)
        .unwrap_or("")
}

fn file_stem(file: &str) -> &str {
    Path::new(file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file)
}

/// `foo_test`, `test_foo`, `foo.test`, `foo.spec` → `foo`; otherwise None.
fn test_module_stem(file: &str) -> Option<String> {
    let stem = file_stem(file);
    for (prefix, suffix) in [
        ("", "_test"),
        ("test_", ""),
        ("", ".test"),
        ("", ".spec"),
    ] {
        if !prefix.is_empty() && stem.len() > prefix.len() && stem.starts_with(prefix) {
            return Some(stem[prefix.len()..].to_string());
        }
        if !suffix.is_empty() && stem.len() > suffix.len() && stem.ends_with(suffix) {
            return Some(stem[..stem.len() - suffix.len()].to_string());
        }
    }
    None
}

fn module_stem(file: &str) -> String {
    test_module_stem(file).unwrap_or_else(|| file_stem(file).to_string())
}

fn is_integration(file: &str) -> bool {
    file.contains("integration")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> TestSchedulingGraph {
        TestSchedulingGraph::new(Arc::new(ExecutionHistory::new(10)))
    }

    fn files(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn position(order: &[String], file: &str) -> usize {
        order.iter().position(|f| f == file).unwrap()
    }

    #[test]
    fn dependency_precedes_dependent() {
        let mut graph = graph();
        graph.add_dependency("a.rs", ["b.rs"]);

        let order = graph.optimal_order(&files(&["a.rs", "b.rs"]));
        assert_eq!(order.len(), 2);
        assert!(position(&order, "b.rs") < position(&order, "a.rs"));
    }

    #[test]
    fn transitive_chain_is_respected() {
        let mut graph = graph();
        graph.add_dependency("c.rs", ["b.rs"]);
        graph.add_dependency("b.rs", ["a.rs"]);

        let order = graph.optimal_order(&files(&["c.rs", "a.rs", "b.rs"]));
        assert!(position(&order, "a.rs") < position(&order, "b.rs"));
        assert!(position(&order, "b.rs") < position(&order, "c.rs"));
    }

    #[test]
    fn faster_files_come_first_among_unconstrained() {
        let history = Arc::new(ExecutionHistory::new(10));
        history.record("slow.rs", 30_000);
        history.record("fast.rs", 50);
        let graph = TestSchedulingGraph::new(history);

        let order = graph.optimal_order(&files(&["slow.rs", "fast.rs"]));
        assert_eq!(order, files(&["fast.rs", "slow.rs"]));
    }

    #[test]
    fn edges_outside_the_input_set_are_ignored() {
        let mut graph = graph();
        graph.add_dependency("a.rs", ["external.rs"]);

        let order = graph.optimal_order(&files(&["a.rs"]));
        assert_eq!(order, files(&["a.rs"]));
    }

    #[test]
    fn cyclic_input_still_yields_every_file_once() {
        let mut graph = graph();
        graph.add_dependency("a.rs", ["b.rs"]);
        graph.add_dependency("b.rs", ["a.rs"]);

        let mut order = graph.optimal_order(&files(&["a.rs", "b.rs"]));
        order.sort();
        assert_eq!(order, files(&["a.rs", "b.rs"]));
    }

    #[test]
    fn analyze_partitions_and_measures_chains() {
        let mut graph = graph();
        graph.add_dependency("c.rs", ["b.rs"]);
        graph.add_dependency("b.rs", ["a.rs"]);

        let analysis = graph.analyze(&files(&["a.rs", "b.rs", "c.rs", "free.rs"]));
        assert_eq!(analysis.independent, files(&["a.rs", "free.rs"]));
        assert_eq!(analysis.dependent, files(&["b.rs", "c.rs"]));
        assert!(analysis.cycles.is_empty());
        assert_eq!(analysis.longest_chain, 3);
    }

    #[test]
    fn analyze_reports_cycles() {
        let mut graph = graph();
        graph.add_dependency("a.rs", ["b.rs"]);
        graph.add_dependency("b.rs", ["a.rs"]);

        let analysis = graph.analyze(&files(&["a.rs", "b.rs"]));
        assert!(!analysis.cycles.is_empty());
        let cycle = &analysis.cycles[0];
        assert!(cycle.contains(&"a.rs".to_string()) && cycle.contains(&"b.rs".to_string()));
    }

    #[test]
    fn infers_test_to_module_edges() {
        let mut graph = graph();
        let set = files(&["src/auth.rs", "src/auth_test.rs"]);
        graph.infer_dependencies(&set);

        let deps = graph.dependencies_of("src/auth_test.rs").unwrap();
        assert!(deps.contains("src/auth.rs"));
    }

    #[test]
    fn infers_integration_suite_edges() {
        let mut graph = graph();
        let set = files(&["suite/integration_login.rs", "suite/users.rs"]);
        graph.infer_dependencies(&set);

        let deps = graph.dependencies_of("suite/integration_login.rs").unwrap();
        assert!(deps.contains("suite/users.rs"));
    }

    #[test]
    fn self_dependencies_are_dropped() {
        let mut graph = graph();
        graph.add_dependency("a.rs", ["a.rs", "b.rs"]);
        let deps = graph.dependencies_of("a.rs").unwrap();
        assert!(!deps.contains("a.rs"));
        assert!(deps.contains("b.rs"));
    }
}
