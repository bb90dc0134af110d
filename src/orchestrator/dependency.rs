use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

use super::PRNode;

/// Analyzes dependencies between PRs for merge ordering.
///
/// PR `X` depends on PR `Y` when `X`'s base branch is `Y`'s head branch, or
/// when `Y` appears in `X`'s explicit depends-on list.
#[derive(Default)]
pub struct DependencyAnalyzer {
    graph: HashMap<u64, HashSet<u64>>,
    reverse: HashMap<u64, HashSet<u64>>,
}

impl DependencyAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(&mut self, prs: &[PRNode]) {
        self.graph.clear();
        self.reverse.clear();

        let pr_by_branch: HashMap<&str, u64> =
            prs.iter().map(|pr| (pr.branch.as_str(), pr.number)).collect();

        for pr in prs {
            if let Some(&dependency) = pr_by_branch.get(pr.base.as_str())
                && dependency != pr.number
            {
                self.graph.entry(pr.number).or_default().insert(dependency);
                self.reverse.entry(dependency).or_default().insert(pr.number);
            }
            for &dep in &pr.depends_on {
                if dep != pr.number {
                    self.graph.entry(pr.number).or_default().insert(dep);
                    self.reverse.entry(dep).or_default().insert(pr.number);
                }
            }
        }
    }

    /// Kahn's topological sort, dependencies first, ascending PR number as
    /// the tie-break. Cycles are an error.
    pub fn topological_sort(&mut self, prs: &[PRNode]) -> Result<Vec<u64>> {
        self.build(prs);

        let numbers: HashSet<u64> = prs.iter().map(|pr| pr.number).collect();
        let mut in_degree: HashMap<u64, usize> = numbers.iter().map(|&n| (n, 0)).collect();
        for (&pr, deps) in &self.graph {
            if numbers.contains(&pr) {
                *in_degree.get_mut(&pr).unwrap() +=
                    deps.iter().filter(|d| numbers.contains(*d)).count();
            }
        }

        let mut queue: Vec<u64> = in_degree
            .iter()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut result = Vec::with_capacity(numbers.len());

        while !queue.is_empty() {
            queue.sort_unstable();
            let current = queue.remove(0);
            result.push(current);

            if let Some(dependents) = self.reverse.get(&current) {
                for &dependent in dependents {
                    if let Some(deg) = in_degree.get_mut(&dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push(dependent);
                        }
                    }
                }
            }
        }

        if result.len() != numbers.len() {
            let mut remaining: Vec<u64> = numbers
                .difference(&result.iter().copied().collect())
                .copied()
                .collect();
            remaining.sort_unstable();
            return Err(Error::Orchestrator(format!(
                "Circular dependency detected among PRs: {remaining:?}"
            )));
        }

        Ok(result)
    }

    /// Group PRs into levels whose dependencies all sit in earlier levels.
    /// Each level can be reviewed concurrently.
    pub fn parallel_groups(&mut self, prs: &[PRNode]) -> Result<Vec<Vec<u64>>> {
        self.build(prs);

        let numbers: HashSet<u64> = prs.iter().map(|pr| pr.number).collect();
        let mut processed: HashSet<u64> = HashSet::new();
        let mut groups = Vec::new();

        while processed.len() < numbers.len() {
            let mut group: Vec<u64> = numbers
                .iter()
                .filter(|n| !processed.contains(*n))
                .filter(|n| {
                    self.graph
                        .get(*n)
                        .map(|deps| {
                            deps.iter()
                                .filter(|d| numbers.contains(*d))
                                .all(|d| processed.contains(d))
                        })
                        .unwrap_or(true)
                })
                .copied()
                .collect();

            if group.is_empty() {
                let mut remaining: Vec<u64> =
                    numbers.difference(&processed).copied().collect();
                remaining.sort_unstable();
                return Err(Error::Orchestrator(format!(
                    "Cannot resolve dependencies for PRs: {remaining:?}"
                )));
            }

            group.sort_unstable();
            processed.extend(group.iter().copied());
            groups.push(group);
        }

        Ok(groups)
    }

    pub fn dependencies(&self, pr: u64) -> HashSet<u64> {
        self.graph.get(&pr).cloned().unwrap_or_default()
    }

    pub fn dependents(&self, pr: u64) -> HashSet<u64> {
        self.reverse.get(&pr).cloned().unwrap_or_default()
    }

    /// A PR is blocked while any dependency is not yet merged.
    pub fn is_blocked(&self, pr: u64, merged: &HashSet<u64>) -> bool {
        self.graph
            .get(&pr)
            .is_some_and(|deps| deps.iter().any(|d| !merged.contains(d)))
    }
}
