use std::collections::{BTreeSet, HashMap};

use super::PRNode;

/// Predicts merge conflicts between PRs from their changed-file lists.
#[derive(Default)]
pub struct ConflictPredictor {
    file_to_prs: HashMap<String, BTreeSet<u64>>,
    dir_to_prs: HashMap<String, BTreeSet<u64>>,
}

impl ConflictPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the file → PRs and directory → PRs reverse indices.
    pub fn analyze(&mut self, prs: &[PRNode]) {
        self.file_to_prs.clear();
        self.dir_to_prs.clear();

        for pr in prs {
            for file in &pr.changed_files {
                self.file_to_prs
                    .entry(file.clone())
                    .or_default()
                    .insert(pr.number);

                let mut dir = file.as_str();
                while let Some(pos) = dir.rfind('/') {
                    dir = &dir[..pos];
                    self.dir_to_prs
                        .entry(dir.to_string())
                        .or_default()
                        .insert(pr.number);
                }
            }
        }
    }

    /// Two PRs conflict iff their changed-file sets intersect. Symmetric;
    /// the returned list is the sorted intersection.
    pub fn predict_conflicts(&self, pr_a: u64, pr_b: u64, prs: &[PRNode]) -> (bool, Vec<String>) {
        let files = |n: u64| -> BTreeSet<&str> {
            prs.iter()
                .find(|pr| pr.number == n)
                .map(|pr| pr.changed_files.iter().map(String::as_str).collect())
                .unwrap_or_default()
        };

        let overlap: Vec<String> = files(pr_a)
            .intersection(&files(pr_b))
            .map(|s| s.to_string())
            .collect();
        (!overlap.is_empty(), overlap)
    }

    /// All conflicting pairs with their overlapping files.
    pub fn conflict_pairs(&mut self, prs: &[PRNode]) -> Vec<(u64, u64, Vec<String>)> {
        self.analyze(prs);
        let mut numbers: Vec<u64> = prs.iter().map(|pr| pr.number).collect();
        numbers.sort_unstable();

        let mut pairs = Vec::new();
        for i in 0..numbers.len() {
            for j in i + 1..numbers.len() {
                let (conflicts, files) = self.predict_conflicts(numbers[i], numbers[j], prs);
                if conflicts {
                    pairs.push((numbers[i], numbers[j], files));
                }
            }
        }
        pairs
    }

    /// Reorder `base_order` so that PRs sharing files always merge
    /// sequentially, oldest first: when the walk reaches the first member of
    /// a conflict group, the whole group is emitted in creation order.
    pub fn conflict_aware_order(&mut self, prs: &[PRNode], base_order: &[u64]) -> Vec<u64> {
        self.analyze(prs);
        let created: HashMap<u64, chrono::DateTime<chrono::Utc>> =
            prs.iter().map(|pr| (pr.number, pr.created_at)).collect();

        let mut groups = self.conflict_groups(prs);
        for group in &mut groups {
            group.sort_by_key(|n| created.get(n).copied());
        }

        let mut result = Vec::with_capacity(base_order.len());
        let mut used: BTreeSet<u64> = BTreeSet::new();

        for &pr in base_order {
            if used.contains(&pr) {
                continue;
            }
            match groups.iter().find(|g| g.contains(&pr)) {
                Some(group) => {
                    for &member in group {
                        if used.insert(member) {
                            result.push(member);
                        }
                    }
                }
                None => {
                    used.insert(pr);
                    result.push(pr);
                }
            }
        }
        result
    }

    /// Union-find over "shares at least one file": maximal groups in which
    /// every pair overlaps directly or transitively.
    pub fn conflict_groups(&self, prs: &[PRNode]) -> Vec<Vec<u64>> {
        let numbers: Vec<u64> = prs.iter().map(|pr| pr.number).collect();
        let mut parent: HashMap<u64, u64> = numbers.iter().map(|&n| (n, n)).collect();

        fn find(parent: &mut HashMap<u64, u64>, x: u64) -> u64 {
            let mut root = x;
            while parent[&root] != root {
                root = parent[&root];
            }
            // Path compression
            let mut current = x;
            while parent[&current] != root {
                let next = parent[&current];
                parent.insert(current, root);
                current = next;
            }
            root
        }

        for pr_set in self.file_to_prs.values() {
            let members: Vec<u64> = pr_set.iter().copied().collect();
            for &other in members.iter().skip(1) {
                let a = find(&mut parent, members[0]);
                let b = find(&mut parent, other);
                if a != b {
                    parent.insert(a, b);
                }
            }
        }

        let mut groups: HashMap<u64, Vec<u64>> = HashMap::new();
        for &n in &numbers {
            let root = find(&mut parent, n);
            groups.entry(root).or_default().push(n);
        }

        let mut result: Vec<Vec<u64>> =
            groups.into_values().filter(|g| g.len() > 1).collect();
        for group in &mut result {
            group.sort_unstable();
        }
        result.sort();
        result
    }

    pub fn prs_for_file(&self, file: &str) -> BTreeSet<u64> {
        self.file_to_prs.get(file).cloned().unwrap_or_default()
    }

    pub fn prs_for_dir(&self, dir: &str) -> BTreeSet<u64> {
        self.dir_to_prs.get(dir).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::test_support::node;
    use chrono::{Duration, Utc};

    #[test]
    fn test_conflict_prediction_symmetry() {
        let prs = vec![
            node(1, "a", "main", &["shared.py", "one.py"]),
            node(2, "b", "main", &["shared.py", "two.py"]),
        ];
        let mut predictor = ConflictPredictor::new();
        predictor.analyze(&prs);

        let (ab, files_ab) = predictor.predict_conflicts(1, 2, &prs);
        let (ba, files_ba) = predictor.predict_conflicts(2, 1, &prs);
        assert!(ab && ba);
        assert_eq!(files_ab, files_ba);
        assert_eq!(files_ab, vec!["shared.py".to_string()]);
    }

    #[test]
    fn test_no_overlap_no_conflict() {
        let prs = vec![
            node(1, "a", "main", &["one.py"]),
            node(2, "b", "main", &["two.py"]),
        ];
        let mut predictor = ConflictPredictor::new();
        predictor.analyze(&prs);
        let (conflicts, files) = predictor.predict_conflicts(1, 2, &prs);
        assert!(!conflicts);
        assert!(files.is_empty());
    }

    #[test]
    fn test_unknown_pr_is_no_conflict() {
        let prs = vec![node(1, "a", "main", &["one.py"])];
        let predictor = ConflictPredictor::new();
        let (conflicts, _) = predictor.predict_conflicts(1, 99, &prs);
        assert!(!conflicts);
    }

    #[test]
    fn test_conflict_pairs() {
        let prs = vec![
            node(1, "a", "main", &["shared.py"]),
            node(2, "b", "main", &["shared.py"]),
            node(3, "c", "main", &["other.py"]),
        ];
        let mut predictor = ConflictPredictor::new();
        let pairs = predictor.conflict_pairs(&prs);
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].0, pairs[0].1), (1, 2));
    }

    #[test]
    fn test_conflict_groups_transitive() {
        // 1-2 share a.py, 2-3 share b.py: one group of three
        let prs = vec![
            node(1, "a", "main", &["a.py"]),
            node(2, "b", "main", &["a.py", "b.py"]),
            node(3, "c", "main", &["b.py"]),
            node(4, "d", "main", &["lonely.py"]),
        ];
        let mut predictor = ConflictPredictor::new();
        predictor.analyze(&prs);
        let groups = predictor.conflict_groups(&prs);
        assert_eq!(groups, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_conflict_aware_order_oldest_first() {
        // PRs 1 and 2 both touch shared.py; 1 is older. Either base order
        // must yield [1, 2].
        let now = Utc::now();
        let mut pr1 = node(1, "a", "main", &["shared.py"]);
        pr1.created_at = now - Duration::hours(2);
        let mut pr2 = node(2, "b", "main", &["shared.py"]);
        pr2.created_at = now - Duration::hours(1);
        let prs = vec![pr1, pr2];

        let mut predictor = ConflictPredictor::new();
        assert_eq!(predictor.conflict_aware_order(&prs, &[2, 1]), vec![1, 2]);
        assert_eq!(predictor.conflict_aware_order(&prs, &[1, 2]), vec![1, 2]);
    }

    #[test]
    fn test_conflict_aware_order_keeps_independent_prs_in_place() {
        let prs = vec![
            node(1, "a", "main", &["one.py"]),
            node(2, "b", "main", &["two.py"]),
            node(3, "c", "main", &["three.py"]),
        ];
        let mut predictor = ConflictPredictor::new();
        assert_eq!(
            predictor.conflict_aware_order(&prs, &[3, 1, 2]),
            vec![3, 1, 2]
        );
    }

    #[test]
    fn test_file_and_dir_indices() {
        let prs = vec![
            node(1, "a", "main", &["src/widgets/frame.py"]),
            node(2, "b", "main", &["src/app.py"]),
        ];
        let mut predictor = ConflictPredictor::new();
        predictor.analyze(&prs);
        assert_eq!(
            predictor.prs_for_file("src/widgets/frame.py"),
            [1].into_iter().collect()
        );
        assert_eq!(predictor.prs_for_dir("src"), [1, 2].into_iter().collect());
        assert_eq!(
            predictor.prs_for_dir("src/widgets"),
            [1].into_iter().collect()
        );
    }
}
