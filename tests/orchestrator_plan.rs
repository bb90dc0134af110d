use chrono::{Duration, TimeZone, Utc};

use mender::orchestrator::conflict::ConflictPredictor;
use mender::orchestrator::dependency::DependencyAnalyzer;
use mender::orchestrator::{PRNode, PrStatus};

fn node(number: u64, branch: &str, base: &str, files: &[&str]) -> PRNode {
    let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        + Duration::minutes(number as i64);
    PRNode {
        number,
        branch: branch.to_string(),
        base: base.to_string(),
        status: PrStatus::Pending,
        changed_files: files.iter().map(|f| f.to_string()).collect(),
        depends_on: vec![],
        conflicts_with: vec![],
        review_result: None,
        created_at: created,
        updated_at: created,
    }
}

#[test]
fn test_stacked_prs_order_and_groups() {
    // PR 2's base is PR 1's head branch; PR 3 targets main independently.
    let prs = vec![
        node(1, "feature/a", "main", &["a.py"]),
        node(2, "feature/b", "feature/a", &["b.py"]),
        node(3, "feature/c", "main", &["c.py"]),
    ];

    let mut analyzer = DependencyAnalyzer::new();
    let order = analyzer.topological_sort(&prs).unwrap();
    let pos = |n: u64| order.iter().position(|&x| x == n).unwrap();
    assert!(pos(1) < pos(2));

    let groups = analyzer.parallel_groups(&prs).unwrap();
    // 1 and 3 are independent and share the first group
    assert!(groups[0].contains(&1));
    assert!(groups[0].contains(&3));
    assert_eq!(groups[1], vec![2]);
}

#[test]
fn test_shared_file_orders_by_creation_regardless_of_input() {
    // PRs 1 and 2 both modify shared.py; 1 was created first.
    let prs = vec![
        node(1, "feature/a", "main", &["shared.py"]),
        node(2, "feature/b", "main", &["shared.py"]),
    ];

    let mut predictor = ConflictPredictor::new();
    for base_order in [vec![2, 1], vec![1, 2]] {
        let order = predictor.conflict_aware_order(&prs, &base_order);
        assert_eq!(order, vec![1, 2], "base order {base_order:?}");
    }
}

#[test]
fn test_cycle_raises_circular_dependency() {
    let mut pr1 = node(1, "feature/a", "main", &[]);
    pr1.depends_on = vec![2];
    let mut pr2 = node(2, "feature/b", "main", &[]);
    pr2.depends_on = vec![1];

    let mut analyzer = DependencyAnalyzer::new();
    let err = analyzer.topological_sort(&[pr1, pr2]).unwrap_err();
    assert!(err.to_string().contains("Circular dependency"));
}

#[test]
fn test_topological_order_respects_all_dependencies() {
    let mut pr4 = node(4, "feature/d", "main", &[]);
    pr4.depends_on = vec![2, 3];
    let prs = vec![
        node(1, "feature/a", "main", &[]),
        node(2, "feature/b", "feature/a", &[]),
        node(3, "feature/c", "main", &[]),
        pr4,
    ];

    let mut analyzer = DependencyAnalyzer::new();
    let order = analyzer.topological_sort(&prs).unwrap();
    analyzer.build(&prs);
    let pos = |n: u64| order.iter().position(|&x| x == n).unwrap();
    for pr in &prs {
        for dep in analyzer.dependencies(pr.number) {
            assert!(
                pos(dep) < pos(pr.number),
                "PR {} must come after its dependency {}",
                pr.number,
                dep
            );
        }
    }
}

#[test]
fn test_parallel_groups_have_no_transitive_dependencies() {
    let mut pr3 = node(3, "feature/c", "main", &[]);
    pr3.depends_on = vec![1];
    let mut pr4 = node(4, "feature/d", "main", &[]);
    pr4.depends_on = vec![3];
    let prs = vec![
        node(1, "feature/a", "main", &[]),
        node(2, "feature/b", "main", &[]),
        pr3,
        pr4,
    ];

    let mut analyzer = DependencyAnalyzer::new();
    let groups = analyzer.parallel_groups(&prs).unwrap();
    assert_eq!(groups, vec![vec![1, 2], vec![3], vec![4]]);
}

#[test]
fn test_conflict_symmetry_and_intersection() {
    let prs = vec![
        node(1, "a", "main", &["x.py", "shared.py", "y.py"]),
        node(2, "b", "main", &["shared.py", "z.py"]),
    ];
    let mut predictor = ConflictPredictor::new();
    predictor.analyze(&prs);

    let (ab, files_ab) = predictor.predict_conflicts(1, 2, &prs);
    let (ba, files_ba) = predictor.predict_conflicts(2, 1, &prs);
    assert_eq!(ab, ba);
    assert_eq!(files_ab, files_ba);
    assert_eq!(files_ab, vec!["shared.py".to_string()]);
}

#[test]
fn test_conflict_group_merged_sequentially_oldest_first() {
    // Three PRs chained by shared files, created out of numeric order.
    let mut pr5 = node(5, "a", "main", &["one.py"]);
    pr5.created_at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let mut pr2 = node(2, "b", "main", &["one.py", "two.py"]);
    pr2.created_at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    let mut pr7 = node(7, "c", "main", &["two.py"]);
    pr7.created_at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    let prs = vec![pr5, pr2, pr7];

    let mut predictor = ConflictPredictor::new();
    let order = predictor.conflict_aware_order(&prs, &[2, 5, 7]);
    assert_eq!(order, vec![7, 5, 2]);
}

#[test]
fn test_status_machine_terminal_states() {
    let mut pr = node(1, "a", "main", &[]);
    assert!(pr.set_status(PrStatus::Reviewing).is_ok());
    assert!(pr.set_status(PrStatus::ReviewFailed).is_ok());
    assert!(pr.set_status(PrStatus::Failed).is_ok());
    assert!(pr.set_status(PrStatus::Reviewing).is_err());
    assert_eq!(pr.status, PrStatus::Failed);
}
