use declad::dag::{DagIssue, calculate_order};

fn order(items: &[&'static str], deps: &[(&'static str, &'static str)]) -> (Vec<&'static str>, Vec<DagIssue<&'static str>>) {
    let ordered = calculate_order(items, deps, |s| *s);
    (ordered.items, ordered.issues)
}

#[test]
fn dependencies_come_first() {
    let (items, issues) = order(&["c", "b", "a"], &[("c", "b"), ("b", "a")]);
    assert_eq!(items, vec!["c", "b", "a"], "each item must follow what it depends on");
    assert!(issues.is_empty(), "a plain chain has no issues");
}

#[test]
fn independent_items_follow_key_order() {
    let (items, issues) = order(&["delta", "alpha", "charlie", "bravo"], &[]);
    assert_eq!(items, vec!["alpha", "bravo", "charlie", "delta"]);
    assert!(issues.is_empty());
}

#[test]
fn output_does_not_depend_on_input_order() {
    let deps = [("alpha", "delta"), ("charlie", "bravo")];
    let (first, _) = order(&["alpha", "bravo", "charlie", "delta"], &deps);
    let (second, _) = order(&["delta", "charlie", "bravo", "alpha"], &deps);
    assert_eq!(first, second, "ordering must be stable across input permutations");
    assert_eq!(first, vec!["alpha", "charlie", "bravo", "delta"]);
}

#[test]
fn cycle_is_reported_and_broken() {
    let (items, issues) = order(&["A", "B", "C"], &[("A", "B"), ("B", "C"), ("C", "A")]);
    assert_eq!(items.len(), 3, "every item is still emitted");
    assert_eq!(items, vec!["B", "C", "A"]);
    assert_eq!(issues, vec![DagIssue::Cycle { before: "A", after: "B" }], "exactly the closing edge is dropped");
}

#[test]
fn self_dependency_is_a_cycle() {
    let (items, issues) = order(&["solo"], &[("solo", "solo")]);
    assert_eq!(items, vec!["solo"]);
    assert_eq!(issues.len(), 1);
}

#[test]
fn unknown_items_are_reported_and_skipped() {
    let (items, issues) = order(&["a", "b"], &[("ghost", "b"), ("a", "b")]);
    assert_eq!(items, vec!["a", "b"]);
    assert_eq!(issues, vec![DagIssue::UnknownItem("ghost")]);
}

#[test]
fn diamond_keeps_shared_dependency_once() {
    let deps = [("base", "left"), ("base", "right"), ("left", "top"), ("right", "top")];
    let (items, issues) = order(&["top", "right", "left", "base"], &deps);
    assert!(issues.is_empty());
    assert_eq!(items, vec!["base", "left", "right", "top"]);
}
