//! Regression suite over the C fixtures in `stubs/`. Each fixture carries
//! its configuration in a leading `//PARAM:` directive, exactly as the
//! analyzer's harness mode reads it.

use std::fs;
use std::path::Path;

use c_static_detector::config::{self, Config};
use c_static_detector::diagnostics::Diagnostic;

fn fixture_source(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("stubs").join(name);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("cannot read {}: {}", path.display(), e))
}

fn analyze_with(name: &str, configure: impl FnOnce(&mut Config)) -> Vec<Diagnostic> {
    let source = fixture_source(name);
    let mut config = Config::default();
    let args = config::param_directive(&source)
        .unwrap_or_else(|| panic!("{} is missing its //PARAM: directive", name));
    config
        .apply_args(args.iter().map(String::as_str))
        .unwrap();
    configure(&mut config);
    c_static_detector::run(&source, name, &config).unwrap()
}

fn analyze(name: &str) -> Vec<Diagnostic> {
    analyze_with(name, |_| {})
}

fn deadlocks(report: &[Diagnostic]) -> Vec<&Diagnostic> {
    report
        .iter()
        .filter(|d| matches!(d, Diagnostic::PotentialDeadlock { .. }))
        .collect()
}

#[test_log::test]
fn asm_deadlock_opaque_policy_is_a_false_negative() {
    // the fixture's directive disables asm_is_nop: the asm output operand
    // drops lock_a from proc_a's must-lockset, so no cycle is reported
    let report = analyze("asm-deadlock.c");
    assert!(deadlocks(&report).is_empty(), "unexpected: {:?}", report);
}

#[test_log::test]
fn asm_deadlock_nop_policy_reports_the_cycle() {
    // same input, asm treated as a no-op: the (lock_a, lock_b) cycle is back
    let report = analyze_with("asm-deadlock.c", |config| {
        config.set_bool("asm_is_nop", true).unwrap();
    });
    let deadlocks = deadlocks(&report);
    assert_eq!(deadlocks.len(), 1);
    match deadlocks[0] {
        Diagnostic::PotentialDeadlock { locks, witnesses } => {
            assert_eq!(locks, &["lock_a", "lock_b"]);
            // one acquisition per direction, from two distinct contexts
            assert_eq!(witnesses.len(), 2);
            assert_ne!(witnesses[0].context, witnesses[1].context);
        }
        other => panic!("expected a deadlock diagnostic, got {:?}", other),
    }
}

#[test_log::test]
fn opposite_order_two_threads() {
    let report = analyze("opposite-order.c");
    assert_eq!(deadlocks(&report).len(), 1);
}

#[test_log::test]
fn consistent_order_is_clean() {
    let report = analyze("consistent-order.c");
    assert!(report.is_empty(), "unexpected: {:?}", report);
}

#[test_log::test]
fn three_thread_chain_is_one_cycle() {
    let report = analyze("three-thread-chain.c");
    let deadlocks = deadlocks(&report);
    assert_eq!(deadlocks.len(), 1);
    match deadlocks[0] {
        Diagnostic::PotentialDeadlock { locks, .. } => {
            assert_eq!(locks, &["lock_a", "lock_b", "lock_c"]);
        }
        other => panic!("expected a deadlock diagnostic, got {:?}", other),
    }
}

#[test_log::test]
fn branch_held_lock_leaves_the_must_set() {
    // lock_a is held on only one path into the lock_b acquisition, so the
    // a -> b ordering is never recorded
    let report = analyze("branch-held.c");
    assert!(report.is_empty(), "unexpected: {:?}", report);
}

#[test_log::test]
fn lock_loop_reports_once() {
    let report = analyze("lock-loop.c");
    assert_eq!(deadlocks(&report).len(), 1);
}

#[test_log::test]
fn both_orders_in_one_thread_are_suppressed() {
    let report = analyze("same-thread-orders.c");
    assert!(report.is_empty(), "unexpected: {:?}", report);
}

#[test_log::test]
fn unmatched_unlock_is_diagnosed() {
    let report = analyze("unmatched-unlock.c");
    assert_eq!(report.len(), 1);
    match &report[0] {
        Diagnostic::UnmatchedUnlock { lock, .. } => assert_eq!(lock, "lock_a"),
        other => panic!("expected an unmatched-unlock diagnostic, got {:?}", other),
    }
}

#[test_log::test]
fn unmatched_unlock_can_be_disabled() {
    let report = analyze_with("unmatched-unlock.c", |config| {
        config.set_bool("warn_unmatched_unlock", false).unwrap();
    });
    assert!(report.is_empty());
}

#[test_log::test]
fn deadlock_through_a_nested_call() {
    let report = analyze("nested-calls.c");
    assert_eq!(deadlocks(&report).len(), 1);
}

#[test_log::test]
fn reports_are_deterministic_across_runs() {
    for fixture in [
        "asm-deadlock.c",
        "opposite-order.c",
        "three-thread-chain.c",
        "nested-calls.c",
    ] {
        let first: Vec<String> = analyze(fixture).iter().map(|d| d.to_string()).collect();
        let second: Vec<String> = analyze(fixture).iter().map(|d| d.to_string()).collect();
        assert_eq!(first, second, "{} is not deterministic", fixture);
    }
}
