//! Tests for Bully priority ordering.
//!
//! Verifies:
//! - Higher value wins regardless of unique id
//! - Equal values are resolved by unique id
//! - The comparator is a strict total order (antisymmetric, transitive)
//! - Undefined priorities sort below all defined ones

use std::cmp::Ordering;

use hrm_protocol::priority::BullyPriority;

fn sample() -> Vec<BullyPriority> {
    let mut all = vec![BullyPriority::UNDEFINED];
    for value in [0u64, 7, 10, 101] {
        for id in [1u64, 2, 3, 50] {
            all.push(BullyPriority::new(value, id));
        }
    }
    all
}

// ═══════════════════════════════════════════════════════════════
// Ordering
// ═══════════════════════════════════════════════════════════════

#[test]
fn equal_values_are_a_strict_order_on_unique_id() {
    for id1 in 1..20u64 {
        for id2 in 1..20u64 {
            let a = BullyPriority::new(10, id1);
            let b = BullyPriority::new(10, id2);
            if id1 == id2 {
                assert_eq!(a.cmp(&b), Ordering::Equal);
                assert!(!a.is_higher_than(&b));
            } else {
                // Exactly one direction holds.
                assert_ne!(a.is_higher_than(&b), b.is_higher_than(&a));
                assert_eq!(a.is_higher_than(&b), id1 > id2);
            }
        }
    }
}

#[test]
fn comparator_is_antisymmetric_and_transitive() {
    let all = sample();
    for a in &all {
        for b in &all {
            if a.is_higher_than(b) {
                assert!(!b.is_higher_than(a), "{} vs {}", a, b);
            }
            for c in &all {
                if a.is_higher_than(b) && b.is_higher_than(c) {
                    assert!(a.is_higher_than(c));
                }
            }
        }
    }
}

#[test]
fn scenario_highest_of_three() {
    let peers = [
        BullyPriority::new(10, 1),
        BullyPriority::new(10, 2),
        BullyPriority::new(7, 3),
    ];
    let best = peers.iter().max().copied().unwrap();
    assert_eq!(best, BullyPriority::new(10, 2));
}

#[test]
fn undefined_sorts_below_everything() {
    for p in sample().into_iter().filter(|p| p.is_defined()) {
        assert!(p.is_higher_than(&BullyPriority::UNDEFINED));
    }
}

#[test]
fn with_value_keeps_unique_id() {
    let p = BullyPriority::new(5, 9).with_value(50);
    assert_eq!(p.value(), Some(50));
    assert_eq!(p.unique_id(), 9);
}
