//! Bully election priorities.
//!
//! A priority is the pair (value, unique id). Comparison is lexicographic:
//! the higher value wins and equal values are resolved by the higher unique
//! id. An undefined value marks a peer whose priority has not been learned
//! yet and sorts below every defined priority.

use serde::{Deserialize, Serialize};

use crate::constants::{CONNECTIVITY_PRIORITY_OFFSET, MAX_NODE_PRIORITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BullyPriority {
    // Field order drives the derived ordering: value first, then unique id.
    value: Option<u64>,
    unique_id: u64,
}

impl BullyPriority {
    /// Sentinel for a peer whose priority is unknown.
    pub const UNDEFINED: BullyPriority = BullyPriority {
        value: None,
        unique_id: 0,
    };

    pub fn new(value: u64, unique_id: u64) -> Self {
        Self {
            value: Some(value),
            unique_id,
        }
    }

    /// Priority derived from node connectivity: the administrator's base
    /// priority (clamped to the allowed range) plus a fixed offset per
    /// physical neighbor.
    pub fn for_connectivity(base: u64, neighbors: usize, unique_id: u64) -> Self {
        let base = base.min(MAX_NODE_PRIORITY);
        let value = base.saturating_add(CONNECTIVITY_PRIORITY_OFFSET.saturating_mul(neighbors as u64));
        Self::new(value, unique_id)
    }

    pub fn value(&self) -> Option<u64> {
        self.value
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn is_defined(&self) -> bool {
        self.value.is_some()
    }

    /// Strictly higher on the full (value, unique id) vector.
    pub fn is_higher_than(&self, other: &BullyPriority) -> bool {
        self > other
    }

    /// Same unique id with a new value.
    pub fn with_value(&self, value: u64) -> Self {
        Self::new(value, self.unique_id)
    }
}

impl std::fmt::Display for BullyPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.value {
            Some(v) => write!(f, "{}#{}", v, self.unique_id),
            None => write!(f, "undefined"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_dominates_unique_id() {
        assert!(BullyPriority::new(11, 1).is_higher_than(&BullyPriority::new(10, 99)));
    }

    #[test]
    fn test_unique_id_breaks_ties() {
        let a = BullyPriority::new(10, 1);
        let b = BullyPriority::new(10, 2);
        assert!(b.is_higher_than(&a));
        assert!(!a.is_higher_than(&b));
    }

    #[test]
    fn test_undefined_is_lowest() {
        assert!(BullyPriority::new(0, 0).is_higher_than(&BullyPriority::UNDEFINED));
        assert!(!BullyPriority::UNDEFINED.is_defined());
        assert_eq!(BullyPriority::UNDEFINED.to_string(), "undefined");
    }

    #[test]
    fn test_connectivity_offset() {
        let p = BullyPriority::for_connectivity(1, 3, 7);
        assert_eq!(p.value(), Some(301));
        assert_eq!(p.unique_id(), 7);
        // Base priority is clamped to the administrator range.
        let clamped = BullyPriority::for_connectivity(500, 0, 1);
        assert_eq!(clamped.value(), Some(MAX_NODE_PRIORITY));
    }
}
