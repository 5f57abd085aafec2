//! Structural predicates over loaded units.
//!
//! # Responsibility
//! - Decide whether a unit is an augmentation target and which of its
//!   behaviors are selected.
//!
//! # Invariants
//! - A result is matched iff it selects at least one behavior.
//! - Rejections carry a diagnostic reason; matches never do.
//!
//! # See also
//! - `crate::catalog` for how matchers are applied to the loaded set.

use sandbox_api::UnitStructure;
use std::collections::BTreeSet;

mod ext_filter;
mod group;
mod unsupported;

pub use ext_filter::ExtFilterMatcher;
pub use group::GroupMatcher;
pub use unsupported::UnsupportedMatcher;

/// Predicate over a unit's structure.
pub trait Matcher: Send + Sync {
    fn matching(&self, structure: &UnitStructure) -> MatchingResult;
}

impl<M: Matcher + ?Sized> Matcher for &M {
    fn matching(&self, structure: &UnitStructure) -> MatchingResult {
        (**self).matching(structure)
    }
}

impl<M: Matcher + ?Sized> Matcher for Box<M> {
    fn matching(&self, structure: &UnitStructure) -> MatchingResult {
        (**self).matching(structure)
    }
}

/// Behaviors selected by a matcher, or the reason nothing was.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchingResult {
    behavior_sign_codes: BTreeSet<String>,
    reason: Option<String>,
}

impl MatchingResult {
    pub fn matched(behavior_sign_codes: impl IntoIterator<Item = String>) -> Self {
        let behavior_sign_codes = behavior_sign_codes.into_iter().collect::<BTreeSet<_>>();
        let reason = behavior_sign_codes
            .is_empty()
            .then(|| "no behavior selected".to_string());
        Self {
            behavior_sign_codes,
            reason,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            behavior_sign_codes: BTreeSet::new(),
            reason: Some(reason.into()),
        }
    }

    pub fn is_matched(&self) -> bool {
        !self.behavior_sign_codes.is_empty()
    }

    pub fn behavior_sign_codes(&self) -> &BTreeSet<String> {
        &self.behavior_sign_codes
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Behaviors selected by both results.
    pub fn and(self, other: Self) -> Self {
        if !self.is_matched() {
            return self;
        }
        if !other.is_matched() {
            return other;
        }
        let codes = self
            .behavior_sign_codes
            .intersection(&other.behavior_sign_codes)
            .cloned()
            .collect::<Vec<_>>();
        Self::matched(codes)
    }

    /// Behaviors selected by either result.
    pub fn or(self, other: Self) -> Self {
        match (self.is_matched(), other.is_matched()) {
            (false, false) => {
                let reason = [self.reason, other.reason]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join("; ");
                Self::rejected(reason)
            }
            _ => Self::matched(
                self.behavior_sign_codes
                    .into_iter()
                    .chain(other.behavior_sign_codes),
            ),
        }
    }
}
