use super::{Matcher, MatchingResult};
use sandbox_api::UnitStructure;

/// Conjunction or disjunction of matchers, evaluated in order.
pub enum GroupMatcher<'a> {
    And(Vec<Box<dyn Matcher + 'a>>),
    Or(Vec<Box<dyn Matcher + 'a>>),
}

impl<'a> GroupMatcher<'a> {
    pub fn and(matchers: Vec<Box<dyn Matcher + 'a>>) -> Self {
        Self::And(matchers)
    }

    pub fn or(matchers: Vec<Box<dyn Matcher + 'a>>) -> Self {
        Self::Or(matchers)
    }
}

impl Matcher for GroupMatcher<'_> {
    fn matching(&self, structure: &UnitStructure) -> MatchingResult {
        match self {
            Self::And(matchers) => {
                let mut matchers = matchers.iter();
                let Some(first) = matchers.next() else {
                    return MatchingResult::rejected("empty matcher group");
                };
                let mut result = first.matching(structure);
                for matcher in matchers {
                    // Later matchers never see a unit an earlier one rejected.
                    if !result.is_matched() {
                        break;
                    }
                    result = result.and(matcher.matching(structure));
                }
                result
            }
            Self::Or(matchers) => matchers
                .iter()
                .map(|matcher| matcher.matching(structure))
                .reduce(MatchingResult::or)
                .unwrap_or_else(|| MatchingResult::rejected("empty matcher group")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::GroupMatcher;
    use crate::matcher::{Matcher, MatchingResult};
    use sandbox_api::UnitStructure;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Select(&'static str);

    impl Matcher for Select {
        fn matching(&self, structure: &UnitStructure) -> MatchingResult {
            MatchingResult::matched(vec![format!("{}#{}()", structure.name, self.0)])
        }
    }

    struct Reject(AtomicUsize);

    impl Matcher for Reject {
        fn matching(&self, _structure: &UnitStructure) -> MatchingResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            MatchingResult::rejected("rejected")
        }
    }

    #[test]
    fn and_stops_at_first_rejection() {
        let reject = Reject(AtomicUsize::new(0));
        let group = GroupMatcher::and(vec![
            Box::new(Reject(AtomicUsize::new(0))),
            Box::new(&reject),
        ]);
        assert!(!group.matching(&UnitStructure::new("a")).is_matched());
        assert_eq!(reject.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn or_selects_from_any_member() {
        let group = GroupMatcher::or(vec![
            Box::new(Reject(AtomicUsize::new(0))),
            Box::new(Select("run")),
        ]);
        let result = group.matching(&UnitStructure::new("a"));
        assert!(result.behavior_sign_codes().contains("a#run()"));
    }

    #[test]
    fn empty_groups_never_match() {
        let unit = UnitStructure::new("a");
        assert!(!GroupMatcher::and(Vec::new()).matching(&unit).is_matched());
        assert!(!GroupMatcher::or(Vec::new()).matching(&unit).is_matched());
    }
}
