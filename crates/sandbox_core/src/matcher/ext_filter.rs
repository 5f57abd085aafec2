use super::{Matcher, MatchingResult};
use sandbox_api::{Filter, UnitStructure};

/// Adapts a module-facing [`Filter`] to the matcher machinery.
pub struct ExtFilterMatcher<'a> {
    filter: &'a dyn Filter,
}

impl<'a> ExtFilterMatcher<'a> {
    pub fn new(filter: &'a dyn Filter) -> Self {
        Self { filter }
    }
}

impl Matcher for ExtFilterMatcher<'_> {
    fn matching(&self, structure: &UnitStructure) -> MatchingResult {
        if structure.is_bootstrap() && !self.filter.include_bootstrap() {
            return MatchingResult::rejected("bootstrap unit excluded by filter");
        }
        if !self.filter.do_unit_filter(
            structure.access,
            &structure.name,
            structure.super_name.as_deref(),
            &structure.interfaces,
            &structure.annotations,
        ) {
            return MatchingResult::rejected("unit filtered out");
        }
        MatchingResult::matched(
            structure
                .behaviors
                .iter()
                .filter(|behavior| {
                    self.filter.do_behavior_filter(
                        behavior.access,
                        &behavior.name,
                        &behavior.parameter_types,
                        &behavior.exception_types,
                        &behavior.annotations,
                    )
                })
                .map(|behavior| behavior.sign_code(&structure.name)),
        )
    }
}
