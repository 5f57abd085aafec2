//! External unit/behavior filter contract used by module authors.

use crate::unit::Access;

/// Predicate pair evaluated over a unit and then over each of its behaviors.
pub trait Filter: Send + Sync {
    /// Decides whether the unit itself is a candidate.
    fn do_unit_filter(
        &self,
        access: Access,
        unit_name: &str,
        super_name: Option<&str>,
        interfaces: &[String],
        annotations: &[String],
    ) -> bool;

    /// Decides whether one behavior of a candidate unit is selected.
    fn do_behavior_filter(
        &self,
        access: Access,
        behavior_name: &str,
        parameter_types: &[String],
        exception_types: &[String],
        annotations: &[String],
    ) -> bool;

    /// Units defined by the bootstrap scope are skipped unless this is `true`.
    fn include_bootstrap(&self) -> bool {
        false
    }
}
