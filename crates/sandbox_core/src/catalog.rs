//! Loaded-unit catalog: queries over the managed runtime's loaded set.
//!
//! # Responsibility
//! - Snapshot the loaded set and evaluate matchers over it.
//! - Guard retransform queries against units that cannot be rewritten.
//!
//! # Invariants
//! - Every query works on one snapshot; result order is snapshot order.
//! - A unit failing introspection is excluded alone; the scan continues.
//! - `find(.., true)` never returns a unit the runtime reports unmodifiable.

use crate::matcher::{ExtFilterMatcher, GroupMatcher, Matcher, UnsupportedMatcher};
use log::debug;
use sandbox_api::{Filter, Instrumentation, UnitRef};
use std::collections::HashSet;
use std::sync::Arc;

/// Read-only view over the units loaded in the managed runtime.
pub struct LoadedUnitCatalog {
    inst: Arc<dyn Instrumentation>,
    enable_unsafe: bool,
}

impl LoadedUnitCatalog {
    pub fn new(inst: Arc<dyn Instrumentation>, enable_unsafe: bool) -> Self {
        Self {
            inst,
            enable_unsafe,
        }
    }

    /// The loaded set without duplicate handles, in runtime order.
    pub fn list(&self) -> Vec<UnitRef> {
        dedup_units(self.inst.all_loaded_units())
    }

    /// Lazily walks one snapshot of the loaded set.
    pub fn iter_loaded(&self) -> impl Iterator<Item = UnitRef> {
        self.inst.all_loaded_units().into_iter()
    }

    /// Units selected by `matcher`.
    ///
    /// With `filter_unsupported`, units the runtime cannot modify are dropped
    /// and `matcher` is combined with an [`UnsupportedMatcher`].
    pub fn find(&self, matcher: &dyn Matcher, filter_unsupported: bool) -> Vec<UnitRef> {
        let guarded;
        let effective: &dyn Matcher = if filter_unsupported {
            guarded = GroupMatcher::and(vec![
                Box::new(UnsupportedMatcher::new(self.enable_unsafe)),
                Box::new(matcher),
            ]);
            &guarded
        } else {
            matcher
        };

        let mut found = Vec::new();
        for unit in self.iter_loaded() {
            if filter_unsupported && !self.inst.is_modifiable_unit(unit.as_ref()) {
                debug!(
                    "event=catalog_find module=catalog status=skip unit={} reason=unmodifiable",
                    unit.name()
                );
                continue;
            }
            match unit.structure() {
                Ok(structure) => {
                    if effective.matching(&structure).is_matched() {
                        found.push(unit);
                    }
                }
                Err(err) => debug!(
                    "event=catalog_find module=catalog status=skip unit={} error={}",
                    unit.name(),
                    err
                ),
            }
        }
        found
    }

    /// Units eligible for rewriting that `matcher` selects.
    pub fn find_for_retransform(&self, matcher: &dyn Matcher) -> Vec<UnitRef> {
        self.find(matcher, true)
    }

    /// Units selected by a module-facing filter, without the unsupported guard.
    pub fn find_by_filter(&self, filter: &dyn Filter) -> Vec<UnitRef> {
        dedup_units(self.find(&ExtFilterMatcher::new(filter), false))
    }
}

fn dedup_units(units: Vec<UnitRef>) -> Vec<UnitRef> {
    let mut seen = HashSet::new();
    units
        .into_iter()
        .filter(|unit| seen.insert(Arc::as_ptr(unit) as *const ()))
        .collect()
}
