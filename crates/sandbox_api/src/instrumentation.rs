//! Instrumentation capability handle supplied by the managed runtime.

use crate::unit::{LoadedUnit, UnitRef};
use std::io;
use std::path::Path;

/// Capability handle handed to the bootstrap entry points.
///
/// The handle is owned by the host runtime; the sandbox only queries it and
/// never caches the loaded set it returns.
pub trait Instrumentation: Send + Sync {
    /// Returns every unit currently loaded, in runtime order.
    fn all_loaded_units(&self) -> Vec<UnitRef>;

    /// Whether the runtime allows rewriting `unit`.
    fn is_modifiable_unit(&self, unit: &dyn LoadedUnit) -> bool;

    /// Makes `archive` visible to the bootstrap scope so every domain can
    /// reach the interception entry points.
    fn append_to_bootstrap_search(&self, archive: &Path) -> io::Result<()>;
}
