//! Archive and resolution-scope building blocks for isolation domains.
//!
//! # Responsibility
//! - Model an archive as a private set of named units plus a service index.
//! - Define the resolution contract every domain implements.
//! - Provide the host scope that sits at the root of every delegation chain.
//!
//! # Invariants
//! - Resolution never mutates the archive; caching is the domain's business.
//! - A closed archive resolves nothing.
//!
//! # See also
//! - `native` for dynamic-library archives, `linked` for archives compiled
//!   into the host, `routing` for pattern-forced parent delegation.

use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod linked;
pub mod native;
pub mod routing;

/// A resolved unit: opaque until downcast to the contract type it implements.
pub type Unit = Arc<dyn Any + Send + Sync>;

/// Names exported by one archive and its service-discovery index.
#[derive(Default)]
pub struct ExportTable {
    units: BTreeMap<String, Unit>,
    services: BTreeMap<String, Vec<String>>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports `unit` under `name`, replacing an earlier export of that name.
    pub fn export<T: Any + Send + Sync>(&mut self, name: impl Into<String>, unit: T) -> &mut Self {
        self.units.insert(name.into(), Arc::new(unit));
        self
    }

    /// Declares `implementation` as a provider of `contract`.
    ///
    /// Declaration order is discovery order.
    pub fn provide(
        &mut self,
        contract: impl Into<String>,
        implementation: impl Into<String>,
    ) -> &mut Self {
        self.services
            .entry(contract.into())
            .or_default()
            .push(implementation.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<Unit> {
        self.units.get(name).cloned()
    }

    pub fn services(&self, contract: &str) -> Vec<String> {
        self.services.get(contract).cloned().unwrap_or_default()
    }

    /// Number of exported units someone outside the table still holds.
    pub fn outstanding(&self) -> usize {
        self.units
            .values()
            .filter(|unit| Arc::strong_count(unit) > 1)
            .count()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// An opened archive holding a private unit set.
pub trait Archive: Send + Sync {
    fn path(&self) -> &Path;

    /// Looks up a unit exported by this archive only.
    fn lookup(&self, name: &str) -> Option<Unit>;

    /// Implementation names declared for `contract`, in declaration order.
    fn services(&self, contract: &str) -> Vec<String>;

    /// Releases file handles held by the archive.
    fn close(&self) -> Result<(), ArchiveError>;
}

/// Opens archives from paths.
pub trait ArchiveOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Archive>, ArchiveError>;
}

/// Archive open/close failures.
#[derive(Debug)]
pub enum ArchiveError {
    NotFound(PathBuf),
    Io { path: PathBuf, source: io::Error },
    Load { path: PathBuf, message: String },
    IncompatibleAbi { path: PathBuf, expected: u32, actual: u32 },
}

impl Display for ArchiveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "archive not found: {}", path.display()),
            Self::Io { path, source } => {
                write!(f, "archive `{}` i/o failure: {source}", path.display())
            }
            Self::Load { path, message } => {
                write!(f, "archive `{}` failed to load: {message}", path.display())
            }
            Self::IncompatibleAbi {
                path,
                expected,
                actual,
            } => write!(
                f,
                "archive `{}` has incompatible abi version {actual}, expected {expected}",
                path.display()
            ),
        }
    }
}

impl Error for ArchiveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::NotFound(_) | Self::Load { .. } | Self::IncompatibleAbi { .. } => None,
        }
    }
}

/// A named scope that resolves unit names.
pub trait ResolutionScope: Send + Sync {
    /// Diagnostic name of the scope.
    fn scope_name(&self) -> String;

    fn resolve(&self, name: &str) -> Result<Unit, ResolveError>;
}

/// Resolution failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    NotFound { name: String, scope: String },
    Incompatible { name: String, expected: &'static str },
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { name, scope } => write!(f, "unit `{name}` not found in {scope}"),
            Self::Incompatible { name, expected } => {
                write!(f, "unit `{name}` does not implement {expected}")
            }
        }
    }
}

impl Error for ResolveError {}

/// Resolves `name` in `scope` and downcasts it to the contract type `T`.
pub fn resolve_as<T: Any + Send + Sync>(
    scope: &dyn ResolutionScope,
    name: &str,
) -> Result<Arc<T>, ResolveError> {
    scope
        .resolve(name)?
        .downcast::<T>()
        .map_err(|_| ResolveError::Incompatible {
            name: name.to_string(),
            expected: type_name::<T>(),
        })
}

/// Root scope holding units the host binary shares with every domain.
pub struct HostScope {
    name: String,
    exports: ExportTable,
}

impl HostScope {
    pub fn new(exports: ExportTable) -> Self {
        Self::named("HostScope", exports)
    }

    /// Scope reporting `name` in diagnostics.
    pub fn named(name: impl Into<String>, exports: ExportTable) -> Self {
        Self {
            name: name.into(),
            exports,
        }
    }

    pub fn empty() -> Self {
        Self::new(ExportTable::new())
    }
}

impl Default for HostScope {
    fn default() -> Self {
        Self::empty()
    }
}

impl ResolutionScope for HostScope {
    fn scope_name(&self) -> String {
        self.name.clone()
    }

    fn resolve(&self, name: &str) -> Result<Unit, ResolveError> {
        self.exports.get(name).ok_or_else(|| ResolveError::NotFound {
            name: name.to_string(),
            scope: self.scope_name(),
        })
    }
}
