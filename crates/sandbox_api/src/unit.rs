//! Loaded-unit model shared by the catalog, matchers and ext filters.
//!
//! # Responsibility
//! - Describe the structural shape of a unit loaded in the managed runtime.
//! - Keep introspection fallible per unit: a unit whose defining scope was
//!   already disposed may fail to describe itself.
//!
//! # Invariants
//! - `UnitStructure` is a detached snapshot; it never borrows from the unit.
//! - Behavior sign codes are stable for a given structure.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

bitflags! {
    /// Access and shape modifiers of a unit or one of its behaviors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Access: u32 {
        const PUBLIC = 1 << 0;
        const PRIVATE = 1 << 1;
        const PROTECTED = 1 << 2;
        const STATIC = 1 << 3;
        const FINAL = 1 << 4;
        const INTERFACE = 1 << 5;
        const NATIVE = 1 << 6;
        const ABSTRACT = 1 << 7;
        const ENUM = 1 << 8;
        const ANNOTATION = 1 << 9;
        const SYNTHETIC = 1 << 10;
    }
}

/// Annotation type marking units that must stay invisible to augmentation.
pub const STEALTH_ANNOTATION: &str = "sandbox_api::annotation::Stealth";

/// Identity of the loading scope that defined a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoaderRef {
    /// Opaque scope identity assigned by the managed runtime.
    pub id: u64,
    /// Human-readable scope name, e.g. `SandboxDomain[namespace=default;...]`.
    pub name: String,
    /// `true` when the scope belongs to the sandbox itself.
    pub stealth: bool,
}

/// Structural snapshot of one behavior (method or constructor).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BehaviorStructure {
    pub name: String,
    pub access: Access,
    pub parameter_types: Vec<String>,
    pub return_type: String,
    pub exception_types: Vec<String>,
    pub annotations: Vec<String>,
}

impl BehaviorStructure {
    pub fn new(name: impl Into<String>, access: Access) -> Self {
        Self {
            name: name.into(),
            access,
            ..Self::default()
        }
    }

    /// Stable identity of this behavior inside `owner`: `owner#name(p1,p2)`.
    pub fn sign_code(&self, owner: &str) -> String {
        format!("{owner}#{}({})", self.name, self.parameter_types.join(","))
    }
}

/// Structural snapshot of one loaded unit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnitStructure {
    pub name: String,
    /// `None` means the unit was defined by the bootstrap scope.
    pub loader: Option<LoaderRef>,
    pub access: Access,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub annotations: Vec<String>,
    pub behaviors: Vec<BehaviorStructure>,
}

impl UnitStructure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        self.loader.is_none()
    }

    pub fn has_annotation(&self, annotation: &str) -> bool {
        self.annotations.iter().any(|value| value == annotation)
    }
}

/// A unit currently present in the managed runtime's loaded set.
pub trait LoadedUnit: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Describes the unit's structure.
    ///
    /// # Errors
    /// - Returns `IntrospectionError` when the unit (or a unit it depends on)
    ///   can no longer be described, e.g. after its scope was disposed.
    fn structure(&self) -> Result<UnitStructure, IntrospectionError>;

    /// Modifiability recorded when the unit was captured, for units that are
    /// snapshots of a unit living on the far side of the core boundary.
    fn captured_modifiable(&self) -> Option<bool> {
        None
    }
}

/// Shared handle to one loaded unit.
pub type UnitRef = Arc<dyn LoadedUnit>;

/// Per-unit structural introspection failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntrospectionError {
    pub unit: String,
    pub message: String,
}

impl IntrospectionError {
    pub fn new(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            message: message.into(),
        }
    }
}

impl Display for IntrospectionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "introspection of unit `{}` failed: {}", self.unit, self.message)
    }
}

impl Error for IntrospectionError {}
