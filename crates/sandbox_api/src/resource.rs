//! Configuration accessor and resource injection contracts.
//!
//! # Responsibility
//! - Expose a read-only view of the active core configuration.
//! - Let provider implementations declare injectable resource fields.
//!
//! # Invariants
//! - Injection only targets fields a provider declared itself.
//! - A declared field is injected at most once per discovery.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

/// How the sandbox entered the managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaunchMode {
    /// Loaded at process startup.
    Agent,
    /// Attached into an already-running process.
    Attach,
}

impl LaunchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Attach => "attach",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "agent" => Some(Self::Agent),
            "attach" => Some(Self::Attach),
            _ => None,
        }
    }
}

impl Display for LaunchMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only accessor over the active configuration.
pub trait ConfigInfo: Send + Sync {
    fn namespace(&self) -> &str;
    fn mode(&self) -> LaunchMode;
    fn home(&self) -> &Path;
    fn system_module_path(&self) -> &Path;
    fn user_module_path(&self) -> &Path;
    fn provider_path(&self) -> &Path;
    fn server_address(&self) -> SocketAddr;
    fn is_enable_unsafe(&self) -> bool;
    fn version(&self) -> &str;
}

/// Resource value offered to providers.
#[derive(Clone)]
pub enum Resource {
    ConfigInfo(Arc<dyn ConfigInfo>),
}

/// Declared type of an injectable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    ConfigInfo,
    /// A field the core does not know how to satisfy; left untouched.
    Other(&'static str),
}

/// One field a provider marks as injectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceField {
    pub name: &'static str,
    pub kind: ResourceKind,
}

impl ResourceField {
    pub const fn config_info(name: &'static str) -> Self {
        Self {
            name,
            kind: ResourceKind::ConfigInfo,
        }
    }
}

/// Dependency-injection surface of a provider implementation.
pub trait Injectable {
    /// Fields tagged for injection. Empty by default.
    fn resource_fields(&self) -> Vec<ResourceField> {
        Vec::new()
    }

    /// Stores `resource` into the field called `field`.
    fn inject(&mut self, field: &str, _resource: Resource) -> Result<(), InjectError> {
        Err(InjectError::UnknownField(field.to_string()))
    }
}

/// Resource injection failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectError {
    UnknownField(String),
    Rejected { field: String, reason: String },
}

impl Display for InjectError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownField(field) => write!(f, "resource field is not declared: {field}"),
            Self::Rejected { field, reason } => {
                write!(f, "resource field `{field}` rejected injection: {reason}")
            }
        }
    }
}

impl Error for InjectError {}

#[cfg(test)]
mod tests {
    use super::{
        ConfigInfo, InjectError, Injectable, LaunchMode, Resource, ResourceField, ResourceKind,
    };
    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::Arc;

    struct Plain;
    impl Injectable for Plain {}

    #[test]
    fn launch_mode_round_trips_through_str() {
        for mode in [LaunchMode::Agent, LaunchMode::Attach] {
            assert_eq!(LaunchMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(LaunchMode::parse("remote"), None);
    }

    #[test]
    fn default_injectable_declares_nothing() {
        assert!(Plain.resource_fields().is_empty());
    }

    #[test]
    fn config_info_field_constructor_sets_kind() {
        let field = ResourceField::config_info("config");
        assert_eq!(field.name, "config");
        assert_eq!(field.kind, ResourceKind::ConfigInfo);
    }

    #[test]
    fn default_inject_rejects_undeclared_field() {
        let mut plain = Plain;
        let err = plain
            .inject("config", Resource::ConfigInfo(Arc::new(StubConfig)))
            .expect_err("undeclared field must be rejected");
        assert_eq!(err, InjectError::UnknownField("config".to_string()));
    }

    struct StubConfig;

    impl ConfigInfo for StubConfig {
        fn namespace(&self) -> &str {
            "default"
        }
        fn mode(&self) -> LaunchMode {
            LaunchMode::Agent
        }
        fn home(&self) -> &Path {
            Path::new("/opt/sandbox")
        }
        fn system_module_path(&self) -> &Path {
            Path::new("/opt/sandbox/module")
        }
        fn user_module_path(&self) -> &Path {
            Path::new("/opt/sandbox/user-module")
        }
        fn provider_path(&self) -> &Path {
            Path::new("/opt/sandbox/provider")
        }
        fn server_address(&self) -> SocketAddr {
            SocketAddr::from(([0, 0, 0, 0], 0))
        }
        fn is_enable_unsafe(&self) -> bool {
            false
        }
        fn version(&self) -> &str {
            "0.0.0"
        }
    }
}
