//! Core runtime archive of the sandbox.
//!
//! Loaded into an isolation domain by the agent, which reaches a separately
//! built core through the C-ABI table of [`cabi`] and a linked one through
//! the units registered in [`exports`].

pub mod cabi;
pub mod catalog;
pub mod configure;
pub mod exports;
pub mod matcher;
pub mod provider;
pub mod server;

pub use catalog::LoadedUnitCatalog;
pub use configure::{ConfigureError, CoreConfigure};
pub use cabi::{sandbox_core_entry_v1, spy_handler_table, ForeignThrown, ForeignValue};
pub use exports::{register_exports, register_exports_with};
pub use matcher::{ExtFilterMatcher, GroupMatcher, Matcher, MatchingResult, UnsupportedMatcher};
pub use provider::{inject_resources, ProviderLoadError, ProviderManager};
pub use server::{CoreRuntime, ProxyCoreServer};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
