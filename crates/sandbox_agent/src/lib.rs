//! Agent side of the sandbox.
//!
//! The host process calls [`premain`] at startup or [`agentmain`] after an
//! attach request. Both open (or reuse) the namespace's isolation domain and
//! bind the core runtime's control server inside it. A core built on its own
//! is reached through [`GuestArchiveOpener`].

pub mod domain;
pub mod feature;
pub mod guest;
pub mod launcher;
pub mod layout;
pub mod logging;
pub mod result;

pub use domain::{DomainError, DomainManager, SandboxDomain};
pub use feature::FeatureMap;
pub use guest::{CoreThrown, GuestArchive, GuestArchiveOpener};
pub use launcher::{AgentLauncher, AttachCause, AttachError, AttachPhase};
pub use layout::SandboxLayout;
pub use result::{append_attach_result, lookup_attach_result, AttachResult, ResultFileError};

use once_cell::sync::OnceCell;
use sandbox_api::Instrumentation;
use std::net::SocketAddr;
use std::sync::Arc;

static LAUNCHER: OnceCell<AgentLauncher> = OnceCell::new();

/// Process-wide launcher over [`DomainManager::global`].
pub fn launcher() -> &'static AgentLauncher {
    LAUNCHER.get_or_init(|| AgentLauncher::new(DomainManager::global()))
}

/// Static-load entry point.
pub fn premain(feature: &str, inst: Arc<dyn Instrumentation>) -> Result<SocketAddr, AttachError> {
    let feature = FeatureMap::parse(feature);
    start_logging(&feature);
    launcher().premain(&feature, inst).inspect_err(report)
}

/// Dynamic-attach entry point; also appends the attach result record.
pub fn agentmain(
    feature: &str,
    inst: Arc<dyn Instrumentation>,
) -> Result<AttachResult, AttachError> {
    let feature = FeatureMap::parse(feature);
    start_logging(&feature);
    launcher().agentmain(&feature, inst).inspect_err(report)
}

/// Minimal health-check API for controllers.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the agent crate version.
pub fn agent_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

fn start_logging(feature: &FeatureMap) {
    let Some(layout) = launcher().layout(feature) else {
        return;
    };
    // A broken log directory never blocks attach.
    if let Err(err) = logging::init_logging(logging::default_log_level(), &layout.log_dir()) {
        eprintln!("sandbox: logging disabled: {err}");
    }
}

fn report(err: &AttachError) {
    eprintln!("sandbox: {err}");
}
