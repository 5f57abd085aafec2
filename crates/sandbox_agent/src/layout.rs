//! On-disk layout of a sandbox installation.
//!
//! Everything except the user module directory and the attach result file
//! hangs off the sandbox home. Those two live under a per-host data root.

use sandbox_api::loader::native::archive_file_name;
use std::path::{Path, PathBuf};

/// Data root shared by every installation on the host.
pub const DEFAULT_DATA_ROOT: &str = "/data/appdatas/sandbox";

const CORE_ARCHIVE_STEM: &str = "sandbox_core";
const SPY_ARCHIVE_STEM: &str = "sandbox_spy";
const PROPERTIES_FILE_NAME: &str = "sandbox.properties";
const RESULT_FILE_NAME: &str = ".sandbox.token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    home: PathBuf,
    data_root: PathBuf,
}

impl SandboxLayout {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
        }
    }

    pub fn with_data_root(mut self, data_root: impl Into<PathBuf>) -> Self {
        self.data_root = data_root.into();
        self
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn cfg_dir(&self) -> PathBuf {
        self.home.join("cfg")
    }

    pub fn properties_file(&self) -> PathBuf {
        self.cfg_dir().join(PROPERTIES_FILE_NAME)
    }

    /// System module directory.
    pub fn module_dir(&self) -> PathBuf {
        self.home.join("module")
    }

    pub fn user_module_dir(&self) -> PathBuf {
        self.data_root.join("user-module")
    }

    pub fn provider_dir(&self) -> PathBuf {
        self.home.join("provider")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.home.join("lib")
    }

    /// Core runtime archive loaded into each isolation domain.
    pub fn core_archive(&self) -> PathBuf {
        self.lib_dir().join(archive_file_name(CORE_ARCHIVE_STEM))
    }

    /// Interception support archive appended to the bootstrap search path.
    pub fn spy_archive(&self) -> PathBuf {
        self.lib_dir().join(archive_file_name(SPY_ARCHIVE_STEM))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn result_file(&self) -> PathBuf {
        self.data_root.join(RESULT_FILE_NAME)
    }
}
