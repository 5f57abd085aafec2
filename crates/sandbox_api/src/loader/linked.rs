//! Archives compiled into the host binary.
//!
//! Static deployments link the core runtime directly and register its export
//! function under the path the agent would otherwise open from disk.

use super::{Archive, ArchiveError, ArchiveOpener, ExportTable, Unit};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Populates the export table of one linked archive.
pub type ExportFn = Arc<dyn Fn(&mut ExportTable) + Send + Sync>;

/// Opener resolving archive paths to in-process export functions.
#[derive(Default)]
pub struct LinkedArchiveOpener {
    archives: RwLock<HashMap<PathBuf, ExportFn>>,
}

impl LinkedArchiveOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the archive at `path`. A later registration replaces it.
    pub fn register(
        &self,
        path: impl Into<PathBuf>,
        exports: impl Fn(&mut ExportTable) + Send + Sync + 'static,
    ) -> &Self {
        self.archives.write().insert(path.into(), Arc::new(exports));
        self
    }

    pub fn is_registered(&self, path: &Path) -> bool {
        self.archives.read().contains_key(path)
    }
}

impl ArchiveOpener for LinkedArchiveOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Archive>, ArchiveError> {
        let exports_fn = self
            .archives
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| ArchiveError::NotFound(path.to_path_buf()))?;
        let mut exports = ExportTable::new();
        exports_fn(&mut exports);
        Ok(Box::new(LinkedArchive {
            path: path.to_path_buf(),
            exports: Mutex::new(Some(exports)),
        }))
    }
}

/// One opened linked archive.
pub struct LinkedArchive {
    path: PathBuf,
    exports: Mutex<Option<ExportTable>>,
}

impl Archive for LinkedArchive {
    fn path(&self) -> &Path {
        &self.path
    }

    fn lookup(&self, name: &str) -> Option<Unit> {
        self.exports.lock().as_ref().and_then(|table| table.get(name))
    }

    fn services(&self, contract: &str) -> Vec<String> {
        self.exports
            .lock()
            .as_ref()
            .map(|table| table.services(contract))
            .unwrap_or_default()
    }

    fn close(&self) -> Result<(), ArchiveError> {
        self.exports.lock().take();
        Ok(())
    }
}
