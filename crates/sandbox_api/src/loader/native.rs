//! Dynamic-library archives.
//!
//! A native archive is a shared library exporting two C-ABI symbols:
//! `sandbox_archive_abi_version` and `sandbox_archive_exports_v1`. The
//! library is opened with local symbol visibility so its code stays private
//! to the domain that opened it.
//!
//! The export table crosses as a Rust type, so these archives must come from
//! the same build as the code opening them. Core archives use the versioned
//! entry in [`crate::abi`] instead.

use super::{Archive, ArchiveError, ArchiveOpener, ExportTable, Unit};
use libloading::{Library, Symbol};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// ABI version both sides of the archive boundary must agree on.
pub const ARCHIVE_ABI_VERSION: u32 = 1;

const ABI_VERSION_SYMBOL: &[u8] = b"sandbox_archive_abi_version\0";
const EXPORTS_SYMBOL: &[u8] = b"sandbox_archive_exports_v1\0";

pub type ArchiveAbiVersionFn = unsafe extern "C" fn() -> u32;
pub type ArchiveExportsFn = unsafe extern "C" fn(table: *mut ExportTable);

/// Opens shared libraries as archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeArchiveOpener;

impl ArchiveOpener for NativeArchiveOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Archive>, ArchiveError> {
        Ok(Box::new(NativeArchive::open(path)?))
    }
}

struct Loaded {
    // Declared before `library` so exported units drop while the code that
    // backs them is still mapped.
    exports: ExportTable,
    library: Library,
}

/// A shared library opened as an archive.
pub struct NativeArchive {
    path: PathBuf,
    loaded: Mutex<Option<Loaded>>,
}

impl NativeArchive {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        if !path.is_file() {
            return Err(ArchiveError::NotFound(path.to_path_buf()));
        }

        // SAFETY: archives are trusted sandbox components; their initialisers
        // run with the same privileges as the host.
        let library = unsafe { Library::new(path) }.map_err(|err| ArchiveError::Load {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

        let actual = {
            let abi_version: Symbol<ArchiveAbiVersionFn> =
                unsafe { library.get(ABI_VERSION_SYMBOL) }.map_err(|err| ArchiveError::Load {
                    path: path.to_path_buf(),
                    message: format!("missing abi version symbol: {err}"),
                })?;
            unsafe { abi_version() }
        };
        if actual != ARCHIVE_ABI_VERSION {
            return Err(ArchiveError::IncompatibleAbi {
                path: path.to_path_buf(),
                expected: ARCHIVE_ABI_VERSION,
                actual,
            });
        }

        let mut exports = ExportTable::new();
        {
            let register: Symbol<ArchiveExportsFn> =
                unsafe { library.get(EXPORTS_SYMBOL) }.map_err(|err| ArchiveError::Load {
                    path: path.to_path_buf(),
                    message: format!("missing exports symbol: {err}"),
                })?;
            unsafe { register(&mut exports) };
        }

        info!(
            "event=archive_open module=loader status=ok path={} units={}",
            path.display(),
            exports.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            loaded: Mutex::new(Some(Loaded { exports, library })),
        })
    }
}

impl Archive for NativeArchive {
    fn path(&self) -> &Path {
        &self.path
    }

    fn lookup(&self, name: &str) -> Option<Unit> {
        self.loaded
            .lock()
            .as_ref()
            .and_then(|loaded| loaded.exports.get(name))
    }

    fn services(&self, contract: &str) -> Vec<String> {
        self.loaded
            .lock()
            .as_ref()
            .map(|loaded| loaded.exports.services(contract))
            .unwrap_or_default()
    }

    fn close(&self) -> Result<(), ArchiveError> {
        let Some(Loaded { exports, library }) = self.loaded.lock().take() else {
            return Ok(());
        };
        let outstanding = exports.outstanding();
        drop(exports);
        if outstanding > 0 {
            // Units still held elsewhere point into the mapping; keep it.
            warn!(
                "event=archive_close module=loader status=deferred path={} outstanding_units={}",
                self.path.display(),
                outstanding
            );
            std::mem::forget(library);
            return Ok(());
        }
        library.close().map_err(|err| ArchiveError::Load {
            path: self.path.clone(),
            message: format!("close failed: {err}"),
        })?;
        debug!(
            "event=archive_close module=loader status=ok path={}",
            self.path.display()
        );
        Ok(())
    }
}

/// Whether `path` names a shared library on any supported platform.
pub fn is_native_archive(path: &Path) -> bool {
    matches!(
        path.extension().and_then(OsStr::to_str),
        Some("so") | Some("dylib") | Some("dll")
    )
}

/// Platform file name of an archive called `stem`, e.g. `libsandbox_core.so`.
pub fn archive_file_name(stem: &str) -> String {
    format!(
        "{}{stem}{}",
        std::env::consts::DLL_PREFIX,
        std::env::consts::DLL_SUFFIX
    )
}

#[cfg(test)]
mod tests {
    use super::{archive_file_name, is_native_archive, NativeArchive};
    use crate::loader::ArchiveError;
    use std::path::Path;

    #[test]
    fn recognises_shared_library_extensions() {
        assert!(is_native_archive(Path::new("/opt/provider/libaudit.so")));
        assert!(is_native_archive(Path::new("audit.dylib")));
        assert!(is_native_archive(Path::new("audit.dll")));
        assert!(!is_native_archive(Path::new("audit.jar")));
        assert!(!is_native_archive(Path::new("provider")));
    }

    #[test]
    fn archive_file_name_uses_platform_affixes() {
        let name = archive_file_name("sandbox_core");
        assert!(name.contains("sandbox_core"));
        assert!(name.ends_with(std::env::consts::DLL_SUFFIX));
    }

    #[test]
    fn missing_file_is_reported_as_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(archive_file_name("absent"));
        let err = NativeArchive::open(&path)
            .err()
            .expect("missing archive must fail");
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }

    #[test]
    fn garbage_file_fails_to_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(archive_file_name("garbage"));
        std::fs::write(&path, b"not a shared library").expect("write garbage");
        let err = NativeArchive::open(&path)
            .err()
            .expect("garbage archive must fail");
        assert!(matches!(err, ArchiveError::Load { .. }));
    }
}
