//! Attach result record.
//!
//! # Responsibility
//! - Append one `namespace;token;host;port` line per successful attach.
//! - Look up the latest record for a namespace on the controller side.
//!
//! # Invariants
//! - The file is only ever appended to.
//! - Writers inside one process are serialised.
//! - A result path that exists but is not a writable regular file is refused.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const FIELD_SEPARATOR: char = ';';

static RESULT_FILE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Outcome of one attach: where the namespace's control server listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachResult {
    pub namespace: String,
    pub token: String,
    pub host: String,
    pub port: u16,
}

impl AttachResult {
    pub fn new(namespace: impl Into<String>, token: impl Into<String>, local: SocketAddr) -> Self {
        Self {
            namespace: namespace.into(),
            token: token.into(),
            host: local.ip().to_string(),
            port: local.port(),
        }
    }

    /// Record line without the trailing newline.
    pub fn to_line(&self) -> String {
        format!(
            "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}",
            self.namespace, self.token, self.host, self.port
        )
    }

    /// Parses one record line; `None` for anything malformed.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.trim_end_matches(['\r', '\n']).split(FIELD_SEPARATOR);
        let namespace = fields.next()?;
        let token = fields.next()?;
        let host = fields.next()?;
        let port = fields.next()?.trim().parse().ok()?;
        if fields.next().is_some() || namespace.is_empty() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            token: token.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

/// Appends `result` to the record file at `path`, creating it if needed.
pub fn append_attach_result(path: &Path, result: &AttachResult) -> Result<(), ResultFileError> {
    let _guard = RESULT_FILE_LOCK.lock();
    ensure_writable(path)?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| ResultFileError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ResultFileError::io(path, source))?;
    writeln!(file, "{}", result.to_line()).map_err(|source| ResultFileError::io(path, source))?;
    file.flush()
        .map_err(|source| ResultFileError::io(path, source))
}

/// Latest record for `namespace`, optionally narrowed to `token`.
///
/// A missing record file has no records.
pub fn lookup_attach_result(
    path: &Path,
    namespace: &str,
    token: Option<&str>,
) -> Result<Option<AttachResult>, ResultFileError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ResultFileError::io(path, source)),
    };

    Ok(content
        .lines()
        .filter_map(AttachResult::parse_line)
        .filter(|record| record.namespace == namespace)
        .filter(|record| token.map_or(true, |token| record.token == token))
        .last())
}

fn ensure_writable(path: &Path) -> Result<(), ResultFileError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(ResultFileError::io(path, source)),
    };
    if !metadata.is_file() || metadata.permissions().readonly() {
        return Err(ResultFileError::NotWritable(path.to_path_buf()));
    }
    Ok(())
}

/// Result record failures.
#[derive(Debug)]
pub enum ResultFileError {
    NotWritable(PathBuf),
    Io { path: PathBuf, source: io::Error },
}

impl ResultFileError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl Display for ResultFileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotWritable(path) => {
                write!(f, "result file `{}` is not a writable file", path.display())
            }
            Self::Io { path, source } => {
                write!(f, "result file `{}` i/o failure: {source}", path.display())
            }
        }
    }
}

impl Error for ResultFileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::NotWritable(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{append_attach_result, lookup_attach_result, AttachResult, ResultFileError};
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn record(namespace: &str, token: &str, port: u16) -> AttachResult {
        let local: SocketAddr = format!("127.0.0.1:{port}").parse().expect("addr");
        AttachResult::new(namespace, token, local)
    }

    #[test]
    fn line_format_and_parse() {
        let result = record("alpha", "t-1", 40123);
        assert_eq!(result.to_line(), "alpha;t-1;127.0.0.1;40123");
        assert_eq!(AttachResult::parse_line("alpha;t-1;127.0.0.1;40123\n"), Some(result));

        let no_token = AttachResult::parse_line("beta;;0.0.0.0;0").expect("empty token");
        assert_eq!(no_token.token, "");
        assert!(AttachResult::parse_line("alpha;t;host").is_none());
        assert!(AttachResult::parse_line("alpha;t;host;port").is_none());
        assert!(AttachResult::parse_line("alpha;t;host;1;extra").is_none());
    }

    #[test]
    fn serializes_with_field_names() {
        let json = serde_json::to_value(record("alpha", "t-1", 40123)).expect("json");
        assert_eq!(
            json,
            serde_json::json!({
                "namespace": "alpha",
                "token": "t-1",
                "host": "127.0.0.1",
                "port": 40123,
            })
        );
    }

    #[test]
    fn appends_and_looks_up_latest_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(".sandbox.token");

        append_attach_result(&path, &record("alpha", "t-1", 4001)).expect("first");
        append_attach_result(&path, &record("beta", "t-2", 4002)).expect("second");
        append_attach_result(&path, &record("alpha", "t-3", 4003)).expect("third");

        let content = std::fs::read_to_string(&path).expect("read");
        assert_eq!(content.lines().count(), 3);

        let latest = lookup_attach_result(&path, "alpha", None)
            .expect("lookup")
            .expect("alpha record");
        assert_eq!(latest.port, 4003);
        let by_token = lookup_attach_result(&path, "alpha", Some("t-1"))
            .expect("lookup")
            .expect("token record");
        assert_eq!(by_token.port, 4001);
        assert!(lookup_attach_result(&path, "gamma", None)
            .expect("lookup")
            .is_none());
    }

    #[test]
    fn missing_file_has_no_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let found = lookup_attach_result(&dir.path().join("absent"), "alpha", None)
            .expect("missing file is not an error");
        assert!(found.is_none());
    }

    #[test]
    fn refuses_non_file_result_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = append_attach_result(dir.path(), &record("alpha", "", 1))
            .expect_err("directory is not writable as a file");
        assert!(matches!(err, ResultFileError::NotWritable(_)));
    }

    #[test]
    fn concurrent_writers_never_interleave_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Arc::new(dir.path().join(".sandbox.token"));

        let handles: Vec<_> = (0..16_u16)
            .map(|index| {
                let path = path.clone();
                std::thread::spawn(move || {
                    for round in 0..10_u16 {
                        let result = record(&format!("ns{index}"), "token", round);
                        append_attach_result(&path, &result).expect("append");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let content = std::fs::read_to_string(path.as_ref()).expect("read");
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 160);
        assert!(lines
            .iter()
            .all(|line| AttachResult::parse_line(line).is_some()));
    }
}
