//! Core configuration parsed from the feature string handed over by the agent.
//!
//! # Responsibility
//! - Decode `;key=value;` core feature strings into typed settings.
//! - Serve the read-only `ConfigInfo` view injected into providers.
//!
//! # Invariants
//! - Malformed segments are dropped; only missing `sandbox_home` or an
//!   unparsable ip/port is fatal.
//! - A parsed configuration is immutable.

use sandbox_api::{ConfigInfo, LaunchMode};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

pub const KEY_CFG: &str = "cfg";
pub const KEY_SYSTEM_MODULE: &str = "system_module";
pub const KEY_MODE: &str = "mode";
pub const KEY_SANDBOX_HOME: &str = "sandbox_home";
pub const KEY_USER_MODULE: &str = "user_module";
pub const KEY_PROVIDER: &str = "provider";
pub const KEY_NAMESPACE: &str = "namespace";
pub const KEY_SERVER_IP: &str = "ip";
pub const KEY_SERVER_PORT: &str = "port";
pub const KEY_UNSAFE_ENABLE: &str = "unsafe.enable";

const DEFAULT_NAMESPACE: &str = "default";

/// Typed core settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfigure {
    namespace: String,
    mode: LaunchMode,
    home: PathBuf,
    cfg_path: PathBuf,
    system_module_path: PathBuf,
    user_module_path: PathBuf,
    provider_path: PathBuf,
    server_ip: IpAddr,
    server_port: u16,
    enable_unsafe: bool,
    properties_path: PathBuf,
}

impl CoreConfigure {
    /// Parses `feature` and records `properties_path`.
    ///
    /// The properties file itself is not read here.
    pub fn to_configure(feature: &str, properties_path: &str) -> Result<Self, ConfigureError> {
        let features = parse_feature(feature);
        let get = |key: &str| features.get(key).map(String::as_str);

        let home = get(KEY_SANDBOX_HOME)
            .map(PathBuf::from)
            .ok_or(ConfigureError::Missing(KEY_SANDBOX_HOME))?;
        let path_or = |key: &str, fallback: &str| {
            get(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join(fallback))
        };

        let mode = match get(KEY_MODE) {
            None => LaunchMode::Agent,
            Some(value) => LaunchMode::parse(value).ok_or_else(|| ConfigureError::Invalid {
                key: KEY_MODE,
                value: value.to_string(),
            })?,
        };
        let server_ip = match get(KEY_SERVER_IP) {
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Some(value) => value.parse().map_err(|_| ConfigureError::Invalid {
                key: KEY_SERVER_IP,
                value: value.to_string(),
            })?,
        };
        let server_port = match get(KEY_SERVER_PORT) {
            None => 0,
            Some(value) => value.parse().map_err(|_| ConfigureError::Invalid {
                key: KEY_SERVER_PORT,
                value: value.to_string(),
            })?,
        };

        Ok(Self {
            namespace: get(KEY_NAMESPACE).unwrap_or(DEFAULT_NAMESPACE).to_string(),
            mode,
            cfg_path: path_or(KEY_CFG, "cfg"),
            system_module_path: path_or(KEY_SYSTEM_MODULE, "module"),
            user_module_path: path_or(KEY_USER_MODULE, "user-module"),
            provider_path: path_or(KEY_PROVIDER, "provider"),
            server_ip,
            server_port,
            enable_unsafe: get(KEY_UNSAFE_ENABLE)
                .is_some_and(|value| value.eq_ignore_ascii_case("true")),
            properties_path: PathBuf::from(properties_path),
            home,
        })
    }

    pub fn cfg_path(&self) -> &Path {
        &self.cfg_path
    }

    pub fn properties_path(&self) -> &Path {
        &self.properties_path
    }

    pub fn server_ip(&self) -> IpAddr {
        self.server_ip
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }
}

impl ConfigInfo for CoreConfigure {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn mode(&self) -> LaunchMode {
        self.mode
    }

    fn home(&self) -> &Path {
        &self.home
    }

    fn system_module_path(&self) -> &Path {
        &self.system_module_path
    }

    fn user_module_path(&self) -> &Path {
        &self.user_module_path
    }

    fn provider_path(&self) -> &Path {
        &self.provider_path
    }

    fn server_address(&self) -> SocketAddr {
        SocketAddr::new(self.server_ip, self.server_port)
    }

    fn is_enable_unsafe(&self) -> bool {
        self.enable_unsafe
    }

    fn version(&self) -> &str {
        crate::core_version()
    }
}

fn parse_feature(feature: &str) -> HashMap<String, String> {
    let mut features = HashMap::new();
    for segment in feature.split(';') {
        let mut parts = segment.split('=').collect::<Vec<_>>();
        while parts.last().is_some_and(|part| part.is_empty()) {
            parts.pop();
        }
        if let [key, value] = parts[..] {
            if !key.trim().is_empty() && !value.trim().is_empty() {
                features.insert(key.to_string(), value.to_string());
            }
        }
    }
    features
}

/// Core feature decoding failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigureError {
    Missing(&'static str),
    Invalid { key: &'static str, value: String },
}

impl Display for ConfigureError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "core feature `{key}` is required"),
            Self::Invalid { key, value } => {
                write!(f, "core feature `{key}` has invalid value `{value}`")
            }
        }
    }
}

impl Error for ConfigureError {}

#[cfg(test)]
mod tests {
    use super::{parse_feature, ConfigureError, CoreConfigure};
    use sandbox_api::{ConfigInfo, LaunchMode};
    use std::path::Path;

    const FEATURE: &str = ";cfg=/opt/sandbox/cfg;system_module=/opt/sandbox/module;mode=attach;\
sandbox_home=/opt/sandbox;user_module=/opt/sandbox/user-module;provider=/opt/sandbox/provider;\
namespace=alpha;ip=127.0.0.1;port=4769;";

    #[test]
    fn parses_full_core_feature() {
        let cfg = CoreConfigure::to_configure(FEATURE, "/opt/sandbox/cfg/sandbox.properties")
            .expect("configure");

        assert_eq!(cfg.namespace(), "alpha");
        assert_eq!(cfg.mode(), LaunchMode::Attach);
        assert_eq!(cfg.home(), Path::new("/opt/sandbox"));
        assert_eq!(cfg.cfg_path(), Path::new("/opt/sandbox/cfg"));
        assert_eq!(cfg.provider_path(), Path::new("/opt/sandbox/provider"));
        assert_eq!(cfg.server_address().to_string(), "127.0.0.1:4769");
        assert!(!cfg.is_enable_unsafe());
        assert_eq!(
            cfg.properties_path(),
            Path::new("/opt/sandbox/cfg/sandbox.properties")
        );
    }

    #[test]
    fn missing_optional_keys_fall_back_to_defaults() {
        let cfg = CoreConfigure::to_configure(";sandbox_home=/srv/sb;", "").expect("configure");

        assert_eq!(cfg.namespace(), "default");
        assert_eq!(cfg.mode(), LaunchMode::Agent);
        assert_eq!(cfg.system_module_path(), Path::new("/srv/sb/module"));
        assert_eq!(cfg.user_module_path(), Path::new("/srv/sb/user-module"));
        assert_eq!(cfg.server_address().to_string(), "0.0.0.0:0");
    }

    #[test]
    fn sandbox_home_is_required() {
        let err = CoreConfigure::to_configure(";namespace=alpha;", "").expect_err("missing home");
        assert_eq!(err, ConfigureError::Missing("sandbox_home"));
    }

    #[test]
    fn rejects_unparsable_port() {
        let err = CoreConfigure::to_configure(";sandbox_home=/srv;port=http;", "")
            .expect_err("bad port");
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn unsafe_flag_is_opt_in() {
        let cfg = CoreConfigure::to_configure(";sandbox_home=/srv;unsafe.enable=TRUE;", "")
            .expect("configure");
        assert!(cfg.is_enable_unsafe());
    }

    #[test]
    fn malformed_segments_are_dropped() {
        let features = parse_feature("a=1;=2;b=;c;d=4=;e=5=6");
        assert_eq!(features.get("a").map(String::as_str), Some("1"));
        assert_eq!(features.get("d").map(String::as_str), Some("4"));
        assert!(!features.contains_key("b"));
        assert!(!features.contains_key("c"));
        assert!(!features.contains_key("e"));
        assert_eq!(features.len(), 2);
    }
}
