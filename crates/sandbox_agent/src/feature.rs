//! Feature descriptor handed to the agent by the controller.
//!
//! # Responsibility
//! - Parse the flat `key=value;key=value;...` descriptor.
//! - Derive the core feature string forwarded across the isolation boundary.
//!
//! # Invariants
//! - Malformed segments are dropped, never reported.
//! - A duplicate key keeps its first position and its last value.
//! - `ip`, `port` and `unsafe.enable` reach the core only when the controller
//!   supplied them.

use crate::layout::SandboxLayout;
use indexmap::IndexMap;
use sandbox_api::LaunchMode;
use std::fmt::{Display, Formatter, Write};
use std::path::PathBuf;

pub const KEY_HOME: &str = "home";
pub const KEY_NAMESPACE: &str = "namespace";
pub const KEY_SERVER_IP: &str = "ip";
pub const KEY_SERVER_PORT: &str = "port";
pub const KEY_TOKEN: &str = "token";
pub const KEY_PROPERTIES_FILE_PATH: &str = "prop";
pub const KEY_UNSAFE_ENABLE: &str = "unsafe.enable";

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_SERVER_IP: &str = "0.0.0.0";
pub const DEFAULT_SERVER_PORT: &str = "0";

/// Environment variable overriding the derived sandbox home.
pub const SANDBOX_HOME_ENV: &str = "SANDBOX_HOME";

const SEGMENT_SEPARATOR: char = ';';
const KV_SEPARATOR: char = '=';

/// Insertion-ordered view of a parsed feature descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureMap {
    entries: IndexMap<String, String>,
}

impl FeatureMap {
    pub fn parse(descriptor: &str) -> Self {
        let mut entries = IndexMap::new();
        for segment in descriptor.split(SEGMENT_SEPARATOR) {
            if let Some((key, value)) = parse_segment(segment) {
                entries.insert(key.to_string(), value.to_string());
            }
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn namespace(&self) -> &str {
        self.get(KEY_NAMESPACE).unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn token(&self) -> &str {
        self.get(KEY_TOKEN).unwrap_or_default()
    }

    pub fn server_ip(&self) -> &str {
        self.get(KEY_SERVER_IP).unwrap_or(DEFAULT_SERVER_IP)
    }

    pub fn server_port(&self) -> &str {
        self.get(KEY_SERVER_PORT).unwrap_or(DEFAULT_SERVER_PORT)
    }

    /// Sandbox home: the `home` key, else [`default_home`].
    pub fn home(&self) -> Option<PathBuf> {
        self.get(KEY_HOME).map(PathBuf::from).or_else(default_home)
    }

    /// Properties file: the `prop` key, else `<home>/cfg/sandbox.properties`.
    pub fn properties_path(&self, layout: &SandboxLayout) -> PathBuf {
        self.get(KEY_PROPERTIES_FILE_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| layout.properties_file())
    }

    /// Re-encodes every entry in insertion order.
    pub fn to_descriptor(&self) -> String {
        self.to_string()
    }

    /// Core feature string consumed by the core configure factory.
    pub fn to_core_feature(&self, layout: &SandboxLayout, mode: LaunchMode) -> String {
        let mut feature = String::new();
        // Writing into a String cannot fail.
        let _ = write!(
            feature,
            ";cfg={};system_module={};mode={};sandbox_home={};user_module={};provider={};namespace={};",
            layout.cfg_dir().display(),
            layout.module_dir().display(),
            mode.as_str(),
            layout.home().display(),
            layout.user_module_dir().display(),
            layout.provider_dir().display(),
            self.namespace(),
        );
        if self.contains_key(KEY_SERVER_IP) {
            let _ = write!(feature, "{KEY_SERVER_IP}={};", self.server_ip());
        }
        if self.contains_key(KEY_SERVER_PORT) {
            let _ = write!(feature, "{KEY_SERVER_PORT}={};", self.server_port());
        }
        if let Some(enable) = self.get(KEY_UNSAFE_ENABLE) {
            let _ = write!(feature, "{KEY_UNSAFE_ENABLE}={enable};");
        }
        feature
    }
}

impl Display for FeatureMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (key, value) in &self.entries {
            write!(f, "{key}{KV_SEPARATOR}{value}{SEGMENT_SEPARATOR}")?;
        }
        Ok(())
    }
}

/// `$SANDBOX_HOME`, else two levels above the running executable.
pub fn default_home() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os(SANDBOX_HOME_ENV).filter(|home| !home.is_empty()) {
        return Some(PathBuf::from(home));
    }
    let exe = std::env::current_exe().ok()?;
    exe.parent()?.parent().map(PathBuf::from)
}

fn parse_segment(segment: &str) -> Option<(&str, &str)> {
    let mut parts = segment.split(KV_SEPARATOR);
    let key = parts.next()?.trim();
    let value = parts.next()?.trim();
    if parts.any(|rest| !rest.is_empty()) || key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::{
        FeatureMap, DEFAULT_NAMESPACE, KEY_NAMESPACE, KEY_SERVER_PORT, KEY_UNSAFE_ENABLE,
    };
    use crate::layout::SandboxLayout;
    use sandbox_api::LaunchMode;
    use std::path::{Path, PathBuf};

    #[test]
    fn parse_drops_malformed_segments() {
        let feature = FeatureMap::parse("namespace=alpha;;novalue;=orphan;a=b=c;port=;token=t1;");
        let pairs: Vec<_> = feature.iter().collect();
        assert_eq!(pairs, vec![("namespace", "alpha"), ("token", "t1")]);
    }

    #[test]
    fn trailing_separator_after_value_is_tolerated() {
        let feature = FeatureMap::parse("home=/srv/sandbox=;namespace=beta");
        assert_eq!(feature.get("home"), Some("/srv/sandbox"));
        assert_eq!(feature.namespace(), "beta");
    }

    #[test]
    fn duplicate_key_keeps_last_value() {
        let feature = FeatureMap::parse("namespace=first;port=1;namespace=second");
        assert_eq!(feature.namespace(), "second");
        assert_eq!(feature.to_descriptor(), "namespace=second;port=1;");
    }

    #[test]
    fn defaults_apply_to_missing_keys() {
        let feature = FeatureMap::parse("");
        assert!(feature.is_empty());
        assert_eq!(feature.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(feature.token(), "");
        assert_eq!(feature.server_ip(), "0.0.0.0");
        assert_eq!(feature.server_port(), "0");
    }

    #[test]
    fn recognised_keys_survive_reencoding() {
        let descriptors = [
            "namespace=alpha;port=8080",
            "home=/opt/sandbox;namespace=ns-1;ip=127.0.0.1;port=0;token=abc;prop=/tmp/x.properties;",
            ";;token=t;bogus;namespace=a;namespace=b;",
            " namespace = spaced ; ip = ::1 ",
        ];
        let keys = ["home", KEY_NAMESPACE, "ip", KEY_SERVER_PORT, "token", "prop"];
        for descriptor in descriptors {
            let parsed = FeatureMap::parse(descriptor);
            let reparsed = FeatureMap::parse(&parsed.to_descriptor());
            for key in keys {
                assert_eq!(parsed.get(key), reparsed.get(key), "{descriptor} / {key}");
            }
        }
    }

    #[test]
    fn properties_path_falls_back_to_layout() {
        let layout = SandboxLayout::new("/opt/sandbox");
        let feature = FeatureMap::parse("namespace=alpha");
        assert_eq!(
            feature.properties_path(&layout),
            Path::new("/opt/sandbox/cfg/sandbox.properties")
        );
        let feature = FeatureMap::parse("prop=/etc/sandbox.properties");
        assert_eq!(
            feature.properties_path(&layout),
            PathBuf::from("/etc/sandbox.properties")
        );
    }

    #[test]
    fn core_feature_forwards_ip_and_port_only_when_present() {
        let layout = SandboxLayout::new("/opt/sandbox").with_data_root("/data/sandbox");
        let feature = FeatureMap::parse("namespace=alpha;port=8080");
        let core = feature.to_core_feature(&layout, LaunchMode::Attach);
        assert_eq!(
            core,
            ";cfg=/opt/sandbox/cfg;system_module=/opt/sandbox/module;mode=attach;\
             sandbox_home=/opt/sandbox;user_module=/data/sandbox/user-module;\
             provider=/opt/sandbox/provider;namespace=alpha;port=8080;"
        );

        let bare = FeatureMap::parse("").to_core_feature(&layout, LaunchMode::Agent);
        assert!(bare.contains("mode=agent;"));
        assert!(bare.ends_with("namespace=default;"));
        assert!(!bare.contains("ip="));
        assert!(!bare.contains(KEY_UNSAFE_ENABLE));
    }

    #[test]
    fn core_feature_forwards_unsafe_switch() {
        let layout = SandboxLayout::new("/opt/sandbox");
        let feature = FeatureMap::parse("namespace=alpha;unsafe.enable=true;token=t");
        let core = feature.to_core_feature(&layout, LaunchMode::Attach);
        assert!(core.ends_with("namespace=alpha;unsafe.enable=true;"));
        assert!(!core.contains("token"));
    }
}
