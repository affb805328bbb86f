//! Native configuration model and JSON loader.
//!
//! The configuration is a typed tree of global settings, virtual hosts,
//! locations and nested match rules. Files may pull in further files through
//! `include`/`includes` (single path or array); includes are resolved
//! relative to the including file, merged into the base, and cycle-checked.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

const MAX_INCLUDE_DEPTH: usize = 10;

const DEFAULT_RATE_LIMIT_REQUESTS: i64 = 100;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_ADMIN_PORT: &str = "8080";

/// Log sink entry with an optional named format (`combined`, `common`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LogEntry {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MimeType {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ext: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub mime: String,
}

/// How a location `path` is matched against a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Prefix,
    Regex,
    RegexCaseInsensitive,
}

impl MatchKind {
    fn parse(raw: &str) -> MatchKind {
        match raw.to_ascii_lowercase().as_str() {
            "regex" => MatchKind::Regex,
            "regexcaseinsensitive" => MatchKind::RegexCaseInsensitive,
            _ => MatchKind::Prefix,
        }
    }

    pub fn is_regex(self) -> bool {
        matches!(self, MatchKind::Regex | MatchKind::RegexCaseInsensitive)
    }
}

/// File-name-scoped override nested inside a location, from `<FilesMatch>`.
/// The pattern is tested case-insensitively against the resolved file name,
/// never the URL path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchRule {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pattern: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub handler: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_unix_socket: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cgi_path: String,
    #[serde(rename = "phpProxyFCGI", skip_serializing_if = "String::is_empty")]
    pub php_proxy_fcgi: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub directory_index: String,
    #[serde(skip)]
    pub(crate) compiled: Option<Regex>,
}

impl MatchRule {
    pub fn matches(&self, file_name: &str) -> bool {
        self.compiled
            .as_ref()
            .map(|re| re.is_match(file_name))
            .unwrap_or(false)
    }
}

/// Scoped override within a virtual host: a URL prefix, a pattern, or a
/// filesystem directory (from `<Directory>` conversion).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Location {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub match_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub handler: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_unix_socket: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cgi_path: String,
    #[serde(rename = "phpProxyFCGI", skip_serializing_if = "String::is_empty")]
    pub php_proxy_fcgi: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub directory_index: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub match_rules: Vec<MatchRule>,
    #[serde(skip)]
    pub(crate) pattern: Option<Regex>,
}

impl Location {
    pub fn match_kind(&self) -> MatchKind {
        MatchKind::parse(&self.match_type)
    }

    pub fn matches_url(&self, url_path: &str) -> bool {
        match self.match_kind() {
            MatchKind::Prefix => url_path.starts_with(&self.path),
            _ => self
                .pattern
                .as_ref()
                .map(|re| re.is_match(url_path))
                .unwrap_or(false),
        }
    }

    /// First match rule whose pattern matches the resolved file name.
    pub fn match_rule_for(&self, file_name: &str) -> Option<&MatchRule> {
        self.match_rules.iter().find(|rule| rule.matches(file_name))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualHost {
    /// Ports this virtual host answers on; empty means every configured port.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub listen: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub server_alias: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub document_root: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_admin: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub error_log: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom_log: Vec<LogEntry>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub directory_index: String,
    #[serde(rename = "phpProxyFCGI", skip_serializing_if = "String::is_empty")]
    pub php_proxy_fcgi: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cgi_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_unix_socket: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
}

impl VirtualHost {
    pub fn matches_host(&self, host: &str) -> bool {
        self.server_name == host || self.server_alias.iter().any(|alias| alias == host)
    }

    pub fn listens_on(&self, port: &str) -> bool {
        self.listen.is_empty() || self.listen.iter().any(|p| p == port)
    }

    /// Compile location and match-rule patterns. Must run after loading and
    /// after any mutation through the admin surface.
    pub fn compile_patterns(&mut self) -> GatewayResult<()> {
        for location in &mut self.locations {
            match location.match_kind() {
                MatchKind::Regex => {
                    location.pattern = Some(compile(&location.path, false)?);
                }
                MatchKind::RegexCaseInsensitive => {
                    location.pattern = Some(compile(&location.path, true)?);
                }
                MatchKind::Prefix => location.pattern = None,
            }
            for rule in &mut location.match_rules {
                rule.compiled = Some(compile(&rule.pattern, true)?);
            }
        }
        Ok(())
    }

    /// Matching location for a request. Regex locations are probed first in
    /// declaration order; prefix locations resolve by longest prefix, where a
    /// prefix may match the URL path or, for `<Directory>`-derived locations,
    /// contain the resolved filesystem candidate.
    pub fn location_for(&self, url_path: &str, fs_candidate: Option<&Path>) -> Option<&Location> {
        for location in &self.locations {
            if location.match_kind().is_regex() && location.matches_url(url_path) {
                return Some(location);
            }
        }

        let mut best: Option<&Location> = None;
        let mut longest = 0;
        for location in &self.locations {
            if location.match_kind() != MatchKind::Prefix || location.path.is_empty() {
                continue;
            }
            let by_url = url_path.starts_with(&location.path);
            let by_fs = fs_candidate
                .map(|candidate| candidate.starts_with(&location.path))
                .unwrap_or(false);
            if (by_url || by_fs) && location.path.len() > longest {
                longest = location.path.len();
                best = Some(location);
            }
        }
        best
    }
}

fn compile(pattern: &str, case_insensitive: bool) -> GatewayResult<Regex> {
    let source = if case_insensitive {
        format!("(?i){pattern}")
    } else {
        pattern.to_string()
    };
    Regex::new(&source).map_err(|source| GatewayError::InvalidRegex {
        path: pattern.to_string(),
        source,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Single path or array of paths merged into this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub includes: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_admin: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub listen: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub virtual_hosts: Vec<VirtualHost>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mime_types: Vec<MimeType>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub directory_index: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub rate_limit_requests: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub rate_limit_window_seconds: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub admin_port: String,
    #[serde(skip_serializing_if = "is_false")]
    pub admin_enabled: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub admin_auth_enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub admin_username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub admin_password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub admin_token: String,
    #[serde(rename = "adminIPWhitelist", skip_serializing_if = "Vec::is_empty")]
    pub admin_ip_whitelist: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub log_file: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub admin_log_file: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_log_file: String,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Config {
    /// Load a configuration file, resolving includes recursively and
    /// compiling all location patterns.
    pub fn load(path: impl AsRef<Path>) -> GatewayResult<Config> {
        let mut visited = HashSet::new();
        let mut config = load_with_depth(path.as_ref(), 0, &mut visited)?;
        config.compile_all_patterns()?;
        Ok(config)
    }

    pub fn compile_all_patterns(&mut self) -> GatewayResult<()> {
        for vhost in &mut self.virtual_hosts {
            vhost.compile_patterns()?;
        }
        Ok(())
    }

    /// First virtual host, in declaration order, whose name or alias equals
    /// `host` and whose listen set is empty or contains `port`. An empty
    /// `port` matches any listen restriction.
    pub fn virtual_host(&self, host: &str, port: &str) -> Option<&VirtualHost> {
        self.virtual_hosts.iter().find(|vhost| {
            vhost.matches_host(host) && (port.is_empty() || vhost.listens_on(port))
        })
    }

    /// Ordered union of global and per-vhost listen ports, first seen wins.
    pub fn all_listen_ports(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ports = Vec::new();
        let global = self.listen.iter();
        let per_vhost = self.virtual_hosts.iter().flat_map(|v| v.listen.iter());
        for port in global.chain(per_vhost) {
            if !port.is_empty() && seen.insert(port.clone()) {
                ports.push(port.clone());
            }
        }
        ports
    }

    pub fn rate_limit(&self) -> (i64, u64) {
        let max_requests = if self.rate_limit_requests > 0 {
            self.rate_limit_requests
        } else {
            DEFAULT_RATE_LIMIT_REQUESTS
        };
        let window = if self.rate_limit_window_seconds > 0 {
            self.rate_limit_window_seconds as u64
        } else {
            DEFAULT_RATE_LIMIT_WINDOW_SECS
        };
        (max_requests, window)
    }

    pub fn admin_port(&self) -> &str {
        if self.admin_port.is_empty() {
            DEFAULT_ADMIN_PORT
        } else {
            &self.admin_port
        }
    }

    /// Directory index for a virtual host, falling back to the global value.
    pub fn directory_index_for<'a>(&'a self, vhost: Option<&'a VirtualHost>) -> &'a str {
        match vhost {
            Some(v) if !v.directory_index.is_empty() => &v.directory_index,
            _ => &self.directory_index,
        }
    }

    pub fn mime_lookup(&self, ext: &str) -> Option<&str> {
        self.mime_types
            .iter()
            .find(|mt| mt.ext.eq_ignore_ascii_case(ext))
            .map(|mt| mt.mime.as_str())
    }

    /// Merge an included file into this one. Scalars override when set,
    /// string lists append with dedup, MIME entries dedup by extension with
    /// the base winning, virtual hosts append.
    fn merge_from(&mut self, included: Config) {
        merge_string(&mut self.user, included.user);
        merge_string(&mut self.group, included.group);
        merge_string(&mut self.server_admin, included.server_admin);
        merge_string(&mut self.directory_index, included.directory_index);
        merge_string(&mut self.admin_port, included.admin_port);
        merge_string(&mut self.admin_username, included.admin_username);
        merge_string(&mut self.admin_password, included.admin_password);
        merge_string(&mut self.admin_token, included.admin_token);
        merge_string(&mut self.log_file, included.log_file);
        merge_string(&mut self.admin_log_file, included.admin_log_file);
        merge_string(&mut self.error_log_file, included.error_log_file);

        merge_string_list(&mut self.listen, included.listen);
        merge_string_list(&mut self.admin_ip_whitelist, included.admin_ip_whitelist);

        if included.rate_limit_requests > 0 {
            self.rate_limit_requests = included.rate_limit_requests;
        }
        if included.rate_limit_window_seconds > 0 {
            self.rate_limit_window_seconds = included.rate_limit_window_seconds;
        }
        self.admin_enabled |= included.admin_enabled;
        self.admin_auth_enabled |= included.admin_auth_enabled;

        for mime in included.mime_types {
            if !self.mime_types.iter().any(|mt| mt.ext == mime.ext) {
                self.mime_types.push(mime);
            }
        }
        self.virtual_hosts.extend(included.virtual_hosts);
    }
}

fn merge_string(base: &mut String, included: String) {
    if !included.is_empty() {
        *base = included;
    }
}

fn merge_string_list(base: &mut Vec<String>, included: Vec<String>) {
    for value in included {
        if !base.iter().any(|existing| *existing == value) {
            base.push(value);
        }
    }
}

fn load_with_depth(
    path: &Path,
    depth: usize,
    visited: &mut HashSet<PathBuf>,
) -> GatewayResult<Config> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(GatewayError::MaxIncludeDepth);
    }

    let abs = path.canonicalize().map_err(|err| {
        GatewayError::Config(format!("cannot resolve config path {}: {err}", path.display()))
    })?;
    if !visited.insert(abs.clone()) {
        return Err(GatewayError::CircularInclude(abs.display().to_string()));
    }

    let raw = std::fs::read_to_string(&abs)?;
    let mut config: Config = serde_json::from_str(&raw).map_err(|err| {
        GatewayError::Config(format!("error parsing {}: {err}", abs.display()))
    })?;

    let base_dir = abs.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut include_files = Vec::new();
    if let Some(value) = &config.include {
        include_files.extend(include_paths(value));
    }
    if let Some(value) = &config.includes {
        include_files.extend(include_paths(value));
    }

    for include_file in include_files {
        let include_path = if Path::new(&include_file).is_absolute() {
            PathBuf::from(&include_file)
        } else {
            base_dir.join(&include_file)
        };
        let included = load_with_depth(&include_path, depth + 1, visited)?;
        config.merge_from(included);
    }

    Ok(config)
}

/// The include field accepts a single string or an array of strings; other
/// shapes are ignored.
fn include_paths(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::String(path) => vec![path.clone()],
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
