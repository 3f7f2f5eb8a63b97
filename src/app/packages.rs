use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use crate::app::config::ToolSettings;
use crate::app::error::AppError;
use crate::app::models::PackageRecord;
use crate::app::runner::{args, run_tool};

/// Platform package manager lookup for a single package name.
pub trait PackageResolver: Send + Sync {
    fn resolve(&self, package_name: &str, trace_id: &str) -> Result<PackageRecord, AppError>;
}

/// Reads `packages.list` and resolves every named package, in file order.
///
/// Blank lines and names that no longer resolve (uninstalled, mid-uninstall)
/// are dropped. A missing file is an empty list.
pub fn read_packages(path: &Path, resolver: &dyn PackageResolver, trace_id: &str) -> Vec<PackageRecord> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(trace_id = %trace_id, path = %path.display(), error = %err, "failed to read package list");
            return Vec::new();
        }
    };

    raw.lines()
        .filter_map(package_name_of)
        .filter_map(|name| match resolver.resolve(name, trace_id) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!(trace_id = %trace_id, package_name = %name, error = %err, "skipping unresolved package");
                None
            }
        })
        .collect()
}

pub fn package_name_of(line: &str) -> Option<&str> {
    line.split_whitespace().next()
}

/// Resolves packages through `dumpsys package <name>`, caching by name.
pub struct DumpsysResolver {
    program: String,
    timeout: Duration,
    cache: Mutex<HashMap<String, PackageRecord>>,
}

impl DumpsysResolver {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &ToolSettings) -> Self {
        Self::new(&settings.dumpsys_program, settings.timeout())
    }

    pub fn forget(&self, package_name: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(package_name);
        }
    }
}

impl PackageResolver for DumpsysResolver {
    fn resolve(&self, package_name: &str, trace_id: &str) -> Result<PackageRecord, AppError> {
        if let Some(hit) = self.cache.lock().ok().and_then(|cache| cache.get(package_name).cloned()) {
            return Ok(hit);
        }
        let output = run_tool(&self.program, &args(["package", package_name]), self.timeout, trace_id)?;
        let record = parse_dumpsys_package(package_name, &output.stdout).ok_or_else(|| {
            AppError::dependency(format!("Package {package_name} is not installed"), trace_id)
        })?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(package_name.to_string(), record.clone());
        }
        Ok(record)
    }
}

/// Builds a record from `dumpsys package` output; `None` when the package is unknown.
pub fn parse_dumpsys_package(package_name: &str, output: &str) -> Option<PackageRecord> {
    let uid = parse_dumpsys_user_id(output)?;
    Some(PackageRecord {
        package_name: package_name.to_string(),
        uid,
        label: package_name.to_string(),
        version_name: parse_dumpsys_value(output, "versionName"),
        version_code: parse_dumpsys_value(output, "versionCode").and_then(|value| value.parse().ok()),
        is_system: parse_dumpsys_is_system(output),
        code_path: parse_dumpsys_value(output, "codePath"),
    })
}

pub fn parse_dumpsys_user_id(output: &str) -> Option<i32> {
    parse_dumpsys_value(output, "userId").and_then(|value| value.parse().ok())
}

/// First `key=value` (or `key:value`) occurrence, value cut at whitespace and unquoted.
pub fn parse_dumpsys_value(output: &str, key: &str) -> Option<String> {
    for line in output.lines() {
        for token in line.split_whitespace() {
            let value = token
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('=').or_else(|| rest.strip_prefix(':')));
            if let Some(value) = value {
                let value = value.trim_matches(['"', '\'']);
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

pub fn parse_dumpsys_is_system(output: &str) -> bool {
    output.lines().any(|line| {
        line.trim()
            .strip_prefix("pkgFlags=[")
            .map(|flags| flags.split_whitespace().any(|flag| flag == "SYSTEM"))
            .unwrap_or(false)
    })
}
