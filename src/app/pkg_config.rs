//! Flat-file store of per-uid root grants.
//!
//! The file is a header line followed by one CSV row per non-default uid:
//!
//! ```text
//! pkg,exclude,allow,uid,to_uid,sctx
//! com.termux,0,1,10234,0,u:r:magisk:s0
//! ```
//!
//! Every mutation is a full read-modify-write executed on the root executor
//! while holding [`config_lock`].

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::app::error::AppError;
use crate::app::executor::RootExecutor;
use crate::app::models::{PackageRecord, PermissionConfigEntry, PermissionProfile, DEFAULT_SCONTEXT};

pub const CSV_HEADER: &str = "pkg,exclude,allow,uid,to_uid,sctx";

const PER_USER_RANGE: i32 = 100_000;

pub type ConfigMap = HashMap<i32, PermissionConfigEntry>;

/// Process-wide guard around the config file.
fn config_lock(trace_id: &str) -> Result<MutexGuard<'static, ()>, AppError> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .map_err(|_| AppError::system("Package config lock poisoned", trace_id))
}

pub fn parse_config_line(line: &str) -> Option<PermissionConfigEntry> {
    // The context is last and may itself contain commas (MLS categories).
    let columns: Vec<&str> = line.splitn(6, ',').collect();
    if columns.len() != 6 {
        return None;
    }
    let exclude = columns[1].trim().parse().ok()?;
    let allow = columns[2].trim().parse().ok()?;
    let uid = columns[3].trim().parse().ok()?;
    let to_uid = columns[4].trim().parse().ok()?;
    Some(PermissionConfigEntry {
        pkg: columns[0].to_string(),
        exclude,
        allow,
        profile: PermissionProfile {
            uid,
            to_uid,
            scontext: columns[5].trim_end_matches('\r').to_string(),
        },
    })
}

pub fn to_config_line(entry: &PermissionConfigEntry) -> String {
    format!(
        "{},{},{},{},{},{}",
        entry.pkg, entry.exclude, entry.allow, entry.profile.uid, entry.profile.to_uid, entry.profile.scontext
    )
}

/// Parses a whole file body. Malformed rows are skipped and logged, defaults dropped.
pub fn parse_configs(raw: &str, trace_id: &str) -> ConfigMap {
    let mut configs = ConfigMap::new();
    for (index, line) in raw.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        match parse_config_line(line) {
            Some(entry) if entry.is_default() => {}
            Some(entry) => {
                configs.insert(entry.uid(), entry);
            }
            None => {
                warn!(trace_id = %trace_id, line = index + 1, "skipping malformed package config row");
            }
        }
    }
    configs
}

pub fn render_configs(configs: &ConfigMap) -> String {
    let mut rows: Vec<&PermissionConfigEntry> = configs.values().filter(|entry| !entry.is_default()).collect();
    rows.sort_by_key(|entry| entry.uid());
    let mut body = String::with_capacity(CSV_HEADER.len() + 1 + rows.len() * 48);
    body.push_str(CSV_HEADER);
    body.push('\n');
    for entry in rows {
        body.push_str(&to_config_line(entry));
        body.push('\n');
    }
    body
}

/// Applies one change to `configs` with the grant/exclusion rules.
pub fn apply_change(configs: &mut ConfigMap, mut entry: PermissionConfigEntry) {
    let uid = entry.uid();
    entry.normalize();

    // An existing row for a non-granted, excluded uid is dropped outright; the
    // exclusion itself is not persisted on this path.
    if entry.allow == 0 && entry.exclude != 0 && configs.contains_key(&uid) {
        configs.remove(&uid);
    } else {
        debug!(uid, pkg = %entry.pkg, allow = entry.allow, exclude = entry.exclude, "change config");
        configs.insert(uid, entry);
    }
}

/// What a sync against the installed package list produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub stored: Vec<PermissionConfigEntry>,
    /// Excluded rows implied by whitelist enforcement; never written.
    pub implied: Vec<PermissionConfigEntry>,
    pub rewritten: bool,
}

#[derive(Debug, Clone)]
pub struct PermissionConfigStore {
    path: PathBuf,
}

impl PermissionConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_configs(&self, trace_id: &str) -> Result<ConfigMap, AppError> {
        let _guard = config_lock(trace_id)?;
        self.read_unlocked(trace_id)
    }

    pub fn write_configs(&self, configs: &ConfigMap, trace_id: &str) -> Result<(), AppError> {
        let _guard = config_lock(trace_id)?;
        self.write_unlocked(configs, trace_id)
    }

    /// Read-modify-write of one entry; see [`apply_change`] for the rules.
    pub fn change_config_blocking(&self, entry: PermissionConfigEntry, trace_id: &str) -> Result<(), AppError> {
        let _guard = config_lock(trace_id)?;
        let mut configs = self.read_unlocked(trace_id)?;
        apply_change(&mut configs, entry);
        self.write_unlocked(&configs, trace_id)
    }

    /// The mutation entry point: runs on the root executor.
    pub async fn change_config(
        &self,
        executor: &RootExecutor,
        entry: PermissionConfigEntry,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let store = self.clone();
        executor
            .run(trace_id, move |_gateway, trace| store.change_config_blocking(entry, trace))
            .await
    }

    /// Reconciles stored rows with what is installed.
    ///
    /// Rows for uninstalled packages and duplicate package rows are dropped, and
    /// a row whose app id moved is re-based onto the new uid within the same
    /// user. The file is rewritten only when one of those happened. With
    /// `whitelist` set, non-system packages without a row (other than the
    /// manager) come back as implied excluded rows.
    pub fn synchronize_with_packages(
        &self,
        packages: &[PackageRecord],
        whitelist: bool,
        manager_package: &str,
        trace_id: &str,
    ) -> Result<SyncOutcome, AppError> {
        let _guard = config_lock(trace_id)?;
        let mut rows: Vec<PermissionConfigEntry> = self.read_unlocked(trace_id)?.into_values().collect();
        rows.sort_by_key(|entry| entry.uid());
        let original_len = rows.len();

        let installed: HashMap<&str, &PackageRecord> =
            packages.iter().map(|record| (record.package_name.as_str(), record)).collect();
        rows.retain(|entry| installed.contains_key(entry.pkg.as_str()));
        let mut seen = HashSet::new();
        rows.retain(|entry| seen.insert(entry.pkg.clone()));
        let removed = original_len - rows.len();

        let mut rebased = false;
        for entry in rows.iter_mut() {
            let Some(record) = installed.get(entry.pkg.as_str()) else {
                continue;
            };
            if entry.profile.uid % PER_USER_RANGE != record.uid % PER_USER_RANGE {
                let new_uid = entry.profile.uid / PER_USER_RANGE * PER_USER_RANGE + record.uid % PER_USER_RANGE;
                info!(trace_id = %trace_id, pkg = %entry.pkg, from = entry.profile.uid, to = new_uid, "re-basing package uid");
                entry.profile.uid = new_uid;
                rebased = true;
            }
        }

        let mut implied = Vec::new();
        if whitelist {
            let configured: HashSet<&str> = rows.iter().map(|entry| entry.pkg.as_str()).collect();
            for record in packages {
                if record.is_system
                    || record.package_name == manager_package
                    || configured.contains(record.package_name.as_str())
                {
                    continue;
                }
                implied.push(PermissionConfigEntry::new(
                    &record.package_name,
                    1,
                    0,
                    PermissionProfile {
                        uid: record.uid,
                        to_uid: 0,
                        scontext: DEFAULT_SCONTEXT.to_string(),
                    },
                ));
            }
        }

        let rewritten = removed > 0 || rebased;
        if removed > 0 {
            info!(trace_id = %trace_id, removed, "dropping configs of uninstalled packages");
        }
        if rewritten {
            let map: ConfigMap = rows.iter().cloned().map(|entry| (entry.uid(), entry)).collect();
            self.write_unlocked(&map, trace_id)?;
        }
        Ok(SyncOutcome {
            stored: rows,
            implied,
            rewritten,
        })
    }

    fn read_unlocked(&self, trace_id: &str) -> Result<ConfigMap, AppError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(parse_configs(&raw, trace_id)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(ConfigMap::new()),
            Err(err) => Err(AppError::system(
                format!("Failed to read package config {}: {err}", self.path.display()),
                trace_id,
            )),
        }
    }

    fn write_unlocked(&self, configs: &ConfigMap, trace_id: &str) -> Result<(), AppError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .map_err(|err| AppError::system(format!("Failed to create config dir: {err}"), trace_id))?;

        let mut staged = NamedTempFile::new_in(&parent)
            .map_err(|err| AppError::system(format!("Failed to stage package config: {err}"), trace_id))?;
        staged
            .write_all(render_configs(configs).as_bytes())
            .and_then(|()| staged.flush())
            .map_err(|err| AppError::system(format!("Failed to write package config: {err}"), trace_id))?;
        staged
            .persist(&self.path)
            .map_err(|err| AppError::system(format!("Failed to replace package config: {}", err.error), trace_id))?;
        Ok(())
    }
}
