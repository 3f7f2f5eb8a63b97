use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::app::error::AppError;
use crate::app::executor::RootExecutor;
use crate::app::models::{KpmControlResult, KpmInfo};
use crate::app::search::{collate, matches_query};
use crate::app::store::SnapshotStore;

use super::{degrade, RefreshState};

/// Reads the `key=value` info blob of one loaded module. The listed name
/// stands in when the blob carries none.
pub fn parse_kpm_info(listed_name: &str, info: &str) -> KpmInfo {
    let mut parsed = KpmInfo::default();
    for line in info.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "name" => parsed.name = value,
            "version" => parsed.version = value,
            "license" => parsed.license = value,
            "author" => parsed.author = value,
            "description" => parsed.description = value,
            "args" => parsed.args = value,
            _ => {}
        }
    }
    if parsed.name.is_empty() {
        parsed.name = listed_name.to_string();
    }
    parsed
}

/// Marks loaded modules that are also installed and adds placeholders for
/// installed modules the kernel does not report.
pub fn merge_installed(mut loaded: Vec<KpmInfo>, installed: &[String]) -> (Vec<KpmInfo>, Vec<KpmInfo>) {
    for module in loaded.iter_mut() {
        module.is_installed = installed.iter().any(|name| *name == module.name);
    }
    let installed_list = installed
        .iter()
        .map(|name| {
            loaded
                .iter()
                .find(|module| module.name == *name)
                .cloned()
                .unwrap_or_else(|| KpmInfo::installed_placeholder(name))
        })
        .collect();
    (loaded, installed_list)
}

pub fn derive_kpm_list(modules: &[KpmInfo], search: &str) -> Vec<KpmInfo> {
    let mut visible: Vec<KpmInfo> = modules
        .iter()
        .filter(|module| matches_query(search, &[&module.name]))
        .cloned()
        .collect();
    visible.sort_by(|left, right| collate(&left.name, &right.name));
    visible
}

pub struct KpModuleViewModel {
    executor: Arc<RootExecutor>,
    modules: SnapshotStore<KpmInfo>,
    installed: SnapshotStore<KpmInfo>,
    flags: RefreshState,
}

impl KpModuleViewModel {
    pub fn new(executor: Arc<RootExecutor>) -> Self {
        let flags = RefreshState::default();
        flags.mark_need_refresh();
        Self {
            executor,
            modules: SnapshotStore::new(),
            installed: SnapshotStore::new(),
            flags,
        }
    }

    pub fn modules(&self) -> &SnapshotStore<KpmInfo> {
        &self.modules
    }

    pub fn installed(&self) -> &SnapshotStore<KpmInfo> {
        &self.installed
    }

    pub fn flags(&self) -> &RefreshState {
        &self.flags
    }

    pub fn module_list(&self, search: &str) -> Vec<KpmInfo> {
        derive_kpm_list(&self.modules.snapshot(), search)
    }

    pub fn installed_module_list(&self, search: &str) -> Vec<KpmInfo> {
        derive_kpm_list(&self.installed.snapshot(), search)
    }

    pub async fn fetch_module_list(&self, trace_id: &str) -> Result<bool, AppError> {
        let _guard = self.flags.begin();
        let started = Instant::now();
        let fetched = self
            .executor
            .run(trace_id, |gateway, trace| {
                let names = if gateway.kpm_num(trace)? <= 0 {
                    String::new()
                } else {
                    gateway.kpm_list(trace)?
                };
                let mut loaded = Vec::new();
                for name in names.lines().map(str::trim).filter(|name| !name.is_empty()) {
                    let info = gateway.kpm_info(name, trace)?;
                    loaded.push(parse_kpm_info(name, &info));
                }
                let installed = gateway.installed_kpms(trace)?;
                Ok((loaded, installed))
            })
            .await;
        let (loaded, installed) = match fetched {
            Ok(fetched) => fetched,
            Err(err) => return degrade(err, "kernel module listing"),
        };

        let (loaded, installed) = merge_installed(loaded, &installed);
        let counts = (loaded.len(), installed.len());
        self.modules.publish_if_changed(loaded);
        self.installed.publish_if_changed(installed);
        self.flags.mark_fresh();
        info!(
            trace_id = %trace_id,
            loaded = counts.0,
            installed = counts.1,
            cost_ms = started.elapsed().as_millis() as u64,
            "kernel module list refreshed"
        );
        Ok(true)
    }

    pub async fn load_module(&self, path: &str, args: &str, trace_id: &str) -> Result<(), AppError> {
        let path = required(path, "module path", trace_id)?;
        let args = args.to_string();
        self.executor
            .run(trace_id, move |gateway, trace| gateway.load_kpm(&path, &args, trace))
            .await?;
        self.flags.mark_need_refresh();
        Ok(())
    }

    pub async fn unload_module(&self, name: &str, trace_id: &str) -> Result<(), AppError> {
        let name = required(name, "module name", trace_id)?;
        self.executor
            .run(trace_id, move |gateway, trace| gateway.unload_kpm(&name, trace))
            .await?;
        self.flags.mark_need_refresh();
        Ok(())
    }

    pub async fn control_module(&self, name: &str, args: &str, trace_id: &str) -> Result<KpmControlResult, AppError> {
        let name = required(name, "module name", trace_id)?;
        let args = args.to_string();
        let result = self
            .executor
            .run(trace_id, move |gateway, trace| gateway.control_kpm(&name, &args, trace))
            .await?;
        info!(trace_id = %trace_id, rc = result.rc, "kernel module control returned");
        Ok(result)
    }

    pub async fn install_module(&self, path: &str, trace_id: &str) -> Result<(), AppError> {
        let path = required(path, "module path", trace_id)?;
        self.executor
            .run(trace_id, move |gateway, trace| gateway.install_kpm(&path, trace))
            .await?;
        self.flags.mark_need_refresh();
        Ok(())
    }

    pub async fn uninstall_module(&self, name: &str, trace_id: &str) -> Result<(), AppError> {
        let name = required(name, "module name", trace_id)?;
        self.executor
            .run(trace_id, move |gateway, trace| gateway.uninstall_kpm(&name, trace))
            .await?;
        self.flags.mark_need_refresh();
        Ok(())
    }
}

fn required(value: &str, what: &str, trace_id: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation(format!("{what} is required"), trace_id));
    }
    Ok(trimmed.to_string())
}
