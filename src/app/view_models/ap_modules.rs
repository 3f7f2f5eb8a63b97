use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::app::error::AppError;
use crate::app::executor::RootExecutor;
use crate::app::models::{ModuleInfo, ModuleUpdateInfo};
use crate::app::privilege::{ModuleLister, ModuleVerb};
use crate::app::search::{collate, matches_query};
use crate::app::store::SnapshotStore;
use crate::app::updates::UpdateChecker;

use super::{degrade, RefreshState};

/// Enabled meta-modules first, then by id.
pub fn derive_module_list(modules: &[ModuleInfo], search: &str) -> Vec<ModuleInfo> {
    let mut visible: Vec<ModuleInfo> = modules
        .iter()
        .filter(|module| matches_query(search, &[&module.name, &module.id]))
        .cloned()
        .collect();
    visible.sort_by(|left, right| {
        let left_meta = left.metamodule && left.enabled;
        let right_meta = right.metamodule && right.enabled;
        right_meta.cmp(&left_meta).then_with(|| collate(&left.id, &right.id))
    });
    visible
}

/// Replacement for `current` when `fresh` differs from it, with update info
/// carried over for modules whose listing did not change.
pub fn merge_listing(current: &[ModuleInfo], fresh: Vec<ModuleInfo>) -> Option<Vec<ModuleInfo>> {
    let unchanged = current.len() == fresh.len()
        && current.iter().zip(&fresh).all(|(old, new)| old.same_listing(new));
    if unchanged {
        return None;
    }
    let merged = fresh
        .into_iter()
        .map(|mut module| {
            module.update_info = current
                .iter()
                .find(|old| old.same_listing(&module))
                .and_then(|old| old.update_info.clone());
            module
        })
        .collect();
    Some(merged)
}

fn apply_update_info(items: &mut [ModuleInfo], checked: &ModuleInfo, found: Option<ModuleUpdateInfo>) -> bool {
    match items.iter_mut().find(|item| item.same_listing(checked)) {
        Some(item) if item.update_info != found => {
            item.update_info = found;
            true
        }
        _ => false,
    }
}

pub struct ApModuleViewModel {
    executor: Arc<RootExecutor>,
    lister: Arc<dyn ModuleLister>,
    checker: UpdateChecker,
    check_concurrency: usize,
    modules: SnapshotStore<ModuleInfo>,
    flags: RefreshState,
}

impl ApModuleViewModel {
    pub fn new(
        executor: Arc<RootExecutor>,
        lister: Arc<dyn ModuleLister>,
        checker: UpdateChecker,
        check_concurrency: usize,
    ) -> Self {
        let flags = RefreshState::default();
        flags.mark_need_refresh();
        Self {
            executor,
            lister,
            checker,
            check_concurrency: check_concurrency.max(1),
            modules: SnapshotStore::new(),
            flags,
        }
    }

    pub fn modules(&self) -> &SnapshotStore<ModuleInfo> {
        &self.modules
    }

    pub fn flags(&self) -> &RefreshState {
        &self.flags
    }

    pub fn checker(&self) -> &UpdateChecker {
        &self.checker
    }

    pub fn module_list(&self, search: &str) -> Vec<ModuleInfo> {
        derive_module_list(&self.modules.snapshot(), search)
    }

    /// Lists modules, publishes the listing, then resolves updates.
    pub async fn fetch_module_list(&self, trace_id: &str) -> Result<bool, AppError> {
        let guard = self.flags.begin();
        let started = Instant::now();

        let lister = Arc::clone(&self.lister);
        let raw = match self
            .executor
            .run(trace_id, move |_gateway, trace| lister.list_modules(trace))
            .await
        {
            Ok(raw) => raw,
            Err(err) => return degrade(err, "module listing"),
        };
        let fresh: Vec<ModuleInfo> = match serde_json::from_str(&raw) {
            Ok(fresh) => fresh,
            Err(err) => {
                return degrade(
                    AppError::parse(format!("Bad module listing: {err}"), trace_id),
                    "module listing",
                )
            }
        };
        let count = fresh.len();
        let changed = self.modules.publish_with(|current| merge_listing(current, fresh));
        self.flags.mark_fresh();
        drop(guard);

        self.check_updates(trace_id).await;
        info!(
            trace_id = %trace_id,
            modules = count,
            changed,
            cost_ms = started.elapsed().as_millis() as u64,
            "module list refreshed"
        );
        Ok(true)
    }

    /// Checks every eligible module, a bounded number at a time, merging each
    /// result as it lands. A failed check keeps what the module had before.
    pub async fn check_updates(&self, trace_id: &str) {
        let candidates: Vec<ModuleInfo> = self
            .modules
            .snapshot()
            .iter()
            .filter(|module| module.wants_update_check())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return;
        }

        let permits = Arc::new(Semaphore::new(self.check_concurrency));
        let mut tasks = JoinSet::new();
        for module in candidates {
            let checker = self.checker.clone();
            let permits = Arc::clone(&permits);
            let trace = trace_id.to_string();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = checker.fetch_update(&module, &trace).await;
                (module, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((module, Ok(found))) => {
                    let has_update = found.is_some();
                    if self.modules.update(|items| apply_update_info(items, &module, found)) {
                        debug!(trace_id = %trace_id, module = %module.id, has_update, "update info merged");
                    }
                }
                Ok((module, Err(err))) => {
                    warn!(trace_id = %trace_id, module = %module.id, error = %err, "update check failed, keeping previous result");
                }
                Err(err) => {
                    warn!(trace_id = %trace_id, error = %err, "update check task aborted");
                }
            }
        }
    }

    pub async fn enable_module(&self, id: &str, trace_id: &str) -> Result<(), AppError> {
        self.control(ModuleVerb::Enable, id, trace_id).await
    }

    pub async fn disable_module(&self, id: &str, trace_id: &str) -> Result<(), AppError> {
        self.control(ModuleVerb::Disable, id, trace_id).await
    }

    pub async fn uninstall_module(&self, id: &str, trace_id: &str) -> Result<(), AppError> {
        self.control(ModuleVerb::Uninstall, id, trace_id).await
    }

    pub async fn restore_module(&self, id: &str, trace_id: &str) -> Result<(), AppError> {
        self.control(ModuleVerb::Restore, id, trace_id).await
    }

    async fn control(&self, verb: ModuleVerb, id: &str, trace_id: &str) -> Result<(), AppError> {
        let lister = Arc::clone(&self.lister);
        let module_id = id.to_string();
        self.executor
            .run(trace_id, move |_gateway, trace| lister.module_command(verb, &module_id, trace))
            .await?;
        info!(trace_id = %trace_id, module = %id, verb = verb.as_str(), "module control applied");
        self.flags.mark_need_refresh();
        Ok(())
    }
}
