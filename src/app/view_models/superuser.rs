use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::executor::RootExecutor;
use crate::app::models::{
    AppEntry, PackageRecord, PermissionConfigEntry, PermissionProfile, DEFAULT_SCONTEXT, MAGISK_SCONTEXT,
    SHELL_UID,
};
use crate::app::packages::{read_packages, PackageResolver};
use crate::app::pkg_config::{ConfigMap, PermissionConfigStore, SyncOutcome};
use crate::app::search::{collate, matches_query};
use crate::app::store::SnapshotStore;

use super::{degrade, RefreshState};

/// Which apps lose root access automatically when it is revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistMode {
    SystemDefault,
    ExcludeUserApps,
    ExcludeSystemApps,
    ExcludeAll,
}

impl WhitelistMode {
    /// Unknown codes fall back to the system default.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => WhitelistMode::ExcludeUserApps,
            1 => WhitelistMode::ExcludeSystemApps,
            2 => WhitelistMode::ExcludeAll,
            _ => WhitelistMode::SystemDefault,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            WhitelistMode::SystemDefault => -1,
            WhitelistMode::ExcludeUserApps => 0,
            WhitelistMode::ExcludeSystemApps => 1,
            WhitelistMode::ExcludeAll => 2,
        }
    }

    pub fn should_exclude(self, is_system: bool) -> bool {
        match self {
            WhitelistMode::SystemDefault => false,
            WhitelistMode::ExcludeUserApps => !is_system,
            WhitelistMode::ExcludeSystemApps => is_system,
            WhitelistMode::ExcludeAll => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppFilter {
    pub search: String,
    pub show_system_apps: bool,
}

/// Filtered, sorted view of `apps`: granted first, then excluded, then by label.
pub fn derive_app_list(apps: &[AppEntry], filter: &AppFilter) -> Vec<AppEntry> {
    let mut visible: Vec<AppEntry> = apps
        .iter()
        .filter(|app| matches_query(&filter.search, &[&app.label, app.package_name()]))
        .filter(|app| app.uid() == SHELL_UID || filter.show_system_apps || !app.package.is_system)
        .cloned()
        .collect();
    visible.sort_by(|left, right| {
        list_rank(&left.config)
            .cmp(&list_rank(&right.config))
            .then_with(|| collate(&left.label, &right.label))
    });
    visible
}

fn list_rank(config: &PermissionConfigEntry) -> u8 {
    if config.allow != 0 {
        0
    } else if config.exclude == 1 {
        1
    } else {
        2
    }
}

pub struct SuperUserViewModel {
    executor: Arc<RootExecutor>,
    config_store: PermissionConfigStore,
    resolver: Arc<dyn PackageResolver>,
    packages_list: PathBuf,
    whitelist_mode: WhitelistMode,
    manager_package: String,
    apps: SnapshotStore<AppEntry>,
    refresh_lock: AsyncMutex<()>,
    flags: RefreshState,
    last_refreshed: Mutex<Option<DateTime<Utc>>>,
}

impl SuperUserViewModel {
    pub fn new(
        executor: Arc<RootExecutor>,
        config_store: PermissionConfigStore,
        resolver: Arc<dyn PackageResolver>,
        packages_list: impl Into<PathBuf>,
        whitelist_mode: WhitelistMode,
        manager_package: impl Into<String>,
    ) -> Self {
        let flags = RefreshState::default();
        flags.mark_need_refresh();
        Self {
            executor,
            config_store,
            resolver,
            packages_list: packages_list.into(),
            whitelist_mode,
            manager_package: manager_package.into(),
            apps: SnapshotStore::new(),
            refresh_lock: AsyncMutex::new(()),
            flags,
            last_refreshed: Mutex::new(None),
        }
    }

    pub fn apps(&self) -> &SnapshotStore<AppEntry> {
        &self.apps
    }

    pub fn flags(&self) -> &RefreshState {
        &self.flags
    }

    pub fn whitelist_mode(&self) -> WhitelistMode {
        self.whitelist_mode
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed.lock().ok().and_then(|stamp| *stamp)
    }

    pub fn app_list(&self, filter: &AppFilter) -> Vec<AppEntry> {
        derive_app_list(&self.apps.snapshot(), filter)
    }

    /// Rebuilds the app list from grants, stored configs and installed packages.
    ///
    /// Returns `Ok(false)` when another refresh was already running or the
    /// refresh failed for a non-privilege reason.
    pub async fn fetch_app_list(&self, trace_id: &str) -> Result<bool, AppError> {
        let Ok(_running) = self.refresh_lock.try_lock() else {
            info!(trace_id = %trace_id, "app list refresh already running");
            return Ok(false);
        };
        let _guard = self.flags.begin();
        let started = Instant::now();

        let store = self.config_store.clone();
        let resolver = Arc::clone(&self.resolver);
        let list_path = self.packages_list.clone();
        let built = self
            .executor
            .run(trace_id, move |gateway, trace| {
                let granted: HashSet<i32> = gateway.su_uids(trace)?.into_iter().collect();
                let configs = store.read_configs(trace).unwrap_or_else(|err| {
                    warn!(trace_id = %trace, error = %err, "package config unreadable, listing without it");
                    ConfigMap::new()
                });
                let packages = read_packages(&list_path, resolver.as_ref(), trace);

                let mut apps = Vec::with_capacity(packages.len());
                for record in packages {
                    let uid = record.uid;
                    let active = if granted.contains(&uid) {
                        gateway.su_profile(uid, trace)?
                    } else {
                        None
                    };
                    let mut config = match configs.get(&uid) {
                        Some(stored) => stored.clone(),
                        None => PermissionConfigEntry::new(
                            &record.package_name,
                            gateway.uid_excluded(uid, trace).unwrap_or(0),
                            0,
                            PermissionProfile::for_uid(uid),
                        ),
                    };
                    config.allow = 0;
                    if let Some(profile) = active {
                        config.allow = 1;
                        config.profile = profile;
                    }
                    apps.push(AppEntry::new(record.label.clone(), record, config));
                }
                Ok(apps)
            })
            .await;

        let apps = match built {
            Ok(apps) => apps,
            Err(err) => return degrade(err, "app list refresh"),
        };
        let count = apps.len();
        let changed = self.apps.publish_if_changed(apps);
        self.flags.mark_fresh();
        if let Ok(mut stamp) = self.last_refreshed.lock() {
            *stamp = Some(Utc::now());
        }
        info!(
            trace_id = %trace_id,
            apps = count,
            changed,
            cost_ms = started.elapsed().as_millis() as u64,
            "app list refreshed"
        );
        Ok(true)
    }

    /// Grants or revokes root for `uid`, persisting the config before the
    /// kernel is told. On revoke the whitelist mode may exclude the app.
    pub async fn set_root_granted(&self, uid: i32, granted: bool, trace_id: &str) -> Result<AppEntry, AppError> {
        let mut app = self.find(uid, trace_id)?;
        app.root_granted = granted;
        app.config.profile.uid = uid;
        if granted {
            app.exclude_app = 0;
            app.config.allow = 1;
            app.config.exclude = 0;
            app.config.profile.scontext = MAGISK_SCONTEXT.to_string();
        } else {
            app.config.allow = 0;
        }
        self.config_store
            .change_config(&self.executor, app.config.clone(), trace_id)
            .await?;

        let scontext = app.config.profile.scontext.clone();
        let is_system = app.package.is_system;
        let mode = self.whitelist_mode;
        let excluded = self
            .executor
            .run(trace_id, move |gateway, trace| {
                if granted {
                    gateway.grant_su(uid, 0, &scontext, trace)?;
                    gateway.set_uid_excluded(uid, 0, trace)?;
                    return Ok(false);
                }
                gateway.revoke_su(uid, trace)?;
                if mode.should_exclude(is_system) {
                    gateway.set_uid_excluded(uid, 1, trace)?;
                    return Ok(true);
                }
                Ok(false)
            })
            .await?;
        if excluded {
            app.exclude_app = 1;
        }
        info!(trace_id = %trace_id, uid, granted, excluded, "root access changed");
        self.replace(app.clone());
        Ok(app)
    }

    /// Toggles the exclusion flag; excluding also revokes root.
    pub async fn set_excluded(&self, uid: i32, excluded: bool, trace_id: &str) -> Result<AppEntry, AppError> {
        let mut app = self.find(uid, trace_id)?;
        if excluded {
            app.exclude_app = 1;
            app.root_granted = false;
            app.config.allow = 0;
            app.config.profile.scontext = DEFAULT_SCONTEXT.to_string();
            self.executor
                .run(trace_id, move |gateway, trace| gateway.revoke_su(uid, trace))
                .await?;
        } else {
            app.exclude_app = 0;
        }
        app.config.exclude = app.exclude_app;
        app.config.profile.uid = uid;
        self.config_store
            .change_config(&self.executor, app.config.clone(), trace_id)
            .await?;

        let flag = app.exclude_app;
        self.executor
            .run(trace_id, move |gateway, trace| gateway.set_uid_excluded(uid, flag, trace))
            .await?;
        info!(trace_id = %trace_id, uid, excluded, "exclusion changed");
        self.replace(app.clone());
        Ok(app)
    }

    /// Revokes every grant, clears every exclusion and empties the config file.
    pub async fn reset_app_list(&self, trace_id: &str) -> Result<(), AppError> {
        let excluded: Vec<i32> = self
            .apps
            .snapshot()
            .iter()
            .filter(|app| app.exclude_app != 0)
            .map(AppEntry::uid)
            .collect();
        let store = self.config_store.clone();
        let revoked = self
            .executor
            .run(trace_id, move |gateway, trace| {
                let granted = gateway.su_uids(trace)?;
                for uid in &granted {
                    gateway.revoke_su(*uid, trace)?;
                }
                for uid in &excluded {
                    gateway.set_uid_excluded(*uid, 0, trace)?;
                }
                store.write_configs(&ConfigMap::new(), trace)?;
                Ok(granted.len())
            })
            .await?;
        warn!(trace_id = %trace_id, revoked, "superuser list reset");
        self.flags.mark_need_refresh();
        self.fetch_app_list(trace_id).await?;
        Ok(())
    }

    /// Reconciles the config file with installed packages; runs on the executor.
    pub async fn synchronize_configs(&self, trace_id: &str) -> Result<SyncOutcome, AppError> {
        let store = self.config_store.clone();
        let resolver = Arc::clone(&self.resolver);
        let list_path = self.packages_list.clone();
        let whitelist = self.whitelist_mode != WhitelistMode::SystemDefault;
        let manager = self.manager_package.clone();
        let outcome = self
            .executor
            .run(trace_id, move |_gateway, trace| {
                let packages: Vec<PackageRecord> = read_packages(&list_path, resolver.as_ref(), trace);
                store.synchronize_with_packages(&packages, whitelist, &manager, trace)
            })
            .await?;
        if outcome.rewritten {
            self.flags.mark_need_refresh();
        }
        Ok(outcome)
    }

    fn find(&self, uid: i32, trace_id: &str) -> Result<AppEntry, AppError> {
        self.apps
            .snapshot()
            .iter()
            .find(|app| app.uid() == uid)
            .cloned()
            .ok_or_else(|| AppError::validation(format!("No app with uid {uid} in the list"), trace_id))
    }

    fn replace(&self, app: AppEntry) {
        self.apps.update(|items| match items.iter_mut().find(|item| item.uid() == app.uid()) {
            Some(slot) if *slot != app => {
                *slot = app;
                true
            }
            _ => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{package, FakeGateway, FakeResolver};
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        gateway: Arc<FakeGateway>,
        store: PermissionConfigStore,
        vm: SuperUserViewModel,
    }

    fn fixture(mode: WhitelistMode) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let list = dir.path().join("packages.list");
        fs::write(
            &list,
            "com.user 10001 0 /d\ncom.sys 1001 0 /d\ncom.shell 2000 0 /d\ncom.granted 10003 0 /d\n",
        )
        .expect("list");
        let resolver = Arc::new(FakeResolver::with(&[
            ("com.user", 10001, false),
            ("com.sys", 1001, true),
            ("com.shell", SHELL_UID, true),
            ("com.granted", 10003, false),
        ]));
        let gateway = Arc::new(FakeGateway::default());
        gateway.grant(10003, MAGISK_SCONTEXT);
        let executor = Arc::new(RootExecutor::new(gateway.clone()).expect("executor"));
        let store = PermissionConfigStore::new(dir.path().join("package_config"));
        let vm = SuperUserViewModel::new(executor, store.clone(), resolver, list, mode, "me.bmax.apatch");
        Fixture {
            _dir: dir,
            gateway,
            store,
            vm,
        }
    }

    fn app(label: &str, uid: i32, is_system: bool, allow: i32, exclude: i32) -> AppEntry {
        let record = package(label, uid, is_system);
        let config = PermissionConfigEntry::new(label, exclude, allow, PermissionProfile::for_uid(uid));
        AppEntry::new(label.to_string(), record, config)
    }

    #[test]
    fn sorts_granted_then_excluded_then_by_label() {
        let apps = vec![
            app("zeta", 10001, false, 0, 0),
            app("Alpha", 10002, false, 0, 1),
            app("beta", 10003, false, 1, 0),
            app("alpha", 10004, false, 0, 0),
        ];
        let filter = AppFilter::default();
        let labels: Vec<String> = derive_app_list(&apps, &filter).into_iter().map(|a| a.label).collect();
        assert_eq!(labels, vec!["beta", "Alpha", "alpha", "zeta"]);
    }

    #[test]
    fn granted_apps_sort_by_label_regardless_of_exclude() {
        let apps = vec![
            app("zeta", 10001, false, 1, 1),
            app("alpha", 10002, false, 1, 0),
            app("beta", 10003, false, 0, 1),
        ];
        let labels: Vec<String> = derive_app_list(&apps, &AppFilter::default())
            .into_iter()
            .map(|a| a.label)
            .collect();
        assert_eq!(labels, vec!["alpha", "zeta", "beta"]);
    }

    #[test]
    fn hides_system_apps_except_shell_and_filters_by_search() {
        let apps = vec![
            app("Files", 1001, true, 0, 0),
            app("Shell", SHELL_UID, true, 0, 0),
            app("Termux", 10001, false, 0, 0),
            app("微信", 10002, false, 0, 0),
        ];
        let hidden = derive_app_list(&apps, &AppFilter::default());
        let labels: Vec<&str> = hidden.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(labels.len(), 3);
        assert!(!labels.contains(&"Files"));
        assert!(labels.contains(&"Shell"));

        let shown = derive_app_list(&apps, &AppFilter { search: String::new(), show_system_apps: true });
        assert_eq!(shown.len(), 4);

        let found = derive_app_list(&apps, &AppFilter { search: "weixin".to_string(), show_system_apps: false });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uid(), 10002);
    }

    #[test]
    fn whitelist_mode_codes() {
        assert_eq!(WhitelistMode::from_code(7), WhitelistMode::SystemDefault);
        assert!(WhitelistMode::ExcludeUserApps.should_exclude(false));
        assert!(!WhitelistMode::ExcludeUserApps.should_exclude(true));
        assert!(WhitelistMode::ExcludeSystemApps.should_exclude(true));
        assert!(WhitelistMode::ExcludeAll.should_exclude(false));
        assert!(!WhitelistMode::SystemDefault.should_exclude(true));
        assert_eq!(WhitelistMode::from_code(2).code(), 2);
    }

    #[tokio::test]
    async fn refresh_merges_grants_and_stored_configs() {
        let fx = fixture(WhitelistMode::SystemDefault);
        let mut configs = ConfigMap::new();
        configs.insert(
            10001,
            PermissionConfigEntry::new("com.user", 1, 0, PermissionProfile::for_uid(10001)),
        );
        fx.store.write_configs(&configs, "t").expect("write");
        fx.gateway.exclude(SHELL_UID);

        assert!(fx.vm.flags().is_need_refresh());
        assert!(fx.vm.fetch_app_list("t").await.expect("refresh"));
        assert!(!fx.vm.flags().is_need_refresh());
        assert!(fx.vm.last_refreshed().is_some());

        let apps = fx.vm.apps().snapshot();
        assert_eq!(apps.len(), 4);
        let granted = apps.iter().find(|a| a.uid() == 10003).expect("granted");
        assert!(granted.root_granted);
        assert_eq!(granted.config.profile.scontext, MAGISK_SCONTEXT);
        let user = apps.iter().find(|a| a.uid() == 10001).expect("user");
        assert!(!user.root_granted);
        assert_eq!(user.exclude_app, 1);
        let shell = apps.iter().find(|a| a.uid() == SHELL_UID).expect("shell");
        assert_eq!(shell.exclude_app, 1);

        let visible: Vec<i32> = fx.vm.app_list(&AppFilter::default()).iter().map(AppEntry::uid).collect();
        assert_eq!(visible, vec![10003, SHELL_UID, 10001]);
    }

    #[tokio::test]
    async fn failed_elevation_propagates_and_keeps_the_list() {
        let fx = fixture(WhitelistMode::SystemDefault);
        fx.vm.fetch_app_list("t").await.expect("refresh");
        fx.gateway.set_elevation_allowed(false);
        fx.vm.flags().mark_need_refresh();

        let err = fx.vm.fetch_app_list("t").await.expect_err("denied");
        assert!(err.is_privilege());
        assert_eq!(fx.vm.apps().snapshot().len(), 4);
        assert!(fx.vm.flags().is_need_refresh());
        assert!(!fx.vm.flags().is_refreshing());
    }

    #[tokio::test]
    async fn granting_persists_then_tells_the_kernel() {
        let fx = fixture(WhitelistMode::SystemDefault);
        fx.vm.fetch_app_list("t").await.expect("refresh");

        let app = fx.vm.set_root_granted(10001, true, "t").await.expect("grant");
        assert!(app.root_granted);
        assert_eq!(app.config.profile.scontext, MAGISK_SCONTEXT);
        assert_eq!(fx.store.read_configs("t").expect("read")[&10001].allow, 1);
        assert!(fx.gateway.granted_uids().contains(&10001));
        assert!(fx.gateway.calls().contains(&format!("grant 10001 0 {MAGISK_SCONTEXT}")));
        assert!(fx.vm.apps().snapshot().iter().any(|a| a.uid() == 10001 && a.root_granted));
    }

    #[tokio::test]
    async fn revoking_under_whitelist_excludes_user_apps() {
        let fx = fixture(WhitelistMode::ExcludeUserApps);
        fx.vm.fetch_app_list("t").await.expect("refresh");

        let app = fx.vm.set_root_granted(10003, false, "t").await.expect("revoke");
        assert!(!app.root_granted);
        assert_eq!(app.exclude_app, 1);
        assert!(!fx.gateway.granted_uids().contains(&10003));
        assert_eq!(fx.gateway.excluded_flag(10003), 1);
    }

    #[tokio::test]
    async fn excluding_revokes_and_stores_the_flag() {
        let fx = fixture(WhitelistMode::SystemDefault);
        fx.vm.fetch_app_list("t").await.expect("refresh");

        let app = fx.vm.set_excluded(10001, true, "t").await.expect("exclude");
        assert_eq!(app.exclude_app, 1);
        assert_eq!(app.config.profile.scontext, DEFAULT_SCONTEXT);
        assert_eq!(fx.gateway.excluded_flag(10001), 1);
        assert_eq!(fx.store.read_configs("t").expect("read")[&10001].exclude, 1);

        let app = fx.vm.set_excluded(10001, false, "t").await.expect("include");
        assert_eq!(app.exclude_app, 0);
        assert_eq!(fx.gateway.excluded_flag(10001), 0);
    }

    #[tokio::test]
    async fn unknown_uid_is_a_validation_error() {
        let fx = fixture(WhitelistMode::SystemDefault);
        let err = fx.vm.set_root_granted(4242, true, "t").await.expect_err("unknown");
        assert_eq!(err.code, "ERR_VALIDATION");
    }

    #[tokio::test]
    async fn reset_revokes_everything_and_empties_the_file() {
        let fx = fixture(WhitelistMode::SystemDefault);
        fx.vm.fetch_app_list("t").await.expect("refresh");
        fx.vm.set_excluded(10001, true, "t").await.expect("exclude");

        fx.vm.reset_app_list("t").await.expect("reset");
        assert!(fx.gateway.granted_uids().is_empty());
        assert_eq!(fx.gateway.excluded_flag(10001), 0);
        assert!(fx.store.read_configs("t").expect("read").is_empty());
        assert!(fx.vm.apps().snapshot().iter().all(|a| !a.root_granted && a.exclude_app == 0));
    }

    #[tokio::test]
    async fn sync_reports_implied_exclusions_under_whitelist() {
        let fx = fixture(WhitelistMode::ExcludeUserApps);
        let outcome = fx.vm.synchronize_configs("t").await.expect("sync");
        let implied: Vec<&str> = outcome.implied.iter().map(|row| row.pkg.as_str()).collect();
        assert_eq!(implied, vec!["com.user", "com.granted"]);
        assert!(!outcome.rewritten);
    }
}
