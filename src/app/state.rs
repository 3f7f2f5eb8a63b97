use std::sync::Arc;

use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::executor::RootExecutor;
use crate::app::packages::{DumpsysResolver, PackageResolver};
use crate::app::pkg_config::PermissionConfigStore;
use crate::app::privilege::{ApdModuleLister, KpatchGateway, ModuleLister, PrivilegeGateway};
use crate::app::updates::{HttpFetch, ReqwestFetcher, UpdateChecker};
use crate::app::view_models::{ApModuleViewModel, KpModuleViewModel, SuperUserViewModel, WhitelistMode};

/// Everything a front end needs, wired once from the loaded config.
pub struct AppState {
    pub config: AppConfig,
    pub executor: Arc<RootExecutor>,
    pub config_store: PermissionConfigStore,
    pub superuser: SuperUserViewModel,
    pub ap_modules: ApModuleViewModel,
    pub kp_modules: KpModuleViewModel,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self, AppError> {
        let gateway: Arc<dyn PrivilegeGateway> = Arc::new(KpatchGateway::from_settings(&config.tools));
        let lister: Arc<dyn ModuleLister> = Arc::new(ApdModuleLister::from_settings(&config.tools));
        let resolver: Arc<dyn PackageResolver> = Arc::new(DumpsysResolver::from_settings(&config.tools));
        let fetcher: Arc<dyn HttpFetch> = Arc::new(ReqwestFetcher::new(&config.updates)?);
        Self::with_parts(config, gateway, lister, resolver, fetcher)
    }

    pub fn with_parts(
        config: AppConfig,
        gateway: Arc<dyn PrivilegeGateway>,
        lister: Arc<dyn ModuleLister>,
        resolver: Arc<dyn PackageResolver>,
        fetcher: Arc<dyn HttpFetch>,
    ) -> Result<Self, AppError> {
        let executor = Arc::new(RootExecutor::new(gateway)?);
        let config_store = PermissionConfigStore::new(&config.paths.package_config);
        let superuser = SuperUserViewModel::new(
            Arc::clone(&executor),
            config_store.clone(),
            resolver,
            &config.paths.packages_list,
            WhitelistMode::from_code(config.superuser.whitelist_mode),
            &config.superuser.manager_package,
        );
        let ap_modules = ApModuleViewModel::new(
            Arc::clone(&executor),
            lister,
            UpdateChecker::new(fetcher),
            config.updates.check_concurrency,
        );
        let kp_modules = KpModuleViewModel::new(Arc::clone(&executor));
        Ok(Self {
            config,
            executor,
            config_store,
            superuser,
            ap_modules,
            kp_modules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{FakeFetcher, FakeGateway, FakeLister, FakeResolver};

    #[tokio::test]
    async fn view_models_share_one_executor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::default();
        config.paths.package_config = dir.path().join("package_config").display().to_string();
        config.paths.packages_list = dir.path().join("packages.list").display().to_string();
        config.superuser.whitelist_mode = 2;

        let gateway = Arc::new(FakeGateway::default());
        let state = AppState::with_parts(
            config,
            gateway.clone(),
            Arc::new(FakeLister::default()),
            Arc::new(FakeResolver::with(&[])),
            Arc::new(FakeFetcher::default()),
        )
        .expect("state");

        assert_eq!(state.superuser.whitelist_mode(), WhitelistMode::ExcludeAll);
        state.superuser.fetch_app_list("t").await.expect("apps");
        state.ap_modules.fetch_module_list("t").await.expect("modules");
        state.kp_modules.fetch_module_list("t").await.expect("kpms");
        assert_eq!(gateway.elevations(), 3);
        assert_eq!(state.config_store.path(), dir.path().join("package_config"));
    }
}
