//! In-memory stand-ins for the privileged side, the package manager and the
//! network, shared by unit tests across the crate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::app::error::AppError;
use crate::app::models::{KpmControlResult, ModuleInfo, PackageRecord, PermissionProfile};
use crate::app::packages::PackageResolver;
use crate::app::privilege::{ModuleLister, ModuleVerb, PrivilegeGateway};
use crate::app::updates::HttpFetch;

pub fn package(name: &str, uid: i32, is_system: bool) -> PackageRecord {
    PackageRecord {
        package_name: name.to_string(),
        uid,
        label: name.to_string(),
        version_name: None,
        version_code: None,
        is_system,
        code_path: None,
    }
}

/// Enabled module with the given update descriptor URL.
pub fn module(id: &str, version_code: i64, update_json: &str) -> ModuleInfo {
    ModuleInfo {
        id: id.to_string(),
        name: id.to_string(),
        author: "Unknown".to_string(),
        version: format!("v{version_code}"),
        version_code,
        description: String::new(),
        enabled: true,
        update: false,
        remove: false,
        update_json: update_json.to_string(),
        has_web_ui: false,
        has_action_script: false,
        metamodule: false,
        update_info: None,
    }
}

#[derive(Default)]
struct GatewayState {
    grants: BTreeMap<i32, PermissionProfile>,
    excluded: HashMap<i32, i32>,
    kpms: Vec<(String, String)>,
    installed: Vec<String>,
    calls: Vec<String>,
}

pub struct FakeGateway {
    elevation_allowed: AtomicBool,
    kpm_failing: AtomicBool,
    elevations: AtomicUsize,
    state: Mutex<GatewayState>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            elevation_allowed: AtomicBool::new(true),
            kpm_failing: AtomicBool::new(false),
            elevations: AtomicUsize::new(0),
            state: Mutex::new(GatewayState::default()),
        }
    }
}

impl FakeGateway {
    pub fn set_elevation_allowed(&self, allowed: bool) {
        self.elevation_allowed.store(allowed, Ordering::SeqCst);
    }

    pub fn set_kpm_failing(&self, failing: bool) {
        self.kpm_failing.store(failing, Ordering::SeqCst);
    }

    pub fn elevations(&self) -> usize {
        self.elevations.load(Ordering::SeqCst)
    }

    pub fn grant(&self, uid: i32, scontext: &str) {
        self.state().grants.insert(
            uid,
            PermissionProfile {
                uid,
                to_uid: 0,
                scontext: scontext.to_string(),
            },
        );
    }

    pub fn exclude(&self, uid: i32) {
        self.state().excluded.insert(uid, 1);
    }

    /// Loaded module with a `key=value` info blob.
    pub fn load(&self, name: &str, info: &str) {
        self.state().kpms.push((name.to_string(), info.to_string()));
    }

    pub fn install(&self, name: &str) {
        self.state().installed.push(name.to_string());
    }

    pub fn granted_uids(&self) -> Vec<i32> {
        self.state().grants.keys().copied().collect()
    }

    pub fn excluded_flag(&self, uid: i32) -> i32 {
        self.state().excluded.get(&uid).copied().unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GatewayState> {
        self.state.lock().expect("fake gateway state")
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }

    fn kpm_guard(&self, trace_id: &str) -> Result<(), AppError> {
        if self.kpm_failing.load(Ordering::SeqCst) {
            return Err(AppError::dependency("kpm interface unavailable", trace_id));
        }
        Ok(())
    }
}

impl PrivilegeGateway for FakeGateway {
    fn elevate(&self, trace_id: &str) -> Result<(), AppError> {
        self.elevations.fetch_add(1, Ordering::SeqCst);
        if self.elevation_allowed.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::privilege("denied", trace_id))
        }
    }

    fn su_uids(&self, _trace_id: &str) -> Result<Vec<i32>, AppError> {
        Ok(self.granted_uids())
    }

    fn su_profile(&self, uid: i32, _trace_id: &str) -> Result<Option<PermissionProfile>, AppError> {
        Ok(self.state().grants.get(&uid).cloned())
    }

    fn grant_su(&self, uid: i32, to_uid: i32, scontext: &str, _trace_id: &str) -> Result<(), AppError> {
        self.record(format!("grant {uid} {to_uid} {scontext}"));
        self.state().grants.insert(
            uid,
            PermissionProfile {
                uid,
                to_uid,
                scontext: scontext.to_string(),
            },
        );
        Ok(())
    }

    fn revoke_su(&self, uid: i32, _trace_id: &str) -> Result<(), AppError> {
        self.record(format!("revoke {uid}"));
        self.state().grants.remove(&uid);
        Ok(())
    }

    fn uid_excluded(&self, uid: i32, _trace_id: &str) -> Result<i32, AppError> {
        Ok(self.excluded_flag(uid))
    }

    fn set_uid_excluded(&self, uid: i32, exclude: i32, _trace_id: &str) -> Result<(), AppError> {
        self.record(format!("exclude {uid} {exclude}"));
        self.state().excluded.insert(uid, exclude);
        Ok(())
    }

    fn kpm_num(&self, trace_id: &str) -> Result<i64, AppError> {
        self.kpm_guard(trace_id)?;
        Ok(self.state().kpms.len() as i64)
    }

    fn kpm_list(&self, trace_id: &str) -> Result<String, AppError> {
        self.kpm_guard(trace_id)?;
        let names: Vec<String> = self.state().kpms.iter().map(|(name, _)| name.clone()).collect();
        Ok(names.join("\n"))
    }

    fn kpm_info(&self, name: &str, trace_id: &str) -> Result<String, AppError> {
        self.kpm_guard(trace_id)?;
        self.state()
            .kpms
            .iter()
            .find(|(loaded, _)| loaded == name)
            .map(|(_, info)| info.clone())
            .ok_or_else(|| AppError::dependency(format!("{name} is not loaded"), trace_id))
    }

    fn load_kpm(&self, path: &str, args: &str, trace_id: &str) -> Result<(), AppError> {
        self.kpm_guard(trace_id)?;
        self.record(format!("load {path} {args}"));
        let name = path.rsplit('/').next().unwrap_or(path).trim_end_matches(".kpm").to_string();
        let info = format!("name={name}\nversion=1\nargs={args}");
        self.state().kpms.push((name, info));
        Ok(())
    }

    fn unload_kpm(&self, name: &str, trace_id: &str) -> Result<(), AppError> {
        self.kpm_guard(trace_id)?;
        self.record(format!("unload {name}"));
        self.state().kpms.retain(|(loaded, _)| loaded != name);
        Ok(())
    }

    fn control_kpm(&self, name: &str, args: &str, trace_id: &str) -> Result<KpmControlResult, AppError> {
        self.kpm_guard(trace_id)?;
        self.record(format!("control {name} {args}"));
        Ok(KpmControlResult {
            rc: 0,
            out_msg: format!("{name}: {args}"),
        })
    }

    fn installed_kpms(&self, trace_id: &str) -> Result<Vec<String>, AppError> {
        self.kpm_guard(trace_id)?;
        Ok(self.state().installed.clone())
    }

    fn install_kpm(&self, path: &str, trace_id: &str) -> Result<(), AppError> {
        self.kpm_guard(trace_id)?;
        self.record(format!("install {path}"));
        let name = path.rsplit('/').next().unwrap_or(path).trim_end_matches(".kpm").to_string();
        self.state().installed.push(name);
        Ok(())
    }

    fn uninstall_kpm(&self, name: &str, trace_id: &str) -> Result<(), AppError> {
        self.kpm_guard(trace_id)?;
        self.record(format!("uninstall {name}"));
        self.state().installed.retain(|installed| installed != name);
        Ok(())
    }
}

pub struct FakeResolver {
    records: HashMap<String, PackageRecord>,
}

impl FakeResolver {
    pub fn with(packages: &[(&str, i32, bool)]) -> Self {
        let records = packages
            .iter()
            .map(|(name, uid, is_system)| (name.to_string(), package(name, *uid, *is_system)))
            .collect();
        Self { records }
    }
}

impl PackageResolver for FakeResolver {
    fn resolve(&self, package_name: &str, trace_id: &str) -> Result<PackageRecord, AppError> {
        self.records
            .get(package_name)
            .cloned()
            .ok_or_else(|| AppError::dependency(format!("{package_name} not installed"), trace_id))
    }
}

pub struct FakeLister {
    listing: Mutex<Result<String, AppError>>,
    commands: Mutex<Vec<(ModuleVerb, String)>>,
}

impl Default for FakeLister {
    fn default() -> Self {
        Self {
            listing: Mutex::new(Ok("[]".to_string())),
            commands: Mutex::new(Vec::new()),
        }
    }
}

impl FakeLister {
    pub fn with_listing(raw: &str) -> Self {
        let lister = Self::default();
        lister.set_listing(raw);
        lister
    }

    pub fn set_listing(&self, raw: &str) {
        *self.listing.lock().expect("listing") = Ok(raw.to_string());
    }

    pub fn set_failure(&self, err: AppError) {
        *self.listing.lock().expect("listing") = Err(err);
    }

    pub fn commands(&self) -> Vec<(ModuleVerb, String)> {
        self.commands.lock().expect("commands").clone()
    }
}

impl ModuleLister for FakeLister {
    fn list_modules(&self, _trace_id: &str) -> Result<String, AppError> {
        self.listing.lock().expect("listing").clone()
    }

    fn module_command(&self, verb: ModuleVerb, id: &str, trace_id: &str) -> Result<(), AppError> {
        if id.trim().is_empty() {
            return Err(AppError::validation("module id is required", trace_id));
        }
        self.commands.lock().expect("commands").push((verb, id.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFetcher {
    bodies: HashMap<String, String>,
    failing: HashSet<String>,
    hits: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn respond(mut self, url: &str, body: &str) -> Self {
        self.bodies.insert(url.to_string(), body.to_string());
        self
    }

    pub fn fail(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().expect("hits").clone()
    }
}

#[async_trait]
impl HttpFetch for FakeFetcher {
    async fn get_text(&self, url: &str, trace_id: &str) -> Result<String, AppError> {
        self.hits.lock().expect("hits").push(url.to_string());
        if self.failing.contains(url) {
            return Err(AppError::dependency(format!("GET {url} failed"), trace_id));
        }
        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| AppError::dependency(format!("GET {url} returned 404 Not Found"), trace_id))
    }
}
