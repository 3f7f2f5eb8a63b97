//! Seams to the privileged side of the framework.
//!
//! Everything here talks to components that live outside this crate (the kernel
//! supercall interface and the `apd` daemon). Calls block, so they are only ever
//! issued from the root executor's worker thread.

pub mod apd;
pub mod kpatch;

use crate::app::error::AppError;
use crate::app::models::{KpmControlResult, PermissionProfile};

pub use apd::ApdModuleLister;
pub use kpatch::KpatchGateway;

pub trait PrivilegeGateway: Send + Sync {
    /// (Re-)establishes root for the operation about to run.
    fn elevate(&self, trace_id: &str) -> Result<(), AppError>;

    fn su_uids(&self, trace_id: &str) -> Result<Vec<i32>, AppError>;
    fn su_profile(&self, uid: i32, trace_id: &str) -> Result<Option<PermissionProfile>, AppError>;
    fn grant_su(&self, uid: i32, to_uid: i32, scontext: &str, trace_id: &str) -> Result<(), AppError>;
    fn revoke_su(&self, uid: i32, trace_id: &str) -> Result<(), AppError>;
    fn uid_excluded(&self, uid: i32, trace_id: &str) -> Result<i32, AppError>;
    fn set_uid_excluded(&self, uid: i32, exclude: i32, trace_id: &str) -> Result<(), AppError>;

    fn kpm_num(&self, trace_id: &str) -> Result<i64, AppError>;
    /// Newline-delimited names of loaded kernel-patch modules.
    fn kpm_list(&self, trace_id: &str) -> Result<String, AppError>;
    /// `key=value` lines describing one loaded module.
    fn kpm_info(&self, name: &str, trace_id: &str) -> Result<String, AppError>;
    fn load_kpm(&self, path: &str, args: &str, trace_id: &str) -> Result<(), AppError>;
    fn unload_kpm(&self, name: &str, trace_id: &str) -> Result<(), AppError>;
    fn control_kpm(&self, name: &str, args: &str, trace_id: &str) -> Result<KpmControlResult, AppError>;
    fn installed_kpms(&self, trace_id: &str) -> Result<Vec<String>, AppError>;
    fn install_kpm(&self, path: &str, trace_id: &str) -> Result<(), AppError>;
    fn uninstall_kpm(&self, name: &str, trace_id: &str) -> Result<(), AppError>;
}

/// Source of the Android-patch module listing and its per-module controls.
pub trait ModuleLister: Send + Sync {
    /// JSON array of module descriptors.
    fn list_modules(&self, trace_id: &str) -> Result<String, AppError>;
    fn module_command(&self, verb: ModuleVerb, id: &str, trace_id: &str) -> Result<(), AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleVerb {
    Enable,
    Disable,
    Uninstall,
    Restore,
}

impl ModuleVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleVerb::Enable => "enable",
            ModuleVerb::Disable => "disable",
            ModuleVerb::Uninstall => "uninstall",
            ModuleVerb::Restore => "restore",
        }
    }
}
