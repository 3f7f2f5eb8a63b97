//! List view models: each owns a snapshot store, refreshes it from the
//! privileged side and derives the filtered, sorted list on demand.

pub mod ap_modules;
pub mod kp_modules;
pub mod superuser;

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::app::error::AppError;

pub use ap_modules::ApModuleViewModel;
pub use kp_modules::KpModuleViewModel;
pub use superuser::{AppFilter, SuperUserViewModel, WhitelistMode};

/// `refreshing` is advisory only; `need_refresh` survives failed refreshes.
#[derive(Debug, Default)]
pub struct RefreshState {
    refreshing: AtomicBool,
    need_refresh: AtomicBool,
}

impl RefreshState {
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    pub fn is_need_refresh(&self) -> bool {
        self.need_refresh.load(Ordering::Acquire)
    }

    pub fn mark_need_refresh(&self) {
        self.need_refresh.store(true, Ordering::Release);
    }

    pub fn mark_fresh(&self) {
        self.need_refresh.store(false, Ordering::Release);
    }

    pub fn begin(&self) -> RefreshGuard<'_> {
        self.refreshing.store(true, Ordering::Release);
        RefreshGuard { state: self }
    }
}

pub struct RefreshGuard<'a> {
    state: &'a RefreshState,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.state.refreshing.store(false, Ordering::Release);
    }
}

/// Privilege failures go back to the caller; anything else keeps the last
/// good snapshot and reads as "nothing refreshed".
pub(crate) fn degrade(err: AppError, what: &str) -> Result<bool, AppError> {
    if err.is_privilege() {
        return Err(err);
    }
    warn!(trace_id = %err.trace_id, error = %err, "{what} failed, keeping previous list");
    Ok(false)
}
