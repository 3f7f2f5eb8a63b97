use std::time::Duration;

use crate::app::config::ToolSettings;
use crate::app::error::AppError;
use crate::app::runner::{args, ensure_success, run_tool};

use super::{ModuleLister, ModuleVerb};

/// Lists and controls Android-patch modules through `apd module ...`.
pub struct ApdModuleLister {
    program: String,
    timeout: Duration,
}

impl ApdModuleLister {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &ToolSettings) -> Self {
        Self::new(&settings.apd_program, settings.timeout())
    }
}

impl ModuleLister for ApdModuleLister {
    fn list_modules(&self, trace_id: &str) -> Result<String, AppError> {
        let output = ensure_success(
            run_tool(&self.program, &args(["module", "list"]), self.timeout, trace_id)?,
            "apd module list",
            trace_id,
        )?;
        Ok(output.stdout)
    }

    fn module_command(&self, verb: ModuleVerb, id: &str, trace_id: &str) -> Result<(), AppError> {
        if id.trim().is_empty() {
            return Err(AppError::validation("module id is required", trace_id));
        }
        let argv = args(["module", verb.as_str(), id]);
        let what = format!("apd module {}", verb.as_str());
        ensure_success(run_tool(&self.program, &argv, self.timeout, trace_id)?, &what, trace_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_module_ids() {
        let lister = ApdModuleLister::new("apd", Duration::from_secs(1));
        let err = lister
            .module_command(ModuleVerb::Disable, " ", "t")
            .expect_err("blank id");
        assert_eq!(err.code, "ERR_VALIDATION");
    }
}
