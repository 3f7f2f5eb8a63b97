use std::time::Duration;

use tracing::warn;

use crate::app::config::ToolSettings;
use crate::app::error::AppError;
use crate::app::models::{KpmControlResult, PermissionProfile};
use crate::app::runner::{ensure_success, run_tool, CommandOutput};

use super::PrivilegeGateway;

/// Drives the `kpatch` tool: `kpatch <superkey> <subcommand> ...`.
pub struct KpatchGateway {
    program: String,
    superkey: String,
    timeout: Duration,
}

impl KpatchGateway {
    pub fn new(program: impl Into<String>, superkey: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            superkey: superkey.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &ToolSettings) -> Self {
        Self::new(&settings.kpatch_program, &settings.superkey, settings.timeout())
    }

    fn invoke(&self, sub: &[&str], trace_id: &str) -> Result<CommandOutput, AppError> {
        if self.superkey.is_empty() {
            return Err(AppError::privilege("Superkey is not configured", trace_id));
        }
        let mut args = Vec::with_capacity(sub.len() + 1);
        args.push(self.superkey.clone());
        args.extend(sub.iter().map(|item| item.to_string()));
        run_tool(&self.program, &args, self.timeout, trace_id)
    }

    fn checked(&self, sub: &[&str], trace_id: &str) -> Result<String, AppError> {
        let what = format!("kpatch {}", sub.first().copied().unwrap_or_default());
        let output = ensure_success(self.invoke(sub, trace_id)?, &what, trace_id)?;
        Ok(output.stdout)
    }
}

impl PrivilegeGateway for KpatchGateway {
    fn elevate(&self, trace_id: &str) -> Result<(), AppError> {
        let output = self.invoke(&["hello"], trace_id)?;
        if output.success() && output.stdout.contains("hello") {
            return Ok(());
        }
        Err(AppError::privilege(
            format!("Root elevation refused: {}", output.stderr.trim()),
            trace_id,
        ))
    }

    fn su_uids(&self, trace_id: &str) -> Result<Vec<i32>, AppError> {
        let stdout = self.checked(&["sumgr", "list"], trace_id)?;
        Ok(parse_uid_list(&stdout, trace_id))
    }

    fn su_profile(&self, uid: i32, trace_id: &str) -> Result<Option<PermissionProfile>, AppError> {
        let uid = uid.to_string();
        let output = self.invoke(&["sumgr", "profile", &uid], trace_id)?;
        if !output.success() {
            return Ok(None);
        }
        Ok(parse_profile_output(&output.stdout))
    }

    fn grant_su(&self, uid: i32, to_uid: i32, scontext: &str, trace_id: &str) -> Result<(), AppError> {
        let (uid, to_uid) = (uid.to_string(), to_uid.to_string());
        self.checked(&["sumgr", "grant", &uid, &to_uid, scontext], trace_id)
            .map(|_| ())
    }

    fn revoke_su(&self, uid: i32, trace_id: &str) -> Result<(), AppError> {
        let uid = uid.to_string();
        self.checked(&["sumgr", "revoke", &uid], trace_id).map(|_| ())
    }

    fn uid_excluded(&self, uid: i32, trace_id: &str) -> Result<i32, AppError> {
        let uid = uid.to_string();
        let stdout = self.checked(&["sumgr", "exclude", &uid], trace_id)?;
        parse_number(&stdout, "exclude flag", trace_id)
    }

    fn set_uid_excluded(&self, uid: i32, exclude: i32, trace_id: &str) -> Result<(), AppError> {
        let (uid, exclude) = (uid.to_string(), exclude.to_string());
        self.checked(&["sumgr", "exclude", &uid, &exclude], trace_id)
            .map(|_| ())
    }

    fn kpm_num(&self, trace_id: &str) -> Result<i64, AppError> {
        let stdout = self.checked(&["kpm", "num"], trace_id)?;
        parse_number(&stdout, "kpm count", trace_id)
    }

    fn kpm_list(&self, trace_id: &str) -> Result<String, AppError> {
        self.checked(&["kpm", "list"], trace_id)
    }

    fn kpm_info(&self, name: &str, trace_id: &str) -> Result<String, AppError> {
        self.checked(&["kpm", "info", name], trace_id)
    }

    fn load_kpm(&self, path: &str, args: &str, trace_id: &str) -> Result<(), AppError> {
        let mut sub = vec!["kpm", "load", path];
        if !args.trim().is_empty() {
            sub.push(args);
        }
        self.checked(&sub, trace_id).map(|_| ())
    }

    fn unload_kpm(&self, name: &str, trace_id: &str) -> Result<(), AppError> {
        self.checked(&["kpm", "unload", name], trace_id).map(|_| ())
    }

    fn control_kpm(&self, name: &str, args: &str, trace_id: &str) -> Result<KpmControlResult, AppError> {
        let output = self.invoke(&["kpm", "ctl0", name, args], trace_id)?;
        Ok(KpmControlResult {
            rc: output.exit_code.map(i64::from).unwrap_or(-1),
            out_msg: output.stdout.trim_end().to_string(),
        })
    }

    fn installed_kpms(&self, trace_id: &str) -> Result<Vec<String>, AppError> {
        let stdout = self.checked(&["kpm", "installed"], trace_id)?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn install_kpm(&self, path: &str, trace_id: &str) -> Result<(), AppError> {
        self.checked(&["kpm", "install", path], trace_id).map(|_| ())
    }

    fn uninstall_kpm(&self, name: &str, trace_id: &str) -> Result<(), AppError> {
        self.checked(&["kpm", "uninstall", name], trace_id).map(|_| ())
    }
}

pub fn parse_uid_list(output: &str, trace_id: &str) -> Vec<i32> {
    output
        .split_whitespace()
        .filter_map(|token| match token.parse::<i32>() {
            Ok(uid) => Some(uid),
            Err(_) => {
                warn!(trace_id = %trace_id, token = %token, "ignoring non-numeric uid");
                None
            }
        })
        .collect()
}

pub fn parse_profile_output(output: &str) -> Option<PermissionProfile> {
    let mut uid = None;
    let mut profile = PermissionProfile::default();
    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "uid" => uid = value.parse().ok(),
            "to_uid" => profile.to_uid = value.parse().unwrap_or_default(),
            "scontext" | "sctx" => profile.scontext = value.to_string(),
            _ => {}
        }
    }
    profile.uid = uid?;
    Some(profile)
}

fn parse_number<T: std::str::FromStr>(output: &str, what: &str, trace_id: &str) -> Result<T, AppError> {
    output
        .trim()
        .parse()
        .map_err(|_| AppError::parse(format!("Unexpected {what}: {:?}", output.trim()), trace_id))
}
