use chrono::{DateTime, Utc};
use patch_manager_lib::app::config::{config_path, load_config, save_config, AppConfig};
use patch_manager_lib::app::error::{resolve_trace_id, AppError};
use patch_manager_lib::app::logging::init_logging;
use patch_manager_lib::app::models::CommandResponse;
use patch_manager_lib::app::privilege::ModuleVerb;
use patch_manager_lib::app::state::AppState;
use patch_manager_lib::app::view_models::AppFilter;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

const USAGE: &str = "Usage: patchmgr [--trace-id ID] [--search TEXT] [--system] [--installed] <command> [args]\n\
Commands:\n  \
apps | grant UID | revoke UID | exclude UID | include UID | reset-apps | sync-configs\n  \
modules | module-enable ID | module-disable ID | module-uninstall ID | module-restore ID | changelog ID\n  \
kpms | kpm-load PATH [ARGS] | kpm-unload NAME | kpm-control NAME ARGS | kpm-install PATH | kpm-uninstall NAME\n  \
config | config-reset\n";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Apps,
    Grant(i32),
    Revoke(i32),
    Exclude(i32),
    Include(i32),
    ResetApps,
    SyncConfigs,
    Modules,
    Module(ModuleVerb, String),
    Changelog(String),
    Kpms,
    KpmLoad { path: String, args: String },
    KpmUnload(String),
    KpmControl { name: String, args: String },
    KpmInstall(String),
    KpmUninstall(String),
    Config,
    ConfigReset,
}

#[derive(Debug, Clone, PartialEq)]
struct Args {
    trace_id: Option<String>,
    search: String,
    show_system: bool,
    installed: bool,
    command: Command,
}

#[derive(Serialize)]
struct ListView<T> {
    generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refreshed_at: Option<DateTime<Utc>>,
    count: usize,
    items: Vec<T>,
}

impl<T> ListView<T> {
    fn new(refreshed_at: Option<DateTime<Utc>>, items: Vec<T>) -> Self {
        Self {
            generated_at: Utc::now(),
            refreshed_at,
            count: items.len(),
            items,
        }
    }
}

fn parse_args(raw: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut trace_id = None;
    let mut search = String::new();
    let mut show_system = false;
    let mut installed = false;
    let mut positional: Vec<String> = Vec::new();

    let mut it = raw.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--trace-id" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--trace-id requires a value".to_string())?;
                trace_id = Some(value);
            }
            "--search" => {
                search = it
                    .next()
                    .ok_or_else(|| "--search requires a value".to_string())?;
            }
            "--system" => {
                show_system = true;
            }
            "--installed" => {
                installed = true;
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other if other.starts_with("--") => return Err(format!("Unknown arg: {other}")),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let name = positional.next().ok_or_else(|| USAGE.to_string())?;
    let mut next = |what: &str| {
        positional
            .next()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| format!("{name} requires {what}"))
    };
    let uid = |value: String| {
        value
            .trim()
            .parse::<i32>()
            .map_err(|_| format!("Invalid uid: {value}"))
    };

    let command = match name.as_str() {
        "apps" => Command::Apps,
        "grant" => Command::Grant(uid(next("a uid")?)?),
        "revoke" => Command::Revoke(uid(next("a uid")?)?),
        "exclude" => Command::Exclude(uid(next("a uid")?)?),
        "include" => Command::Include(uid(next("a uid")?)?),
        "reset-apps" => Command::ResetApps,
        "sync-configs" => Command::SyncConfigs,
        "modules" => Command::Modules,
        "module-enable" => Command::Module(ModuleVerb::Enable, next("a module id")?),
        "module-disable" => Command::Module(ModuleVerb::Disable, next("a module id")?),
        "module-uninstall" => Command::Module(ModuleVerb::Uninstall, next("a module id")?),
        "module-restore" => Command::Module(ModuleVerb::Restore, next("a module id")?),
        "changelog" => Command::Changelog(next("a module id")?),
        "kpms" => Command::Kpms,
        "kpm-load" => {
            let path = next("a module path")?;
            let args = next("args").unwrap_or_default();
            Command::KpmLoad { path, args }
        }
        "kpm-unload" => Command::KpmUnload(next("a module name")?),
        "kpm-control" => {
            let name = next("a module name")?;
            let args = next("control args")?;
            Command::KpmControl { name, args }
        }
        "kpm-install" => Command::KpmInstall(next("a module path")?),
        "kpm-uninstall" => Command::KpmUninstall(next("a module name")?),
        "config" => Command::Config,
        "config-reset" => Command::ConfigReset,
        other => return Err(format!("Unknown command: {other}\n{USAGE}")),
    };

    Ok(Args {
        trace_id,
        search,
        show_system,
        installed,
        command,
    })
}

fn to_json<T: Serialize>(value: &T, trace_id: &str) -> Result<Value, AppError> {
    serde_json::to_value(value).map_err(|err| AppError::system(format!("Failed to encode output: {err}"), trace_id))
}

async fn dispatch(args: &Args, config: AppConfig, trace_id: &str) -> Result<Value, AppError> {
    match &args.command {
        Command::Config => return to_json(&config.redacted(), trace_id),
        Command::ConfigReset => {
            let fresh = AppConfig::default();
            save_config(&fresh, trace_id)?;
            return to_json(&json!({ "path": config_path().display().to_string(), "config": fresh.redacted() }), trace_id);
        }
        _ => {}
    }

    let show_system = args.show_system || config.superuser.show_system_apps;
    let state = AppState::new(config)?;
    let superuser = &state.superuser;
    let filter = AppFilter {
        search: args.search.clone(),
        show_system_apps: show_system,
    };

    match &args.command {
        Command::Apps => {
            superuser.fetch_app_list(trace_id).await?;
            to_json(&ListView::new(superuser.last_refreshed(), superuser.app_list(&filter)), trace_id)
        }
        Command::Grant(uid) | Command::Revoke(uid) => {
            superuser.fetch_app_list(trace_id).await?;
            let granted = matches!(args.command, Command::Grant(_));
            to_json(&superuser.set_root_granted(*uid, granted, trace_id).await?, trace_id)
        }
        Command::Exclude(uid) | Command::Include(uid) => {
            superuser.fetch_app_list(trace_id).await?;
            let excluded = matches!(args.command, Command::Exclude(_));
            to_json(&superuser.set_excluded(*uid, excluded, trace_id).await?, trace_id)
        }
        Command::ResetApps => {
            superuser.fetch_app_list(trace_id).await?;
            superuser.reset_app_list(trace_id).await?;
            to_json(&ListView::new(superuser.last_refreshed(), superuser.app_list(&filter)), trace_id)
        }
        Command::SyncConfigs => {
            let outcome = superuser.synchronize_configs(trace_id).await?;
            to_json(
                &json!({
                    "stored": outcome.stored,
                    "implied": outcome.implied,
                    "rewritten": outcome.rewritten,
                }),
                trace_id,
            )
        }
        Command::Modules => {
            state.ap_modules.fetch_module_list(trace_id).await?;
            to_json(&ListView::new(None, state.ap_modules.module_list(&args.search)), trace_id)
        }
        Command::Module(verb, id) => {
            match verb {
                ModuleVerb::Enable => state.ap_modules.enable_module(id, trace_id).await?,
                ModuleVerb::Disable => state.ap_modules.disable_module(id, trace_id).await?,
                ModuleVerb::Uninstall => state.ap_modules.uninstall_module(id, trace_id).await?,
                ModuleVerb::Restore => state.ap_modules.restore_module(id, trace_id).await?,
            }
            to_json(&json!({ "module": id, "action": verb.as_str() }), trace_id)
        }
        Command::Changelog(id) => {
            state.ap_modules.fetch_module_list(trace_id).await?;
            let snapshot = state.ap_modules.modules().snapshot();
            let module = snapshot
                .iter()
                .find(|module| module.id == *id)
                .ok_or_else(|| AppError::validation(format!("No module with id {id}"), trace_id))?;
            let update = module
                .update_info
                .as_ref()
                .ok_or_else(|| AppError::validation(format!("No update available for {id}"), trace_id))?;
            let changelog = state.ap_modules.checker().fetch_changelog(&update.changelog, trace_id).await?;
            to_json(
                &json!({ "module": id, "version": update.version, "changelog": changelog }),
                trace_id,
            )
        }
        Command::Kpms => {
            state.kp_modules.fetch_module_list(trace_id).await?;
            let items = if args.installed {
                state.kp_modules.installed_module_list(&args.search)
            } else {
                state.kp_modules.module_list(&args.search)
            };
            to_json(&ListView::new(None, items), trace_id)
        }
        Command::KpmLoad { path, args: kpm_args } => {
            state.kp_modules.load_module(path, kpm_args, trace_id).await?;
            to_json(&json!({ "loaded": path }), trace_id)
        }
        Command::KpmUnload(name) => {
            state.kp_modules.unload_module(name, trace_id).await?;
            to_json(&json!({ "unloaded": name }), trace_id)
        }
        Command::KpmControl { name, args: kpm_args } => {
            to_json(&state.kp_modules.control_module(name, kpm_args, trace_id).await?, trace_id)
        }
        Command::KpmInstall(path) => {
            state.kp_modules.install_module(path, trace_id).await?;
            to_json(&json!({ "installed": path }), trace_id)
        }
        Command::KpmUninstall(name) => {
            state.kp_modules.uninstall_module(name, trace_id).await?;
            to_json(&json!({ "uninstalled": name }), trace_id)
        }
        Command::Config | Command::ConfigReset => to_json(&Value::Null, trace_id),
    }
}

fn fail(err: &AppError) -> ! {
    match serde_json::to_string_pretty(err) {
        Ok(body) => eprintln!("{body}"),
        Err(_) => eprintln!("{err}"),
    }
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = resolve_trace_id(args.trace_id.clone());
    let config = match load_config(&trace_id) {
        Ok(config) => config,
        Err(err) => fail(&err),
    };
    init_logging(&config.logging.log_level);
    info!(trace_id = %trace_id, command = ?args.command, "patchmgr start");

    let data = match dispatch(&args, config, &trace_id).await {
        Ok(data) => data,
        Err(err) => fail(&err),
    };
    let response = CommandResponse { trace_id, data };
    match serde_json::to_string_pretty(&response) {
        Ok(body) => println!("{body}"),
        Err(err) => fail(&AppError::system(format!("Failed to encode output: {err}"), &response.trace_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(items: &[&str]) -> Result<Args, String> {
        parse_args(items.iter().map(|item| item.to_string()))
    }

    #[test]
    fn parses_flags_anywhere() {
        let args = parse(&["apps", "--search", "term", "--system"]).expect("args");
        assert_eq!(args.command, Command::Apps);
        assert_eq!(args.search, "term");
        assert!(args.show_system);
        assert_eq!(args.trace_id, None);

        let args = parse(&["--trace-id", "abc", "kpms", "--installed"]).expect("args");
        assert_eq!(args.trace_id.as_deref(), Some("abc"));
        assert!(args.installed);
    }

    #[test]
    fn parses_command_operands() {
        assert_eq!(parse(&["grant", "10123"]).expect("grant").command, Command::Grant(10123));
        assert_eq!(
            parse(&["module-disable", "zygisk"]).expect("disable").command,
            Command::Module(ModuleVerb::Disable, "zygisk".to_string())
        );
        assert_eq!(
            parse(&["kpm-load", "/sdcard/a.kpm"]).expect("load").command,
            Command::KpmLoad {
                path: "/sdcard/a.kpm".to_string(),
                args: String::new()
            }
        );
        assert_eq!(
            parse(&["kpm-control", "a", "ping 1"]).expect("control").command,
            Command::KpmControl {
                name: "a".to_string(),
                args: "ping 1".to_string()
            }
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["grant"]).expect_err("missing uid").contains("requires a uid"));
        assert!(parse(&["grant", "abc"]).expect_err("bad uid").contains("Invalid uid"));
        assert!(parse(&["launch"]).expect_err("unknown").starts_with("Unknown command"));
        assert!(parse(&["apps", "--verbose"]).expect_err("flag").starts_with("Unknown arg"));
    }

    #[test]
    fn list_view_counts_items() {
        let view = ListView::new(None, vec![1, 2, 3]);
        let encoded = serde_json::to_value(&view).expect("json");
        assert_eq!(encoded["count"], 3);
        assert!(encoded.get("refreshed_at").is_none());
        assert!(encoded["generated_at"].is_string());
    }
}
