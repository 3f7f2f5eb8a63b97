use serde::{Deserialize, Deserializer, Serialize};
use std::sync::OnceLock;

use regex::Regex;

pub const SHELL_UID: i32 = 2000;
pub const MAGISK_SCONTEXT: &str = "u:r:magisk:s0";
pub const DEFAULT_SCONTEXT: &str = "u:r:untrusted_app:s0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResponse<T> {
    pub trace_id: String,
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageRecord {
    pub package_name: String,
    pub uid: i32,
    pub label: String,
    pub version_name: Option<String>,
    pub version_code: Option<i64>,
    pub is_system: bool,
    pub code_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PermissionProfile {
    pub uid: i32,
    pub to_uid: i32,
    pub scontext: String,
}

impl PermissionProfile {
    pub fn for_uid(uid: i32) -> Self {
        Self {
            uid,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionConfigEntry {
    pub pkg: String,
    pub exclude: i32,
    pub allow: i32,
    pub profile: PermissionProfile,
}

impl PermissionConfigEntry {
    pub fn new(pkg: impl Into<String>, exclude: i32, allow: i32, profile: PermissionProfile) -> Self {
        Self {
            pkg: pkg.into(),
            exclude,
            allow,
            profile,
        }
    }

    pub fn uid(&self) -> i32 {
        self.profile.uid
    }

    pub fn is_default(&self) -> bool {
        self.allow == 0 && self.exclude == 0
    }

    /// A granted app is never excluded.
    pub fn normalize(&mut self) {
        if self.allow == 1 {
            self.exclude = 0;
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppEntry {
    pub label: String,
    pub package: PackageRecord,
    pub config: PermissionConfigEntry,
    pub root_granted: bool,
    pub exclude_app: i32,
}

impl AppEntry {
    pub fn new(label: String, package: PackageRecord, config: PermissionConfigEntry) -> Self {
        let root_granted = config.allow != 0;
        let exclude_app = config.exclude;
        Self {
            label,
            package,
            config,
            root_granted,
            exclude_app,
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package.package_name
    }

    pub fn uid(&self) -> i32 {
        self.package.uid
    }
}

/// Android-patch module as reported by `apd module list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "unknown_field")]
    pub author: String,
    #[serde(default = "unknown_field")]
    pub version: String,
    #[serde(rename = "versionCode", default, deserialize_with = "deserialize_int_compat")]
    pub version_code: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "deserialize_bool_compat")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "deserialize_bool_compat")]
    pub update: bool,
    #[serde(default, deserialize_with = "deserialize_bool_compat")]
    pub remove: bool,
    #[serde(rename = "updateJson", default)]
    pub update_json: String,
    #[serde(rename = "web", default, deserialize_with = "deserialize_bool_compat")]
    pub has_web_ui: bool,
    #[serde(rename = "action", default, deserialize_with = "deserialize_bool_compat")]
    pub has_action_script: bool,
    #[serde(default, deserialize_with = "deserialize_bool_compat")]
    pub metamodule: bool,
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub update_info: Option<ModuleUpdateInfo>,
}

impl ModuleInfo {
    /// Equality over everything the lister reports; resolved update info is ignored.
    pub fn same_listing(&self, other: &ModuleInfo) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.author == other.author
            && self.version == other.version
            && self.version_code == other.version_code
            && self.description == other.description
            && self.enabled == other.enabled
            && self.update == other.update
            && self.remove == other.remove
            && self.update_json == other.update_json
            && self.has_web_ui == other.has_web_ui
            && self.has_action_script == other.has_action_script
            && self.metamodule == other.metamodule
    }

    pub fn wants_update_check(&self) -> bool {
        self.enabled && !self.update_json.is_empty() && !self.update && !self.remove
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ModuleUpdateInfo {
    #[serde(default, deserialize_with = "deserialize_sanitized_version")]
    pub version: String,
    #[serde(rename = "versionCode", default, deserialize_with = "deserialize_int_compat")]
    pub version_code: i64,
    #[serde(rename = "zipUrl", default)]
    pub zip_url: String,
    #[serde(default)]
    pub changelog: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KpmInfo {
    pub name: String,
    pub version: String,
    pub license: String,
    pub author: String,
    pub description: String,
    pub args: String,
    pub is_installed: bool,
}

impl KpmInfo {
    pub fn installed_placeholder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "unknown".to_string(),
            license: "unknown".to_string(),
            author: "unknown".to_string(),
            description: "unknown".to_string(),
            args: "unknown".to_string(),
            is_installed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KpmControlResult {
    pub rc: i64,
    pub out_msg: String,
}

fn unknown_field() -> String {
    "Unknown".to_string()
}

/// Shapes the lister uses for flag fields. Anything else decodes as `false`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompatBool {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    Other(serde_json::Value),
}

impl From<CompatBool> for bool {
    fn from(value: CompatBool) -> Self {
        match value {
            CompatBool::Bool(flag) => flag,
            CompatBool::Number(number) => number.as_i64().map(|v| v != 0).unwrap_or(false),
            CompatBool::Text(text) => {
                let lowered = text.to_lowercase();
                lowered == "true" || lowered == "1"
            }
            CompatBool::Other(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompatInt {
    Number(serde_json::Number),
    Text(String),
    Other(serde_json::Value),
}

impl From<CompatInt> for i64 {
    fn from(value: CompatInt) -> Self {
        match value {
            CompatInt::Number(number) => number.as_i64().unwrap_or(0),
            CompatInt::Text(text) => text.trim().parse().unwrap_or(0),
            CompatInt::Other(_) => 0,
        }
    }
}

pub fn deserialize_bool_compat<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    CompatBool::deserialize(deserializer).map(bool::from)
}

pub fn deserialize_int_compat<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    CompatInt::deserialize(deserializer).map(i64::from)
}

fn deserialize_sanitized_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    Ok(sanitize_version(&raw))
}

pub fn sanitize_version(version: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let pattern = UNSAFE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9.\-_]").expect("static regex"));
    pattern.replace_all(version, "_").into_owned()
}
