use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::app::config::UpdateSettings;
use crate::app::error::AppError;
use crate::app::models::{ModuleInfo, ModuleUpdateInfo};

#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// Body of a successful GET; non-2xx answers are errors.
    async fn get_text(&self, url: &str, trace_id: &str) -> Result<String, AppError>;
}

pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(settings: &UpdateSettings) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|err| AppError::system(format!("Failed to build HTTP client: {err}"), ""))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    async fn get_text(&self, url: &str, trace_id: &str) -> Result<String, AppError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| AppError::dependency(format!("GET {url} failed: {err}"), trace_id))?;
        let status = response.status();
        debug!(trace_id = %trace_id, url = %url, status = status.as_u16(), "fetched");
        if !status.is_success() {
            return Err(AppError::dependency(format!("GET {url} returned {status}"), trace_id));
        }
        response
            .text()
            .await
            .map_err(|err| AppError::dependency(format!("Reading {url} failed: {err}"), trace_id))
    }
}

#[derive(Clone)]
pub struct UpdateChecker {
    fetcher: Arc<dyn HttpFetch>,
}

impl UpdateChecker {
    pub fn new(fetcher: Arc<dyn HttpFetch>) -> Self {
        Self { fetcher }
    }

    /// Newer version for `module`, or `None`. Never fails: network and decode
    /// problems are logged and read as "no update".
    pub async fn check_update(&self, module: &ModuleInfo, trace_id: &str) -> Option<ModuleUpdateInfo> {
        match self.fetch_update(module, trace_id).await {
            Ok(found) => found,
            Err(err) => {
                warn!(trace_id = %trace_id, module = %module.id, error = %err, "update check failed");
                None
            }
        }
    }

    /// Like [`check_update`](Self::check_update) but tells a failed check apart from "no update".
    pub async fn fetch_update(
        &self,
        module: &ModuleInfo,
        trace_id: &str,
    ) -> Result<Option<ModuleUpdateInfo>, AppError> {
        if !module.wants_update_check() {
            return Ok(None);
        }
        info!(trace_id = %trace_id, module = %module.id, url = %module.update_json, "checking for update");
        let body = self.fetcher.get_text(&module.update_json, trace_id).await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let remote: ModuleUpdateInfo = serde_json::from_str(&body).map_err(|err| {
            AppError::parse(format!("Bad update descriptor for {}: {err}", module.id), trace_id)
        })?;
        Ok(newer_than(module, remote))
    }

    /// Changelog text: fetched when `source` is an http(s) URL, otherwise `source` itself.
    pub async fn fetch_changelog(&self, source: &str, trace_id: &str) -> Result<String, AppError> {
        let trimmed = source.trim();
        if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
            return self.fetcher.get_text(trimmed, trace_id).await;
        }
        Ok(source.to_string())
    }
}

pub fn newer_than(module: &ModuleInfo, remote: ModuleUpdateInfo) -> Option<ModuleUpdateInfo> {
    if remote.version_code <= module.version_code || remote.zip_url.is_empty() {
        return None;
    }
    Some(remote)
}
