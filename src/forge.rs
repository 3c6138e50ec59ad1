//! Forge registry client.
//!
//! The [`ForgeApi`] trait is the seam between the registry cache and the
//! network; [`HttpForgeApi`] implements it with `ureq`, and tests implement
//! it in memory.

use std::io::Read;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;

use crate::defaults::user_agent;
use crate::error::{Error, Result};

/// Fields the module endpoint is asked to leave out of its response.
const EXCLUDED_FIELDS: &str = "readme%20changelog%20license%20uri%20compatibility%20tasks%20plans";

/// A release as described by either registry endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseInfo {
    pub version: String,
    #[serde(default)]
    pub file_md5: Option<String>,
    #[serde(default)]
    pub file_sha256: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Present on the release endpoint only.
    #[serde(default)]
    pub module: Option<ModuleStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SupersededBy {
    pub slug: String,
}

/// Deprecation state of a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ModuleStatus {
    #[serde(default)]
    pub deprecated_at: Option<String>,
    #[serde(default)]
    pub superseded_by: Option<SupersededBy>,
}

impl ModuleStatus {
    /// A warning line when the module is deprecated.
    pub fn deprecation(&self, slug: &str) -> Option<String> {
        let when = self.deprecated_at.as_ref()?;
        Some(match &self.superseded_by {
            Some(successor) => format!(
                "Forge module {} was deprecated at {}; use {} instead",
                slug, when, successor.slug
            ),
            None => format!("Forge module {} was deprecated at {}", slug, when),
        })
    }
}

/// Body of `GET /v3/modules/{slug}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModuleInfo {
    pub slug: String,
    pub current_release: ReleaseInfo,
    #[serde(flatten)]
    pub status: ModuleStatus,
}

impl ModuleInfo {
    pub fn parse(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Outcome of a (possibly conditional) module query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleQuery {
    /// `200`: the raw body (persisted as the last-checked marker) and its
    /// parsed form.
    Fetched { body: String, info: ModuleInfo },
    /// `304`
    NotModified,
}

/// The registry operations the cache needs.
pub trait ForgeApi: Send + Sync {
    /// Query the module endpoint, conditionally when `if_modified_since` is
    /// given. `404` is [`Error::ForgeNotFound`]; transport failures are
    /// [`Error::Network`].
    fn module_info(
        &self,
        base_url: &str,
        slug: &str,
        if_modified_since: Option<SystemTime>,
    ) -> Result<ModuleQuery>;

    /// Query the release endpoint for `slug` at `version`.
    fn release_info(&self, base_url: &str, slug: &str, version: &str) -> Result<ReleaseInfo>;

    /// Stream the release tarball into `consume`.
    fn download(
        &self,
        base_url: &str,
        slug: &str,
        version: &str,
        consume: &mut dyn FnMut(&mut dyn Read) -> Result<()>,
    ) -> Result<()>;
}

pub fn module_url(base_url: &str, slug: &str) -> String {
    format!(
        "{}/v3/modules/{}?exclude_fields={}",
        base_url.trim_end_matches('/'),
        slug,
        EXCLUDED_FIELDS
    )
}

pub fn release_url(base_url: &str, slug: &str, version: &str) -> String {
    format!("{}/v3/releases/{}-{}", base_url.trim_end_matches('/'), slug, version)
}

pub fn file_url(base_url: &str, slug: &str, version: &str) -> String {
    format!(
        "{}/v3/files/{}-{}.tar.gz",
        base_url.trim_end_matches('/'),
        slug,
        version
    )
}

/// `If-Modified-Since` value for `time`.
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// `ureq`-backed registry client. Proxy settings are taken from the
/// environment.
pub struct HttpForgeApi {
    agent: ureq::Agent,
    user_agent: String,
}

impl HttpForgeApi {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            user_agent: user_agent(),
        }
    }

    fn get(
        &self,
        url: &str,
        slug: &str,
        if_modified_since: Option<SystemTime>,
    ) -> Result<ureq::http::Response<ureq::Body>> {
        debug!("GET {}", url);
        let mut request = self.agent.get(url).header("User-Agent", &self.user_agent);
        if let Some(since) = if_modified_since {
            request = request.header("If-Modified-Since", &http_date(since));
        }
        request.call().map_err(|e| map_ureq_error(url, slug, &e))
    }
}

fn map_ureq_error(url: &str, slug: &str, err: &ureq::Error) -> Error {
    match err {
        ureq::Error::StatusCode(404) => Error::ForgeNotFound {
            slug: slug.to_string(),
            url: url.to_string(),
        },
        other => Error::Network {
            url: url.to_string(),
            message: other.to_string(),
        },
    }
}

impl ForgeApi for HttpForgeApi {
    fn module_info(
        &self,
        base_url: &str,
        slug: &str,
        if_modified_since: Option<SystemTime>,
    ) -> Result<ModuleQuery> {
        let url = module_url(base_url, slug);
        let response = self.get(&url, slug, if_modified_since)?;
        if response.status().as_u16() == 304 {
            return Ok(ModuleQuery::NotModified);
        }
        let body = response
            .into_body()
            .read_to_string()
            .map_err(|e| map_ureq_error(&url, slug, &e))?;
        let info = ModuleInfo::parse(&body)?;
        Ok(ModuleQuery::Fetched { body, info })
    }

    fn release_info(&self, base_url: &str, slug: &str, version: &str) -> Result<ReleaseInfo> {
        let url = release_url(base_url, slug, version);
        let body = self
            .get(&url, &format!("{}-{}", slug, version), None)?
            .into_body()
            .read_to_string()
            .map_err(|e| map_ureq_error(&url, slug, &e))?;
        Ok(serde_json::from_str(&body)?)
    }

    fn download(
        &self,
        base_url: &str,
        slug: &str,
        version: &str,
        consume: &mut dyn FnMut(&mut dyn Read) -> Result<()>,
    ) -> Result<()> {
        let url = file_url(base_url, slug, version);
        let response = self.get(&url, &format!("{}-{}", slug, version), None)?;
        let mut reader = response.into_body().into_reader();
        consume(&mut reader)
    }
}
