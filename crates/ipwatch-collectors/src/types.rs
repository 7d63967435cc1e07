//! Collector types: injected settings, login session and raw payloads.

use std::time::Duration;

use ipwatch_core::SourceConfig;
use serde::Serialize;

/// Credentials and endpoint for one collector. Supplied from configuration.
#[derive(Clone)]
pub struct CollectorSettings {
    pub source: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl CollectorSettings {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            source: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            timeout: config.timeout,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl std::fmt::Debug for CollectorSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorSettings")
            .field("source", &self.source)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// An authenticated portal session.
///
/// Holds the HTTP client so cookie-based logins keep their jar for the
/// fetch that follows.
pub struct Session {
    pub client: reqwest::blocking::Client,
    /// Bearer-style token for portals that hand one out at login.
    pub token: Option<String>,
}

/// Undecoded portal response, handed from `fetch_raw` to `parse_to_records`.
#[derive(Debug, Clone)]
pub enum RawPayload {
    /// One HTML document per fetched page.
    HtmlPages(Vec<String>),
    /// An XLSX workbook export.
    Workbook(Vec<u8>),
}

/// Known collector variants, selected by source name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorKind {
    Regtech,
    Secudium,
}

impl CollectorKind {
    pub fn from_source(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "regtech" => Some(Self::Regtech),
            "secudium" => Some(Self::Secudium),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regtech => "regtech",
            Self::Secudium => "secudium",
        }
    }
}
