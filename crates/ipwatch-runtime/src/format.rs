//! Stateless rendering of the active set.

use serde::Serialize;
use serde_json::json;

use ipwatch_core::{Error, Result};
use ipwatch_store::ActiveIndicator;

/// Supported renderings of the active set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One ip per line.
    #[default]
    Text,
    /// Full entries with provenance.
    Json,
    /// ip + classification pairs for firewall threat-feed connectors.
    Connector,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" | "txt" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "connector" => Ok(Self::Connector),
            other => Err(Error::InvalidRequest(format!("unknown output format: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Connector => "connector",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Text => "text/plain; charset=utf-8",
            Self::Json | Self::Connector => "application/json",
        }
    }
}

/// A rendered response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedPayload {
    pub content_type: &'static str,
    pub body: String,
}

/// Connector classification of every active entry. Sources are blacklist
/// feeds, so an ip is either listed or absent; per-source confidence is
/// reported in the JSON format and never folded into this label.
pub const CONNECTOR_CLASSIFICATION: &str = "malicious";

pub fn format(format: OutputFormat, entries: &[ActiveIndicator]) -> Result<FormattedPayload> {
    let body = match format {
        OutputFormat::Text => {
            let mut body = String::with_capacity(entries.len() * 16);
            for entry in entries {
                body.push_str(&entry.ip);
                body.push('\n');
            }
            body
        }
        OutputFormat::Json => serde_json::to_string(&json!({
            "count": entries.len(),
            "indicators": entries,
        }))?,
        OutputFormat::Connector => {
            let pairs: Vec<_> = entries
                .iter()
                .map(|e| {
                    json!({
                        "ip": e.ip,
                        "classification": CONNECTOR_CLASSIFICATION,
                        "sources": e.sources,
                    })
                })
                .collect();
            serde_json::to_string(&json!({ "type": "ip", "entries": pairs }))?
        }
    };
    Ok(FormattedPayload {
        content_type: format.content_type(),
        body,
    })
}
