//! Blocking HTTP plumbing shared by the portal adapters.

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;

use crate::types::CollectorSettings;
use ipwatch_core::{Error, Result};

const USER_AGENT: &str = concat!("ipwatch/", env!("CARGO_PKG_VERSION"));

/// A fresh client with its own cookie jar.
///
/// Built per collection inside the blocking worker; a blocking client must
/// not be created or dropped on an async executor thread.
pub fn client(settings: &CollectorSettings) -> Result<Client> {
    Client::builder()
        .timeout(settings.timeout)
        .cookie_store(true)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| Error::Transport(format!("failed to build http client: {}", e)))
}

pub fn transport(e: reqwest::Error) -> Error {
    Error::Transport(e.to_string())
}

/// Map an HTTP status to the collector error taxonomy.
pub fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    match status {
        s if s.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Authentication(format!(
            "{} rejected with status {}",
            what, status
        ))),
        _ => Err(Error::Transport(format!("{} returned status {}", what, status))),
    }
}
