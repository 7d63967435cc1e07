//! REGTECH advisory portal: form login with a cookie session, then a paged
//! HTML table of blocked addresses.

use ipwatch_core::{normalize_ip, CollectedIndicator, Error, Result};
use serde_json::json;
use tracing::{debug, info};

use crate::collector::SourceCollector;
use crate::http::{self, check_status};
use crate::markup::{cell_text, confidence_from_risk, parse_date, regex};
use crate::types::{CollectorSettings, RawPayload, Session};

const LOGIN_PATH: &str = "/login/loginProcess";
const LIST_PATH: &str = "/fcti/securityAdvisory/advisoryList";
const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 50;
/// Used when a row carries no recognizable risk label.
const DEFAULT_CONFIDENCE: f64 = 0.7;

pub struct RegtechCollector {
    settings: CollectorSettings,
}

impl RegtechCollector {
    pub fn new(settings: CollectorSettings) -> Self {
        Self { settings }
    }
}

impl SourceCollector for RegtechCollector {
    fn source(&self) -> &str {
        &self.settings.source
    }

    fn authenticate(&self) -> Result<Session> {
        if !self.settings.has_credentials() {
            return Err(Error::Authentication(format!(
                "no credentials configured for {}",
                self.settings.source
            )));
        }
        let client = http::client(&self.settings)?;
        let response = client
            .post(self.settings.url(LOGIN_PATH))
            .form(&[
                ("loginID", self.settings.username.as_str()),
                ("loginPW", self.settings.password.as_str()),
            ])
            .send()
            .map_err(http::transport)?;
        let response = check_status(response, "login")?;
        let final_url = response.url().to_string();
        let body = response.text().map_err(http::transport)?;

        if !login_succeeded(&final_url, &body) {
            return Err(Error::Authentication("login rejected by portal".into()));
        }
        debug!("{}: logged in", self.settings.source);
        Ok(Session {
            client,
            token: None,
        })
    }

    fn fetch_raw(&self, session: &Session) -> Result<RawPayload> {
        let mut pages = Vec::new();
        for page in 1..=MAX_PAGES {
            let response = session
                .client
                .get(self.settings.url(LIST_PATH))
                .query(&[("page", page.to_string()), ("size", PAGE_SIZE.to_string())])
                .send()
                .map_err(http::transport)?;
            let response = check_status(response, "advisory list")?;
            let final_url = response.url().to_string();
            let body = response.text().map_err(http::transport)?;

            if !login_succeeded(&final_url, &body) {
                return Err(Error::Authentication("session expired while paging".into()));
            }
            let rows = parse_advisory_page(&body)?.len();
            pages.push(body);
            if rows < PAGE_SIZE {
                break;
            }
        }
        info!("{}: fetched {} advisory pages", self.settings.source, pages.len());
        Ok(RawPayload::HtmlPages(pages))
    }

    fn parse_to_records(&self, raw: RawPayload) -> Result<Vec<CollectedIndicator>> {
        match raw {
            RawPayload::HtmlPages(pages) => {
                let mut out = Vec::new();
                for page in &pages {
                    out.extend(parse_advisory_page(page)?);
                }
                Ok(out)
            }
            RawPayload::Workbook(_) => Err(Error::Parse(
                "regtech expects HTML pages, got a workbook".into(),
            )),
        }
    }
}

/// The portal answers a failed login with the login form again, or a
/// redirect back to it.
pub fn login_succeeded(final_url: &str, body: &str) -> bool {
    let on_login_page = final_url.trim_end_matches('/').ends_with("/login")
        || final_url.contains("/login?");
    let shows_form = body.contains("loginForm") || body.contains("name=\"loginPW\"");
    !on_login_page && !shows_form
}

/// Parse one advisory page.
///
/// Rows without an address cell (headers, "no data" rows) are skipped. A row
/// with an address but no readable detection date means the markup changed
/// and fails the page with `Parse`.
pub fn parse_advisory_page(html: &str) -> Result<Vec<CollectedIndicator>> {
    if !html.to_lowercase().contains("<table") {
        return Err(Error::Parse("advisory table not found".into()));
    }
    let row_re = regex(r"(?is)<tr[^>]*>(.*?)</tr>")?;
    let cell_re = regex(r"(?is)<td[^>]*>(.*?)</td>")?;
    let tag_re = regex(r"(?s)<[^>]*>")?;

    let mut out = Vec::new();
    for (row_no, row) in row_re.captures_iter(html).enumerate() {
        let cells: Vec<String> = cell_re
            .captures_iter(&row[1])
            .map(|c| cell_text(&tag_re, &c[1]))
            .collect();
        if cells.is_empty() {
            continue;
        }

        let Some((ip_idx, ip)) = cells
            .iter()
            .enumerate()
            .find_map(|(i, c)| normalize_ip(c).ok().map(|ip| (i, ip)))
        else {
            continue;
        };

        let (date_idx, detected_at) = cells
            .iter()
            .enumerate()
            .skip(ip_idx + 1)
            .find_map(|(i, c)| parse_date(c).map(|d| (i, d)))
            .ok_or_else(|| {
                Error::Parse(format!("row {}: no detection date for {}", row_no + 1, ip))
            })?;

        // The risk label, when present, follows the date.
        let confidence = cells[date_idx + 1..]
            .iter()
            .find_map(|c| confidence_from_risk(c))
            .unwrap_or(DEFAULT_CONFIDENCE);

        // Columns after the address: country, then reason.
        let country = cells.get(ip_idx + 1).cloned().unwrap_or_default();
        let reason = cells.get(ip_idx + 2).cloned().unwrap_or_default();
        out.push(CollectedIndicator {
            ip,
            detected_at,
            confidence,
            metadata: json!({ "country": country, "reason": reason }),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const PAGE: &str = r#"
        <html><body>
        <table class="board_list">
          <thead><tr><th>No</th><th>IP</th><th>Country</th><th>Reason</th><th>Date</th><th>Risk</th></tr></thead>
          <tbody>
            <tr><td>1</td><td><span>192.0.2.10</span></td><td>KR</td><td>SSH brute force</td><td>2024-03-15</td><td>High</td></tr>
            <tr><td>2</td><td>2001:DB8::1</td><td>US</td><td>Web scan &amp; probe</td><td>2024.03.14</td><td>낮음</td></tr>
            <tr><td>3</td><td>198.51.100.7</td><td>CN</td><td>Botnet C2</td><td>2024-03-13</td><td></td></tr>
          </tbody>
        </table>
        </body></html>"#;

    #[test]
    fn test_parse_advisory_page() {
        let rows = parse_advisory_page(PAGE).unwrap();
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].ip, "192.0.2.10");
        assert_eq!(
            rows[0].detected_at,
            Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(rows[0].confidence, 0.9);
        assert_eq!(rows[0].metadata["country"], "KR");
        assert_eq!(rows[0].metadata["reason"], "SSH brute force");

        assert_eq!(rows[1].ip, "2001:db8::1");
        assert_eq!(rows[1].confidence, 0.5);
        assert_eq!(rows[1].metadata["reason"], "Web scan & probe");

        assert_eq!(rows[2].confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_empty_table_is_empty_batch() {
        let html = "<table><tr><th>IP</th></tr><tr><td colspan=6>No data</td></tr></table>";
        assert!(parse_advisory_page(html).unwrap().is_empty());
    }

    #[test]
    fn test_missing_table_is_parse_error() {
        let err = parse_advisory_page("<html><body>maintenance</body></html>").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_row_without_date_is_parse_error() {
        let html = "<table><tr><td>1</td><td>192.0.2.1</td><td>KR</td></tr></table>";
        let err = parse_advisory_page(html).unwrap_err();
        assert!(matches!(err, Error::Parse(msg) if msg.contains("192.0.2.1")));
    }

    #[test]
    fn test_login_detection() {
        assert!(login_succeeded("https://portal.example/main/main", "<html>welcome</html>"));
        assert!(!login_succeeded("https://portal.example/login", "<html></html>"));
        assert!(!login_succeeded(
            "https://portal.example/main",
            "<form id=\"loginForm\"></form>"
        ));
    }

    #[test]
    fn test_parse_rejects_workbook_payload() {
        let collector = RegtechCollector::new(CollectorSettings {
            source: "regtech".into(),
            base_url: "https://portal.example".into(),
            username: "u".into(),
            password: "p".into(),
            timeout: std::time::Duration::from_secs(5),
        });
        let err = collector
            .parse_to_records(RawPayload::Workbook(vec![1, 2, 3]))
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
