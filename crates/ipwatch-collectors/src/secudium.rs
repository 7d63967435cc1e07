//! SECUDIUM threat portal: JSON token login, then the newest blacklist
//! spreadsheet export.
//!
//! The workbook is read straight from the XLSX zip container: the shared
//! strings table plus the first worksheet. Columns are located by header
//! text so reordering in the export does not break parsing.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use ipwatch_core::{normalize_ip, CollectedIndicator, Error, Result};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::collector::SourceCollector;
use crate::http::{self, check_status};
use crate::markup::{confidence_from_risk, from_excel_serial, parse_date, regex, unescape};
use crate::types::{CollectorSettings, RawPayload, Session};

const LOGIN_PATH: &str = "/isap-api/loginProcess";
const LIST_PATH: &str = "/isap-api/secinfo/list/black_ip";
const DOWNLOAD_PATH: &str = "/isap-api/file/SECINFO/download";
const TOKEN_HEADER: &str = "X-Auth-Token";
const DEFAULT_CONFIDENCE: f64 = 0.8;

const SHARED_STRINGS: &str = "xl/sharedStrings.xml";
const FIRST_SHEET: &str = "xl/worksheets/sheet1.xml";

pub struct SecudiumCollector {
    settings: CollectorSettings,
}

impl SecudiumCollector {
    pub fn new(settings: CollectorSettings) -> Self {
        Self { settings }
    }
}

impl SourceCollector for SecudiumCollector {
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
                ("lang", "company.lang01"),
                ("is_otp", "N"),
                ("is_expire", "N"),
                ("login_name", self.settings.username.as_str()),
                ("password", self.settings.password.as_str()),
            ])
            .send()
            .map_err(http::transport)?;
        let response = check_status(response, "login")?;
        let body: Value = response
            .json()
            .map_err(|e| Error::Parse(format!("login response is not JSON: {}", e)))?;

        let token = extract_token(&body)?;
        debug!("{}: obtained session token", self.settings.source);
        Ok(Session {
            client,
            token: Some(token),
        })
    }

    fn fetch_raw(&self, session: &Session) -> Result<RawPayload> {
        let token = session
            .token
            .as_deref()
            .ok_or_else(|| Error::Authentication("session has no token".into()))?;

        let response = session
            .client
            .get(self.settings.url(LIST_PATH))
            .query(&[("page", "0"), ("size", "20")])
            .header(TOKEN_HEADER, token)
            .send()
            .map_err(http::transport)?;
        let listing: Value = check_status(response, "export listing")?
            .json()
            .map_err(|e| Error::Parse(format!("export listing is not JSON: {}", e)))?;
        let file_id = latest_export_id(&listing)?;

        let response = session
            .client
            .get(self.settings.url(DOWNLOAD_PATH))
            .query(&[("fileIdx", file_id.as_str())])
            .header(TOKEN_HEADER, token)
            .send()
            .map_err(http::transport)?;
        let bytes = check_status(response, "export download")?
            .bytes()
            .map_err(http::transport)?
            .to_vec();

        if !bytes.starts_with(b"PK") {
            return Err(Error::Parse(format!(
                "export {} is not an xlsx workbook",
                file_id
            )));
        }
        info!(
            "{}: downloaded export {} ({} bytes)",
            self.settings.source,
            file_id,
            bytes.len()
        );
        Ok(RawPayload::Workbook(bytes))
    }

    fn parse_to_records(&self, raw: RawPayload) -> Result<Vec<CollectedIndicator>> {
        match raw {
            RawPayload::Workbook(bytes) => parse_workbook(&bytes),
            RawPayload::HtmlPages(_) => Err(Error::Parse(
                "secudium expects a workbook, got HTML pages".into(),
            )),
        }
    }
}

/// Pull the session token out of a login response.
pub fn extract_token(body: &Value) -> Result<String> {
    if body.get("error").and_then(Value::as_bool) == Some(true) {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("login rejected");
        return Err(Error::Authentication(message.to_string()));
    }
    body.get("token")
        .or_else(|| body.pointer("/data/token"))
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Authentication("no token in login response".into()))
}

/// Id of the newest export in a listing response.
pub fn latest_export_id(listing: &Value) -> Result<String> {
    let items = listing
        .get("content")
        .or_else(|| listing.get("rows"))
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Parse("export listing has no rows".into()))?;
    let first = items
        .first()
        .ok_or_else(|| Error::Parse("export listing is empty".into()))?;
    match first.get("fileIdx").or_else(|| first.get("id")) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::Parse("export entry has no file id".into())),
    }
}

/// Parse the first worksheet of an XLSX export into indicators.
pub fn parse_workbook(bytes: &[u8]) -> Result<Vec<CollectedIndicator>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::Parse(format!("invalid xlsx container: {}", e)))?;

    // Workbooks without any text cells have no shared strings part.
    let shared = match read_part(&mut archive, SHARED_STRINGS)? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };
    let sheet = read_part(&mut archive, FIRST_SHEET)?
        .ok_or_else(|| Error::Parse(format!("{} missing from workbook", FIRST_SHEET)))?;
    let rows = parse_sheet_rows(&sheet, &shared)?;
    rows_to_indicators(&rows)
}

fn read_part(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(Error::Parse(format!("{}: {}", name, e))),
    };
    let mut xml = String::new();
    file.read_to_string(&mut xml)
        .map_err(|e| Error::Parse(format!("{}: {}", name, e)))?;
    Ok(Some(xml))
}

/// The shared strings table, in index order. Rich-text runs are joined.
pub fn parse_shared_strings(xml: &str) -> Result<Vec<String>> {
    let si_re = regex(r"(?s)<si>(.*?)</si>")?;
    let t_re = regex(r"(?s)<t[^>]*>(.*?)</t>")?;
    Ok(si_re
        .captures_iter(xml)
        .map(|si| {
            t_re.captures_iter(&si[1])
                .map(|t| unescape(&t[1]))
                .collect::<String>()
        })
        .collect())
}

/// Worksheet rows as column-index → text maps, in sheet order.
pub fn parse_sheet_rows(xml: &str, shared: &[String]) -> Result<Vec<BTreeMap<usize, String>>> {
    let row_re = regex(r"(?s)<row[^>]*>(.*?)</row>")?;
    let cell_re = regex(r"(?s)<c\s([^>]*?)(?:/>|>(.*?)</c>)")?;
    let ref_re = regex(r#"\br="([A-Z]+)\d+""#)?;
    let type_re = regex(r#"\bt="(\w+)""#)?;
    let value_re = regex(r"(?s)<v>(.*?)</v>")?;
    let inline_re = regex(r"(?s)<t[^>]*>(.*?)</t>")?;

    let mut rows = Vec::new();
    for row in row_re.captures_iter(xml) {
        let mut cells = BTreeMap::new();
        for (pos, cell) in cell_re.captures_iter(&row[1]).enumerate() {
            let attrs = &cell[1];
            let body = cell.get(2).map(|m| m.as_str()).unwrap_or("");
            let col = match ref_re.captures(attrs) {
                Some(r) => match column_index(&r[1]) {
                    Some(col) => col,
                    None => {
                        debug!("Skipping cell with out-of-range reference {}", &r[1]);
                        continue;
                    }
                },
                None => pos,
            };
            let kind = type_re.captures(attrs).map(|t| t[1].to_string());
            let raw = value_re.captures(body).map(|v| unescape(&v[1]));

            let text = match (kind.as_deref(), raw) {
                (Some("s"), Some(idx)) => {
                    let idx: usize = idx
                        .trim()
                        .parse()
                        .map_err(|_| Error::Parse(format!("bad shared string index {}", idx)))?;
                    shared.get(idx).cloned().ok_or_else(|| {
                        Error::Parse(format!("shared string {} out of range", idx))
                    })?
                }
                (Some("inlineStr"), _) => inline_re
                    .captures_iter(body)
                    .map(|t| unescape(&t[1]))
                    .collect(),
                (_, Some(v)) => v,
                (_, None) => continue,
            };
            cells.insert(col, text.trim().to_string());
        }
        if !cells.is_empty() {
            rows.push(cells);
        }
    }
    Ok(rows)
}

/// "A" → 0, "Z" → 25, "AA" → 26. `None` if the reference does not fit.
fn column_index(letters: &str) -> Option<usize> {
    letters
        .bytes()
        .try_fold(0usize, |acc, b| {
            acc.checked_mul(26)?.checked_add(usize::from(b - b'A' + 1))
        })?
        .checked_sub(1)
}

struct Columns {
    ip: usize,
    date: usize,
    country: Option<usize>,
    kind: Option<usize>,
    risk: Option<usize>,
}

fn locate_columns(header: &BTreeMap<usize, String>) -> Option<Columns> {
    let find = |keys: &[&str]| {
        header.iter().find_map(|(col, text)| {
            let lower = text.to_lowercase();
            keys.iter().any(|k| lower.contains(k)).then_some(*col)
        })
    };
    // "ip" alone would also hit words like "description".
    let ip = header.iter().find_map(|(col, text)| {
        let lower = text.to_lowercase();
        let is_ip = lower.starts_with("ip")
            || lower.split(|c: char| !c.is_alphanumeric()).any(|w| w == "ip");
        is_ip.then_some(*col)
    })?;
    Some(Columns {
        ip,
        date: find(&["탐지", "date", "일시", "등록일"])?,
        country: find(&["국가", "country"]),
        kind: find(&["유형", "type", "category"]),
        risk: find(&["위험", "risk", "level", "등급"]),
    })
}

fn rows_to_indicators(rows: &[BTreeMap<usize, String>]) -> Result<Vec<CollectedIndicator>> {
    let Some(header_pos) = rows.iter().position(|r| locate_columns(r).is_some()) else {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        return Err(Error::Parse("no header row with ip and date columns".into()));
    };
    let Some(cols) = locate_columns(&rows[header_pos]) else {
        return Err(Error::Parse("no header row with ip and date columns".into()));
    };

    let mut out = Vec::new();
    let mut skipped = 0usize;
    for (offset, row) in rows[header_pos + 1..].iter().enumerate() {
        let Some(raw_ip) = row.get(&cols.ip).filter(|s| !s.is_empty()) else {
            continue;
        };
        let Ok(ip) = normalize_ip(raw_ip) else {
            skipped += 1;
            continue;
        };

        let raw_date = row.get(&cols.date).map(String::as_str).unwrap_or("");
        let detected_at = raw_date
            .parse::<f64>()
            .ok()
            .and_then(from_excel_serial)
            .or_else(|| parse_date(raw_date))
            .ok_or_else(|| {
                Error::Parse(format!(
                    "row {}: unreadable detection date {:?}",
                    header_pos + offset + 2,
                    raw_date
                ))
            })?;

        let confidence = cols
            .risk
            .and_then(|c| row.get(&c))
            .and_then(|r| confidence_from_risk(r))
            .unwrap_or(DEFAULT_CONFIDENCE);

        let text = |col: Option<usize>| {
            col.and_then(|c| row.get(&c))
                .cloned()
                .unwrap_or_default()
        };
        out.push(CollectedIndicator {
            ip,
            detected_at,
            confidence,
            metadata: json!({ "country": text(cols.country), "attack_type": text(cols.kind) }),
        });
    }
    if skipped > 0 {
        debug!("Skipped {} rows with unparseable addresses", skipped);
    }
    Ok(out)
}
