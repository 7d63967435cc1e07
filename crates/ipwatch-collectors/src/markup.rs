//! Text helpers for scraped markup: tag stripping, entity decoding, dates
//! and risk labels.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

use ipwatch_core::{Error, Result};

/// Compile a fixed pattern, reporting a bad one as an internal error.
pub fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Internal(format!("bad pattern {}: {}", pattern, e)))
}

/// Decode the five predefined XML entities and numeric references.
pub fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(end) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Remove tags, decode entities and collapse whitespace.
pub fn cell_text(tags: &Regex, html: &str) -> String {
    let stripped = tags.replace_all(html, " ");
    unescape(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse the date formats the portals use. Dates without a time are
/// taken as midnight UTC.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y.%m.%d %H:%M:%S", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    let date_part = s.split_whitespace().next().unwrap_or(s);
    for fmt in ["%Y-%m-%d", "%Y.%m.%d", "%Y/%m/%d", "%Y%m%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(date_part.trim_end_matches('.'), fmt) {
            return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

/// Spreadsheet serial day number (1900 date system) to a UTC timestamp.
pub fn from_excel_serial(serial: f64) -> Option<DateTime<Utc>> {
    if !(1.0..=2_958_465.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    Some((epoch + chrono::Duration::milliseconds(millis)).and_utc())
}

/// Map a portal risk label to a confidence in [0, 1].
///
/// Accepts English and Korean labels, plain fractions and percentages.
pub fn confidence_from_risk(raw: &str) -> Option<f64> {
    let s = raw.trim().to_lowercase();
    if s.is_empty() {
        return None;
    }
    if let Ok(n) = s.trim_end_matches('%').parse::<f64>() {
        return match n {
            n if (0.0..=1.0).contains(&n) && !s.ends_with('%') => Some(n),
            n if (0.0..=100.0).contains(&n) => Some(n / 100.0),
            _ => None,
        };
    }
    let level = if ["critical", "high", "높음", "위험", "심각"].iter().any(|k| s.contains(k)) {
        0.9
    } else if ["medium", "moderate", "중간", "보통", "주의"].iter().any(|k| s.contains(k)) {
        0.7
    } else if ["low", "낮음", "관심"].iter().any(|k| s.contains(k)) {
        0.5
    } else {
        return None;
    };
    Some(level)
}
