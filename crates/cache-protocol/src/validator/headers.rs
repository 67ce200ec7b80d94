//! Header value helpers: list splitting, HTTP dates, byte ranges and the
//! "Name: value" line block stored with an entry.

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{AsHeaderName, HeaderMap, HeaderName, HeaderValue, WARNING};
use reqwest::{StatusCode, Version};

pub const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
pub const CONTENT_MD5: HeaderName = HeaderName::from_static("content-md5");

pub const WARNING_STALE: &str = "110 - \"Response is stale\"";
pub const WARNING_REVALIDATION_FAILED: &str = "111 - \"Revalidation failed\"";
pub const WARNING_HEURISTIC: &str = "113 - \"Heuristic expiration\"";

/// Split a comma separated header value, keeping quoted strings together.
///
/// Elements are trimmed and empty elements dropped.
pub fn split_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for ch in value.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => {
                current.push(ch);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                push_trimmed(&mut items, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push_trimmed(&mut items, &current);
    items
}

fn push_trimmed(items: &mut Vec<String>, item: &str) {
    let item = item.trim();
    if !item.is_empty() {
        items.push(item.to_string());
    }
}

/// All values of a header, split into one list
pub fn header_list<K: AsHeaderName>(headers: &HeaderMap, name: K) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(split_list)
        .collect()
}

pub fn header_str<K: AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Replace a header, dropping values that are not valid header text
pub fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => {
            headers.remove(name);
        }
    }
}

pub fn append_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.append(name, value);
    }
}

/// Parse an HTTP date in RFC 1123, RFC 850 or asctime form
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn header_date<K: AsHeaderName>(headers: &HeaderMap, name: K) -> Option<DateTime<Utc>> {
    header_str(headers, name).and_then(parse_http_date)
}

/// Parse a delta-seconds value such as the `Age` header
pub fn parse_seconds(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

pub fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn parse_version(value: &str) -> Option<Version> {
    match value.to_ascii_uppercase().as_str() {
        "HTTP/0.9" => Some(Version::HTTP_09),
        "HTTP/1.0" => Some(Version::HTTP_10),
        "HTTP/1.1" => Some(Version::HTTP_11),
        "HTTP/2" | "HTTP/2.0" => Some(Version::HTTP_2),
        "HTTP/3" | "HTTP/3.0" => Some(Version::HTTP_3),
        _ => None,
    }
}

pub fn status_line(version: Version, status: StatusCode) -> String {
    format!(
        "{} {} {}",
        version_str(version),
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .trim_end()
    .to_string()
}

/// Parse "HTTP/1.1 200 OK"
pub fn parse_status_line(line: &str) -> Option<(Version, StatusCode)> {
    let mut parts = line.split_whitespace();
    let version = parse_version(parts.next()?)?;
    let status = parts.next()?.parse::<u16>().ok()?;
    Some((version, StatusCode::from_u16(status).ok()?))
}

/// Parse stored "Name: value" lines, skipping anything malformed
pub fn parse_header_lines<'a>(lines: impl IntoIterator<Item = &'a String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

/// Build the stored line block: status line first, then one line per value
pub fn header_lines(version: Version, status: StatusCode, headers: &HeaderMap) -> Vec<String> {
    let mut lines = Vec::with_capacity(headers.len() + 1);
    lines.push(status_line(version, status));
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            lines.push(format!("{}: {}", canonical_name(name), value));
        }
    }
    lines
}

fn canonical_name(name: &HeaderName) -> String {
    name.as_str()
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Drop stored Warning values with a 1xx warn-code
pub fn strip_informational_warnings(headers: &mut HeaderMap) {
    let kept: Vec<String> = header_list(headers, WARNING)
        .into_iter()
        .filter(|warning| !warning.starts_with('1'))
        .collect();
    headers.remove(WARNING);
    for warning in kept {
        append_header(headers, WARNING, &warning);
    }
}

/// One byte range of a `Range: bytes=` request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `start-end` or open-ended `start-`
    From { start: u64, end: Option<u64> },
    /// `-length`, the last bytes of the entity
    Suffix(u64),
}

/// Parse a single-range `bytes=` request value
pub fn parse_range_request(value: &str) -> Option<RangeSpec> {
    let rest = strip_bytes_unit(value)?.trim_start();
    let rest = rest.strip_prefix('=')?.trim();
    if rest.contains(',') {
        return None;
    }
    let (start, end) = rest.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());
    if start.is_empty() {
        return end.parse().ok().map(RangeSpec::Suffix);
    }
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    if end.is_some_and(|end| end < start) {
        return None;
    }
    Some(RangeSpec::From { start, end })
}

/// `Content-Range: bytes start-end/total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` for `*`
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = strip_bytes_unit(value)?;
    if !rest.starts_with(' ') {
        return None;
    }
    let (range, total) = rest.trim().split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    // the last byte position must leave room for a length
    if end < start || end == u64::MAX {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse().ok()?),
    };
    if total.is_some_and(|total| end >= total) {
        return None;
    }
    Some(ContentRange { start, end, total })
}

pub fn format_content_range(start: u64, length: u64, total: Option<u64>) -> String {
    let end = start.saturating_add(length).saturating_sub(1);
    match total {
        Some(total) => format!("bytes {start}-{end}/{total}"),
        None => format!("bytes {start}-{end}/*"),
    }
}

fn strip_bytes_unit(value: &str) -> Option<&str> {
    let value = value.trim_start();
    let unit = value.get(..5)?;
    unit.eq_ignore_ascii_case("bytes").then(|| &value[5..])
}
