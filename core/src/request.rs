use std::sync::Arc;

use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE};
use tracing::debug;
use url::Url;

use crate::error::{CoreError, CoreResult};
use crate::net::{HttpRequest, HttpResponse, HttpTransport};

pub const DEFAULT_FILE_NAME: &str = "download.bin";

/// What the server told us about the resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Zero when the server did not announce a length.
    pub total_size: u64,
    pub supports_range: bool,
    pub file_name: Option<String>,
}

/// One source address of the resource together with the transport used to
/// reach it.
#[derive(Clone)]
pub struct Request {
    url: String,
    transport: Arc<dyn HttpTransport>,
}

impl Request {
    pub fn new(url: impl Into<String>, transport: Arc<dyn HttpTransport>) -> CoreResult<Self> {
        let url = url.into();
        Url::parse(&url).map_err(|err| CoreError::InvalidState(format!("invalid url {}: {}", url, err)))?;
        Ok(Self { url, transport })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Asks for size, range support and file name. HEAD first; when HEAD is
    /// refused or does not advertise ranges, a one-byte ranged GET decides.
    pub async fn probe(&self) -> CoreResult<ResourceInfo> {
        let mut info = ResourceInfo::default();
        match self.transport.send(&HttpRequest::head(&self.url)).await {
            Ok(resp) if resp.is_success() => {
                info = info_from_headers(&resp.headers);
                if info.supports_range && info.total_size > 0 {
                    info.file_name = info.file_name.or_else(|| file_name_from_url(&self.url));
                    return Ok(info);
                }
            }
            Ok(resp) => {
                debug!(url = %self.url, status = resp.status, "HEAD refused, probing with GET");
            }
            Err(err) if err.is_retryable() => {
                debug!(url = %self.url, error = %err, "HEAD failed, probing with GET");
            }
            Err(err) => return Err(err),
        }

        let resp = self
            .transport
            .send(&HttpRequest::get(&self.url).with_range(0, Some(0)))
            .await?;
        match resp.status {
            206 => {
                let headers = info_from_headers(&resp.headers);
                info.supports_range = true;
                if let Some(total) = total_from_content_range(&resp.headers) {
                    info.total_size = total;
                }
                info.file_name = info.file_name.or(headers.file_name);
            }
            200 => {
                let headers = info_from_headers(&resp.headers);
                info.supports_range = false;
                if headers.total_size > 0 {
                    info.total_size = headers.total_size;
                }
                info.file_name = info.file_name.or(headers.file_name);
            }
            status => {
                return Err(CoreError::HttpStatus {
                    status,
                    url: self.url.clone(),
                })
            }
        }
        info.file_name = info.file_name.or_else(|| file_name_from_url(&self.url));
        Ok(info)
    }

    pub async fn file_name(&self) -> CoreResult<String> {
        let info = self.probe().await?;
        Ok(info
            .file_name
            .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string()))
    }

    /// Opens the body of `[start, end]`. A server answering a ranged request
    /// that starts past zero with the whole body is a malformed answer.
    pub async fn open_range(&self, start: u64, end: Option<u64>, ranged: bool) -> CoreResult<HttpResponse> {
        let mut req = HttpRequest::get(&self.url);
        if ranged {
            req = req.with_range(start, end);
        }
        let resp = self.transport.send(&req).await?;
        match resp.status {
            206 if ranged => Ok(resp),
            200 if !ranged || start == 0 => Ok(resp),
            200 => Err(CoreError::Unsupported(format!(
                "{} ignored range request starting at {}",
                self.url, start
            ))),
            status => Err(CoreError::HttpStatus {
                status,
                url: self.url.clone(),
            }),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: reqwest::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn info_from_headers(headers: &HeaderMap) -> ResourceInfo {
    let total_size = header_str(headers, CONTENT_LENGTH)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let supports_range = header_str(headers, ACCEPT_RANGES)
        .map(|value| value.trim().eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);
    let file_name = file_name_from_content_disposition(header_str(headers, CONTENT_DISPOSITION));
    ResourceInfo {
        total_size,
        supports_range,
        file_name,
    }
}

/// Total length from `Content-Range: bytes 0-0/12345`.
fn total_from_content_range(headers: &HeaderMap) -> Option<u64> {
    let value = header_str(headers, CONTENT_RANGE)?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

pub fn file_name_from_content_disposition(value: Option<&str>) -> Option<String> {
    let mut plain = None;
    let mut extended = None;
    for part in value?.split(';') {
        let Some((key, raw)) = part.trim().split_once('=') else {
            continue;
        };
        let raw = raw.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let encoded = raw.split_once("''").map(|(_, rest)| rest).unwrap_or(raw);
                let decoded = percent_decode(encoded);
                if !decoded.is_empty() {
                    extended = Some(decoded);
                }
            }
            "filename" if !raw.is_empty() => plain = Some(raw.to_string()),
            _ => {}
        }
    }
    extended.or(plain).map(|name| sanitize_file_name(&name))
}

pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.last()?;
    if last.is_empty() {
        return None;
    }
    Some(sanitize_file_name(&percent_decode(last)))
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0usize;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[index + 1]), hex_value(bytes[index + 2])) {
                out.push((hi << 4) | lo);
                index += 3;
                continue;
            }
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Keeps the name on one path component and free of control characters.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        };
        out.push(mapped);
    }
    let trimmed = out.trim_matches(|ch: char| ch == ' ' || ch == '.');
    if trimmed.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}
