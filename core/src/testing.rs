//! In-process HTTP server double for transfer tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE,
};

use crate::error::{CoreError, CoreResult};
use crate::net::{BodyStream, HttpMethod, HttpRequest, HttpResponse, HttpTransport};

pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|index| (index * 31 % 251) as u8).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Status(u16),
    Network,
    /// Serves this many body bytes, then drops the connection.
    CutAfter(usize),
}

pub struct MockTransport {
    data: Vec<u8>,
    supports_range: bool,
    advertise_length: bool,
    /// Length announced by HEAD instead of the real body size.
    claimed_length: Option<u64>,
    /// HEAD requests to these urls never answer.
    stalled_heads: Vec<String>,
    file_name: Option<String>,
    packet_size: usize,
    delay: Duration,
    /// Failures for GETs whose range starts at the key; `None` count fails
    /// forever.
    failures: Mutex<HashMap<u64, (Failure, Option<u32>)>>,
    log: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            supports_range: true,
            advertise_length: true,
            claimed_length: None,
            stalled_heads: Vec::new(),
            file_name: None,
            packet_size: 1024,
            delay: Duration::ZERO,
            failures: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.supports_range = false;
        self
    }

    pub fn without_length(mut self) -> Self {
        self.advertise_length = false;
        self
    }

    pub fn claiming_length(mut self, length: u64) -> Self {
        self.claimed_length = Some(length);
        self
    }

    pub fn stall_head(mut self, url: &str) -> Self {
        self.stalled_heads.push(url.to_string());
        self
    }

    pub fn with_file_name(mut self, name: &str) -> Self {
        self.file_name = Some(name.to_string());
        self
    }

    pub fn with_packets(mut self, packet_size: usize, delay: Duration) -> Self {
        self.packet_size = packet_size.max(1);
        self.delay = delay;
        self
    }

    pub fn fail_range(self, start: u64, failure: Failure, times: Option<u32>) -> Self {
        self.failures
            .lock()
            .expect("failures lock")
            .insert(start, (failure, times));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().expect("log lock").clone()
    }

    /// Start offsets of every ranged GET seen so far.
    pub fn range_starts(&self) -> Vec<u64> {
        self.requests()
            .iter()
            .filter(|req| req.method == HttpMethod::Get)
            .filter_map(|req| req.range.map(|(start, _)| start))
            .collect()
    }

    fn take_failure(&self, start: u64) -> Option<Failure> {
        let mut failures = self.failures.lock().expect("failures lock");
        let (failure, remaining) = failures.get_mut(&start)?;
        let failure = *failure;
        match remaining {
            None => Some(failure),
            Some(0) => None,
            Some(count) => {
                *count -= 1;
                Some(failure)
            }
        }
    }

    fn base_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if self.supports_range {
            headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }
        if let Some(name) = &self.file_name {
            let value = format!("attachment; filename=\"{}\"", name);
            headers.insert(
                CONTENT_DISPOSITION,
                HeaderValue::from_str(&value).expect("header value"),
            );
        }
        headers
    }

    fn body(&self, bytes: &[u8], cut_after: Option<usize>) -> BodyStream {
        let served = cut_after.map(|cut| cut.min(bytes.len())).unwrap_or(bytes.len());
        let mut packets: Vec<CoreResult<Bytes>> = bytes[..served]
            .chunks(self.packet_size)
            .map(|packet| Ok(Bytes::copy_from_slice(packet)))
            .collect();
        if cut_after.is_some() {
            packets.push(Err(CoreError::Network("connection dropped".to_string())));
        }
        let delay = self.delay;
        stream::iter(packets)
            .then(move |packet| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                packet
            })
            .boxed()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, req: &HttpRequest) -> CoreResult<HttpResponse> {
        self.log.lock().expect("log lock").push(req.clone());
        let total = self.data.len() as u64;
        let mut headers = self.base_headers();

        if req.method == HttpMethod::Head {
            if self.stalled_heads.contains(&req.url) {
                return std::future::pending().await;
            }
            if self.advertise_length {
                let length = self.claimed_length.unwrap_or(total);
                headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
            }
            return Ok(HttpResponse {
                status: 200,
                headers,
                body: stream::empty().boxed(),
            });
        }

        let start = req.range.map(|(start, _)| start).unwrap_or(0);
        let mut cut_after = None;
        match self.take_failure(start) {
            Some(Failure::Network) => {
                return Err(CoreError::Network(format!("connection reset at {}", start)))
            }
            Some(Failure::Status(status)) => {
                return Ok(HttpResponse {
                    status,
                    headers,
                    body: stream::empty().boxed(),
                })
            }
            Some(Failure::CutAfter(bytes)) => cut_after = Some(bytes),
            None => {}
        }

        match req.range {
            Some((start, end)) if self.supports_range => {
                if start >= total {
                    return Ok(HttpResponse {
                        status: 416,
                        headers,
                        body: stream::empty().boxed(),
                    });
                }
                let end = end.unwrap_or(total - 1).min(total - 1);
                let slice = &self.data[start as usize..=end as usize];
                headers.insert(
                    CONTENT_RANGE,
                    HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, total))
                        .expect("header value"),
                );
                headers.insert(CONTENT_LENGTH, HeaderValue::from(slice.len() as u64));
                Ok(HttpResponse {
                    status: 206,
                    headers,
                    body: self.body(slice, cut_after),
                })
            }
            _ => {
                if self.advertise_length {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
                }
                Ok(HttpResponse {
                    status: 200,
                    headers,
                    body: self.body(&self.data, cut_after),
                })
            }
        }
    }
}
