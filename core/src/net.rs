use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use reqwest::{Client, Method};

use crate::config::RequestConfig;
use crate::error::{CoreError, CoreResult};

pub type BodyStream = BoxStream<'static, CoreResult<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Head,
    Get,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    /// Inclusive byte range; an open end asks for everything from `start`.
    pub range: Option<(u64, Option<u64>)>,
}

impl HttpRequest {
    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Head,
            url: url.into(),
            range: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, start: u64, end: Option<u64>) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn range_header(&self) -> Option<String> {
        self.range.map(|(start, end)| match end {
            Some(end) => format!("bytes={}-{}", start, end),
            None => format!("bytes={}-", start),
        })
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The network collaborator. Everything below the HTTP exchange (TLS,
/// connection pooling, proxies) belongs to the implementation.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, req: &HttpRequest) -> CoreResult<HttpResponse>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    headers: HeaderMap,
    basic_auth: Option<(String, String)>,
}

impl ReqwestTransport {
    pub fn new(config: &RequestConfig) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms.max(1)))
            .danger_accept_invalid_certs(config.accept_invalid_certs);
        if let Some(proxy_url) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|err| CoreError::Unsupported(err.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| CoreError::Unsupported(err.to_string()))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| CoreError::InvalidState(err.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| CoreError::InvalidState(err.to_string()))?;
            headers.insert(name, value);
        }

        Ok(Self {
            client,
            headers,
            basic_auth: config.basic_auth.clone(),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> CoreError {
    if err.is_timeout() {
        CoreError::Timeout(err.to_string())
    } else if err.is_builder() {
        CoreError::InvalidState(err.to_string())
    } else {
        CoreError::Network(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, req: &HttpRequest) -> CoreResult<HttpResponse> {
        let method = match req.method {
            HttpMethod::Head => Method::HEAD,
            HttpMethod::Get => Method::GET,
        };
        let mut headers = self.headers.clone();
        if let Some(range) = req.range_header() {
            headers.insert(
                RANGE,
                HeaderValue::from_str(&range)
                    .map_err(|err| CoreError::InvalidState(err.to_string()))?,
            );
        }
        let mut request = self.client.request(method, &req.url).headers(headers);
        if let Some((user, pass)) = &self.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }
        let resp = request.send().await.map_err(map_reqwest_error)?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_reqwest_error))
            .boxed();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
