//! HTTP transport used to reach guards, seed nodes and (without onion routing)
//! storage servers directly.

use crate::error::{Result, RoutingError};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// One HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<Vec<u8>>,
    /// Overrides the transport's own timeout
    pub timeout: Option<Duration>,
    /// Seed nodes carry CA-signed certificates; service nodes don't
    pub is_seed_node: bool,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            body: None,
            timeout: None,
            is_seed_node: false,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            body: Some(body),
            timeout: None,
            is_seed_node: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn to_seed_node(mut self) -> Self {
        self.is_seed_node = true;
        self
    }
}

/// Executes HTTP requests.
///
/// Non-2xx responses must be reported as [`RoutingError::HttpRequestFailed`]
/// with the response body, timeouts as [`RoutingError::Timeout`], and
/// connection failures as `HttpRequestFailed` with status 0.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<Bytes>;
}

/// [`Transport`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    snode_client: reqwest::Client,
    seed_client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let snode_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .map_err(|e| RoutingError::InvalidConfig(format!("HTTP client: {}", e)))?;
        let seed_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RoutingError::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(Self {
            snode_client,
            seed_client,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RoutingError {
    if err.is_timeout() {
        RoutingError::Timeout
    } else {
        RoutingError::HttpRequestFailed {
            status_code: err.status().map(|s| s.as_u16()).unwrap_or(0),
            body: None,
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<Bytes> {
        let client = if request.is_seed_node {
            &self.seed_client
        } else {
            &self.snode_client
        };

        let mut builder = match request.method {
            HttpMethod::Get => client.get(&request.url),
            HttpMethod::Post => client.post(&request.url),
        };
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            debug!("{} returned {}", request.url, status);
            return Err(RoutingError::HttpRequestFailed {
                status_code: status.as_u16(),
                body: Some(body),
            });
        }
        Ok(body)
    }
}
