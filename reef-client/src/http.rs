//! HTTP/1.1 passthrough for the query, analytics, search, views and
//! config-streaming surfaces.
//!
//! The core is responsible only for framing, status demultiplex and chunked
//! streaming; payload schemas belong to the server and the outer layers.

use bytes::Bytes;
use tokio::sync::mpsc;

use reef_core::error::{CoreError, Result};
use reef_core::service::ServiceType;

use crate::credentials::SharedCredentials;

/// Separator between documents on the streaming config feed.
const CONFIG_STREAM_SEPARATOR: &str = "\n\n\n\n";

/// A raw HTTP response: status and body bytes.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn io_error(e: reqwest::Error) -> CoreError {
    CoreError::Io(std::sync::Arc::new(std::io::Error::new(
        std::io::ErrorKind::Other,
        e,
    )))
}

/// Issues HTTP requests against a node's service port.
#[derive(Debug, Clone)]
pub struct HttpService {
    client: reqwest::Client,
    credentials: SharedCredentials,
    tls: bool,
}

impl HttpService {
    /// Creates an HTTP service.
    pub fn new(credentials: SharedCredentials, tls: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(io_error)?;
        Ok(Self {
            client,
            credentials,
            tls,
        })
    }

    fn base_url(&self, host: &str, port: u16, path: &str) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, host, port, path)
    }

    /// Sends a GET request to a service path.
    pub async fn get(
        &self,
        service: ServiceType,
        host: &str,
        port: u16,
        path: &str,
    ) -> Result<HttpResponse> {
        let credentials = self.credentials.credentials_for(service);
        let response = self
            .client
            .get(self.base_url(host, port, path))
            .basic_auth(credentials.username(), Some(credentials.password()))
            .send()
            .await
            .map_err(io_error)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(io_error)?;
        Ok(HttpResponse { status, body })
    }

    /// Sends a POST request with a JSON body to a service path.
    pub async fn post_json(
        &self,
        service: ServiceType,
        host: &str,
        port: u16,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse> {
        let credentials = self.credentials.credentials_for(service);
        let response = self
            .client
            .post(self.base_url(host, port, path))
            .basic_auth(credentials.username(), Some(credentials.password()))
            .json(body)
            .send()
            .await
            .map_err(io_error)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(io_error)?;
        Ok(HttpResponse { status, body })
    }

    /// Follows the streaming config feed for a bucket.
    ///
    /// Documents arrive separated by blank-line runs; each complete
    /// document is sent to `configs` as it appears. Returns when the feed
    /// or the receiver closes.
    pub async fn stream_configs(
        &self,
        host: &str,
        port: u16,
        bucket: &str,
        configs: mpsc::Sender<String>,
    ) -> Result<()> {
        let credentials = self.credentials.credentials_for(ServiceType::Manager);
        let path = format!("/pools/default/bs/{}", bucket);
        let mut response = self
            .client
            .get(self.base_url(host, port, &path))
            .basic_auth(credentials.username(), Some(credentials.password()))
            .send()
            .await
            .map_err(io_error)?;

        if !response.status().is_success() {
            return Err(CoreError::Config(format!(
                "config stream for bucket '{}' refused with HTTP {}",
                bucket,
                response.status().as_u16()
            )));
        }

        let mut buffer = String::new();
        while let Some(chunk) = response.chunk().await.map_err(io_error)? {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(position) = buffer.find(CONFIG_STREAM_SEPARATOR) {
                let document: String = buffer.drain(..position).collect();
                buffer.drain(..CONFIG_STREAM_SEPARATOR.len());
                let trimmed = document.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if configs.send(trimmed.to_string()).await.is_err() {
                    return Ok(());
                }
            }
        }

        let remainder = buffer.trim();
        if !remainder.is_empty() {
            let _ = configs.send(remainder.to_string()).await;
        }
        Ok(())
    }
}
