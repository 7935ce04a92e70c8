//! # HTTP Retrieval Utilities
//!
//! This module provides an asynchronous API client wrapper around `reqwest`.
//! It includes middleware support for exponential backoff retries and standardized
//! JSON response handling.

use anyhow::{anyhow, Context};
use reqwest::{header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE}, Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::{de::DeserializeOwned, Serialize};

/// A standardized container for API responses.
///
/// This struct wraps the deserialized data along with metadata about the
/// HTTP transaction, such as status codes and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs,
/// authentication tokens, and automatic retries.
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined. Always ends with `/`.
    base_url: Url,
    /// An optional Bearer token used for authorization.
    auth_token: Option<String>,
    /// Retries of transient failures; `0` sends every request once.
    max_retries: u32,
}

impl ApiClient {
    /// Creates a new `ApiClient` retrying transient failures up to `max_retries`
    /// times with exponential backoff.
    ///
    /// # Errors
    /// Fails if `base_url` is not a valid absolute URL.
    pub fn new(base_url: &str, auth_token: Option<String>, max_retries: u32) -> anyhow::Result<Self> {
        // A trailing slash keeps the last path segment of the base when joining.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let url = Url::parse(&normalized)
            .with_context(|| format!("Invalid base URL (must be absolute): {}", base_url))?;
        if url.cannot_be_a_base() {
            return Err(anyhow!("Base URL cannot carry paths: {}", base_url));
        }

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token,
            max_retries,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Builds an absolute URL from path segments, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Base URL cannot carry paths: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Performs a request against `path`, relative to the base URL.
    ///
    /// # Errors
    /// Returns an `anyhow::Error` if URL joining or network execution fails.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let full_url = self.base_url.join(path.trim_start_matches('/'))?;
        self.request_url(method, full_url, headers, body).await
    }

    /// Performs a request against an absolute URL and decodes a JSON body on success.
    /// An empty successful body decodes as `null`, so `T = ()` or `Option<_>` accept it.
    pub async fn request_url<T, B>(
        &self,
        method: Method,
        full_url: Url,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let mut req = self.inner.request(method, full_url);

        // 1. Add Custom Headers if provided
        if let Some(h) = headers {
            req = req.headers(h);
        }

        // 2. Inject Bearer Authentication if a token is present
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        // 3. Serialize and attach the JSON body if present
        if let Some(b) = body {
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        // 4. Execute the request and capture response metadata
        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        // 5. Handle the result based on success status
        if status.is_success() {
            let raw = response.text().await?;
            let data = if raw.trim().is_empty() {
                serde_json::from_value::<T>(serde_json::Value::Null)?
            } else {
                serde_json::from_str::<T>(&raw)?
            };
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            // Capture the error body as a string for debugging
            let error_text = response.text().await.ok().filter(|t| !t.is_empty());
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }
}
