//! The network capability exposed to guest code.
//!
//! [`FetchClient::fetch`] turns a guest-supplied URL and [`RequestOptions`]
//! into one outbound call through the [`RetryPolicy`], and wraps the result
//! in a [`ResponseHandle`]. A non-2xx status is a normal response; only
//! transport failures and the retry ceiling are errors.

pub mod backoff;
pub mod resilience;
pub mod response;

#[cfg(test)]
pub(crate) mod stub;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::{HttpConfig, ResilienceConfig};
pub use resilience::RetryPolicy;
pub use response::ResponseHandle;

const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("response body is no longer available")]
    BodyUnavailable,

    #[error("response body is not valid JSON: {0}")]
    InvalidJson(String),
}

/// Second argument of guest `fetch(url, options)`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<serde_json::Map<String, Value>>,
    /// Strings are sent verbatim, other values as JSON text.
    #[serde(default)]
    pub body: Option<Value>,
}

/// `RequestOptions` after validation: method parsed, content type pulled
/// out of the header map, body rendered to text.
#[derive(Debug)]
struct PreparedRequest {
    method: Method,
    url: Url,
    headers: Vec<(HeaderName, HeaderValue)>,
    content_type: Option<HeaderValue>,
    body: Option<String>,
}

impl PreparedRequest {
    fn new(url: &str, options: RequestOptions) -> Result<Self, FetchError> {
        let url = Url::parse(url).map_err(|e| FetchError::InvalidRequest(format!("{url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidRequest(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }

        let method_name = options.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| FetchError::InvalidRequest(format!("invalid method: {method_name}")))?;

        let body = match options.body {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };

        let mut headers = Vec::new();
        let mut content_type = None;
        for (name, value) in options.headers.unwrap_or_default() {
            let value = match value {
                Value::Null => continue,
                Value::String(s) => s,
                other => other.to_string(),
            };
            let value = HeaderValue::from_str(&value)
                .map_err(|_| FetchError::InvalidRequest(format!("invalid value for header {name}")))?;
            if name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
                content_type = Some(value);
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::InvalidRequest(format!("invalid header name: {name}")))?;
            headers.push((name, value));
        }

        // Content-Type only travels with a body; JSON unless told otherwise.
        let content_type = match body {
            Some(_) => Some(content_type.unwrap_or(HeaderValue::from_static(DEFAULT_CONTENT_TYPE))),
            None => None,
        };

        Ok(Self {
            method,
            url,
            headers,
            content_type,
            body,
        })
    }

    fn build(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let mut builder = client.request(self.method.clone(), self.url.clone());
        for (name, value) in &self.headers {
            builder = builder.header(name.clone(), value.clone());
        }
        if let Some(content_type) = &self.content_type {
            builder = builder.header(CONTENT_TYPE, content_type.clone());
        }
        if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }
        builder
    }
}

/// Builds the process-wide HTTP client from the `[http]` section.
pub fn build_http_client(config: &HttpConfig) -> Result<reqwest::Client, FetchError> {
    if !config.tls_verify {
        warn!("TLS certificate verification is DISABLED for outbound guest requests");
    }

    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .user_agent(config.user_agent.as_str())
        .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
        .danger_accept_invalid_certs(!config.tls_verify)
        .build()
        .map_err(|e| FetchError::InvalidRequest(format!("HTTP client setup: {e}")))
}

/// Scheme, host and port of `url`: the only part of a guest URL that is
/// logged. Paths and queries may carry substituted secrets.
pub(crate) fn origin(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// The `fetch` capability. Cheap to clone; all clones share one
/// connection pool.
#[derive(Clone)]
pub struct FetchClient {
    client: reqwest::Client,
    policy: Arc<RetryPolicy>,
    max_body_bytes: usize,
}

impl FetchClient {
    pub fn new(client: reqwest::Client, resilience: ResilienceConfig, max_body_bytes: usize) -> Self {
        Self {
            client,
            policy: Arc::new(RetryPolicy::new(resilience)),
            max_body_bytes,
        }
    }

    pub async fn fetch(&self, url: &str, options: RequestOptions) -> Result<ResponseHandle, FetchError> {
        let request = PreparedRequest::new(url, options)?;
        let origin = origin(&request.url);
        debug!("fetch {} {origin}", request.method);

        let response = self.policy.execute(|| request.build(&self.client).send()).await?;
        let handle = ResponseHandle::new(response, self.max_body_bytes);
        debug!(
            "fetch {} {origin} -> {} ({})",
            request.method,
            handle.status,
            handle.header("content-type").unwrap_or("no content type")
        );
        Ok(handle)
    }
}
