//! Response handle handed to guest code.
//!
//! Status and headers are available immediately. The body stays on the
//! connection until the first of `text`/`json`/`blob`, is read once into
//! a buffer, and every later accessor reads that buffer.

use tokio::sync::{Mutex, OnceCell};

use super::FetchError;

pub struct ResponseHandle {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    /// Final URL after redirects.
    pub url: String,
    /// Header names lower-cased; repeated headers appear once per value.
    pub headers: Vec<(String, String)>,
    max_body_bytes: usize,
    stream: Mutex<Option<reqwest::Response>>,
    body: OnceCell<Vec<u8>>,
}

// The URL is left out: it may carry substituted secrets.
impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("status", &self.status)
            .field("headers", &self.headers.len())
            .field("body_read", &self.body.initialized())
            .finish_non_exhaustive()
    }
}

impl ResponseHandle {
    pub fn new(response: reqwest::Response, max_body_bytes: usize) -> Self {
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Self {
            ok: status.is_success(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            url: response.url().to_string(),
            headers,
            max_body_bytes,
            stream: Mutex::new(Some(response)),
            body: OnceCell::new(),
        }
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The raw body. Reads the network stream on first call only.
    pub async fn bytes(&self) -> Result<&[u8], FetchError> {
        let body = self
            .body
            .get_or_try_init(|| async {
                let mut guard = self.stream.lock().await;
                let mut response = guard.take().ok_or(FetchError::BodyUnavailable)?;

                let mut buf = Vec::new();
                while let Some(chunk) = response
                    .chunk()
                    .await
                    .map_err(|e| FetchError::Transport(super::resilience::error_chain(&e)))?
                {
                    if buf.len() + chunk.len() > self.max_body_bytes {
                        return Err(FetchError::BodyTooLarge(self.max_body_bytes));
                    }
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf)
            })
            .await?;
        Ok(body.as_slice())
    }

    /// Body decoded as UTF-8, invalid sequences replaced.
    pub async fn text(&self) -> Result<String, FetchError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Body parsed as JSON. An empty body is `null`.
    pub async fn json(&self) -> Result<serde_json::Value, FetchError> {
        let bytes = self.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(bytes).map_err(|e| FetchError::InvalidJson(e.to_string()))
    }

    /// Drops the connection if the body was never read.
    pub fn release(&self) {
        if let Ok(mut guard) = self.stream.try_lock() {
            guard.take();
        }
    }
}
