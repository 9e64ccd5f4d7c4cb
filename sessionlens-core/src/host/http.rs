//! Outbound request entry points: promise-style fetch and the legacy request object

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

/// Error type produced by a fetch implementation; passed through unchanged
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// `None` means the implementation default, `GET`
    pub method: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: None,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Method as sent on the wire
    pub fn effective_method(&self) -> &str {
        self.method.as_deref().unwrap_or("GET")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Promise-style request function
#[async_trait]
pub trait FetchApi: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// Fetch performed with reqwest
#[derive(Debug, Clone, Default)]
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FetchApi for ReqwestFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let method = reqwest::Method::from_bytes(request.effective_method().as_bytes())?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

/// Fetch for pages that have none; every call fails
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableFetch;

#[async_trait]
impl FetchApi for UnavailableFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        Err(format!("fetch is not available in this environment: {}", request.url).into())
    }
}

/// Listener invoked with the final status once a request completes
pub type LoadEndListener = Box<dyn FnOnce(u16) + Send + 'static>;

/// Callback-style request object: `open`, then `send`, completion via listeners
pub trait LegacyRequest: Send {
    fn open(&mut self, method: &str, url: &str);
    fn send(&mut self, body: Option<Vec<u8>>);
    /// Status of the completed request, `0` before completion or on failure
    fn status(&self) -> u16;
    fn add_load_end_listener(&mut self, listener: LoadEndListener);
}

/// Constructor for [`LegacyRequest`] objects
pub trait LegacyRequestFactory: Send + Sync {
    fn create(&self) -> Box<dyn LegacyRequest>;
}

/// Factory for request objects backed by reqwest
#[derive(Debug, Clone, Default)]
pub struct ReqwestLegacyRequests {
    client: reqwest::Client,
}

impl LegacyRequestFactory for ReqwestLegacyRequests {
    fn create(&self) -> Box<dyn LegacyRequest> {
        Box::new(ReqwestLegacyRequest {
            client: self.client.clone(),
            method: None,
            url: None,
            status: Arc::new(AtomicU16::new(0)),
            listeners: Vec::new(),
        })
    }
}

struct ReqwestLegacyRequest {
    client: reqwest::Client,
    method: Option<String>,
    url: Option<String>,
    status: Arc<AtomicU16>,
    listeners: Vec<LoadEndListener>,
}

impl LegacyRequest for ReqwestLegacyRequest {
    fn open(&mut self, method: &str, url: &str) {
        self.method = Some(method.to_string());
        self.url = Some(url.to_string());
    }

    fn send(&mut self, body: Option<Vec<u8>>) {
        let listeners = std::mem::take(&mut self.listeners);
        let complete = move |status: u16| {
            for listener in listeners {
                listener(status);
            }
        };

        let (Some(method), Some(url)) = (self.method.clone(), self.url.clone()) else {
            complete(0);
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            complete(0);
            return;
        };

        let client = self.client.clone();
        let status_cell = self.status.clone();
        handle.spawn(async move {
            let status = match reqwest::Method::from_bytes(method.as_bytes()) {
                Ok(method) => {
                    let mut builder = client.request(method, &url);
                    if let Some(body) = body {
                        builder = builder.body(body);
                    }
                    match builder.send().await {
                        Ok(response) => response.status().as_u16(),
                        Err(e) => {
                            tracing::debug!(url = %url, error = %e, "legacy request failed");
                            0
                        }
                    }
                }
                Err(_) => 0,
            };
            status_cell.store(status, Ordering::SeqCst);
            complete(status);
        });
    }

    fn status(&self) -> u16 {
        self.status.load(Ordering::SeqCst)
    }

    fn add_load_end_listener(&mut self, listener: LoadEndListener) {
        self.listeners.push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_to_get() {
        let request = FetchRequest::get("https://example.com");
        assert_eq!(request.effective_method(), "GET");

        let post = FetchRequest::new("POST", "https://example.com")
            .header("Content-Type", "application/json")
            .body(b"{}".to_vec());
        assert_eq!(post.effective_method(), "POST");
        assert_eq!(post.body.as_deref(), Some(&b"{}"[..]));
    }

    #[tokio::test]
    async fn test_unavailable_fetch_fails() {
        let err = UnavailableFetch
            .fetch(FetchRequest::get("https://example.com"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not available"));
    }

    #[test]
    fn test_legacy_send_without_open_completes_with_zero() {
        let mut request = ReqwestLegacyRequests::default().create();
        let seen = Arc::new(AtomicU16::new(999));
        let seen_clone = seen.clone();
        request.add_load_end_listener(Box::new(move |status| {
            seen_clone.store(status, Ordering::SeqCst)
        }));
        request.send(None);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
