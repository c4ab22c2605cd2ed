use crate::client::HttpClient;
use crate::error::HttpError;
use crate::response::HttpResponse;
use bytes::Bytes;
use http::{Method, Request};
use http_body_util::Full;
use serde::Serialize;
use std::time::Duration;

/// HTTP request builder
///
/// Created by [`HttpClient::get`], [`HttpClient::post`] and friends.
/// Nothing is sent until [`RequestBuilder::send`] is awaited.
#[must_use = "requests do nothing unless `send()` is awaited"]
pub struct RequestBuilder {
    client: HttpClient,
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Option<(Bytes, &'static str)>,
    timeout: Duration,
}

impl RequestBuilder {
    pub(crate) fn new(client: HttpClient, method: Method, url: String) -> Self {
        let timeout = client.timeout;
        Self {
            client,
            method,
            url,
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            timeout,
        }
    }

    /// Add a header. A later header with the same name is appended, not replaced.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Add multiple headers
    pub fn headers<K, V>(mut self, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Append query parameters (percent-encoded on send)
    pub fn query<K, V>(mut self, pairs: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.query.extend(
            pairs
                .iter()
                .map(|(k, v)| (k.as_ref().to_owned(), v.as_ref().to_owned())),
        );
        self
    }

    /// Override the client timeout for this request only
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set a JSON body with `content-type: application/json`
    ///
    /// # Errors
    /// Returns `HttpError::Json` if serialization fails.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, HttpError> {
        let bytes = serde_json::to_vec(body)?;
        self.body = Some((Bytes::from(bytes), "application/json"));
        Ok(self)
    }

    /// Set a raw body with an explicit content type
    pub fn body_bytes(mut self, body: Bytes, content_type: &'static str) -> Self {
        self.body = Some((body, content_type));
        self
    }

    fn validate_url(&self) -> Result<http::Uri, HttpError> {
        let mut url = url::Url::parse(&self.url).map_err(|e| HttpError::InvalidUri {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "http" => {}
            "https" => {
                return Err(HttpError::InvalidScheme {
                    scheme: "https".to_owned(),
                    reason: "TLS is not supported by this client".to_owned(),
                });
            }
            other => {
                return Err(HttpError::InvalidScheme {
                    scheme: other.to_owned(),
                    reason: "only http:// URLs are supported".to_owned(),
                });
            }
        }

        if url.host_str().is_none_or(str::is_empty) {
            return Err(HttpError::InvalidUri {
                url: self.url.clone(),
                reason: "missing host".to_owned(),
            });
        }

        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }

        url.as_str()
            .parse::<http::Uri>()
            .map_err(|e| HttpError::InvalidUri {
                url: self.url.clone(),
                reason: e.to_string(),
            })
    }

    /// Send the request and return the response
    ///
    /// The configured timeout bounds connecting and receiving response headers.
    /// Reading the body through [`HttpResponse`] helpers is bounded by the same timeout.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` if:
    /// - The URL is invalid or not `http://`
    /// - Request building failed (invalid header name or value)
    /// - Network/transport error
    /// - Request timeout
    pub async fn send(self) -> Result<HttpResponse, HttpError> {
        let uri = self.validate_url()?;

        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .header(http::header::USER_AGENT, self.client.user_agent.as_str());

        let has_content_type = self
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(http::header::CONTENT_TYPE.as_str()));

        let body = match self.body {
            Some((bytes, content_type)) => {
                if !has_content_type {
                    builder = builder.header(http::header::CONTENT_TYPE, content_type);
                }
                bytes
            }
            None => Bytes::new(),
        };

        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let request = builder.body(Full::new(body))?;
        let deadline = tokio::time::Instant::now() + self.timeout;

        tracing::trace!(method = %self.method, url = %self.url, "sending request");

        let response = tokio::time::timeout_at(deadline, self.client.inner.request(request))
            .await
            .map_err(|_| HttpError::Timeout(self.timeout))??;

        Ok(HttpResponse::new(
            response,
            self.client.max_body_size,
            deadline,
            self.timeout,
        ))
    }
}
