#![warn(warnings)]

//! HTTP client infrastructure for the service registry
//!
//! A thin hyper-based client with:
//! - Connection pooling (hyper-util legacy client)
//! - A per-request timeout covering connect, headers and body
//! - JSON request and response helpers
//! - Response body size limits
//!
//! Only plain `http://` URLs are accepted. Registered services are addressed
//! by `host:port` inside the deployment network.
//!
//! # Example
//!
//! ```ignore
//! use registry_http::HttpClient;
//! use std::time::Duration;
//!
//! let client = HttpClient::builder()
//!     .timeout(Duration::from_secs(5))
//!     .build();
//!
//! let resp = client.get("http://127.0.0.1:9001/health").send().await?;
//! assert!(resp.status().is_success());
//! ```

mod client;
mod error;
mod request;
mod response;

pub use client::{
    DEFAULT_MAX_BODY_SIZE, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, HttpClient, HttpClientBuilder,
};
pub use error::HttpError;
pub use http::{Method, StatusCode};
pub use request::RequestBuilder;
pub use response::HttpResponse;
