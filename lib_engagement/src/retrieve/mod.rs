//! # Data Retrieval Module
//!
//! HTTP plumbing shared by the REST engagement adapter and the hub negotiation.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: A generic HTTP `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, featuring automatic retries with exponential
//!   backoff.
//!
//! - **`likes_api`**: `RestEngagementApi`, the [`EngagementApi`] implementation
//!   talking to `/api/likes`.
//!
//! [`EngagementApi`]: crate::core::EngagementApi

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;
/// REST adapter for like counts, like status and like/unlike mutations.
pub mod likes_api;

pub use ky_http::{ApiClient, ApiResponse};
pub use likes_api::RestEngagementApi;
