//! Explicit resource limits
//!
//! The engine does not retry failed loads and does not bound work
//! implicitly; every limit is named here. Defaults are conservative.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineLimits {
    /// Default timeout for a single endpoint request. Endpoints may
    /// override this per record.
    pub http_timeout: Duration,

    /// TCP connect timeout for the shared HTTP client.
    pub http_connect_timeout: Duration,

    /// Maximum redirects the HTTP client follows.
    pub max_redirects: usize,

    /// Row cap for transformer output. Exceeding it fails the run instead
    /// of committing an oversized write.
    pub max_transform_rows: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            http_connect_timeout: Duration::from_secs(10),
            max_redirects: 5,
            max_transform_rows: 10_000,
        }
    }
}

impl EngineLimits {
    /// Tighter limits for tests.
    pub fn testing() -> Self {
        Self {
            http_timeout: Duration::from_secs(5),
            http_connect_timeout: Duration::from_secs(2),
            max_redirects: 2,
            max_transform_rows: 100,
        }
    }
}
