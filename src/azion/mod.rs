// Azion API module - authenticated access to the Analytics endpoints
//
// The scheduler only depends on the `AnalyticsSource` trait, so the
// concrete HTTP client can be replaced by a fake in tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

pub mod client;
pub mod error;
pub mod token;

pub use client::{AzionClient, ClientSettings, RetryPolicy};
pub use error::ApiError;
pub use token::Credentials;

/// Query descriptor for one analytics time series
///
/// Addresses `products/{product}/aggregate/metrics/{metric}/dimensions/{dimension}`
/// and, in the response, the nested `products.{product}.{metric}.{dimension}` array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricQuery {
    pub product: String,
    pub metric: String,
    pub dimension: String,
}

impl MetricQuery {
    pub fn new(
        product: impl Into<String>,
        metric: impl Into<String>,
        dimension: impl Into<String>,
    ) -> Self {
        MetricQuery {
            product: product.into(),
            metric: metric.into(),
            dimension: dimension.into(),
        }
    }

    /// Request path relative to the API base URL
    pub fn path(&self) -> String {
        format!(
            "products/{}/aggregate/metrics/{}/dimensions/{}",
            self.product, self.metric, self.dimension
        )
    }
}

impl fmt::Display for MetricQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.product, self.metric, self.dimension)
    }
}

/// Anything that can return the raw analytics payload for a query.
///
/// An empty payload is a valid answer and must be tolerated by callers.
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    async fn fetch(&self, query: &MetricQuery) -> Result<Bytes, ApiError>;
}
