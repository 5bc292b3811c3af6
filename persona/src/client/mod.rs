//! Signed GraphQL client.
//!
//! Requests go through [`SigningMiddleware`], which signs the exact body
//! bytes as the active persona on every attempt, so retries never reuse an
//! envelope.

mod graphql;
mod middleware;

use async_trait::async_trait;
use serde_json::Value;

pub use graphql::{ClientConfig, GraphqlClient};
pub use middleware::SigningMiddleware;

use crate::error::Result;

/// Request/response boundary to the backend API.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a GraphQL operation and return its `data` member.
    async fn request(&self, query: &str, variables: Value) -> Result<Value>;
}
