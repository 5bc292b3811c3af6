use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::{SigningMiddleware, Transport};
use crate::error::{Error, Result};
use crate::persona::PersonaKey;
use crate::signer::{HEADER_FRONTEND_VERSION, HEADER_PERSONA_PKH, RequestSigner};

/// Backend client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// GraphQL endpoint URL.
    pub endpoint: String,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// User agent string.
    pub user_agent: Option<String>,
    /// Value of the `frontend-version` header.
    pub frontend_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/graphql/".to_owned(),
            timeout_secs: Some(30),
            user_agent: None,
            frontend_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

impl ClientConfig {
    /// Build a reqwest client sending `default_headers` on every request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the client cannot be built.
    pub fn build_client(&self, default_headers: HeaderMap) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().default_headers(default_headers);

        if let Some(timeout) = self.timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        if let Some(ref user_agent) = self.user_agent {
            builder = builder.user_agent(user_agent);
        }

        builder
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))
    }
}

/// GraphQL client authenticated as one persona.
#[derive(Debug, Clone)]
pub struct GraphqlClient {
    http: ClientWithMiddleware,
    endpoint: String,
    persona: PersonaKey,
}

impl GraphqlClient {
    /// Create a client that signs every request as `persona`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the persona pkh or frontend version is not
    /// a valid header value, or the HTTP client cannot be built.
    pub fn new(config: &ClientConfig, signer: Arc<RequestSigner>, persona: PersonaKey) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_PERSONA_PKH, header_value(persona.pkh.as_str())?);
        headers.insert(HEADER_FRONTEND_VERSION, header_value(&config.frontend_version)?);

        let client = config.build_client(headers)?;
        let http = ClientBuilder::new(client)
            .with(SigningMiddleware::new(signer, persona.clone()))
            .build();

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            persona,
        })
    }

    /// The persona requests are signed as.
    #[must_use]
    pub const fn persona(&self) -> &PersonaKey {
        &self.persona
    }

    /// The GraphQL endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Run a GraphQL operation and return its `data` member.
    ///
    /// # Errors
    ///
    /// - [`Error::SigningUnavailable`] if the request could not be signed; it
    ///   was not sent.
    /// - [`Error::Transport`] if the request failed in flight.
    /// - [`Error::HttpStatus`] for a non-2xx answer.
    /// - [`Error::GraphQl`] if the response carries GraphQL errors.
    pub async fn request(&self, query: &str, variables: Value) -> Result<Value> {
        let body = serde_json::to_vec(&json!({
            "query": query,
            "variables": variables,
        }))?;

        let response = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.map_err(Error::from)?;
        debug!(pkh = %self.persona.pkh, status = %status, "graphql response");

        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }

        let mut payload: Value = serde_json::from_str(&text)?;
        let messages = graphql_errors(&payload);
        if !messages.is_empty() {
            return Err(Error::GraphQl(messages));
        }

        Ok(payload
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Transport for GraphqlClient {
    async fn request(&self, query: &str, variables: Value) -> Result<Value> {
        Self::request(self, query, variables).await
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::config(format!("invalid header value '{value}': {e}")))
}

fn graphql_errors(payload: &Value) -> Vec<String> {
    payload
        .get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .map(|e| {
                    e.get("message")
                        .and_then(Value::as_str)
                        .map_or_else(|| e.to_string(), str::to_owned)
                })
                .collect()
        })
        .unwrap_or_default()
}
