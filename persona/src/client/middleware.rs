use std::sync::Arc;

use async_trait::async_trait;
use http::Extensions;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use tracing::warn;

use crate::error::Error;
use crate::persona::PersonaKey;
use crate::signer::RequestSigner;

/// Signs each outgoing request body as a persona.
///
/// Requests without a buffered body (absent or streaming) cannot be signed
/// and fail with [`Error::SigningUnavailable`] before anything is sent.
#[derive(Debug)]
pub struct SigningMiddleware {
    signer: Arc<RequestSigner>,
    persona: PersonaKey,
}

impl SigningMiddleware {
    /// Sign requests as `persona`.
    #[must_use]
    pub const fn new(signer: Arc<RequestSigner>, persona: PersonaKey) -> Self {
        Self { signer, persona }
    }

    fn sign(&self, req: &mut Request) -> Result<(), Error> {
        let body = req
            .body()
            .and_then(reqwest::Body::as_bytes)
            .ok_or_else(|| Error::signing_unavailable("request body is not buffered"))?;
        let envelope = self.signer.sign(&self.persona, body)?;
        envelope.apply(req.headers_mut())
    }
}

#[async_trait]
impl Middleware for SigningMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        if let Err(e) = self.sign(&mut req) {
            warn!(pkh = %self.persona.pkh, url = %req.url(), error = %e, "request not sent");
            return Err(reqwest_middleware::Error::middleware(e));
        }
        next.run(req, extensions).await
    }
}
