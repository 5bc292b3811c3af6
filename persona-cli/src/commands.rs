//! One handler per `personactl` subcommand.

use persona::prelude::*;
use persona::seed::generate_seed_phrase;
use persona::signer::HEADER_PERSONA_PKH;
use persona::store::StoreState;
use serde_json::{Map, Value, json};

/// Summarize a reconciliation for display.
#[must_use]
pub fn describe_report(report: &ReconcileReport) -> Value {
    let store = match &report.store_state {
        StoreState::Absent => "absent".to_owned(),
        StoreState::Fresh => "fresh".to_owned(),
        StoreState::Stale(reason) => format!("stale: {reason}"),
    };
    json!({
        "seed": format!("{:?}", report.seed_origin).to_lowercase(),
        "store": store,
        "rebuilt": report.rebuilt(),
        "active_pkh": report.active_pkh,
        "warnings": report.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
    })
}

/// The session's master fingerprint and personas. Secrets are never shown.
pub async fn show(session: &IdentitySession) -> Value {
    let store = session.persona_store().await;
    let personas: Vec<Value> = store
        .info
        .iter()
        .map(|p| json!({ "path": p.path, "pkh": p.pkh, "active": p.active }))
        .collect();
    json!({
        "master_pkh": session.master_pkh().await,
        "format": store.format,
        "num": store.num,
        "personas": personas,
    })
}

/// Replace the seed with `phrase`, or with a fresh one when `None`.
///
/// # Errors
///
/// Fails if a phrase cannot be generated or the new phrase is rejected.
pub async fn reseed(session: &IdentitySession, phrase: Option<&str>) -> Result<Value> {
    let report = match phrase {
        Some(phrase) => session.replace_seed(phrase).await?,
        None => {
            let generated = generate_seed_phrase()?;
            session.replace_seed(&generated).await?
        }
    };
    Ok(describe_report(&report))
}

/// Sign `payload` as the active persona and return the headers to send.
///
/// # Errors
///
/// Fails if the active persona cannot sign.
pub async fn sign(session: &IdentitySession, payload: &[u8]) -> Result<Value> {
    let persona = session.active_persona().await?;
    let envelope = session.sign(payload).await?;

    let mut headers = Map::new();
    headers.insert(
        HEADER_PERSONA_PKH.as_str().to_owned(),
        Value::String(persona.pkh.to_string()),
    );
    for (name, value) in envelope.header_pairs() {
        headers.insert(name.as_str().to_owned(), Value::String(value));
    }
    Ok(Value::Object(headers))
}

/// Check a received envelope against `body`.
///
/// # Errors
///
/// Returns [`Error::Verification`] if the envelope does not verify.
pub fn verify(headers: &AuthHeaders, body: &[u8], mode: PayloadMode) -> Result<Value> {
    let verified = verify_headers(headers, body, mode)?;
    Ok(json!({
        "pkh": verified.pkh,
        "sent_at": verified.sent_at_ms,
        "nonce": verified.nonce,
    }))
}

/// Send one GraphQL operation and return its `data`.
///
/// # Errors
///
/// Propagates transport, HTTP and GraphQL errors.
pub async fn request(transport: &dyn Transport, query: &str, variables: Value) -> Result<Value> {
    transport.request(query, variables).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;

    const DEV_PHRASE: &str = "bottom drive obey lake curtain smoke basket hold race lonely fit walk";

    async fn session() -> IdentitySession {
        IdentitySession::start(Arc::new(MemoryStore::new()), IdentityConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_show_omits_secrets() {
        let session = session().await;
        let shown = show(&session).await;
        assert_eq!(shown["num"], 1);
        assert_eq!(shown["personas"][0]["path"], 0);
        assert!(shown["personas"][0].get("hdkey").is_none());
    }

    #[tokio::test]
    async fn test_reseed_with_phrase() {
        let session = session().await;
        let report = reseed(&session, Some(DEV_PHRASE)).await.unwrap();
        assert_eq!(report["seed"], "replaced");
        assert_eq!(report["rebuilt"], true);
        assert!(report["store"].as_str().unwrap().starts_with("stale: master key changed"));

        let expected = derive_key_at(DEV_PHRASE, 0).unwrap();
        assert_eq!(report["active_pkh"], expected.pkh.as_str());
    }

    #[tokio::test]
    async fn test_reseed_generated() {
        let session = session().await;
        let before = session.master_pkh().await;
        reseed(&session, None).await.unwrap();
        assert_ne!(session.master_pkh().await, before);
    }

    #[tokio::test]
    async fn test_sign_then_verify() {
        let session = session().await;
        let headers = sign(&session, b"{}").await.unwrap();
        let field = |name: &str| headers[name].as_str().unwrap().to_owned();

        let auth = AuthHeaders {
            pkh: field("persona-pkh"),
            sent_at: field("x-sent-at"),
            nonce: field("x-nonce"),
            pubkey: field("x-pubkey"),
            sig: field("x-sig"),
        };
        let verified = verify(&auth, b"{}", PayloadMode::Raw).unwrap();
        assert_eq!(verified["nonce"], auth.nonce.as_str());

        assert!(matches!(
            verify(&auth, b"{ }", PayloadMode::Raw),
            Err(Error::Verification(_))
        ));
    }

    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn request(&self, query: &str, variables: Value) -> Result<Value> {
            Ok(json!({ "query": query, "variables": variables }))
        }
    }

    #[tokio::test]
    async fn test_request_uses_transport() {
        let data = request(&Echo, "query { me }", json!({"a": 1})).await.unwrap();
        assert_eq!(data["query"], "query { me }");
        assert_eq!(data["variables"]["a"], 1);
    }
}
