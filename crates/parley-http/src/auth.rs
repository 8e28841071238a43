use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use parley_core::constants::{AUTH_TIMESTAMP_SKEW_SECS, KIND_AUTH_DOMAIN, KIND_AUTH_REQUEST};
use parley_core::error::ParleyError;
use parley_core::event::{Event, UnsignedEvent};
use parley_core::types::{Pubkey, Timestamp};
use parley_crypto::{sign_event, verify_event, Keys};

/// Build a request-bound token: binds the absolute URL, the method, and
/// (when a body is supplied) its SHA-256.
pub fn build_request_token(keys: &Keys, url: &str, method: &str, body: Option<&[u8]>) -> String {
    let mut tags = vec![
        vec!["u".to_string(), url.to_string()],
        vec!["method".to_string(), method.to_uppercase()],
    ];
    if let Some(body) = body {
        tags.push(vec!["payload".to_string(), hex::encode(Sha256::digest(body))]);
    }
    let event = sign_event(
        keys,
        UnsignedEvent::new(keys.public(), KIND_AUTH_REQUEST, tags, String::new()),
    );
    encode_header(&event)
}

/// Build a domain-scoped token valid for `domain` and its sub-domains until
/// `expiration` (Unix seconds).
pub fn build_domain_token(keys: &Keys, domain: &str, expiration: Timestamp) -> String {
    let tags = vec![
        vec!["domain".to_string(), domain.to_string()],
        vec!["expiration".to_string(), expiration.to_string()],
    ];
    let event = sign_event(
        keys,
        UnsignedEvent::new(keys.public(), KIND_AUTH_DOMAIN, tags, String::new()),
    );
    encode_header(&event)
}

fn encode_header(event: &Event) -> String {
    let json = serde_json::to_vec(event).expect("event serialization is infallible");
    format!("Nostr {}", BASE64.encode(json))
}

/// Verify an `Authorization` header value against the request it arrived
/// with. Returns the authenticated pubkey.
pub fn verify_auth_header(
    header: &str,
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    now: Timestamp,
) -> Result<Pubkey, ParleyError> {
    let encoded = header.strip_prefix("Nostr ").ok_or(ParleyError::TokenMissing)?;
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|_| ParleyError::TokenSignatureInvalid)?;
    let event: Event =
        serde_json::from_slice(&raw).map_err(|_| ParleyError::TokenSignatureInvalid)?;
    verify_event(&event).map_err(|_| ParleyError::TokenSignatureInvalid)?;

    match event.kind {
        KIND_AUTH_REQUEST => verify_request_token(&event, method, url, body, now),
        KIND_AUTH_DOMAIN => verify_domain_token(&event, url, now),
        _ => Err(ParleyError::TokenSignatureInvalid),
    }?;

    Ok(event.pubkey)
}

fn verify_request_token(
    event: &Event,
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    now: Timestamp,
) -> Result<(), ParleyError> {
    let token_url = event
        .tag_value("u")
        .ok_or_else(|| ParleyError::UrlMismatch(url.to_string()))?;
    if token_url != url {
        return Err(ParleyError::UrlMismatch(url.to_string()));
    }

    let token_method = event
        .tag_value("method")
        .ok_or_else(|| ParleyError::MethodMismatch(method.to_string()))?;
    if !token_method.eq_ignore_ascii_case(method) {
        return Err(ParleyError::MethodMismatch(method.to_string()));
    }

    if let Some(tag_hash) = event.tag_value("payload") {
        let body = body.ok_or(ParleyError::PayloadHashMismatch)?;
        let actual = hex::encode(Sha256::digest(body));
        if !tag_hash.eq_ignore_ascii_case(&actual) {
            return Err(ParleyError::PayloadHashMismatch);
        }
    }

    // Inclusive window: exactly ±60 s is still valid.
    if (now - event.created_at).abs() > AUTH_TIMESTAMP_SKEW_SECS {
        return Err(ParleyError::TokenTimestampSkew);
    }
    Ok(())
}

fn verify_domain_token(event: &Event, url: &str, now: Timestamp) -> Result<(), ParleyError> {
    let domain = event
        .tag_value("domain")
        .ok_or_else(|| ParleyError::DomainMismatch(url.to_string()))?;
    let expiration: Timestamp = event
        .tag_value("expiration")
        .and_then(|v| v.parse().ok())
        .ok_or(ParleyError::TokenExpired)?;
    if now > expiration {
        return Err(ParleyError::TokenExpired);
    }

    let parsed = url::Url::parse(url).map_err(|_| ParleyError::UrlMismatch(url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ParleyError::UrlMismatch(url.to_string()))?;
    let matches = host == domain || host.ends_with(&format!(".{domain}"));
    if !matches {
        return Err(ParleyError::DomainMismatch(host.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://admin.example.com/wallets";

    #[test]
    fn request_token_round_trip() {
        let keys = Keys::generate();
        let header = build_request_token(&keys, URL, "GET", None);
        let pubkey = verify_auth_header(&header, "GET", URL, None, now()).unwrap();
        assert_eq!(pubkey, keys.public());
    }

    fn now() -> Timestamp {
        parley_core::types::now_unix()
    }

    #[test]
    fn timestamp_window_is_inclusive_at_sixty_seconds() {
        let keys = Keys::generate();
        let header = build_request_token(&keys, URL, "GET", None);

        // Decode to learn the token's created_at.
        let raw = BASE64.decode(header.strip_prefix("Nostr ").unwrap()).unwrap();
        let event: Event = serde_json::from_slice(&raw).unwrap();

        assert!(verify_auth_header(&header, "GET", URL, None, event.created_at + 60).is_ok());
        assert!(verify_auth_header(&header, "GET", URL, None, event.created_at - 60).is_ok());

        let err =
            verify_auth_header(&header, "GET", URL, None, event.created_at + 61).unwrap_err();
        assert_eq!(err.code(), "timestamp-skew");
        assert!(verify_auth_header(&header, "GET", URL, None, event.created_at - 61).is_err());
    }

    #[test]
    fn url_and_method_must_match() {
        let keys = Keys::generate();
        let header = build_request_token(&keys, URL, "GET", None);

        let err = verify_auth_header(&header, "GET", "http://admin.example.com/experts", None, now())
            .unwrap_err();
        assert_eq!(err.code(), "url-mismatch");

        let err = verify_auth_header(&header, "DELETE", URL, None, now()).unwrap_err();
        assert_eq!(err.code(), "method-mismatch");
    }

    #[test]
    fn payload_hash_binds_the_body() {
        let keys = Keys::generate();
        let body = br#"{"name":"main"}"#;
        let header = build_request_token(&keys, URL, "POST", Some(body));

        assert!(verify_auth_header(&header, "POST", URL, Some(body), now()).is_ok());

        let err = verify_auth_header(&header, "POST", URL, Some(b"tampered"), now()).unwrap_err();
        assert_eq!(err.code(), "payload-hash-mismatch");

        let err = verify_auth_header(&header, "POST", URL, None, now()).unwrap_err();
        assert_eq!(err.code(), "payload-hash-mismatch");
    }

    #[test]
    fn domain_token_covers_subdomains_until_expiry() {
        let keys = Keys::generate();
        let header = build_domain_token(&keys, "example.com", now() + 3600);

        assert!(verify_auth_header(&header, "GET", "http://example.com/x", None, now()).is_ok());
        assert!(
            verify_auth_header(&header, "GET", "http://api.example.com/x", None, now()).is_ok()
        );

        let err = verify_auth_header(&header, "GET", "http://evilexample.com/x", None, now())
            .unwrap_err();
        assert_eq!(err.code(), "domain-mismatch");
    }

    #[test]
    fn expired_domain_token_is_rejected() {
        let keys = Keys::generate();
        let header = build_domain_token(&keys, "example.com", now() - 1);
        let err =
            verify_auth_header(&header, "GET", "http://example.com/x", None, now()).unwrap_err();
        assert_eq!(err.code(), "expired-token");
    }

    #[test]
    fn tampered_token_fails_signature() {
        let keys = Keys::generate();
        let header = build_request_token(&keys, URL, "GET", None);
        let raw = BASE64.decode(header.strip_prefix("Nostr ").unwrap()).unwrap();
        let mut event: Event = serde_json::from_slice(&raw).unwrap();
        event.tags[0][1] = "http://attacker.example/".into();
        let forged = format!("Nostr {}", BASE64.encode(serde_json::to_vec(&event).unwrap()));

        let err = verify_auth_header(&forged, "GET", "http://attacker.example/", None, now())
            .unwrap_err();
        assert_eq!(err.code(), "signature-invalid");
    }
}
