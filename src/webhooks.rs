use axum::{body::Bytes, extract::Extension, http::HeaderMap, http::StatusCode};
use hmac::{digest::InvalidLength, Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, error};

use crate::billing::reconciliation::{GatewayEvent, ReconciliationHandle, ReconciliationJob};
use crate::error::{AppError, AppResult};

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// Secret shared with the payment gateway for webhook signing.
#[derive(Clone)]
pub struct WebhookSecret(pub Option<String>);

/// Signature header value for `body`, formatted as `sha256=<hex>`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, InvalidLength> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(encoded) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex::decode(encoded) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// key: gateway-webhook -> verify and enqueue payment events
pub async fn gateway_events(
    Extension(secret): Extension<WebhookSecret>,
    Extension(reconciler): Extension<ReconciliationHandle>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let Some(secret) = secret.0.as_deref() else {
        return Err(AppError::Unavailable("webhook secret not configured".into()));
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    if !verify_signature(secret, &body, signature) {
        return Err(AppError::Unauthorized);
    }

    let event: GatewayEvent = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("invalid gateway event: {err}")))?;
    debug!(
        event_id = ?event.id,
        subject_id = %event.subject_id,
        status = ?event.status,
        "accepted gateway event"
    );

    reconciler
        .dispatch(ReconciliationJob::GatewayEvent(event))
        .await
        .map_err(|err| {
            error!(?err, "reconciliation worker unavailable");
            AppError::Unavailable("reconciliation worker unavailable".into())
        })?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_round_trip_and_reject_tampering() {
        let body = br#"{"subject_id":"pi_1"}"#;
        let header = sign("whsec_test", body).unwrap();
        assert!(header.starts_with("sha256="));
        assert!(verify_signature("whsec_test", body, &header));

        assert!(!verify_signature("whsec_other", body, &header));
        assert!(!verify_signature("whsec_test", br#"{"subject_id":"pi_2"}"#, &header));
        assert!(!verify_signature("whsec_test", body, "sha256=zz"));
        assert!(!verify_signature("whsec_test", body, &header.replace("sha256=", "sha1=")));
    }
}
