use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::app_error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

/// Produce a `t=<ts>,v1=<hex>` header for a payload. Used by tests and by
/// operators replaying captured deliveries.
pub fn sign_payload(secret: &SecretString, body: &str, timestamp: i64) -> String {
    let signed_content = format!("{}.{}", timestamp, body);
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(signed_content.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    format!("t={},v1={}", timestamp, signature)
}

/// Verify a `t=<ts>,v1=<hex>` header against the raw body. Freshness is
/// checked before the MAC so a replayed delivery fails fast; the MAC
/// comparison is constant-time.
pub fn verify_signature(
    secret: &SecretString,
    header: &str,
    body: &str,
    now_unix: i64,
    tolerance_secs: i64,
) -> AppResult<()> {
    let (timestamp, provided) = parse_signature_header(header)?;

    if (now_unix - timestamp).abs() > tolerance_secs {
        return Err(AppError::StaleSignature);
    }

    let signed_content = format!("{}.{}", timestamp, body);
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(signed_content.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if !constant_time_compare(expected.as_bytes(), provided.as_bytes()) {
        return Err(AppError::InvalidSignature);
    }
    Ok(())
}

fn parse_signature_header(header: &str) -> AppResult<(i64, &str)> {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signature = Some(value),
            _ => {}
        }
    }
    match (timestamp, signature) {
        (Some(t), Some(s)) => Ok((t, s)),
        _ => Err(AppError::InvalidSignature),
    }
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SecretString {
        SecretString::from("whsec_test_secret")
    }

    #[test]
    fn signature_is_deterministic() {
        let sig1 = sign_payload(&secret(), r#"{"id":"evt_1"}"#, 1706500000);
        let sig2 = sign_payload(&secret(), r#"{"id":"evt_1"}"#, 1706500000);
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn signature_has_correct_format() {
        let sig = sign_payload(&secret(), r#"{"id":"evt_1"}"#, 1706500000);
        assert!(sig.starts_with("t=1706500000,v1="));
        let hex_part = sig.strip_prefix("t=1706500000,v1=").unwrap();
        assert_eq!(hex_part.len(), 64); // SHA-256 hex = 64 chars
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn round_trip_verifies() {
        let body = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let sig = sign_payload(&secret(), body, 1706500000);
        assert!(verify_signature(&secret(), &sig, body, 1706500010, 300).is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected_before_the_mac() {
        let body = r#"{"id":"evt_1"}"#;
        let sig = sign_payload(&secret(), body, 1706500000);
        let err = verify_signature(&secret(), &sig, body, 1706500000 + 301, 300).unwrap_err();
        assert!(matches!(err, AppError::StaleSignature));
    }

    #[test]
    fn future_timestamps_outside_tolerance_are_stale_too() {
        let body = r#"{"id":"evt_1"}"#;
        let sig = sign_payload(&secret(), body, 1706500000 + 600);
        let err = verify_signature(&secret(), &sig, body, 1706500000, 300).unwrap_err();
        assert!(matches!(err, AppError::StaleSignature));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = r#"{"id":"evt_1"}"#;
        let sig = sign_payload(&SecretString::from("whsec_other"), body, 1706500000);
        let err = verify_signature(&secret(), &sig, body, 1706500000, 300).unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let sig = sign_payload(&secret(), r#"{"id":"evt_1"}"#, 1706500000);
        let err =
            verify_signature(&secret(), &sig, r#"{"id":"evt_2"}"#, 1706500000, 300).unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        for header in ["", "t=abc,v1=00", "v1=00", "t=1706500000", "garbage"] {
            let err = verify_signature(&secret(), header, "{}", 1706500000, 300).unwrap_err();
            assert!(matches!(err, AppError::InvalidSignature), "{header}");
        }
    }
}
