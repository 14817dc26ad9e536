use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Validate Meta's `X-Hub-Signature-256` header against the raw request
/// body. The header carries `sha256=<hex>`; the prefix is case-sensitive
/// and the comparison is constant-time (the HMAC verify handles that).
pub fn verify_meta_signature(app_secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time equality comparison for secret strings.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
