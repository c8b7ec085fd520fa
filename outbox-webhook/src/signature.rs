//! Provider authentication: GitHub HMAC signatures and GitLab tokens.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const GITHUB_SIGNATURE_PREFIX: &str = "sha256=";

/// Why a delivery failed authentication. The message becomes the audit summary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing X-Hub-Signature-256 header")]
    MissingSignature,
    #[error("malformed X-Hub-Signature-256 header")]
    MalformedSignature,
    #[error("signature does not match payload")]
    SignatureMismatch,
    #[error("missing X-Gitlab-Token header")]
    MissingToken,
    #[error("X-Gitlab-Token does not match")]
    TokenMismatch,
}

/// Check `sha256=<hex>` against HMAC-SHA256 of the raw body.
pub fn verify_github(secret: &str, header: Option<&str>, body: &[u8]) -> Result<(), AuthError> {
    let header = header
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(AuthError::MissingSignature)?;
    let digest = header
        .strip_prefix(GITHUB_SIGNATURE_PREFIX)
        .ok_or(AuthError::MalformedSignature)?;
    let expected = hex::decode(digest).map_err(|_| AuthError::MalformedSignature)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::SignatureMismatch)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| AuthError::SignatureMismatch)
}

pub fn verify_gitlab(token: &str, header: Option<&str>) -> Result<(), AuthError> {
    let header = header
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(AuthError::MissingToken)?;
    if header != token {
        return Err(AuthError::TokenMismatch);
    }
    Ok(())
}

/// `X-Hub-Signature-256` value GitHub would send for `body`.
#[cfg(test)]
pub fn sign_github(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key");
    mac.update(body);
    format!(
        "{GITHUB_SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    )
}
