use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::VerifyError;

type HmacSha256 = Hmac<Sha256>;

/// Text encoding of the HMAC digest carried in the signature header.
///
/// Push sources disagree here, so it is a per-deployment setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureEncoding {
    #[default]
    Hex,
    Base64,
}

impl SignatureEncoding {
    fn encode(self, digest: &[u8]) -> String {
        match self {
            SignatureEncoding::Hex => hex::encode(digest),
            SignatureEncoding::Base64 => BASE64.encode(digest),
        }
    }

    fn decode(self, signature: &str) -> Option<Vec<u8>> {
        match self {
            SignatureEncoding::Hex => hex::decode(signature).ok(),
            SignatureEncoding::Base64 => BASE64.decode(signature).ok(),
        }
    }
}

fn mac_for(secret: &[u8], payload: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload);
    Some(mac)
}

/// Compute the HMAC-SHA256 signature of a raw body.
pub fn compute_signature(secret: &[u8], payload: &[u8], encoding: SignatureEncoding) -> String {
    mac_for(secret, payload)
        .map(|mac| encoding.encode(&mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Check a received signature and report why it failed.
///
/// An empty or absent secret means the deployment runs open and every body
/// is accepted. The digest comparison is constant time.
pub fn check_signature(
    secret: Option<&str>,
    payload: &[u8],
    signature: Option<&str>,
    encoding: SignatureEncoding,
) -> Result<(), VerifyError> {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return Ok(());
    };

    let signature = signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(VerifyError::MissingSignature)?;

    let received = encoding.decode(signature).ok_or(VerifyError::Encoding)?;
    let mac = mac_for(secret.as_bytes(), payload).ok_or(VerifyError::Mismatch)?;

    mac.verify_slice(&received).map_err(|_| VerifyError::Mismatch)
}

/// Boolean form of [`check_signature`]. Never panics.
pub fn verify_signature(
    secret: Option<&str>,
    payload: &[u8],
    signature: Option<&str>,
    encoding: SignatureEncoding,
) -> bool {
    check_signature(secret, payload, signature, encoding).is_ok()
}

/// Find the signature header in a list of headers, ignoring ASCII case.
pub fn signature_from_headers<'a, I>(headers: I, signature_header: &str) -> Option<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(signature_header))
        .map(|(_, value)| value.to_string())
}
