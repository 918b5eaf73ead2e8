use device_webhook_ingest::{
    check_signature, compute_signature, signature_from_headers, verify_signature,
    SignatureEncoding, VerifyError,
};
use proptest::prelude::*;

const SECRET: &str = "whsec_test";
const BODY: &[u8] = br#"{"events":[{"eventId":"E1"}]}"#;

#[test]
fn empty_or_missing_secret_trusts_everything() {
    assert!(verify_signature(None, BODY, None, SignatureEncoding::Hex));
    assert!(verify_signature(Some(""), BODY, Some("garbage"), SignatureEncoding::Hex));
}

#[test]
fn missing_signature_is_rejected_when_secret_is_set() {
    assert_eq!(
        check_signature(Some(SECRET), BODY, None, SignatureEncoding::Hex),
        Err(VerifyError::MissingSignature)
    );
    assert!(!verify_signature(Some(SECRET), BODY, Some("  "), SignatureEncoding::Hex));
}

#[test]
fn hex_signature_round_trips() {
    let signature = compute_signature(SECRET.as_bytes(), BODY, SignatureEncoding::Hex);
    assert_eq!(signature.len(), 64);
    assert!(verify_signature(Some(SECRET), BODY, Some(&signature), SignatureEncoding::Hex));
}

#[test]
fn base64_signature_round_trips() {
    let signature = compute_signature(SECRET.as_bytes(), BODY, SignatureEncoding::Base64);
    assert!(verify_signature(Some(SECRET), BODY, Some(&signature), SignatureEncoding::Base64));
}

#[test]
fn encoding_mismatch_fails_without_panicking() {
    let hex_sig = compute_signature(SECRET.as_bytes(), BODY, SignatureEncoding::Hex);
    let b64_sig = compute_signature(SECRET.as_bytes(), BODY, SignatureEncoding::Base64);

    assert!(!verify_signature(Some(SECRET), BODY, Some(&b64_sig), SignatureEncoding::Hex));
    assert_eq!(
        check_signature(Some(SECRET), BODY, Some("not-hex!"), SignatureEncoding::Hex),
        Err(VerifyError::Encoding)
    );
    // A hex digest is also valid base64 text, it just decodes to the wrong bytes.
    assert!(!verify_signature(Some(SECRET), BODY, Some(&hex_sig), SignatureEncoding::Base64));
}

#[test]
fn wrong_secret_is_a_mismatch() {
    let signature = compute_signature(b"other", BODY, SignatureEncoding::Hex);
    assert_eq!(
        check_signature(Some(SECRET), BODY, Some(&signature), SignatureEncoding::Hex),
        Err(VerifyError::Mismatch)
    );
}

#[test]
fn signature_header_lookup_ignores_case() {
    let headers = vec![
        ("content-type", "application/json"),
        ("x-signature", "abcd"),
    ];
    let found = signature_from_headers(headers.iter().map(|(k, v)| (*k, *v)), "X-Signature");
    assert_eq!(found.as_deref(), Some("abcd"));

    let missing = signature_from_headers(headers.iter().map(|(k, v)| (*k, *v)), "X-Other");
    assert!(missing.is_none());
}

proptest! {
    #[test]
    fn valid_signature_verifies_and_any_flipped_body_bit_fails(
        body in proptest::collection::vec(any::<u8>(), 1..256),
        secret in "[a-zA-Z0-9]{1,32}",
        index in any::<usize>(),
        bit in 0u8..8,
    ) {
        let signature = compute_signature(secret.as_bytes(), &body, SignatureEncoding::Hex);
        prop_assert!(verify_signature(Some(&secret), &body, Some(&signature), SignatureEncoding::Hex));

        let mut tampered = body.clone();
        let i = index % tampered.len();
        tampered[i] ^= 1 << bit;
        prop_assert!(!verify_signature(Some(&secret), &tampered, Some(&signature), SignatureEncoding::Hex));
    }

    #[test]
    fn any_flipped_signature_bit_fails(
        body in proptest::collection::vec(any::<u8>(), 0..256),
        index in 0usize..32,
        bit in 0u8..8,
    ) {
        let signature = compute_signature(SECRET.as_bytes(), &body, SignatureEncoding::Base64);
        prop_assert!(verify_signature(Some(SECRET), &body, Some(&signature), SignatureEncoding::Base64));

        let mut digest = base64_decode(&signature);
        digest[index] ^= 1 << bit;
        let tampered = base64_encode(&digest);
        prop_assert!(!verify_signature(Some(SECRET), &body, Some(&tampered), SignatureEncoding::Base64));
    }
}

fn base64_decode(s: &str) -> Vec<u8> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s).unwrap()
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
