use device_webhook_ingest::{
    check_signature, compute_signature, signature_from_headers, SignatureEncoding,
};

fn main() {
    let secret = "supersecret";
    let payload = br#"{"events":[{"eventId":"evt_123"}]}"#;

    let signature = compute_signature(secret.as_bytes(), payload, SignatureEncoding::Base64);
    let headers = vec![
        ("Content-Type", "application/json"),
        ("x-signature", signature.as_str()),
    ];

    let presented = signature_from_headers(headers.iter().map(|(k, v)| (*k, *v)), "X-Signature");

    match check_signature(
        Some(secret),
        payload,
        presented.as_deref(),
        SignatureEncoding::Base64,
    ) {
        Ok(()) => println!("signature ok"),
        Err(err) => println!("rejected: {err}"),
    }
}
