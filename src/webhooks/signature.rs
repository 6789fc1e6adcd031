//! Webhook signature verification (HMAC-SHA256).
//!
//! GitHub signs each delivery with the shared secret and sends the digest in
//! `X-Hub-Signature-256` as `sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Decodes a `sha256=<hex>` header into digest bytes.
///
/// Returns `None` for a missing prefix or invalid hex.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Formats digest bytes as a header value.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Computes the header value GitHub would send for `payload`.
///
/// Returns `None` only if the HMAC rejects the key, which HMAC-SHA256 never
/// does.
pub fn sign(payload: &[u8], secret: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload);
    Some(format_signature_header(&mac.finalize().into_bytes()))
}

/// Verifies a delivery against the shared secret.
///
/// A missing secret, missing header, malformed header, or a digest of the
/// wrong length all verify `false`. The comparison itself is constant-time.
pub fn verify_signature(
    payload: &[u8],
    signature_header: Option<&str>,
    secret: Option<&[u8]>,
) -> bool {
    let (Some(header), Some(secret)) = (signature_header, secret) else {
        return false;
    };
    let Some(expected) = parse_signature_header(header) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SECRET: &[u8] = b"It's a Secret to Everybody";

    /// Vector from GitHub's "validating webhook deliveries" documentation.
    #[test]
    fn github_documentation_vector() {
        let header = "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert!(verify_signature(
            b"Hello, World!",
            Some(header),
            Some(SECRET)
        ));
    }

    #[test]
    fn missing_secret_never_verifies() {
        let header = sign(b"payload", SECRET).unwrap();
        assert!(!verify_signature(b"payload", Some(&header), None));
    }

    #[test]
    fn missing_header_never_verifies() {
        assert!(!verify_signature(b"payload", None, Some(SECRET)));
    }

    #[test]
    fn malformed_headers_fail() {
        for header in ["", "sha256=", "sha256=zz", "sha1=abcd", "abcd", "sha256=abc"] {
            assert!(
                !verify_signature(b"x", Some(header), Some(SECRET)),
                "{header:?} verified"
            );
        }
    }

    #[test]
    fn truncated_digest_fails() {
        let header = sign(b"payload", SECRET).unwrap();
        let truncated = &header[..header.len() - 2];
        assert!(!verify_signature(b"payload", Some(truncated), Some(SECRET)));
    }

    #[test]
    fn header_parsing() {
        assert_eq!(
            parse_signature_header("sha256=ABCD1234"),
            Some(vec![0xab, 0xcd, 0x12, 0x34])
        );
        assert_eq!(parse_signature_header("1234abcd"), None);
    }

    proptest! {
        #[test]
        fn signed_payload_verifies(payload: Vec<u8>) {
            let header = sign(&payload, SECRET).unwrap();
            prop_assert!(verify_signature(&payload, Some(&header), Some(SECRET)));
        }

        #[test]
        fn any_body_byte_flip_fails(payload in prop::collection::vec(any::<u8>(), 1..256), idx: prop::sample::Index, bit in 0u8..8) {
            let header = sign(&payload, SECRET).unwrap();
            let mut tampered = payload.clone();
            let i = idx.index(tampered.len());
            tampered[i] ^= 1 << bit;
            prop_assert!(!verify_signature(&tampered, Some(&header), Some(SECRET)));
        }

        #[test]
        fn any_signature_byte_flip_fails(payload: Vec<u8>, idx: prop::sample::Index, bit in 0u8..8) {
            let header = sign(&payload, SECRET).unwrap();
            let mut digest = parse_signature_header(&header).unwrap();
            let i = idx.index(digest.len());
            digest[i] ^= 1 << bit;
            let tampered = format_signature_header(&digest);
            prop_assert!(!verify_signature(&payload, Some(&tampered), Some(SECRET)));
        }

        #[test]
        fn arbitrary_headers_never_panic(header: String, payload: Vec<u8>) {
            let _ = verify_signature(&payload, Some(&header), Some(SECRET));
        }
    }
}
