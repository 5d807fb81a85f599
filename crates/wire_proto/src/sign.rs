//! In-place envelope signing.
//!
//! One algorithm, three parameterizations:
//!
//! * **service**: shared product key, full 32-hex signature, used for
//!   all service-to-service traffic.
//! * **client**: public key plus a fixed permutation of the digest,
//!   producing the shorter obfuscated signature clients carry.
//! * **auth**: the service parameters plus a timestamp freshness
//!   check; verifies the first frame on every new service connection.
//!
//! The signature is computed over the serialized buffer with the
//! `Sign` field holding a fixed-length placeholder, then patched into
//! the same byte range. This avoids a second serialization pass and
//! guarantees the signed bytes are exactly the bytes on the wire. The
//! placeholder reserves the byte length up front, so the signature
//! length is a constant of the parser instance regardless of payload.

use md5::{Digest, Md5};

use crate::error::ProtoError;
use crate::package::{current_timestamp, Package};

/// Allowed clock skew for auth envelopes, in seconds.
pub const AUTH_FRESHNESS_SECS: i64 = 5;

/// Placeholder for the full-length (service) signature; 32 bytes,
/// the width of a hex MD5 digest.
const SERVICE_PLACEHOLDER: &str = "00000000000000000000000000000000";

/// Placeholder for the permuted (client) signature; 16 bytes, the
/// width of [`CLIENT_SIGN_REF`].
const CLIENT_PLACEHOLDER: &str = "0000000000000000";

/// Permutation table for client-facing signatures: output position `k`
/// takes digit `CLIENT_SIGN_REF[k]` of the 32-hex MD5 digest. Must
/// match the table compiled into shipped clients.
pub const CLIENT_SIGN_REF: [usize; 16] = [5, 14, 2, 25, 9, 30, 18, 1, 27, 11, 6, 22, 31, 16, 29, 3];

/// Signs and verifies envelopes for one key/placeholder configuration.
#[derive(Debug, Clone)]
pub struct SignParser {
    key: String,
    placeholder: &'static str,
    ref_table: Option<&'static [usize]>,
    check_expiry: bool,
}

impl SignParser {
    /// Parser for service-to-service traffic.
    pub fn service(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            placeholder: SERVICE_PLACEHOLDER,
            ref_table: None,
            check_expiry: false,
        }
    }

    /// Parser for client-facing traffic: permuted, shorter signature.
    pub fn client(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            placeholder: CLIENT_PLACEHOLDER,
            ref_table: Some(&CLIENT_SIGN_REF),
            check_expiry: false,
        }
    }

    /// Parser for the first frame on a new service connection; adds
    /// the replay-protection freshness check.
    pub fn auth(key: impl Into<String>) -> Self {
        Self {
            check_expiry: true,
            ..Self::service(key)
        }
    }

    /// Byte length of every signature this parser produces.
    pub fn sign_len(&self) -> usize {
        self.placeholder.len()
    }

    /// Serializes and signs the envelope, returning the wire bytes.
    ///
    /// The envelope's `sign` field is left holding the final
    /// signature. The buffer must not be re-serialized afterwards;
    /// the signature covers these exact bytes.
    pub fn sign(&self, package: &mut Package) -> Result<Vec<u8>, ProtoError> {
        package.sign = self.placeholder.to_string();
        let mut buf = serde_json::to_vec(package)?;

        let (start, len) = locate_string_value(&buf, "Sign").ok_or(ProtoError::InvalidSign)?;
        if len != self.placeholder.len() {
            // The field held attacker-controlled bytes of a different
            // length; the patch would shift the document.
            return Err(ProtoError::InvalidSign);
        }
        buf[start..start + len].copy_from_slice(self.placeholder.as_bytes());

        let signature = self.digest(&buf);
        buf[start..start + len].copy_from_slice(signature.as_bytes());
        package.sign = signature;
        Ok(buf)
    }

    /// Verifies a received buffer and decodes the envelope.
    ///
    /// Recomputes the signature with the placeholder patched over the
    /// transmitted `Sign` value and compares. The auth variant also
    /// rejects envelopes whose `Ts` falls outside the freshness
    /// window, with a correct signature.
    pub fn verify(&self, buf: &[u8]) -> Result<Package, ProtoError> {
        let (start, len) = locate_string_value(buf, "Sign").ok_or(ProtoError::InvalidSign)?;
        if len != self.placeholder.len() {
            return Err(ProtoError::InvalidSign);
        }
        let transmitted = &buf[start..start + len];

        let mut scratch = buf.to_vec();
        scratch[start..start + len].copy_from_slice(self.placeholder.as_bytes());
        let expected = self.digest(&scratch);
        if expected.as_bytes() != transmitted {
            return Err(ProtoError::InvalidSign);
        }

        let package: Package = serde_json::from_slice(buf)?;
        if self.check_expiry {
            let skew = (current_timestamp() - package.ts).abs();
            if skew > AUTH_FRESHNESS_SECS {
                return Err(ProtoError::PackageExpired);
            }
        }
        Ok(package)
    }

    /// `MD5(key ‖ buffer)` as lowercase hex, remapped through the
    /// permutation table when one is configured.
    fn digest(&self, buf: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.key.as_bytes());
        hasher.update(buf);
        let hex_digest = hex::encode(hasher.finalize());
        match self.ref_table {
            Some(table) => {
                let digits = hex_digest.as_bytes();
                table.iter().map(|&i| digits[i] as char).collect()
            }
            None => hex_digest,
        }
    }
}

/// Streaming locator for a top-level string field's value bytes.
///
/// Scans the buffer once, tracking nesting depth and string state, and
/// returns the `(start, len)` of the content between the value's
/// quotes for the first top-level key equal to `key`. Strings are
/// consumed wholesale (with escape handling), so braces or key-lookalike
/// text inside nested values never confuse the scan. No full parse of
/// the document is performed.
fn locate_string_value(buf: &[u8], key: &str) -> Option<(usize, usize)> {
    let needle = key.as_bytes();
    let mut depth: usize = 0;
    let mut i = 0;

    while i < buf.len() {
        match buf[i] {
            b'{' | b'[' => {
                depth += 1;
                i += 1;
            }
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            b'"' => {
                let start = i + 1;
                let end = scan_string_end(buf, start)?;
                i = end + 1;
                if depth != 1 {
                    continue;
                }
                // A top-level string followed by ':' is a key.
                let mut j = i;
                while j < buf.len() && buf[j].is_ascii_whitespace() {
                    j += 1;
                }
                if j >= buf.len() || buf[j] != b':' {
                    continue;
                }
                let is_target = &buf[start..end] == needle;
                j += 1;
                while j < buf.len() && buf[j].is_ascii_whitespace() {
                    j += 1;
                }
                if is_target {
                    if j < buf.len() && buf[j] == b'"' {
                        let value_start = j + 1;
                        let value_end = scan_string_end(buf, value_start)?;
                        return Some((value_start, value_end - value_start));
                    }
                    // Target key with a non-string value.
                    return None;
                }
                // Consume a string value so it is not mistaken for
                // the next key.
                if j < buf.len() && buf[j] == b'"' {
                    let value_end = scan_string_end(buf, j + 1)?;
                    i = value_end + 1;
                } else {
                    i = j;
                }
            }
            _ => i += 1,
        }
    }
    None
}

/// Index of the closing quote of the string starting at `i` (which
/// must point just past the opening quote).
fn scan_string_end(buf: &[u8], mut i: usize) -> Option<usize> {
    while i < buf.len() {
        match buf[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Body<'a> {
        text: &'a str,
        value: i64,
    }

    fn sample(id: &str, text: &str) -> Package {
        let mut package = Package::with_body(id, &Body { text, value: 42 }).unwrap();
        package.ssid = "f7a2".into();
        package.server_name = "room1".into();
        package
    }

    #[test]
    fn sign_then_verify_round_trips() {
        for parser in [SignParser::service("product-key"), SignParser::client("public-key")] {
            let mut package = sample("room.C2S_Join", "hello");
            let buf = parser.sign(&mut package).unwrap();
            let verified = parser.verify(&buf).unwrap();
            assert_eq!(verified.id, "room.C2S_Join");
            assert_eq!(verified.sign, package.sign);
        }
    }

    #[test]
    fn any_flipped_byte_outside_sign_fails_verification() {
        let parser = SignParser::service("product-key");
        let mut package = sample("room.C2S_Join", "hello");
        let buf = parser.sign(&mut package).unwrap();
        let (start, len) = locate_string_value(&buf, "Sign").unwrap();

        for i in 0..buf.len() {
            if i >= start && i < start + len {
                continue;
            }
            let mut tampered = buf.clone();
            tampered[i] ^= 0x01;
            assert!(
                parser.verify(&tampered).is_err(),
                "flip at byte {i} was not detected"
            );
        }
    }

    #[test]
    fn tampered_sign_field_fails_verification() {
        let parser = SignParser::service("product-key");
        let mut package = sample("x", "y");
        let mut buf = parser.sign(&mut package).unwrap();
        let (start, _) = locate_string_value(&buf, "Sign").unwrap();
        buf[start] = if buf[start] == b'a' { b'b' } else { b'a' };
        assert!(matches!(parser.verify(&buf), Err(ProtoError::InvalidSign)));
    }

    #[test]
    fn signature_length_is_constant_per_parser() {
        let service = SignParser::service("k");
        let client = SignParser::client("k");
        for text in ["", "a", &"long ".repeat(500)] {
            let mut package = sample("id", text);
            let buf = service.sign(&mut package).unwrap();
            let (_, len) = locate_string_value(&buf, "Sign").unwrap();
            assert_eq!(len, service.sign_len());
            assert_eq!(len, 32);

            let mut package = sample("id", text);
            let buf = client.sign(&mut package).unwrap();
            let (_, len) = locate_string_value(&buf, "Sign").unwrap();
            assert_eq!(len, client.sign_len());
            assert_eq!(len, CLIENT_SIGN_REF.len());
        }
    }

    #[test]
    fn client_signature_is_the_permuted_digest() {
        let parser = SignParser::client("k");
        let mut package = sample("id", "body");
        parser.sign(&mut package).unwrap();

        let full = SignParser::service("k");
        let mut twin = sample("id", "body");
        // Service and client placeholders differ in length, so the
        // signed buffers differ; recompute the digest by hand over
        // the client-placeholder buffer instead.
        twin.sign = CLIENT_PLACEHOLDER.to_string();
        let buf = serde_json::to_vec(&twin).unwrap();
        let digest = full.digest(&buf);
        let expected: String = CLIENT_SIGN_REF
            .iter()
            .map(|&i| digest.as_bytes()[i] as char)
            .collect();
        assert_eq!(package.sign, expected);
    }

    #[test]
    fn stale_auth_envelope_is_rejected_despite_valid_signature() {
        let parser = SignParser::auth("product-key");
        let mut package = sample("Auth", "hello");
        package.ts = current_timestamp() - AUTH_FRESHNESS_SECS - 2;
        let buf = parser.sign(&mut package).unwrap();
        assert!(matches!(
            parser.verify(&buf),
            Err(ProtoError::PackageExpired)
        ));
    }

    #[test]
    fn fresh_auth_envelope_is_accepted() {
        let parser = SignParser::auth("product-key");
        let mut package = sample("Auth", "hello");
        package.ts = current_timestamp();
        let buf = parser.sign(&mut package).unwrap();
        assert!(parser.verify(&buf).is_ok());
    }

    #[test]
    fn locator_ignores_sign_lookalikes_inside_nested_data() {
        let mut package = Package::with_body(
            "id",
            &serde_json::json!({ "Sign": "decoy", "note": "\"Sign\":\"still a decoy\"" }),
        )
        .unwrap();
        let parser = SignParser::service("k");
        let buf = parser.sign(&mut package).unwrap();
        let (start, len) = locate_string_value(&buf, "Sign").unwrap();
        assert_eq!(&buf[start..start + len], package.sign.as_bytes());
        assert!(parser.verify(&buf).is_ok());
    }

    #[test]
    fn locator_handles_escaped_quotes_in_values() {
        let json = br#"{"Id":"a\"b","Sign":"abcd"}"#;
        let (start, len) = locate_string_value(json, "Sign").unwrap();
        assert_eq!(&json[start..start + len], b"abcd");
    }

    #[test]
    fn missing_sign_field_fails() {
        let parser = SignParser::service("k");
        assert!(matches!(
            parser.verify(br#"{"Id":"x"}"#),
            Err(ProtoError::InvalidSign)
        ));
    }

    #[test]
    fn wrong_length_sign_field_fails() {
        let parser = SignParser::service("k");
        assert!(matches!(
            parser.verify(br#"{"Id":"x","Sign":"short"}"#),
            Err(ProtoError::InvalidSign)
        ));
    }

    #[test]
    fn signing_is_deterministic() {
        let parser = SignParser::service("k");
        let mut a = sample("id", "same");
        let mut b = sample("id", "same");
        assert_eq!(parser.sign(&mut a).unwrap(), parser.sign(&mut b).unwrap());
    }
}
