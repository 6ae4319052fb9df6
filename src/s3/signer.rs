//! AWS Signature Version 4 signer
//!
//! The signature embeds a second-granularity timestamp and a security token
//! that may be rotated between retries, so signing happens once per physical
//! send attempt, never once per logical operation. The signer holds no
//! mutable state: credentials and the timestamp are supplied at call time,
//! making `sign` a pure function of its inputs.
//!
//! Known limitations, kept deliberately because the service verifies the
//! canonical form bit-for-bit:
//! - duplicate query keys sort by key only; ties are not resolved, so don't
//!   send duplicates
//! - duplicate header names are unrepresentable here; pre-join multi-value
//!   headers instead of passing a name twice

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::credentials::CredentialSet;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// SHA-256 hex digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// HMAC-SHA-256 returning a fixed-size array (no heap allocation).
pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(msg);
    let result = mac.finalize().into_bytes();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Lowercase-keyed header map ordered by name.
///
/// Multi-value headers are joined with `,` in canonical form and on the
/// wire; keys are lowercased on insert so the map order is already the
/// canonical order.
#[derive(Debug, Clone, Default)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any existing values.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    /// Append a value to a header.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.0
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// First value of a header, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate as `(name, comma-joined value)` pairs for the wire.
    pub fn flatten(&self) -> impl Iterator<Item = (&str, String)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v.join(",")))
    }
}

/// Canonical header block and the `;`-joined signed-header list.
///
/// Values are joined with `,`, embedded newlines become spaces, runs of
/// spaces collapse to one, and the block carries a trailing newline.
pub fn canonicalized_headers(headers: &Headers) -> (String, String) {
    let mut block = String::with_capacity(headers.0.len() * 64);
    let mut names = String::with_capacity(headers.0.len() * 20);
    for (name, values) in &headers.0 {
        let joined = values.join(",").replace('\n', " ");
        block.push_str(name);
        block.push(':');
        block.push_str(&squeeze_spaces(joined.trim()));
        block.push('\n');
        if !names.is_empty() {
            names.push(';');
        }
        names.push_str(name);
    }
    (block, names)
}

/// Canonical query string: pairs split on the first `=`, stable-sorted by
/// key only. A valueless parameter (`?uploads`) canonicalizes to `key=`.
pub fn canonical_query_string(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<(&str, &str)> = query
        .split('&')
        .map(|pair| match pair.find('=') {
            Some(pos) => (&pair[..pos], &pair[pos + 1..]),
            None => (pair, ""),
        })
        .collect();
    pairs.sort_by_key(|&(k, _)| k);
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Six-line canonical request plus the signed-header list.
pub fn canonical_request(
    verb: &str,
    uri_path: &str,
    query: &str,
    headers: &Headers,
    payload_hash: &str,
) -> (String, String) {
    let (canonical_headers, signed_headers) = canonicalized_headers(headers);
    let path = if uri_path.is_empty() { "/" } else { uri_path };
    (
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            verb,
            path,
            canonical_query_string(query),
            canonical_headers,
            signed_headers,
            payload_hash
        ),
        signed_headers,
    )
}

/// AWS Signature V4 signer for one region/service pair.
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    region: String,
    service: String,
}

impl SigV4Signer {
    pub fn new(region: impl Into<String>) -> Self {
        Self::for_service(region, "s3")
    }

    pub fn for_service(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
        }
    }

    /// Sign a request, hashing the payload here.
    pub fn sign(
        &self,
        verb: &str,
        url: &str,
        headers: Headers,
        payload: &[u8],
        creds: &CredentialSet,
        now: DateTime<Utc>,
    ) -> Headers {
        let payload_hash = sha256_hex(payload);
        self.sign_with_hash(verb, url, headers, &payload_hash, creds, now)
    }

    /// Sign a request with a pre-computed payload hash.
    ///
    /// Injects `host`, `x-amz-date`, `x-amz-security-token` (empty string
    /// when the credential set has none, never omitted, so the signed set
    /// is identical with and without a token) and `x-amz-content-sha256`
    /// before canonicalizing, then adds the `authorization` header.
    pub fn sign_with_hash(
        &self,
        verb: &str,
        url: &str,
        mut headers: Headers,
        payload_hash: &str,
        creds: &CredentialSet,
        now: DateTime<Utc>,
    ) -> Headers {
        let (host, path, query) = parse_url(url);
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        headers.set("host", host);
        headers.set("x-amz-date", &amz_date);
        headers.set(
            "x-amz-security-token",
            creds.security_token.as_deref().unwrap_or(""),
        );
        headers.set("x-amz-content-sha256", payload_hash);

        let (canonical, signed_headers) =
            canonical_request(verb, path, query, &headers, payload_hash);
        let (string_to_sign, scope) =
            self.string_to_sign(&amz_date, &sha256_hex(canonical.as_bytes()));
        let signing_key = self.signing_key(&creds.secret_access_key, &date_stamp);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, creds.access_key_id, scope, signed_headers, signature
        );
        headers.set("authorization", authorization);
        headers
    }

    /// String-to-sign and its credential scope.
    pub fn string_to_sign(&self, amz_date: &str, canonical_request_hash: &str) -> (String, String) {
        let scope = format!(
            "{}/{}/{}/aws4_request",
            &amz_date[..8],
            self.region,
            self.service
        );
        (
            format!(
                "{}\n{}\n{}\n{}",
                ALGORITHM, amz_date, scope, canonical_request_hash
            ),
            scope,
        )
    }

    /// Derive the signing key: four chained HMAC operations.
    pub fn signing_key(&self, secret: &str, date_stamp: &str) -> [u8; 32] {
        let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }
}

fn squeeze_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_space = false;
    for ch in s.chars() {
        if ch == ' ' {
            if !prev_space {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(ch);
            prev_space = false;
        }
    }
    out
}

/// URL component extraction without heap allocation.
///
/// Returns `(host, path, query)` as slices into the original URL, with
/// default ports (:443 for https, :80 for http) stripped from the host.
fn parse_url(url: &str) -> (&str, &str, &str) {
    let after_scheme = if let Some(rest) = url.strip_prefix("https://") {
        rest
    } else if let Some(rest) = url.strip_prefix("http://") {
        rest
    } else {
        url
    };

    let (authority, path_and_query) = match after_scheme.find('/') {
        Some(pos) => (&after_scheme[..pos], &after_scheme[pos..]),
        None => (after_scheme, "/"),
    };

    let (path, query) = match path_and_query.find('?') {
        Some(pos) => (&path_and_query[..pos], &path_and_query[pos + 1..]),
        None => (path_and_query, ""),
    };

    let host = if url.starts_with("https") {
        authority.strip_suffix(":443").unwrap_or(authority)
    } else {
        authority.strip_suffix(":80").unwrap_or(authority)
    };

    (host, path, query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn example_creds() -> CredentialSet {
        CredentialSet::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            None,
        )
    }

    #[test]
    fn test_parse_url() {
        assert_eq!(
            parse_url("https://bucket.s3.amazonaws.com/key?uploads"),
            ("bucket.s3.amazonaws.com", "/key", "uploads")
        );
        assert_eq!(parse_url("https://host:443/path"), ("host", "/path", ""));
        assert_eq!(parse_url("https://host"), ("host", "/", ""));
    }

    #[test]
    fn test_canonical_query_sorting() {
        assert_eq!(canonical_query_string(""), "");
        assert_eq!(canonical_query_string("zebra=1&alpha=2"), "alpha=2&zebra=1");
        assert_eq!(canonical_query_string("uploads"), "uploads=");
        assert_eq!(
            canonical_query_string("uploadId=abc&partNumber=3"),
            "partNumber=3&uploadId=abc"
        );
    }

    #[test]
    fn test_header_canonicalization_sorts_and_lowercases() {
        let mut headers = Headers::new();
        headers.set("X-Amz-Date", "d");
        headers.set("host", "h");
        headers.set("X-Amz-Content-Sha256", "s");

        let (block, signed) = canonicalized_headers(&headers);
        assert_eq!(block, "host:h\nx-amz-content-sha256:s\nx-amz-date:d\n");
        assert_eq!(signed, "host;x-amz-content-sha256;x-amz-date");
    }

    #[test]
    fn test_header_values_are_cleaned() {
        let mut headers = Headers::new();
        headers.set("a", "  spaced   out\nvalue  ");
        headers.add("b", "one");
        headers.add("b", "two");

        let (block, _) = canonicalized_headers(&headers);
        assert_eq!(block, "a:spaced out value\nb:one,two\n");
    }

    // Vectors from the AWS Signature Version 4 documentation
    // (GET https://iam.amazonaws.com/?Action=ListUsers&Version=2010-05-08
    // at 20150830T123600Z).

    #[test]
    fn test_canonical_request_matches_reference() {
        let mut headers = Headers::new();
        headers.set("host", "iam.amazonaws.com");
        headers.set(
            "content-type",
            "application/x-www-form-urlencoded; charset=utf-8",
        );
        headers.set("x-amz-date", "20150830T123600Z");

        let (canonical, signed) = canonical_request(
            "GET",
            "/",
            "Action=ListUsers&Version=2010-05-08",
            &headers,
            &sha256_hex(b""),
        );
        assert_eq!(signed, "content-type;host;x-amz-date");
        assert_eq!(
            sha256_hex(canonical.as_bytes()),
            "f536975d06c0309214f805bb90ccff089219ecd68b2577efef23edd43b7e1a59"
        );
    }

    #[test]
    fn test_signing_key_matches_reference() {
        let signer = SigV4Signer::for_service("us-east-1", "iam");
        let key = signer.signing_key("wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY", "20150830");
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn test_signature_matches_reference() {
        let signer = SigV4Signer::for_service("us-east-1", "iam");
        let (string_to_sign, scope) = signer.string_to_sign(
            "20150830T123600Z",
            "f536975d06c0309214f805bb90ccff089219ecd68b2577efef23edd43b7e1a59",
        );
        assert_eq!(scope, "20150830/us-east-1/iam/aws4_request");

        let key = signer.signing_key("wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY", "20150830");
        assert_eq!(
            hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())),
            "5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        );
    }

    #[test]
    fn test_sign_is_deterministic_for_fixed_timestamp() {
        let signer = SigV4Signer::new("us-east-1");
        let creds = example_creds();
        let now = Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap();

        let a = signer.sign(
            "PUT",
            "https://bucket.s3.amazonaws.com/stage/file.gz",
            Headers::new(),
            b"payload",
            &creds,
            now,
        );
        let b = signer.sign(
            "PUT",
            "https://bucket.s3.amazonaws.com/stage/file.gz",
            Headers::new(),
            b"payload",
            &creds,
            now,
        );
        assert_eq!(a.get("authorization"), b.get("authorization"));
        assert!(a
            .get("authorization")
            .unwrap()
            .starts_with("AWS4-HMAC-SHA256 "));
    }

    #[test]
    fn test_sign_injects_required_headers() {
        let signer = SigV4Signer::new("us-west-2");
        let now = Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap();
        let signed = signer.sign(
            "HEAD",
            "https://bucket.s3.amazonaws.com/key",
            Headers::new(),
            b"",
            &example_creds(),
            now,
        );

        assert_eq!(signed.get("host"), Some("bucket.s3.amazonaws.com"));
        assert_eq!(signed.get("x-amz-date"), Some("20210601T120000Z"));
        // Empty string when no token, never omitted.
        assert_eq!(signed.get("x-amz-security-token"), Some(""));
        assert!(signed.get("x-amz-content-sha256").is_some());
        let auth = signed.get("authorization").unwrap();
        assert!(auth.contains(
            "SignedHeaders=host;x-amz-content-sha256;x-amz-date;x-amz-security-token"
        ));
    }

    #[test]
    fn test_token_changes_signature() {
        let signer = SigV4Signer::new("us-east-1");
        let now = Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap();
        let without = signer.sign(
            "GET",
            "https://b.s3.amazonaws.com/k",
            Headers::new(),
            b"",
            &example_creds(),
            now,
        );
        let mut creds = example_creds();
        creds.security_token = Some("fresh-token".to_string());
        let with = signer.sign(
            "GET",
            "https://b.s3.amazonaws.com/k",
            Headers::new(),
            b"",
            &creds,
            now,
        );
        assert_ne!(without.get("authorization"), with.get("authorization"));
    }
}
