//! AWS Signature Version 4 request signing.
//!
//! Pure string/HMAC composition, no I/O: the client hands in the
//! canonical pieces, this module returns the `Authorization` header. For
//! a fixed input tuple the output is bit-for-bit stable.

use std::collections::BTreeMap;

use crate::crypto::hash::{hmac_sha256, sha256_hex};

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const SERVICE: &str = "s3";
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Everything that goes into one signature.
///
/// `headers` must use lowercase names; `BTreeMap` keeps them in the
/// sorted order the canonical form requires. `canonical_path` is already
/// percent-encoded with slashes preserved; `canonical_query` is the
/// sorted, encoded query string without the leading `?`.
pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub canonical_path: &'a str,
    pub canonical_query: &'a str,
    pub headers: &'a BTreeMap<String, String>,
    pub payload_hash: &'a str,
    pub amz_date: &'a str,
    pub date_stamp: &'a str,
    pub region: &'a str,
}

/// `<date>/<region>/s3/aws4_request`.
pub fn credential_scope(date_stamp: &str, region: &str) -> String {
    format!("{date_stamp}/{region}/{SERVICE}/aws4_request")
}

/// The canonical request block.
pub fn canonical_request(req: &SigningRequest<'_>) -> String {
    let mut canonical_headers = String::new();
    for (name, value) in req.headers {
        canonical_headers.push_str(name);
        canonical_headers.push(':');
        canonical_headers.push_str(value.trim());
        canonical_headers.push('\n');
    }
    let signed = signed_headers(req.headers);
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        req.method, req.canonical_path, req.canonical_query, canonical_headers, signed,
        req.payload_hash
    )
}

/// Semicolon-joined sorted lowercase header names.
pub fn signed_headers(headers: &BTreeMap<String, String>) -> String {
    headers.keys().cloned().collect::<Vec<_>>().join(";")
}

/// The string-to-sign over a hashed canonical request.
pub fn string_to_sign(req: &SigningRequest<'_>, hashed_canonical: &str) -> String {
    format!(
        "{ALGORITHM}\n{}\n{}\n{}",
        req.amz_date,
        credential_scope(req.date_stamp, req.region),
        hashed_canonical
    )
}

/// `HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region), service), "aws4_request")`.
pub fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// The complete `Authorization` header value.
pub fn authorization_header(
    req: &SigningRequest<'_>,
    access_key: &str,
    secret: &str,
) -> String {
    let hashed = sha256_hex(canonical_request(req).as_bytes());
    let to_sign = string_to_sign(req, &hashed);
    let key = signing_key(secret, req.date_stamp, req.region, SERVICE);
    let signature = hex::encode(hmac_sha256(&key, to_sign.as_bytes()));

    format!(
        "{ALGORITHM} Credential={access_key}/{}, SignedHeaders={}, Signature={signature}",
        credential_scope(req.date_stamp, req.region),
        signed_headers(req.headers)
    )
}

/// AWS-style percent-encoding: unreserved characters pass through,
/// everything else becomes `%XX`. Forward slashes survive when encoding
/// object keys (`preserve_slash`), never in query values.
pub fn uri_encode(input: &str, preserve_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            b'/' if preserve_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// `(amz_date, date_stamp)` for the current instant.
pub fn timestamps_now() -> (String, String) {
    let now = chrono::Utc::now();
    (
        now.format("%Y%m%dT%H%M%SZ").to_string(),
        now.format("%Y%m%d").to_string(),
    )
}
