//! ListObjectsV2 response parsing.
//!
//! The S3 listing XML is regular enough that the controller extracts what
//! it needs with anchored regular expressions: `<Contents>` blocks with
//! key/size/modified, and the pagination markers.

use regex::Regex;

use crate::error::{Result, VaultError};

/// One remote object from a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub last_modified: i64,
}

/// Pagination state extracted from one response page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pagination {
    pub truncated: bool,
    pub continuation_token: Option<String>,
}

/// Parse the `<Contents>` entries of one response page.
pub fn parse_listing(xml: &str) -> Result<Vec<RemoteObject>> {
    let contents = Regex::new(r"(?s)<Contents>(.*?)</Contents>")
        .map_err(|e| VaultError::Io(format!("listing regex: {e}")))?;
    let key_re = Regex::new(r"<Key>([^<]+)</Key>").expect("static regex");
    let size_re = Regex::new(r"<Size>(\d+)</Size>").expect("static regex");
    let modified_re =
        Regex::new(r"<LastModified>([^<]+)</LastModified>").expect("static regex");

    let mut out = Vec::new();
    for block in contents.captures_iter(xml) {
        let body = &block[1];
        let Some(key) = key_re.captures(body).map(|c| c[1].to_string()) else {
            tracing::warn!("listing entry without <Key>, skipped");
            continue;
        };
        let size = size_re
            .captures(body)
            .and_then(|c| c[1].parse::<u64>().ok())
            .unwrap_or(0);
        let last_modified = modified_re
            .captures(body)
            .map(|c| parse_iso8601(&c[1]))
            .unwrap_or(0);
        out.push(RemoteObject {
            key: xml_unescape(&key),
            size,
            last_modified,
        });
    }
    Ok(out)
}

/// Extract pagination markers; mirrors the wire contract: listing
/// continues while `<IsTruncated>true</IsTruncated>` and a continuation
/// token are both present.
pub fn parse_pagination(xml: &str) -> Pagination {
    let truncated = xml.contains("<IsTruncated>true</IsTruncated>");
    let token = Regex::new(r"<NextContinuationToken>([^<]+)</NextContinuationToken>")
        .expect("static regex")
        .captures(xml)
        .map(|c| xml_unescape(&c[1]));
    Pagination {
        truncated: truncated && token.is_some(),
        continuation_token: token,
    }
}

/// Extract an `<UploadId>` from an initiate-multipart response.
pub fn parse_upload_id(xml: &str) -> Option<String> {
    Regex::new(r"<UploadId>([^<]+)</UploadId>")
        .expect("static regex")
        .captures(xml)
        .map(|c| xml_unescape(&c[1]))
}

/// Completion body enumerating parts 1..N in order with their ETags.
pub fn compose_complete_xml(etags: &[String]) -> String {
    let mut xml = String::from("<CompleteMultipartUpload>");
    for (i, etag) in etags.iter().enumerate() {
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            i + 1,
            etag
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

/// Sequential `(offset, length)` pairs covering `total` bytes.
pub fn plan_parts(total: u64, part_size: u64) -> Vec<(u64, u64)> {
    let mut parts = Vec::new();
    let mut offset = 0;
    while offset < total {
        let len = part_size.min(total - offset);
        parts.push((offset, len));
        offset += len;
    }
    parts
}

fn parse_iso8601(raw: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

fn xml_unescape(raw: &str) -> String {
    raw.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}
