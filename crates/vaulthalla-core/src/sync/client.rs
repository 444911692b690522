//! Blocking S3 client: SigV4-signed subset of the S3 HTTP API.
//!
//! Single-object PUT/GET/DELETE/HEAD, ListObjectsV2 with full
//! pagination, metadata replacement via copy-in-place, and multipart
//! upload with abort-on-failure. No retries at this layer; the sync
//! controller re-enqueues transient failures.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::{Client, Response};
use reqwest::Method;
use tracing::{debug, error};

use crate::config::S3Config;
use crate::crypto::hash::sha256_hex;
use crate::error::{Result, VaultError};
use crate::model::ApiKey;
use crate::storage::engine::RemoteFetcher;
use crate::sync::remote::{
    compose_complete_xml, parse_listing, parse_pagination, parse_upload_id, plan_parts,
    RemoteObject,
};
use crate::sync::sigv4::{self, SigningRequest, UNSIGNED_PAYLOAD};

/// Outcome of a credentials validation probe.
#[derive(Debug, Clone)]
pub struct ValidateResult {
    pub ok: bool,
    pub message: String,
}

/// The multipart wire operations, factored out so the orchestration
/// (sequencing, abort-on-failure) is testable without a network.
pub trait MultipartTransport {
    fn initiate(&self, key: &str) -> Result<String>;
    fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, data: &[u8])
        -> Result<String>;
    fn complete(&self, key: &str, upload_id: &str, etags: &[String]) -> Result<()>;
    fn abort(&self, key: &str, upload_id: &str) -> Result<()>;
}

/// Upload `body` in sequential parts; a failed part aborts the upload
/// and surfaces the failure.
pub fn multipart_upload(
    transport: &dyn MultipartTransport,
    key: &str,
    body: &[u8],
    part_size: u64,
) -> Result<()> {
    let upload_id = transport.initiate(key)?;
    let mut etags = Vec::new();

    for (index, (offset, len)) in plan_parts(body.len() as u64, part_size).iter().enumerate() {
        let part = &body[*offset as usize..(*offset + *len) as usize];
        match transport.upload_part(key, &upload_id, index as u32 + 1, part) {
            Ok(etag) => etags.push(etag),
            Err(e) => {
                if let Err(abort_err) = transport.abort(key, &upload_id) {
                    error!(%key, %upload_id, error = %abort_err, "multipart abort failed");
                }
                return Err(e);
            }
        }
    }

    if etags.is_empty() {
        transport.abort(key, &upload_id)?;
        return Err(VaultError::InvalidArgument(format!(
            "empty multipart body for {key}"
        )));
    }
    transport.complete(key, &upload_id, &etags)
}

/// SigV4-signing S3 client for one bucket.
pub struct S3Client {
    http: Client,
    key: ApiKey,
    bucket: String,
    part_timeout: Duration,
    multipart_threshold: u64,
    part_size: u64,
}

impl S3Client {
    pub fn new(key: ApiKey, bucket: String, cfg: &S3Config) -> Result<Self> {
        if key.secret_access_key.is_empty() {
            return Err(VaultError::InvalidArgument(
                "API key secret is empty".into(),
            ));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| VaultError::Fatal(format!("HTTP client init failed: {e}")))?;
        Ok(Self {
            http,
            key,
            bucket,
            part_timeout: Duration::from_secs(cfg.part_timeout_secs),
            multipart_threshold: cfg.multipart_threshold,
            part_size: cfg.part_size,
        })
    }

    /// Offline format checks, then a live ListBuckets probe. An
    /// access-denied response without a signature error still proves the
    /// credentials sign correctly.
    pub fn validate_credentials(&self) -> Result<ValidateResult> {
        let key_re = Regex::new("^[A-Za-z0-9/+=]{20,128}$").expect("static regex");
        let endpoint_re = Regex::new(
            r"^https?://([A-Za-z0-9.-]+|\d{1,3}(?:\.\d{1,3}){3})(:\d{1,5})?/?$",
        )
        .expect("static regex");

        let mut errors = String::new();
        if !key_re.is_match(&self.key.access_key) {
            errors.push_str("Access key format looks wrong (expect 20-128 chars).\n");
        }
        if !key_re.is_match(&self.key.secret_access_key) {
            errors.push_str("Secret access key format looks wrong (expect 20-128 chars).\n");
        }
        if !endpoint_re.is_match(&self.key.endpoint) {
            errors.push_str("Endpoint format looks wrong (expect https://<host>[:port]/).\n");
        }
        if !errors.is_empty() {
            return Ok(ValidateResult {
                ok: false,
                message: errors,
            });
        }

        match self.request(Method::GET, "/", "", UNSIGNED_PAYLOAD, &[], None, None) {
            Ok(_) => Ok(ValidateResult {
                ok: true,
                message: "Credentials validated (ListBuckets succeeded).".into(),
            }),
            Err(VaultError::PermissionDenied(_)) => Ok(ValidateResult {
                ok: true,
                message: "Credentials validated (auth OK, ListBuckets denied).".into(),
            }),
            Err(e) => Ok(ValidateResult {
                ok: false,
                message: format!("Auth probe failed: {e}"),
            }),
        }
    }

    /// Upload, choosing multipart above the configured threshold.
    pub fn upload(&self, key: &str, body: &[u8]) -> Result<()> {
        if body.len() as u64 > self.multipart_threshold {
            multipart_upload(self, key, body, self.part_size)
        } else {
            self.put_object(key, body, &[])
        }
    }

    pub fn put_object(&self, key: &str, body: &[u8], metadata: &[(String, String)]) -> Result<()> {
        let payload_hash = sha256_hex(body);
        let extra = meta_headers(metadata);
        self.request(
            Method::PUT,
            &self.object_path(key),
            "",
            &payload_hash,
            &extra,
            Some(body.to_vec()),
            None,
        )?;
        debug!(%key, bytes = body.len(), "uploaded object");
        Ok(())
    }

    pub fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self.request(
            Method::GET,
            &self.object_path(key),
            "",
            UNSIGNED_PAYLOAD,
            &[],
            None,
            None,
        )?;
        Ok(resp
            .bytes()
            .map_err(|e| VaultError::Transient(format!("body read failed: {e}")))?
            .to_vec())
    }

    pub fn delete_object(&self, key: &str) -> Result<()> {
        let payload_hash = sha256_hex(b"");
        self.request(
            Method::DELETE,
            &self.object_path(key),
            "",
            &payload_hash,
            &[],
            None,
            None,
        )?;
        Ok(())
    }

    /// Response headers of a HEAD, lowercased.
    pub fn head_object(&self, key: &str) -> Result<HashMap<String, String>> {
        let resp = self.request(
            Method::HEAD,
            &self.object_path(key),
            "",
            UNSIGNED_PAYLOAD,
            &[],
            None,
            None,
        )?;
        let mut out = HashMap::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                out.insert(name.as_str().to_ascii_lowercase(), v.trim().to_string());
            }
        }
        Ok(out)
    }

    /// Copy-in-place metadata replacement: the full desired
    /// `x-amz-meta-*` set plus the REPLACE directive.
    pub fn replace_metadata(&self, key: &str, metadata: &[(String, String)]) -> Result<()> {
        let mut extra = vec![
            (
                "x-amz-copy-source".to_string(),
                format!("/{}/{}", self.bucket, encode_key(key)),
            ),
            ("x-amz-metadata-directive".to_string(), "REPLACE".to_string()),
        ];
        extra.extend(meta_headers(metadata));
        self.request(
            Method::PUT,
            &self.object_path(key),
            "",
            UNSIGNED_PAYLOAD,
            &extra,
            None,
            None,
        )?;
        Ok(())
    }

    /// List every key under a prefix, following continuation tokens.
    pub fn list_objects(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut params: Vec<(String, String)> = Vec::new();
            if let Some(t) = &token {
                params.push(("continuation-token".into(), sigv4::uri_encode(t, false)));
            }
            params.push(("list-type".into(), "2".into()));
            if !prefix.is_empty() {
                params.push(("prefix".into(), sigv4::uri_encode(prefix, false)));
            }
            params.sort();
            let query = params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");

            let resp = self.request(
                Method::GET,
                &format!("/{}", self.bucket),
                &query,
                UNSIGNED_PAYLOAD,
                &[],
                None,
                None,
            )?;
            let body = resp
                .text()
                .map_err(|e| VaultError::Transient(format!("body read failed: {e}")))?;
            out.extend(parse_listing(&body)?);

            let page = parse_pagination(&body);
            if !page.truncated {
                break;
            }
            token = page.continuation_token;
        }
        Ok(out)
    }

    // --- internals -------------------------------------------------------

    fn object_path(&self, key: &str) -> String {
        format!("/{}/{}", self.bucket, encode_key(key))
    }

    fn endpoint(&self) -> &str {
        self.key.endpoint.trim_end_matches('/')
    }

    #[allow(clippy::too_many_arguments)]
    fn request(
        &self,
        method: Method,
        canonical_path: &str,
        canonical_query: &str,
        payload_hash: &str,
        extra_headers: &[(String, String)],
        body: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let (amz_date, date_stamp) = sigv4::timestamps_now();
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        headers.insert("host".into(), self.key.host().to_string());
        headers.insert("x-amz-content-sha256".into(), payload_hash.to_string());
        headers.insert("x-amz-date".into(), amz_date.clone());
        for (name, value) in extra_headers {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }

        let signing = SigningRequest {
            method: method.as_str(),
            canonical_path,
            canonical_query,
            headers: &headers,
            payload_hash,
            amz_date: &amz_date,
            date_stamp: &date_stamp,
            region: &self.key.region,
        };
        let auth = sigv4::authorization_header(
            &signing,
            &self.key.access_key,
            &self.key.secret_access_key,
        );

        let url = if canonical_query.is_empty() {
            format!("{}{}", self.endpoint(), canonical_path)
        } else {
            format!("{}{}?{}", self.endpoint(), canonical_path, canonical_query)
        };

        let mut builder = self
            .http
            .request(method, &url)
            .header("Authorization", auth)
            .header("Content-Type", "application/octet-stream");
        for (name, value) in &headers {
            if name != "host" {
                builder = builder.header(name, value);
            }
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let resp = builder.send().map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                VaultError::Transient(format!("request failed: {e}"))
            } else {
                VaultError::Io(format!("request failed: {e}"))
            }
        })?;
        classify_status(resp)
    }
}

impl MultipartTransport for S3Client {
    fn initiate(&self, key: &str) -> Result<String> {
        let resp = self.request(
            Method::POST,
            &self.object_path(key),
            "uploads=",
            UNSIGNED_PAYLOAD,
            &[],
            Some(Vec::new()),
            None,
        )?;
        let body = resp
            .text()
            .map_err(|e| VaultError::Transient(format!("body read failed: {e}")))?;
        parse_upload_id(&body)
            .ok_or_else(|| VaultError::Io(format!("no UploadId in initiate response for {key}")))
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> Result<String> {
        let query = format!(
            "partNumber={part_number}&uploadId={}",
            sigv4::uri_encode(upload_id, false)
        );
        let payload_hash = sha256_hex(data);
        let resp = self.request(
            Method::PUT,
            &self.object_path(key),
            &query,
            &payload_hash,
            &[],
            Some(data.to_vec()),
            Some(self.part_timeout),
        )?;
        resp.headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| VaultError::Io(format!("part {part_number} response had no ETag")))
    }

    fn complete(&self, key: &str, upload_id: &str, etags: &[String]) -> Result<()> {
        let body = compose_complete_xml(etags).into_bytes();
        let payload_hash = sha256_hex(&body);
        let query = format!("uploadId={}", sigv4::uri_encode(upload_id, false));
        self.request(
            Method::POST,
            &self.object_path(key),
            &query,
            &payload_hash,
            &[],
            Some(body),
            None,
        )?;
        Ok(())
    }

    fn abort(&self, key: &str, upload_id: &str) -> Result<()> {
        let payload_hash = sha256_hex(b"");
        let query = format!("uploadId={}", sigv4::uri_encode(upload_id, false));
        self.request(
            Method::DELETE,
            &self.object_path(key),
            &query,
            &payload_hash,
            &[],
            None,
            None,
        )?;
        Ok(())
    }
}

impl RemoteFetcher for S3Client {
    fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        self.get_object(key)
    }
}

/// Object keys are percent-encoded except forward slashes.
fn encode_key(key: &str) -> String {
    sigv4::uri_encode(key, true)
}

fn meta_headers(metadata: &[(String, String)]) -> Vec<(String, String)> {
    metadata
        .iter()
        .map(|(k, v)| (format!("x-amz-meta-{k}"), v.clone()))
        .collect()
}

fn classify_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let code = status.as_u16();
    let body = resp.text().unwrap_or_default();

    if code == 401 || code == 403 {
        let auth_broken = body.contains("SignatureDoesNotMatch")
            || body.contains("InvalidAccessKeyId")
            || body.contains("AuthFailure")
            || body.contains("XAmzContentSHA256Mismatch");
        if auth_broken {
            return Err(VaultError::Fatal(format!("signature rejected: {body}")));
        }
        return Err(VaultError::PermissionDenied(format!("HTTP {code}: {body}")));
    }
    if code == 404 {
        return Err(VaultError::NotFound(format!("HTTP 404: {body}")));
    }
    if code == 408 || code == 429 || status.is_server_error() {
        return Err(VaultError::Transient(format!("HTTP {code}: {body}")));
    }
    Err(VaultError::Io(format!("HTTP {code}: {body}")))
}
