//! AWS Signature V4 request signing
//!
//! Signs outgoing requests to the object store. Reference:
//! https://docs.aws.amazon.com/AmazonS3/latest/API/sig-v4-authenticating-requests.html

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::credentials::Credentials;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of an empty payload, used for GET/DELETE requests
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// One request about to be signed
pub struct SigningRequest<'a> {
    /// HTTP method, uppercase
    pub method: &'a str,
    /// Host header value (authority, including any port)
    pub host: &'a str,
    /// URI path, not yet URI-encoded
    pub path: &'a str,
    /// Query parameters, not yet URI-encoded
    pub query: &'a [(String, String)],
    /// Headers to carry and sign, beyond host/x-amz-date/token
    pub headers: &'a [(String, String)],
    /// Hex SHA-256 of the request payload
    pub payload_sha256: &'a str,
    pub credentials: &'a Credentials,
    pub timestamp: DateTime<Utc>,
}

/// AWS Signature V4 signer
pub struct RequestSigner {
    region: String,
    service: String,
}

impl RequestSigner {
    /// Create a signer for `region`. The service is `s3`.
    pub fn new(region: impl Into<String>) -> Self {
        Self::for_service(region, "s3")
    }

    /// Create a signer for an arbitrary service (used by the credential
    /// refresher and by tests against the published example vectors).
    pub fn for_service(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
        }
    }

    /// Sign a request. Returns the complete header set to attach: the
    /// caller's headers plus `x-amz-date`, the session token when present,
    /// and `authorization`. The `host` header is signed but not returned;
    /// the HTTP client supplies it from the URL.
    pub fn sign(&self, req: &SigningRequest<'_>) -> Vec<(String, String)> {
        let amz_date = req.timestamp.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = req.timestamp.format("%Y%m%d").to_string();

        // Canonical headers: lowercase names, trimmed values, sorted.
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        headers.insert("host".to_string(), req.host.trim().to_string());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        if let Some(token) = &req.credentials.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }
        for (name, value) in req.headers {
            headers.insert(name.to_lowercase(), value.trim().to_string());
        }

        let signed_headers: String = headers
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            req.method,
            uri_encode_path(req.path),
            canonical_query_string(req.query),
            canonical_headers,
            signed_headers,
            req.payload_sha256
        );

        let credential_scope = format!(
            "{date_stamp}/{}/{}/aws4_request",
            self.region, self.service
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &req.credentials.secret_key,
            &date_stamp,
            &self.region,
            &self.service,
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            req.credentials.access_key
        );

        let mut out: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(k, _)| k != "host")
            .collect();
        out.push(("authorization".to_string(), authorization));
        out
    }
}

/// Derive the per-day signing key
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = format!("AWS4{secret_key}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Sorted, URI-encoded query string
pub(crate) fn canonical_query_string(query: &[(String, String)]) -> String {
    let mut params: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    params.sort();
    params
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// URI-encode a string (AWS style: unreserved characters pass through)
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{byte:02X}")),
        }
    }
    result
}

/// URI-encode a path, keeping segment separators
pub(crate) fn uri_encode_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn example_credentials() -> Credentials {
        Credentials {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        }
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("hello"), "hello");
        assert_eq!(uri_encode("hello world"), "hello%20world");
        assert_eq!(uri_encode("a/b"), "a%2Fb");
        assert_eq!(uri_encode("a~b-c_d.e"), "a~b-c_d.e");
    }

    #[test]
    fn test_uri_encode_path_keeps_slashes() {
        assert_eq!(uri_encode_path("/bucket/blk/000"), "/bucket/blk/000");
        assert_eq!(uri_encode_path("/b/a b"), "/b/a%20b");
        assert_eq!(uri_encode_path(""), "/");
    }

    #[test]
    fn test_canonical_query_sorted() {
        let q = vec![
            ("list-type".to_string(), "2".to_string()),
            ("continuation-token".to_string(), "a+b".to_string()),
        ];
        assert_eq!(
            canonical_query_string(&q),
            "continuation-token=a%2Bb&list-type=2"
        );
    }

    #[test]
    fn test_signing_key_length() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY",
            "20130524",
            "us-east-1",
            "s3",
        );
        assert_eq!(key.len(), 32);
    }

    /// The published SigV4 example: GET iam ListUsers, 2015-08-30.
    #[test]
    fn test_published_example_vector() {
        let signer = RequestSigner::for_service("us-east-1", "iam");
        let creds = example_credentials();
        let query = vec![
            ("Action".to_string(), "ListUsers".to_string()),
            ("Version".to_string(), "2010-05-08".to_string()),
        ];
        let headers = vec![(
            "content-type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        )];
        let signed = signer.sign(&SigningRequest {
            method: "GET",
            host: "iam.amazonaws.com",
            path: "/",
            query: &query,
            headers: &headers,
            payload_sha256: EMPTY_PAYLOAD_SHA256,
            credentials: &creds,
            timestamp: Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap(),
        });

        let auth = signed
            .iter()
            .find(|(k, _)| k == "authorization")
            .map(|(_, v)| v.as_str())
            .unwrap();
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request"
        ));
        assert!(auth.contains("SignedHeaders=content-type;host;x-amz-date"));
        assert!(auth.ends_with(
            "Signature=5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        ));
    }

    #[test]
    fn test_session_token_is_signed() {
        let signer = RequestSigner::new("us-east-1");
        let creds = Credentials {
            access_key: "AKID".to_string(),
            secret_key: "secret".to_string(),
            session_token: Some("tok123".to_string()),
        };
        let signed = signer.sign(&SigningRequest {
            method: "GET",
            host: "bucket.example.com",
            path: "/k",
            query: &[],
            headers: &[],
            payload_sha256: EMPTY_PAYLOAD_SHA256,
            credentials: &creds,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        });

        assert!(signed
            .iter()
            .any(|(k, v)| k == "x-amz-security-token" && v == "tok123"));
        let auth = &signed.iter().find(|(k, _)| k == "authorization").unwrap().1;
        assert!(auth.contains("x-amz-security-token"));
    }
}
