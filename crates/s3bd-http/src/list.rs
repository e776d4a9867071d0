//! Bucket listing
//!
//! ListObjectsV2 response parsing. The client pages through the bucket
//! with continuation tokens and feeds each key through the key layout.

use serde::Deserialize;

use s3bd_common::{Error, Result};

/// One `<Contents>` element
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListEntry {
    pub key: String,
}

/// A `<ListBucketResult>` page
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListBucketResult {
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(default)]
    pub next_continuation_token: Option<String>,
    #[serde(default)]
    pub contents: Vec<ListEntry>,
}

/// Parse one list page
pub fn parse_list_response(xml: &str) -> Result<ListBucketResult> {
    quick_xml::de::from_str(xml).map_err(|e| Error::Io(format!("malformed list response: {e}")))
}
