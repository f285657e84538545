//! JSON POST helpers
//!
//! Thin wrappers around reqwest with an explicit per-request timeout. Every
//! relay endpoint has its own timeout class, so callers always pass one.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Response;
use serde::Serialize;

/// POST a serialisable payload as JSON.
pub async fn post_json<T: Serialize + ?Sized>(
    url: &str,
    payload: &T,
    timeout: Duration,
) -> Result<Response> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("build HTTP client")?;
    client
        .post(url)
        .json(payload)
        .send()
        .await
        .with_context(|| format!("POST {url}"))
}

/// POST a pre-encoded JSON body. Used where a transcript line must be
/// embedded verbatim without re-encoding.
pub async fn post_raw_json(url: &str, body: Vec<u8>, timeout: Duration) -> Result<Response> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("build HTTP client")?;
    client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .with_context(|| format!("POST {url}"))
}
