//! Session Enrollment
//!
//! Registers a relay session with the server and blocks until the user
//! approves it on their phone (long-poll, 65 s). A filesystem marker keyed
//! by relay id makes enrollment idempotent across hook invocations; a 401
//! from any later request clears the marker so the next attempt re-enrolls.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::http;
use crate::settings;

const ENROLL_TIMEOUT: Duration = Duration::from_secs(65);

#[derive(Debug, Deserialize)]
struct EnrollResponse {
    approved: bool,
    #[serde(default)]
    message: Option<String>,
}

/// POST `/session/enroll` and wait for the user's verdict.
pub async fn enroll(
    base: &str,
    device_id: &str,
    relay_id: &str,
    project: Option<&str>,
) -> Result<()> {
    let mut payload = json!({
        "device_id": device_id,
        "session_id": relay_id,
    });
    if let Some(project) = project.filter(|p| !p.is_empty()) {
        payload["project"] = json!(project);
    }

    let response = http::post_json(&format!("{base}/session/enroll"), &payload, ENROLL_TIMEOUT)
        .await
        .context("enrollment request failed")?;

    let status = response.status().as_u16();
    if status != 200 {
        bail!("enrollment rejected (HTTP {status})");
    }

    let result: EnrollResponse = response
        .json()
        .await
        .context("failed to decode enrollment response")?;
    if !result.approved {
        match result.message {
            Some(message) if !message.is_empty() => bail!("session enrollment {message}"),
            _ => bail!("session enrollment rejected"),
        }
    }

    info!(relay_id, "session enrolled");
    Ok(())
}

/// Enroll unless the marker for this relay id already exists; create the
/// marker on success.
pub async fn ensure_enrolled(
    base: &str,
    device_id: &str,
    relay_id: &str,
    project: Option<&str>,
) -> Result<()> {
    let marker = settings::enrollment_marker_path(relay_id);
    if marker.exists() {
        return Ok(());
    }
    enroll(base, device_id, relay_id, project).await?;
    let _ = std::fs::write(&marker, b"");
    Ok(())
}

/// Remove the marker so the next `ensure_enrolled` actually runs.
pub fn clear_enrollment_marker(relay_id: &str) {
    let _ = std::fs::remove_file(settings::enrollment_marker_path(relay_id));
}
