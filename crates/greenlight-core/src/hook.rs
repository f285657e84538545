//! Hook Dispatcher
//!
//! Converts one hook event on standard input into at most one structured
//! decision on standard output. Permission requests long-poll the relay
//! until the user answers on their phone; a 401 clears the enrollment
//! marker and retries exactly once. Every local failure becomes a deny
//! envelope with exit code 0, because the hosted program treats a non-zero
//! exit as a different signal entirely.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::enroll;
use crate::http;
use crate::sessions;
use crate::settings::{self, Settings, AGENT_NAME};
use crate::spawn;

/// Permission long-poll: just under the hosted program's own hook timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(595);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// One hook event as received from the hosted program.
#[derive(Debug, Default, Deserialize)]
pub struct HookEvent {
    #[serde(default)]
    pub hook_event_name: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub transcript_path: String,
    #[serde(default)]
    pub notification_type: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub title: String,
}

/// Everything the dispatcher needs from the process environment, resolved
/// once so the dispatch logic itself stays testable.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    /// Relay HTTP base URL; empty means unconfigured.
    pub base_url: String,
    pub device_id: Option<String>,
    pub project: Option<String>,
    /// `GREENLIGHT_SESSION_ID` from the environment.
    pub relay_id_env: Option<String>,
    /// `CLAUDE_ENV_FILE`: environment-propagation file of the hosted program.
    pub env_file: Option<PathBuf>,
    /// `GREENLIGHT_BRIDGE`: bridge file path when the host is connected.
    pub bridge_path: Option<String>,
    /// Resolved path of this binary, for spawning the streamer.
    pub exe_path: Option<PathBuf>,
    /// Where the conversation → relay map lives.
    pub sessions_path: Option<PathBuf>,
}

impl HookContext {
    pub fn from_env(settings: &Settings) -> Self {
        let nonempty = |v: String| if v.is_empty() { None } else { Some(v) };
        Self {
            base_url: settings.server_base_url().unwrap_or_default(),
            device_id: settings::resolve_device_id(None),
            project: settings::resolve_project(None),
            relay_id_env: std::env::var("GREENLIGHT_SESSION_ID").ok().and_then(nonempty),
            env_file: std::env::var("CLAUDE_ENV_FILE")
                .ok()
                .and_then(nonempty)
                .map(PathBuf::from),
            bridge_path: std::env::var("GREENLIGHT_BRIDGE").ok().and_then(nonempty),
            exe_path: std::env::current_exe()
                .ok()
                .map(|exe| std::fs::canonicalize(&exe).unwrap_or(exe)),
            sessions_path: settings::config_dir().map(|dir| dir.join("sessions.json")),
        }
    }
}

/// What a hook invocation produces: a decision envelope for stdout, or
/// nothing (activity-style events).
#[derive(Debug, PartialEq)]
pub enum HookAction {
    Emit(DecisionEnvelope),
    Silent,
}

// ========== Decision envelope ==========

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionEnvelope {
    #[serde(rename = "hookSpecificOutput")]
    pub hook_specific_output: HookSpecificOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookSpecificOutput {
    #[serde(rename = "hookEventName")]
    pub hook_event_name: String,
    pub decision: Decision,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub behavior: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "updatedInput", skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<bool>,
}

impl DecisionEnvelope {
    fn wrap(decision: Decision) -> Self {
        Self {
            hook_specific_output: HookSpecificOutput {
                hook_event_name: "PermissionRequest".to_string(),
                decision,
            },
        }
    }

    pub fn allow() -> Self {
        Self::wrap(Decision {
            behavior: "allow".to_string(),
            message: None,
            updated_input: None,
            interrupt: None,
        })
    }

    pub fn allow_with(updated_input: Value) -> Self {
        Self::wrap(Decision {
            behavior: "allow".to_string(),
            message: None,
            updated_input: Some(updated_input),
            interrupt: None,
        })
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::wrap(Decision {
            behavior: "deny".to_string(),
            message: Some(message.into()),
            updated_input: None,
            interrupt: None,
        })
    }

    pub fn deny_interrupt(message: impl Into<String>) -> Self {
        Self::wrap(Decision {
            behavior: "deny".to_string(),
            message: Some(message.into()),
            updated_input: None,
            interrupt: Some(true),
        })
    }
}

/// Verdict returned by the relay for a permission request.
#[derive(Debug, Deserialize)]
struct ServerDecision {
    #[serde(default)]
    behavior: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    updated_input: Option<Value>,
    #[serde(default)]
    interrupt: bool,
    #[serde(default)]
    error: String,
}

// ========== Dispatch ==========

/// Classify one event and produce its action. Never returns more than one
/// decision, and never fails: every error path is a deny envelope.
pub async fn run_hook(ctx: &HookContext, raw_input: &[u8]) -> HookAction {
    if ctx.base_url.is_empty() {
        return HookAction::Emit(DecisionEnvelope::deny(
            "Greenlight server not configured (no relay URL)",
        ));
    }
    let Some(device_id) = ctx.device_id.clone().filter(|v| !v.is_empty()) else {
        return HookAction::Emit(DecisionEnvelope::deny(
            "Greenlight device ID not configured. Run: greenlight register DEVICE_ID",
        ));
    };
    let Some(project) = ctx.project.clone().filter(|v| !v.is_empty()) else {
        return HookAction::Emit(DecisionEnvelope::deny(
            "Greenlight project not configured. Run: greenlight connect --project PROJECT_NAME",
        ));
    };

    let mut event: HookEvent = match serde_json::from_slice(raw_input) {
        Ok(event) => event,
        Err(e) => {
            return HookAction::Emit(DecisionEnvelope::deny(format!(
                "Failed to parse hook input: {e}"
            )))
        }
    };
    if event.hook_event_name.is_empty() {
        event.hook_event_name = "PermissionRequest".to_string();
    }

    // The host exports the relay id into our environment; a hook fired
    // outside a relayed session falls back to the conversation's own id.
    let relay_id = ctx
        .relay_id_env
        .clone()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| event.session_id.clone());

    debug!(
        event = %event.hook_event_name,
        session = %event.session_id,
        relay = %relay_id,
        "hook event"
    );

    match event.hook_event_name.as_str() {
        "SessionStart" => session_start(ctx, &device_id, &project, &relay_id, &event).await,
        "PermissionRequest" => {
            permission_request(ctx, &device_id, &project, &relay_id, &event, raw_input).await
        }
        "Notification" => notification(ctx, &device_id, &project, &relay_id, &event),
        _ => HookAction::Silent,
    }
}

async fn session_start(
    ctx: &HookContext,
    device_id: &str,
    project: &str,
    relay_id: &str,
    event: &HookEvent,
) -> HookAction {
    if let Some(env_file) = &ctx.env_file {
        append_env_exports(env_file, relay_id, project);
    }
    if relay_id.is_empty() {
        return HookAction::Silent;
    }

    if let Err(e) = enroll::ensure_enrolled(&ctx.base_url, device_id, relay_id, Some(project)).await
    {
        warn!(error = %e, "session enrollment failed");
        return HookAction::Silent;
    }

    let activity = json!({
        "device_id": device_id,
        "event": "session_start",
        "tool_name": "SessionStart",
        "tool_input": {},
        "project": project,
        "relay_id": relay_id,
        "agent": AGENT_NAME,
    });
    let activity_url = format!("{}/activity", ctx.base_url);
    tokio::spawn(async move {
        let _ = http::post_json(&activity_url, &activity, ACTIVITY_TIMEOUT).await;
    });

    // Resumed conversations must come back to the same relay id.
    if !event.session_id.is_empty() {
        if let Some(path) = &ctx.sessions_path {
            sessions::save_in(path, &event.session_id, relay_id);
        }
    }

    if !event.transcript_path.is_empty() {
        let session_id = if event.session_id.is_empty() {
            relay_id
        } else {
            &event.session_id
        };
        maybe_start_streamer(
            ctx,
            device_id,
            project,
            relay_id,
            session_id,
            &event.transcript_path,
        );
    }

    HookAction::Silent
}

async fn permission_request(
    ctx: &HookContext,
    device_id: &str,
    project: &str,
    relay_id: &str,
    event: &HookEvent,
    raw_input: &[u8],
) -> HookAction {
    if !relay_id.is_empty() && !event.transcript_path.is_empty() {
        let _ =
            enroll::ensure_enrolled(&ctx.base_url, device_id, relay_id, Some(project)).await;
        let session_id = if event.session_id.is_empty() {
            relay_id
        } else {
            &event.session_id
        };
        maybe_start_streamer(
            ctx,
            device_id,
            project,
            relay_id,
            session_id,
            &event.transcript_path,
        );
    }

    // Forward the original input with our metadata merged in; the shape of
    // tool_input is opaque and must survive untouched.
    let mut payload = match serde_json::from_slice::<Value>(raw_input) {
        Ok(Value::Object(map)) => map,
        _ => {
            return HookAction::Emit(DecisionEnvelope::deny("Failed to parse hook input"));
        }
    };
    payload.insert("device_id".to_string(), json!(device_id));
    payload.insert("project".to_string(), json!(project));
    payload.insert("relay_id".to_string(), json!(relay_id));
    payload.insert("agent".to_string(), json!(AGENT_NAME));
    let payload = Value::Object(payload);

    let request_url = format!("{}/request", ctx.base_url);
    let mut response = match http::post_json(&request_url, &payload, REQUEST_TIMEOUT).await {
        Ok(response) => response,
        Err(_) => {
            return HookAction::Emit(DecisionEnvelope::deny_interrupt(
                "Failed to reach Greenlight server (timeout or connection error)",
            ));
        }
    };

    // Session unknown to the server: re-enroll once and retry.
    if response.status().as_u16() == 401 && !relay_id.is_empty() {
        enroll::clear_enrollment_marker(relay_id);
        if enroll::ensure_enrolled(&ctx.base_url, device_id, relay_id, Some(project))
            .await
            .is_err()
        {
            return HookAction::Emit(DecisionEnvelope::deny(
                "Greenlight session enrollment was rejected",
            ));
        }
        response = match http::post_json(&request_url, &payload, REQUEST_TIMEOUT).await {
            Ok(response) => response,
            Err(_) => {
                return HookAction::Emit(DecisionEnvelope::deny_interrupt(
                    "Failed to reach Greenlight server (timeout or connection error)",
                ));
            }
        };
    }

    let status = response.status().as_u16();
    if status >= 400 {
        let body = response.text().await.unwrap_or_default();
        return HookAction::Emit(DecisionEnvelope::deny(format!(
            "Greenlight server error (HTTP {status}): {body}"
        )));
    }

    let verdict: ServerDecision = match response.json().await {
        Ok(verdict) => verdict,
        Err(e) => {
            return HookAction::Emit(DecisionEnvelope::deny(format!(
                "Failed to parse server response: {e}"
            )));
        }
    };
    decision_from(verdict)
}

fn decision_from(verdict: ServerDecision) -> HookAction {
    if !verdict.error.is_empty() {
        return HookAction::Emit(DecisionEnvelope::deny(verdict.error));
    }
    if verdict.behavior == "allow" {
        return match verdict.updated_input {
            Some(Value::Object(map)) if !map.is_empty() => {
                HookAction::Emit(DecisionEnvelope::allow_with(Value::Object(map)))
            }
            _ => HookAction::Emit(DecisionEnvelope::allow()),
        };
    }
    let message = if verdict.message.is_empty() {
        "Permission denied".to_string()
    } else {
        verdict.message
    };
    if verdict.interrupt {
        HookAction::Emit(DecisionEnvelope::deny_interrupt(message))
    } else {
        HookAction::Emit(DecisionEnvelope::deny(message))
    }
}

fn notification(
    ctx: &HookContext,
    device_id: &str,
    project: &str,
    relay_id: &str,
    event: &HookEvent,
) -> HookAction {
    let payload = json!({
        "device_id": device_id,
        "tool_name": event.notification_type,
        "tool_input": {
            "notification_type": event.notification_type,
            "message": event.message,
            "title": event.title,
        },
        "relay_id": relay_id,
        "project": project,
        "agent": AGENT_NAME,
    });
    let url = format!("{}/request", ctx.base_url);
    tokio::spawn(async move {
        let _ = http::post_json(&url, &payload, NOTIFY_TIMEOUT).await;
    });
    HookAction::Silent
}

// ========== Helpers ==========

/// Append export lines to the hosted program's environment-propagation
/// file so subprocesses inherit the relay identity. An unwritable file is
/// ignored.
fn append_env_exports(env_file: &Path, relay_id: &str, project: &str) {
    use std::io::Write;

    let mut lines = String::new();
    if !relay_id.is_empty() {
        lines.push_str(&format!("export GREENLIGHT_SESSION_ID={relay_id:?}\n"));
    }
    if !project.is_empty() {
        lines.push_str(&format!("export GREENLIGHT_PROJECT={project:?}\n"));
    }
    if lines.is_empty() {
        return;
    }
    match std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(env_file)
    {
        Ok(mut file) => {
            let _ = file.write_all(lines.as_bytes());
        }
        Err(e) => debug!(error = %e, "env propagation file not writable"),
    }
}

/// Spawn the transcript streamer unless one is already running for this
/// session with the same relay id. A live streamer bound to a different
/// relay id is stale and gets killed first.
fn maybe_start_streamer(
    ctx: &HookContext,
    device_id: &str,
    project: &str,
    relay_id: &str,
    session_id: &str,
    transcript_path: &str,
) {
    if transcript_path.is_empty() || session_id.is_empty() {
        return;
    }

    let pid_path = settings::streamer_pid_path(session_id);
    if let Ok(existing) = std::fs::read_to_string(&pid_path) {
        let mut parts = existing.split_whitespace();
        let pid = parts
            .next()
            .and_then(|p| p.parse::<i32>().ok())
            .unwrap_or(0);
        let existing_relay = parts.next().unwrap_or("");
        if pid > 0 {
            let alive = signal::kill(Pid::from_raw(pid), None).is_ok();
            if alive && existing_relay == relay_id {
                return;
            }
            if alive {
                let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }

    let Some(exe) = &ctx.exe_path else {
        debug!("no executable path resolved; streamer not started");
        return;
    };

    let mut argv = vec![
        exe.to_string_lossy().into_owned(),
        "stream".to_string(),
        "--transcript".to_string(),
        transcript_path.to_string(),
        "--session-id".to_string(),
        session_id.to_string(),
        "--relay-id".to_string(),
        relay_id.to_string(),
    ];
    match &ctx.bridge_path {
        Some(bridge) if !bridge.is_empty() => {
            argv.push("--bridge".to_string());
            argv.push(bridge.clone());
        }
        _ => {
            argv.extend([
                "--device-id".to_string(),
                device_id.to_string(),
                "--project".to_string(),
                project.to_string(),
                "--server".to_string(),
                ctx.base_url.clone(),
            ]);
        }
    }

    match spawn::spawn_detached(&argv, &[]) {
        Ok(pid) => {
            let _ = std::fs::write(&pid_path, format!("{pid} {relay_id}"));
        }
        Err(e) => warn!(error = %e, "failed to start streamer"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn ctx(base: &str, relay_id: &str) -> HookContext {
        HookContext {
            base_url: base.to_string(),
            device_id: Some("test-dev".to_string()),
            project: Some("test-proj".to_string()),
            relay_id_env: Some(relay_id.to_string()),
            ..HookContext::default()
        }
    }

    fn permission_input() -> Vec<u8> {
        br#"{"hook_event_name":"PermissionRequest","tool_name":"Bash","tool_input":{"command":"rm -rf /"},"session_id":"s1"}"#
            .to_vec()
    }

    fn decision(action: &HookAction) -> &Decision {
        match action {
            HookAction::Emit(envelope) => &envelope.hook_specific_output.decision,
            HookAction::Silent => panic!("expected a decision envelope"),
        }
    }

    #[test]
    fn test_envelope_shape() {
        let allow = serde_json::to_value(DecisionEnvelope::allow_with(json!({"command":"ls"})))
            .unwrap();
        assert_eq!(
            allow["hookSpecificOutput"]["hookEventName"],
            "PermissionRequest"
        );
        assert_eq!(allow["hookSpecificOutput"]["decision"]["behavior"], "allow");
        assert_eq!(
            allow["hookSpecificOutput"]["decision"]["updatedInput"]["command"],
            "ls"
        );
        assert!(allow["hookSpecificOutput"]["decision"]
            .get("interrupt")
            .is_none());
        assert!(allow["hookSpecificOutput"]["decision"].get("message").is_none());

        let deny = serde_json::to_value(DecisionEnvelope::deny_interrupt("stop")).unwrap();
        assert_eq!(deny["hookSpecificOutput"]["decision"]["behavior"], "deny");
        assert_eq!(deny["hookSpecificOutput"]["decision"]["message"], "stop");
        assert_eq!(deny["hookSpecificOutput"]["decision"]["interrupt"], true);
    }

    #[tokio::test]
    async fn test_missing_device_id_denies() {
        let mut context = ctx("http://127.0.0.1:1", "relay-1");
        context.device_id = None;
        let action = run_hook(&context, &permission_input()).await;
        let decision = decision(&action);
        assert_eq!(decision.behavior, "deny");
        assert!(decision.message.as_ref().unwrap().contains("device ID"));
    }

    #[tokio::test]
    async fn test_missing_project_denies() {
        let mut context = ctx("http://127.0.0.1:1", "relay-1");
        context.project = None;
        let action = run_hook(&context, &permission_input()).await;
        assert_eq!(decision(&action).behavior, "deny");
    }

    #[tokio::test]
    async fn test_malformed_input_denies() {
        let context = ctx("http://127.0.0.1:1", "relay-1");
        let action = run_hook(&context, b"not json at all").await;
        let decision = decision(&action);
        assert_eq!(decision.behavior, "deny");
        assert!(decision.message.as_ref().unwrap().contains("parse"));
    }

    #[tokio::test]
    async fn test_unknown_event_is_silent() {
        let context = ctx("http://127.0.0.1:1", "relay-1");
        let action = run_hook(&context, br#"{"hook_event_name":"SomethingNew"}"#).await;
        assert_eq!(action, HookAction::Silent);
    }

    #[tokio::test]
    async fn test_unreachable_server_denies_with_interrupt() {
        let context = ctx("http://127.0.0.1:1", "relay-1");
        let action = run_hook(&context, &permission_input()).await;
        let decision = decision(&action);
        assert_eq!(decision.behavior, "deny");
        assert_eq!(decision.interrupt, Some(true));
    }

    /// Allow with updated input: the server rewrites the tool command.
    #[tokio::test]
    async fn test_allow_with_updated_input() {
        let (listener, base) = testutil::bind_local().await;
        let server = tokio::spawn(testutil::serve_http(
            listener,
            vec![(
                200,
                r#"{"behavior":"allow","updated_input":{"command":"echo safe"}}"#.to_string(),
            )],
        ));

        let action = run_hook(&ctx(&base, "relay-1"), &permission_input()).await;
        let decision = decision(&action);
        assert_eq!(decision.behavior, "allow");
        assert_eq!(decision.updated_input.as_ref().unwrap()["command"], "echo safe");
        assert!(decision.interrupt.is_none());

        let requests = server.await.unwrap();
        assert_eq!(requests[0].path, "/request");
        assert_eq!(requests[0].body["device_id"], "test-dev");
        assert_eq!(requests[0].body["project"], "test-proj");
        assert_eq!(requests[0].body["relay_id"], "relay-1");
        assert_eq!(requests[0].body["agent"], "claude-code");
        assert_eq!(requests[0].body["tool_name"], "Bash");
        assert_eq!(requests[0].body["tool_input"]["command"], "rm -rf /");
    }

    #[tokio::test]
    async fn test_plain_allow_when_updated_input_empty() {
        let (listener, base) = testutil::bind_local().await;
        let server = tokio::spawn(testutil::serve_http(
            listener,
            vec![(200, r#"{"behavior":"allow","updated_input":{}}"#.to_string())],
        ));

        let action = run_hook(&ctx(&base, "relay-1"), &permission_input()).await;
        let decision = decision(&action);
        assert_eq!(decision.behavior, "allow");
        assert!(decision.updated_input.is_none());
        server.await.unwrap();
    }

    /// Deny with interrupt propagates both the message and the flag.
    #[tokio::test]
    async fn test_deny_with_interrupt() {
        let (listener, base) = testutil::bind_local().await;
        let server = tokio::spawn(testutil::serve_http(
            listener,
            vec![(
                200,
                r#"{"behavior":"deny","message":"interrupted","interrupt":true}"#.to_string(),
            )],
        ));

        let action = run_hook(&ctx(&base, "relay-1"), &permission_input()).await;
        let decision = decision(&action);
        assert_eq!(decision.behavior, "deny");
        assert_eq!(decision.message.as_deref(), Some("interrupted"));
        assert_eq!(decision.interrupt, Some(true));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_deny_default_message() {
        let (listener, base) = testutil::bind_local().await;
        let server = tokio::spawn(testutil::serve_http(
            listener,
            vec![(200, r#"{"behavior":"deny"}"#.to_string())],
        ));

        let action = run_hook(&ctx(&base, "relay-1"), &permission_input()).await;
        assert_eq!(
            decision(&action).message.as_deref(),
            Some("Permission denied")
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_field_overrides_behavior() {
        let (listener, base) = testutil::bind_local().await;
        let server = tokio::spawn(testutil::serve_http(
            listener,
            vec![(
                200,
                r#"{"behavior":"allow","error":"backend exploded"}"#.to_string(),
            )],
        ));

        let action = run_hook(&ctx(&base, "relay-1"), &permission_input()).await;
        let decision = decision(&action);
        assert_eq!(decision.behavior, "deny");
        assert_eq!(decision.message.as_deref(), Some("backend exploded"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_500_denies_with_status_and_body() {
        let (listener, base) = testutil::bind_local().await;
        let server = tokio::spawn(testutil::serve_http(
            listener,
            vec![(500, "boom".to_string())],
        ));

        let action = run_hook(&ctx(&base, "relay-1"), &permission_input()).await;
        let message = decision(&action).message.clone().unwrap();
        assert!(message.contains("HTTP 500"));
        assert!(message.contains("boom"));
        server.await.unwrap();
    }

    /// 401 path: exactly two POSTs to /request with one /session/enroll in
    /// between, ending in allow.
    #[tokio::test]
    async fn test_401_reenrolls_and_retries_once() {
        let relay_id = format!("relay-retry-{}", std::process::id());
        enroll::clear_enrollment_marker(&relay_id);

        let (listener, base) = testutil::bind_local().await;
        let server = tokio::spawn(testutil::serve_http(
            listener,
            vec![
                (401, String::new()),
                (200, r#"{"approved":true}"#.to_string()),
                (200, r#"{"behavior":"allow"}"#.to_string()),
            ],
        ));

        let action = run_hook(&ctx(&base, &relay_id), &permission_input()).await;
        assert_eq!(decision(&action).behavior, "allow");

        let requests = server.await.unwrap();
        let paths: Vec<&str> = requests.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/request", "/session/enroll", "/request"]);

        enroll::clear_enrollment_marker(&relay_id);
    }

    #[tokio::test]
    async fn test_401_with_rejected_reenroll_denies() {
        let relay_id = format!("relay-retry-rejected-{}", std::process::id());
        enroll::clear_enrollment_marker(&relay_id);

        let (listener, base) = testutil::bind_local().await;
        let server = tokio::spawn(testutil::serve_http(
            listener,
            vec![
                (401, String::new()),
                (200, r#"{"approved":false,"message":"nope"}"#.to_string()),
            ],
        ));

        let action = run_hook(&ctx(&base, &relay_id), &permission_input()).await;
        let decision = decision(&action);
        assert_eq!(decision.behavior, "deny");
        assert!(decision.message.as_ref().unwrap().contains("enrollment"));
        server.await.unwrap();

        enroll::clear_enrollment_marker(&relay_id);
    }

    #[tokio::test]
    async fn test_notification_is_silent() {
        let context = ctx("http://127.0.0.1:1", "relay-1");
        let input = br#"{"hook_event_name":"Notification","notification_type":"permission_prompt","message":"waiting","title":"Claude"}"#;
        let action = run_hook(&context, input).await;
        assert_eq!(action, HookAction::Silent);
    }

    #[tokio::test]
    async fn test_session_start_enrolls_exports_and_persists_mapping() {
        let relay_id = format!("relay-session-start-{}", std::process::id());
        enroll::clear_enrollment_marker(&relay_id);

        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("claude-env");
        let sessions_path = dir.path().join("sessions.json");

        let (listener, base) = testutil::bind_local().await;
        let server = tokio::spawn(testutil::serve_http(
            listener,
            vec![(200, r#"{"approved":true}"#.to_string())],
        ));

        let mut context = ctx(&base, &relay_id);
        context.env_file = Some(env_file.clone());
        context.sessions_path = Some(sessions_path.clone());

        let input = br#"{"hook_event_name":"SessionStart","session_id":"conv-42"}"#;
        let action = run_hook(&context, input).await;
        assert_eq!(action, HookAction::Silent);

        let requests = server.await.unwrap();
        assert_eq!(requests[0].path, "/session/enroll");

        let exports = std::fs::read_to_string(&env_file).unwrap();
        assert!(exports.contains(&format!("export GREENLIGHT_SESSION_ID=\"{relay_id}\"")));
        assert!(exports.contains("export GREENLIGHT_PROJECT=\"test-proj\""));

        assert_eq!(
            sessions::lookup_in(&sessions_path, "conv-42").unwrap(),
            relay_id
        );

        enroll::clear_enrollment_marker(&relay_id);
    }
}
