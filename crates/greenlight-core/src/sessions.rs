//! Conversation → Relay Map
//!
//! A resumed Claude Code conversation should reuse the relay id it enrolled
//! with, so the phone-side session history stays contiguous. The mapping is
//! persisted as a flat JSON object in `~/.greenlight/sessions.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::settings;

fn sessions_file_path() -> Option<PathBuf> {
    settings::config_dir().map(|dir| dir.join("sessions.json"))
}

/// Look up the stored relay id for a conversation.
pub fn lookup_relay_id(conversation_id: &str) -> Option<String> {
    let path = sessions_file_path()?;
    lookup_in(&path, conversation_id)
}

/// Persist a conversation → relay mapping. Failures are non-fatal; the
/// worst case is a resumed session enrolling under a fresh relay id.
pub fn save_relay_id(conversation_id: &str, relay_id: &str) {
    if let Some(path) = sessions_file_path() {
        save_in(&path, conversation_id, relay_id);
    }
}

pub fn lookup_in(path: &Path, conversation_id: &str) -> Option<String> {
    let data = std::fs::read(path).ok()?;
    let map: HashMap<String, String> = serde_json::from_slice(&data).ok()?;
    map.get(conversation_id).cloned()
}

pub fn save_in(path: &Path, conversation_id: &str, relay_id: &str) {
    let mut map: HashMap<String, String> = std::fs::read(path)
        .ok()
        .and_then(|data| serde_json::from_slice(&data).ok())
        .unwrap_or_default();
    map.insert(conversation_id.to_string(), relay_id.to_string());

    let Ok(data) = serde_json::to_vec(&map) else {
        return;
    };
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(path, data) {
        debug!(error = %e, path = ?path, "failed to persist session map");
    }
}
