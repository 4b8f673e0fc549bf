//! Two-region persona file: an opaque head kept byte-for-byte, and a runtime
//! block the agent owns and regenerates on every write.
//!
//! ```toml
//! name = "librarian"
//! triggers = ["librarian", "lib"]
//! system_prompt = "..."
//! # Runtime fields (updated atomically by the agent; do not edit manually)
//! running = false
//! total_calls = 0
//! ```
//!
//! The runtime keys are appended at the end of the file, so persona files
//! must stay flat: a `[table]` header in the head would capture them.

use super::PersonaRuntime;

pub const DEFAULT_MARKER: &str = "# Runtime fields (updated atomically by the agent; do not edit manually)";

const MARKER_PREFIX: &str = "# runtime fields";

const RUNTIME_KEYS: [&str; 7] = [
    "running",
    "total_calls",
    "today_calls",
    "today_date",
    "last_started",
    "control_calls",
    "queue_count",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaDocument {
    head: String,
    marker: String,
}

impl PersonaDocument {
    /// Split file text at the first line that starts (case-insensitively) with
    /// `# runtime fields`. Without a marker, top-level runtime assignments
    /// are lifted out of the head so the regenerated block cannot duplicate them.
    pub fn split(text: &str) -> Self {
        let mut head = String::with_capacity(text.len());
        for line in text.split_inclusive('\n') {
            if line.trim().to_ascii_lowercase().starts_with(MARKER_PREFIX) {
                let marker = line.trim_end_matches(['\n', '\r']);
                return Self {
                    head,
                    marker: if marker.is_empty() { DEFAULT_MARKER.to_string() } else { marker.to_string() },
                };
            }
            head.push_str(line);
        }
        Self {
            head: strip_runtime_assignments(text),
            marker: DEFAULT_MARKER.to_string(),
        }
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Head verbatim, then the marker and one line per runtime field.
    pub fn render(&self, runtime: &PersonaRuntime) -> String {
        let mut out = self.head.clone();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.marker);
        out.push('\n');
        for line in runtime_lines(runtime) {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

fn runtime_lines(runtime: &PersonaRuntime) -> [String; 7] {
    [
        format!("running = {}", runtime.running),
        format!("total_calls = {}", runtime.total_calls),
        format!("today_calls = {}", runtime.today_calls),
        format!("today_date = {}", toml_string(&runtime.today_date)),
        format!("last_started = {}", toml_string(&runtime.last_started)),
        format!("control_calls = {}", runtime.control_calls),
        format!("queue_count = {}", runtime.queue_count),
    ]
}

fn toml_string(s: &str) -> String {
    toml::Value::String(s.to_string()).to_string()
}

/// Drop `key = ...` lines for runtime keys that appear before the first table header.
fn strip_runtime_assignments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut top_level = true;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with('[') {
            top_level = false;
        }
        if top_level && is_runtime_assignment(trimmed) {
            continue;
        }
        out.push_str(line);
    }
    out
}

fn is_runtime_assignment(line: &str) -> bool {
    let Some((key, _)) = line.split_once('=') else {
        return false;
    };
    let key = key.trim().trim_matches('"');
    RUNTIME_KEYS.contains(&key)
}
