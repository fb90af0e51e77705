use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;

use crate::diff::diff_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogMode {
    /// Every response body, verbatim.
    Full,
    /// First response per path in full, then only the changed JSON paths.
    Diffed,
}

pub(crate) type SharedLog = Arc<Mutex<MessageLogger>>;

pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
    previous: HashMap<String, Value>,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            mode,
            file,
            previous: HashMap::new(),
        })
    }

    /// `body` must already be redacted.
    pub fn log_request(&mut self, method: &str, path: &str, body: Option<&Value>) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "req",
            "method": method,
            "path": path,
            "body": body,
        });
        self.write_line(&entry);
    }

    pub fn log_response(&mut self, path: &str, status: u16, body: &Value) {
        let entry = match (self.mode, self.previous.get(path)) {
            (MessageLogMode::Diffed, Some(prev)) if (200..300).contains(&status) => {
                let mut changes = Vec::new();
                diff_json(prev, body, "", &mut changes);
                let change_entries: Vec<Value> = changes
                    .iter()
                    .map(|(path, old, new)| json!({ "path": path, "old": old, "new": new }))
                    .collect();
                json!({
                    "ts": Utc::now().to_rfc3339(),
                    "dir": "resp",
                    "path": path,
                    "status": status,
                    "changes": change_entries,
                })
            }
            (MessageLogMode::Diffed, None) if (200..300).contains(&status) => json!({
                "ts": Utc::now().to_rfc3339(),
                "dir": "resp",
                "path": path,
                "status": status,
                "full": true,
                "body": body,
            }),
            _ => json!({
                "ts": Utc::now().to_rfc3339(),
                "dir": "resp",
                "path": path,
                "status": status,
                "body": body,
            }),
        };
        self.write_line(&entry);

        if self.mode == MessageLogMode::Diffed && (200..300).contains(&status) {
            self.previous.insert(path.to_string(), body.clone());
        }
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write log entry: {e}");
        }
    }
}
