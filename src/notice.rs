//! Purpose: Structured non-fatal diagnostics the CLI writes to stderr.
//! Exports: `Notice`, `notice_json`.
//! Role: Report facts a caller needs to chain reads, e.g. the window a range used.
//! Invariants: Notices never alter stdout payloads; fields are only ever added.
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub cmd: String,
    pub database: String,
    pub message: String,
    pub details: Map<String, Value>,
}

impl Notice {
    pub fn new(kind: &str, cmd: &str, database: impl Into<String>, time: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            time: time.into(),
            cmd: cmd.to_string(),
            database: database.into(),
            message: String::new(),
            details: Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_detail(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.details.insert(name.to_string(), value.into());
        self
    }
}

pub fn notice_json(notice: &Notice) -> Value {
    json!({
        "notice": {
            "kind": notice.kind,
            "time": notice.time,
            "cmd": notice.cmd,
            "database": notice.database,
            "message": notice.message,
            "details": notice.details,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{Notice, notice_json};

    #[test]
    fn range_notice_carries_window_for_the_next_read() {
        let notice = Notice::new("range_complete", "range", "/var/lib/phlog.db", "2026-02-01T00:00:05Z")
            .with_message("read 3 entries")
            .with_detail("before", "2026-02-01T00:00:00Z")
            .with_detail("count", 3);

        let value = notice_json(&notice);
        let inner = &value["notice"];
        assert_eq!(inner["kind"], "range_complete");
        assert_eq!(inner["cmd"], "range");
        assert_eq!(inner["database"], "/var/lib/phlog.db");
        assert_eq!(inner["message"], "read 3 entries");
        assert_eq!(inner["details"]["before"], "2026-02-01T00:00:00Z");
        assert_eq!(inner["details"]["count"], 3);
    }

    #[test]
    fn details_default_to_an_empty_object() {
        let value = notice_json(&Notice::new("k", "c", "db", "t"));
        assert!(value["notice"]["details"].as_object().expect("object").is_empty());
    }
}
