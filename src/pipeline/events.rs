//! Machine-readable progress events.
//!
//! A run can emit a JSONL stream of lifecycle events so wrapping tooling can
//! follow along without scraping logs. Each line is one object:
//! `{"ts": <rfc3339>, "event": <name>, "data": {...}}`. Event emission is
//! best-effort and never fails the pipeline; a broken sink downgrades to a
//! warning once and stays silent after that.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

enum Target {
    Disabled,
    Stdout,
    File(Mutex<File>),
}

pub struct EventSink {
    target: Target,
    broken: std::sync::atomic::AtomicBool,
}

impl EventSink {
    /// No-op sink.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            target: Target::Disabled,
            broken: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Sink chosen from configuration: `None` disables events, `"-"` writes
    /// to stdout, anything else appends to that file path.
    #[must_use]
    pub fn from_config(events_path: Option<&str>) -> Self {
        match events_path {
            None => Self::disabled(),
            Some("-") => Self {
                target: Target::Stdout,
                broken: std::sync::atomic::AtomicBool::new(false),
            },
            Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Self {
                    target: Target::File(Mutex::new(file)),
                    broken: std::sync::atomic::AtomicBool::new(false),
                },
                Err(e) => {
                    warn!(path, error = %e, "cannot open events file, events disabled");
                    Self::disabled()
                }
            },
        }
    }

    /// Emit one event line.
    pub fn emit(&self, event: &str, data: Value) {
        if matches!(self.target, Target::Disabled) {
            return;
        }
        if self.broken.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }

        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let result = match &self.target {
            Target::Disabled => return,
            Target::Stdout => {
                let mut out = std::io::stdout().lock();
                writeln!(out, "{line}")
            }
            Target::File(file) => match file.lock() {
                Ok(mut f) => writeln!(f, "{line}").and_then(|()| f.flush()),
                Err(_) => return,
            },
        };

        if let Err(e) = result {
            warn!(event, error = %e, "event sink write failed, events disabled");
            self.broken
                .store(true, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sink_is_silent() {
        let sink = EventSink::disabled();
        sink.emit("run_started", json!({"phases": ["list"]}));
    }

    #[test]
    fn file_sink_writes_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        let sink = EventSink::from_config(Some(path.to_str().unwrap()));

        sink.emit("run_started", json!({"phases": ["list", "detail"]}));
        sink.emit("list_page", json!({"page": 3, "new_posts": 7}));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "run_started");
        assert!(first["ts"].as_str().unwrap().contains('T'));

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["data"]["page"], 3);
    }

    #[test]
    fn file_sink_appends_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");

        let sink = EventSink::from_config(Some(path.to_str().unwrap()));
        sink.emit("run_started", json!({}));
        drop(sink);

        let sink = EventSink::from_config(Some(path.to_str().unwrap()));
        sink.emit("run_completed", json!({}));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
