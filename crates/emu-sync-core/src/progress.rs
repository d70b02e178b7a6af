//! Newline-delimited JSON progress events
//!
//! Upload and sync emit one event per significant action. The stream can be
//! written to stdout, fanned out live to another consumer, or ignored.

use std::io::Write;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One progress event, serialized as `{"event": "<kind>", ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ProgressEvent {
    Start { file: String, size: i64 },
    Complete { file: String },
    Error { file: String, error: String },
    Delete { file: String },
    Skip { file: String },
    Retain { file: String },
    Done(DoneCounts),
}

/// Totals carried by the terminal `done` event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneCounts {
    pub downloaded: usize,
    pub deleted: usize,
    pub retained: usize,
    pub errors: usize,
    pub skipped: usize,
}

/// Destination for progress events; must tolerate calls from many threads
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Writes each event as one JSON line to a shared writer
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl ProgressSink for JsonLinesSink {
    fn emit(&self, event: &ProgressEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode progress event");
                return;
            }
        };
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            warn!(error = %e, "failed to write progress event");
        }
    }
}

/// Collects events in memory, mainly for tests and summaries
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ProgressSink for MemorySink {
    fn emit(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

/// Cheap handle the engines use to report progress; disabled by default
#[derive(Clone, Default)]
pub struct ProgressReporter {
    sink: Option<Arc<dyn ProgressSink>>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl ProgressReporter {
    /// A reporter that drops every event
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(&event);
        }
    }

    pub fn start(&self, file: &str, size: i64) {
        self.emit(ProgressEvent::Start {
            file: file.to_string(),
            size,
        });
    }

    pub fn complete(&self, file: &str) {
        self.emit(ProgressEvent::Complete {
            file: file.to_string(),
        });
    }

    pub fn file_error(&self, file: &str, error: &str) {
        self.emit(ProgressEvent::Error {
            file: file.to_string(),
            error: error.to_string(),
        });
    }

    pub fn delete(&self, file: &str) {
        self.emit(ProgressEvent::Delete {
            file: file.to_string(),
        });
    }

    pub fn skip(&self, file: &str) {
        self.emit(ProgressEvent::Skip {
            file: file.to_string(),
        });
    }

    pub fn retain(&self, file: &str) {
        self.emit(ProgressEvent::Retain {
            file: file.to_string(),
        });
    }

    pub fn done(&self, counts: DoneCounts) {
        self.emit(ProgressEvent::Done(counts));
    }
}
