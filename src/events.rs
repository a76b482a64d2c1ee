//! Event Reporter (C9): queues and batches lifecycle events for later,
//! best-effort delivery to a `ReportSink`. Events are persisted so they
//! survive reboots; transport itself (MQTT, HTTP, …) is out of scope and
//! lives behind `ReportSink` (spec.md §1, §4.9).

use std::collections::VecDeque;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::report::ReportSink;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    DownloadStarted,
    DownloadCompleted { success: bool },
    InstallStarted,
    /// Emitted when the install needs a reboot before it can be confirmed.
    InstallApplied,
    InstallCompleted { success: bool },
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub correlation_id: String,
    pub target_name: String,
    pub version: String,
    pub details: Option<String>,
}

/// Queues events in memory and on disk, preserving per-`correlation_id`
/// order (spec.md §4.9): `DownloadStarted`, `DownloadCompleted`,
/// `InstallStarted`, `InstallApplied` (on `NeedReboot`), `InstallCompleted`.
pub struct EventReporter {
    queue: VecDeque<Event>,
    state_path: camino::Utf8PathBuf,
}

impl EventReporter {
    pub fn new(state_path: impl Into<camino::Utf8PathBuf>) -> Self {
        EventReporter {
            queue: VecDeque::new(),
            state_path: state_path.into(),
        }
    }

    /// Loads any events a previous cycle queued but could not deliver
    /// before a reboot or crash.
    pub fn load(state_path: impl Into<camino::Utf8PathBuf>) -> anyhow::Result<Self> {
        let state_path = state_path.into();
        let queue = if state_path.exists() {
            let raw = std::fs::read_to_string(&state_path)?;
            serde_json::from_str(&raw)?
        } else {
            VecDeque::new()
        };
        Ok(EventReporter { queue, state_path })
    }

    pub fn enqueue(&mut self, event: Event) -> anyhow::Result<()> {
        self.queue.push_back(event);
        self.persist()
    }

    fn persist(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string(&self.queue)?;
        let dir = self.state_path.parent().unwrap_or(Utf8Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        use std::io::Write;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&self.state_path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Best-effort flush of every queued event, oldest first, to `sink`.
    /// Events that fail to deliver remain queued for the next flush.
    pub fn flush(&mut self, sink: &dyn ReportSink) -> anyhow::Result<usize> {
        let mut delivered = 0;
        while let Some(event) = self.queue.front() {
            match sink.send(event) {
                Ok(()) => {
                    info!(correlation_id = %event.correlation_id, kind = ?event.kind, "event delivered");
                    self.queue.pop_front();
                    delivered += 1;
                }
                Err(e) => {
                    warn!(correlation_id = %event.correlation_id, error = %e, "event delivery failed, will retry next cycle");
                    break;
                }
            }
        }
        self.persist()?;
        Ok(delivered)
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }
}
