//! `ReportSink` capability (spec.md §1): telemetry transport is out of
//! scope; the core only emits events to this trait.

use crate::events::Event;

pub trait ReportSink: Send + Sync {
    /// Best-effort delivery; failures are logged by the caller and do not
    /// block the update cycle.
    fn send(&self, event: &Event) -> anyhow::Result<()>;
}

/// A sink that drops every event, useful for offline operation and tests.
pub struct NullSink;

impl ReportSink for NullSink {
    fn send(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}
