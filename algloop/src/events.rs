//! Structured events emitted while solving.
use std::sync::{Arc, Mutex};

/// How serious an event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Progress information.
    Info,
    /// Something questionable that does not stop the solve.
    Warning,
    /// Something failed.
    Error,
}

/// One event reported to a [`LogSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct SolverEvent {
    /// Severity.
    pub severity: Severity,
    /// Short machine-readable tag, e.g. `"ScalingClamped"`.
    pub category: &'static str,
    /// Label of the block the event is about.
    pub block: String,
    /// Human-readable message.
    pub message: String,
    /// Numeric values associated with the event.
    pub values: Vec<(&'static str, f64)>,
}

impl SolverEvent {
    /// Look up a value by name.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, v)| *v)
    }
}

impl std::fmt::Display for SolverEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.block, self.category, self.message)?;
        for (key, value) in &self.values {
            write!(f, " <{key}: {value:e}>")?;
        }
        Ok(())
    }
}

/// Receives solver events. Opaque to the solver.
pub trait LogSink {
    /// Handle one event.
    fn emit(&mut self, event: SolverEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    #[mutants::skip]
    fn emit(&mut self, event: SolverEvent) {
        let SolverEvent {
            severity,
            category,
            block,
            message,
            values,
        } = event;
        match severity {
            Severity::Info => tracing::info!(%block, category, ?values, "{message}"),
            Severity::Warning => tracing::warn!(%block, category, ?values, "{message}"),
            Severity::Error => tracing::error!(%block, category, ?values, "{message}"),
        }
    }
}

/// Keeps every event; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<SolverEvent>>>,
}

impl CollectingSink {
    /// Copy of the events collected so far.
    pub fn events(&self) -> Vec<SolverEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events with the given category.
    pub fn with_category(&self, category: &str) -> Vec<SolverEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.category == category)
            .collect()
    }

    /// Forget everything collected so far.
    pub fn clear(&self) {
        match self.events.lock() {
            Ok(mut events) => events.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl LogSink for CollectingSink {
    fn emit(&mut self, event: SolverEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(category: &'static str) -> SolverEvent {
        SolverEvent {
            severity: Severity::Warning,
            category,
            block: "b".to_owned(),
            message: "m".to_owned(),
            values: vec![("scale", 2.0)],
        }
    }

    #[test]
    fn collecting_sink_shares_buffer() {
        let sink = CollectingSink::default();
        let mut writer = sink.clone();
        writer.emit(event("A"));
        writer.emit(event("B"));
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.with_category("B").len(), 1);
        assert_eq!(sink.events()[0].value("scale"), Some(2.0));
        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn display_includes_values() {
        let shown = event("ScalingClamped").to_string();
        assert_eq!(shown, "[b] ScalingClamped: m <scale: 2e0>");
    }
}
